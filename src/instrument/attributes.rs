//! Request and response attribute builders for each operation.

use super::Operation;
use crate::provider::{
    ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse, ImageRequest, ImageResponse,
    Usage,
};
use crate::telemetry::genai;
use crate::tokens;
use opentelemetry::{Array, KeyValue, StringValue, Value};

/// Attributes shared by every span this crate starts.
pub(crate) fn common(provider: &str, operation: Operation) -> Vec<KeyValue> {
    vec![
        KeyValue::new(genai::LANGSPAN_SDK_NAME, genai::SDK_NAME),
        KeyValue::new(genai::LANGSPAN_VERSION, genai::SDK_VERSION),
        KeyValue::new(genai::GEN_AI_OPERATION_NAME, operation.as_str()),
        KeyValue::new(genai::GEN_AI_PROVIDER_NAME, provider.to_string()),
    ]
}

pub(crate) fn chat_request(request: &ChatRequest, stream: bool, capture: bool) -> Vec<KeyValue> {
    let mut attrs = vec![
        KeyValue::new(genai::GEN_AI_REQUEST_MODEL, request.model.clone()),
        KeyValue::new(genai::GEN_AI_REQUEST_STREAM, stream),
    ];
    if let Some(temperature) = request.temperature {
        attrs.push(KeyValue::new(genai::GEN_AI_REQUEST_TEMPERATURE, temperature));
    }
    if let Some(top_p) = request.top_p {
        attrs.push(KeyValue::new(genai::GEN_AI_REQUEST_TOP_P, top_p));
    }
    if let Some(max_tokens) = request.max_tokens {
        attrs.push(KeyValue::new(genai::GEN_AI_REQUEST_MAX_TOKENS, i64::from(max_tokens)));
    }
    if capture {
        if let Ok(prompt) = serde_json::to_string(&request.messages) {
            attrs.push(KeyValue::new(genai::GEN_AI_PROMPT, prompt));
        }
    }
    attrs
}

/// Token usage resolved for a finished call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ResolvedUsage {
    pub input: u64,
    pub output: u64,
    pub estimated: bool,
}

impl ResolvedUsage {
    /// Prefer what the provider reported; estimate otherwise.
    pub(crate) fn resolve(reported: Option<Usage>, estimate: impl FnOnce() -> (u64, u64)) -> Self {
        match reported {
            Some(usage) => Self {
                input: usage.input_tokens,
                output: usage.output_tokens,
                estimated: false,
            },
            None => {
                let (input, output) = estimate();
                Self {
                    input,
                    output,
                    estimated: true,
                }
            }
        }
    }

    pub(crate) fn attributes(&self) -> Vec<KeyValue> {
        vec![
            KeyValue::new(genai::GEN_AI_USAGE_INPUT_TOKENS, self.input as i64),
            KeyValue::new(genai::GEN_AI_USAGE_OUTPUT_TOKENS, self.output as i64),
            KeyValue::new(genai::GEN_AI_USAGE_TOTAL_TOKENS, (self.input + self.output) as i64),
            KeyValue::new(genai::GEN_AI_USAGE_ESTIMATED, self.estimated),
        ]
    }
}

pub(crate) fn chat_usage(response: &ChatResponse, prompt_tokens: u64, model: &str) -> ResolvedUsage {
    ResolvedUsage::resolve(response.usage, || {
        (prompt_tokens, tokens::estimate(&response.message.content, model))
    })
}

pub(crate) fn chat_response(
    response: &ChatResponse,
    usage: &ResolvedUsage,
    capture: bool,
) -> Vec<KeyValue> {
    let mut attrs = vec![KeyValue::new(genai::GEN_AI_RESPONSE_MODEL, response.model.clone())];
    attrs.extend(usage.attributes());
    if let Some(reason) = &response.finish_reason {
        attrs.push(KeyValue::new(
            genai::GEN_AI_RESPONSE_FINISH_REASONS,
            string_array([reason.clone()]),
        ));
    }
    if capture {
        attrs.push(KeyValue::new(genai::GEN_AI_COMPLETION, response.message.content.clone()));
    }
    attrs
}

pub(crate) fn embedding_request(request: &EmbeddingRequest, capture: bool) -> Vec<KeyValue> {
    let mut attrs = vec![
        KeyValue::new(genai::GEN_AI_REQUEST_MODEL, request.model.clone()),
        KeyValue::new(genai::GEN_AI_REQUEST_EMBEDDING_INPUTS, request.inputs.len() as i64),
    ];
    if capture {
        attrs.push(KeyValue::new(genai::GEN_AI_PROMPT, string_array(request.inputs.iter().cloned())));
    }
    attrs
}

pub(crate) fn embedding_input_tokens(request: &EmbeddingRequest) -> u64 {
    request
        .inputs
        .iter()
        .map(|input| tokens::estimate(input, &request.model))
        .sum()
}

pub(crate) fn embedding_response(response: &EmbeddingResponse, input_tokens: u64) -> Vec<KeyValue> {
    let usage = ResolvedUsage::resolve(response.usage, || (input_tokens, 0));
    let mut attrs = vec![
        KeyValue::new(genai::GEN_AI_RESPONSE_MODEL, response.model.clone()),
        KeyValue::new(genai::GEN_AI_RESPONSE_EMBEDDING_COUNT, response.embeddings.len() as i64),
    ];
    attrs.extend(usage.attributes());
    attrs
}

pub(crate) fn image_request(request: &ImageRequest, capture: bool) -> Vec<KeyValue> {
    let mut attrs = vec![
        KeyValue::new(genai::GEN_AI_REQUEST_MODEL, request.model.clone()),
        KeyValue::new(genai::GEN_AI_REQUEST_IMAGE_COUNT, i64::from(request.n)),
    ];
    if let Some(size) = &request.size {
        attrs.push(KeyValue::new(genai::GEN_AI_REQUEST_IMAGE_SIZE, size.clone()));
    }
    if capture {
        attrs.push(KeyValue::new(genai::GEN_AI_PROMPT, request.prompt.clone()));
    }
    attrs
}

pub(crate) fn image_response(response: &ImageResponse, capture: bool) -> Vec<KeyValue> {
    let mut attrs = vec![KeyValue::new(
        genai::GEN_AI_RESPONSE_IMAGE_COUNT,
        response.images.len() as i64,
    )];
    if capture {
        if let Ok(images) = serde_json::to_string(&response.images) {
            attrs.push(KeyValue::new(genai::GEN_AI_COMPLETION, images));
        }
    }
    attrs
}

/// Attributes for vector-store spans.
pub(crate) fn vector(system: &str, operation: Operation, collection: &str) -> Vec<KeyValue> {
    vec![
        KeyValue::new(genai::LANGSPAN_SDK_NAME, genai::SDK_NAME),
        KeyValue::new(genai::LANGSPAN_VERSION, genai::SDK_VERSION),
        KeyValue::new(genai::DB_SYSTEM, system.to_string()),
        KeyValue::new(genai::DB_OPERATION_NAME, operation.as_str()),
        KeyValue::new(genai::DB_COLLECTION_NAME, collection.to_string()),
    ]
}

fn string_array(values: impl IntoIterator<Item = String>) -> Value {
    let values: Vec<StringValue> = values.into_iter().map(StringValue::from).collect();
    Value::Array(Array::from(values))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reported_usage_wins_over_estimate() {
        let usage = ResolvedUsage::resolve(
            Some(Usage {
                input_tokens: 10,
                output_tokens: 3,
            }),
            || panic!("should not estimate"),
        );
        assert_eq!(
            usage,
            ResolvedUsage {
                input: 10,
                output: 3,
                estimated: false
            }
        );
    }

    #[test]
    fn missing_usage_is_estimated() {
        let usage = ResolvedUsage::resolve(None, || (5, 7));
        assert!(usage.estimated);
        assert_eq!(usage.input + usage.output, 12);
    }
}
