//! Integration tests for the per-operation wrappers and the client decorator.

mod common;

use async_trait::async_trait;
use common::{
    Harness, RateLimitError, ScriptedChat, event_names, find_attribute, int_attribute, request,
    str_attribute,
};
use langspan::context::{self, SPAN_NAME_OVERRIDE};
use langspan::instrument::{InstrumentationSettings, Operation};
use langspan::provider::{
    ChatProvider, EmbeddingProvider, EmbeddingRequest, EmbeddingResponse, GeneratedImage,
    ImageProvider, ImageRequest, ImageResponse, Usage, VectorMatch, VectorQuery, VectorRecord,
    VectorStore,
};
use langspan::span::{self, EXCEPTION_EVENT, SpanKind};
use langspan::telemetry::genai;
use langspan::tokens;
use opentelemetry::trace::Status;
use opentelemetry::{KeyValue, Value};

#[tokio::test]
async fn chat_response_is_returned_unchanged() {
    let harness = Harness::new();
    let plain = ScriptedChat::replying("Paris.");
    let expected = plain.chat(request("gpt-4o", "Capital of France?")).await.unwrap();

    let client = harness
        .instrumentor
        .instrument(ScriptedChat::replying("Paris."));
    let actual = client.chat(request("gpt-4o", "Capital of France?")).await.unwrap();

    assert_eq!(actual, expected);
    assert_eq!(client.inner().call_count(), 1);
}

#[tokio::test]
async fn chat_span_carries_request_and_response_attributes() {
    let harness = Harness::new();
    let client = harness
        .instrumentor
        .instrument(ScriptedChat::replying("Paris."));
    let mut req = request("gpt-4o", "Capital of France?");
    req.temperature = Some(0.2);
    req.max_tokens = Some(64);
    client.chat(req).await.unwrap();

    let span = harness.only_span();
    assert_eq!(span.name, "scripted.chat.completions.create");
    assert_eq!(span.span_kind, SpanKind::Client);
    assert_eq!(span.status, Status::Ok);
    assert_eq!(str_attribute(&span, genai::LANGSPAN_SDK_NAME), "langspan");
    assert_eq!(str_attribute(&span, genai::GEN_AI_PROVIDER_NAME), "scripted");
    assert_eq!(
        str_attribute(&span, genai::GEN_AI_OPERATION_NAME),
        "chat.completions.create"
    );
    assert_eq!(str_attribute(&span, genai::GEN_AI_REQUEST_MODEL), "gpt-4o");
    assert_eq!(int_attribute(&span, genai::GEN_AI_REQUEST_MAX_TOKENS), 64);
    assert_eq!(
        find_attribute(&span, genai::GEN_AI_REQUEST_TEMPERATURE),
        Some(&Value::F64(0.2))
    );
    assert_eq!(str_attribute(&span, genai::GEN_AI_COMPLETION), "Paris.");
    assert!(str_attribute(&span, genai::GEN_AI_PROMPT).contains("Capital of France?"));
}

#[tokio::test]
async fn reported_usage_is_preferred_over_estimates() {
    let harness = Harness::new();
    let client = harness.instrumentor.instrument(ScriptedChat {
        usage: Some(Usage {
            input_tokens: 11,
            output_tokens: 4,
        }),
        ..ScriptedChat::replying("Paris.")
    });
    client.chat(request("gpt-4o", "Capital?")).await.unwrap();

    let span = harness.only_span();
    assert_eq!(int_attribute(&span, genai::GEN_AI_USAGE_INPUT_TOKENS), 11);
    assert_eq!(int_attribute(&span, genai::GEN_AI_USAGE_OUTPUT_TOKENS), 4);
    assert_eq!(int_attribute(&span, genai::GEN_AI_USAGE_TOTAL_TOKENS), 15);
    assert_eq!(
        find_attribute(&span, genai::GEN_AI_USAGE_ESTIMATED),
        Some(&Value::Bool(false))
    );
}

#[tokio::test]
async fn missing_usage_is_estimated() {
    let harness = Harness::new();
    let client = harness
        .instrumentor
        .instrument(ScriptedChat::replying("Paris is the capital."));
    let req = request("gpt-4o", "Capital?");
    let prompt = tokens::estimate_prompt(&req.messages, "gpt-4o");
    client.chat(req).await.unwrap();

    let span = harness.only_span();
    let completion = tokens::estimate("Paris is the capital.", "gpt-4o");
    assert_eq!(int_attribute(&span, genai::GEN_AI_USAGE_INPUT_TOKENS), prompt as i64);
    assert_eq!(
        int_attribute(&span, genai::GEN_AI_USAGE_OUTPUT_TOKENS),
        completion as i64
    );
    assert_eq!(
        find_attribute(&span, genai::GEN_AI_USAGE_ESTIMATED),
        Some(&Value::Bool(true))
    );
}

#[tokio::test]
async fn rate_limit_error_is_recorded_and_returned_unchanged() {
    let harness = Harness::new();
    let error = RateLimitError {
        retry_after_secs: 20,
    };
    let client = harness
        .instrumentor
        .instrument(ScriptedChat::failing(error.clone()));

    let result = client.chat(request("gpt-4o", "hi")).await;
    assert_eq!(result, Err(error.clone()));

    let span = harness.only_span();
    assert_eq!(
        span.status,
        Status::error("rate limit exceeded, retry after 20s")
    );
    assert_eq!(
        event_names(&span)
            .iter()
            .filter(|n| *n == EXCEPTION_EVENT)
            .count(),
        1
    );
    assert!(find_attribute(&span, genai::GEN_AI_COMPLETION).is_none());
}

#[tokio::test]
async fn disabled_operation_creates_no_span() {
    let harness = Harness::with_settings(InstrumentationSettings {
        disabled_operations: vec![Operation::ChatCompletions],
        ..InstrumentationSettings::default()
    });
    let client = harness
        .instrumentor
        .instrument(ScriptedChat::replying("ok"));
    let response = client.chat(request("gpt-4o", "hi")).await.unwrap();
    assert_eq!(response.message.content, "ok");

    let stream = client.chat_stream(request("gpt-4o", "hi")).await.unwrap();
    drop(stream);

    assert!(harness.spans().is_empty());
}

#[tokio::test]
async fn ambient_attributes_reach_nested_spans_only_inside_scope() {
    let harness = Harness::new();
    let client = harness
        .instrumentor
        .instrument(ScriptedChat::replying("ok"));

    client.chat(request("gpt-4o", "before")).await.unwrap();
    context::with_attributes(
        context::attributes([KeyValue::new("user.id", "u-42")]),
        async {
            client.chat(request("gpt-4o", "inside")).await.unwrap();
        },
    )
    .await;
    client.chat(request("gpt-4o", "after")).await.unwrap();

    let spans = harness.spans();
    assert_eq!(spans.len(), 3);
    let tagged: Vec<bool> = spans
        .iter()
        .map(|s| find_attribute(s, "user.id").is_some())
        .collect();
    assert_eq!(tagged, vec![false, true, false]);
}

#[tokio::test]
async fn concurrent_scopes_do_not_leak_into_each_other() {
    let harness = Harness::new();
    let client = harness
        .instrumentor
        .instrument(ScriptedChat::replying("ok"));

    let client = &client;
    let call = |user: &'static str| {
        context::with_attributes(
            context::attributes([KeyValue::new("user.id", user)]),
            async move {
                tokio::task::yield_now().await;
                client.chat(request("gpt-4o", user)).await.unwrap();
            },
        )
    };
    tokio::join!(call("alice"), call("bob"));

    let spans = harness.spans();
    assert_eq!(spans.len(), 2);
    for span in &spans {
        let user = str_attribute(span, "user.id");
        let prompt = str_attribute(span, genai::GEN_AI_PROMPT);
        assert!(prompt.contains(&user), "{user} saw {prompt}");
    }
}

#[tokio::test]
async fn span_name_override_replaces_default_name() {
    let harness = Harness::new();
    let client = harness
        .instrumentor
        .instrument(ScriptedChat::replying("ok"));

    context::with_attributes(
        context::attributes([KeyValue::new(SPAN_NAME_OVERRIDE, "summarize-step")]),
        client.chat(request("gpt-4o", "hi")),
    )
    .await
    .unwrap();

    assert_eq!(harness.only_span().name, "summarize-step");
}

#[tokio::test]
async fn root_span_parents_instrumented_calls() {
    let harness = Harness::new();
    let client = harness
        .instrumentor
        .instrument(ScriptedChat::replying("ok"));

    let (root_span_id, root_trace_id) = span::with_root_span(
        harness.tracer(),
        "workflow",
        SpanKind::Internal,
        |span_id, trace_id| async move {
            client.chat(request("gpt-4o", "step one")).await?;
            client.chat(request("gpt-4o", "step two")).await?;
            Ok::<_, RateLimitError>((span_id, trace_id))
        },
    )
    .await
    .unwrap();

    let spans = harness.spans();
    assert_eq!(spans.len(), 3);
    let root = spans.iter().find(|s| s.name == "workflow").unwrap();
    assert_eq!(root.span_context.span_id(), root_span_id);
    for child in spans.iter().filter(|s| s.name != "workflow") {
        assert_eq!(child.parent_span_id, root_span_id);
        assert_eq!(child.span_context.trace_id(), root_trace_id);
    }
}

// ---------------------------------------------------------------------------
// Embeddings, images, vector stores
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ScriptedAi;

#[async_trait]
impl EmbeddingProvider for ScriptedAi {
    type Error = RateLimitError;

    fn provider_name(&self) -> &str {
        "scripted"
    }

    async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse, RateLimitError> {
        Ok(EmbeddingResponse {
            model: request.model,
            embeddings: request.inputs.iter().map(|_| vec![0.1, 0.2]).collect(),
            usage: None,
        })
    }
}

#[async_trait]
impl ImageProvider for ScriptedAi {
    type Error = RateLimitError;

    fn provider_name(&self) -> &str {
        "scripted"
    }

    async fn generate_images(&self, request: ImageRequest) -> Result<ImageResponse, RateLimitError> {
        Ok(ImageResponse {
            images: (0..request.n)
                .map(|i| GeneratedImage {
                    url: Some(format!("https://img.example/{i}.png")),
                    revised_prompt: None,
                })
                .collect(),
        })
    }
}

#[tokio::test]
async fn embeddings_record_inputs_and_estimated_tokens() {
    let harness = Harness::new();
    let client = harness.instrumentor.instrument(ScriptedAi);
    let inputs = vec!["first document".to_string(), "second one".to_string()];
    let response = client
        .embed(EmbeddingRequest {
            model: "text-embedding-3-small".to_string(),
            inputs: inputs.clone(),
        })
        .await
        .unwrap();
    assert_eq!(response.embeddings.len(), 2);

    let span = harness.only_span();
    assert_eq!(span.name, "scripted.embeddings.create");
    assert_eq!(int_attribute(&span, genai::GEN_AI_REQUEST_EMBEDDING_INPUTS), 2);
    assert_eq!(int_attribute(&span, genai::GEN_AI_RESPONSE_EMBEDDING_COUNT), 2);
    let expected: u64 = inputs
        .iter()
        .map(|i| tokens::estimate(i, "text-embedding-3-small"))
        .sum();
    assert_eq!(
        int_attribute(&span, genai::GEN_AI_USAGE_INPUT_TOKENS),
        expected as i64
    );
}

#[tokio::test]
async fn image_generation_records_prompt_and_count() {
    let harness = Harness::new();
    let client = harness.instrumentor.instrument(ScriptedAi);
    let response = client
        .generate_images(ImageRequest {
            model: "dall-e-3".to_string(),
            prompt: "a lighthouse at dusk".to_string(),
            n: 2,
            size: Some("1024x1024".to_string()),
        })
        .await
        .unwrap();
    assert_eq!(response.images.len(), 2);

    let span = harness.only_span();
    assert_eq!(span.name, "scripted.images.generate");
    assert_eq!(str_attribute(&span, genai::GEN_AI_PROMPT), "a lighthouse at dusk");
    assert_eq!(int_attribute(&span, genai::GEN_AI_REQUEST_IMAGE_COUNT), 2);
    assert_eq!(int_attribute(&span, genai::GEN_AI_RESPONSE_IMAGE_COUNT), 2);
    assert_eq!(str_attribute(&span, genai::GEN_AI_REQUEST_IMAGE_SIZE), "1024x1024");
}

#[derive(Debug, Default)]
struct ScriptedVectors;

#[async_trait]
impl VectorStore for ScriptedVectors {
    type Error = RateLimitError;

    fn system_name(&self) -> &str {
        "memvec"
    }

    async fn query(&self, query: VectorQuery) -> Result<Vec<VectorMatch>, RateLimitError> {
        Ok((0..query.top_k.min(2))
            .map(|i| VectorMatch {
                id: format!("doc-{i}"),
                score: 0.9,
            })
            .collect())
    }

    async fn upsert(
        &self,
        _collection: &str,
        records: Vec<VectorRecord>,
    ) -> Result<usize, RateLimitError> {
        Ok(records.len())
    }

    async fn delete(&self, _collection: &str, _ids: Vec<String>) -> Result<usize, RateLimitError> {
        Err(RateLimitError {
            retry_after_secs: 1,
        })
    }
}

#[tokio::test]
async fn vector_operations_record_db_attributes() {
    let harness = Harness::new();
    let store = harness.instrumentor.instrument(ScriptedVectors);

    let matches = store
        .query(VectorQuery {
            collection: "docs".to_string(),
            vector: vec![0.1, 0.2],
            top_k: 5,
        })
        .await
        .unwrap();
    assert_eq!(matches.len(), 2);

    let written = store
        .upsert(
            "docs",
            vec![VectorRecord {
                id: "doc-9".to_string(),
                vector: vec![0.3, 0.4],
                metadata: serde_json::json!({"source": "test"}),
            }],
        )
        .await
        .unwrap();
    assert_eq!(written, 1);

    let deleted = store.delete("docs", vec!["doc-9".to_string()]).await;
    assert!(deleted.is_err());

    let spans = harness.spans();
    let names: Vec<&str> = spans.iter().map(|s| s.name.as_ref()).collect();
    assert_eq!(
        names,
        vec!["memvec.vector.query", "memvec.vector.upsert", "memvec.vector.delete"]
    );

    let query = &spans[0];
    assert_eq!(str_attribute(query, genai::DB_SYSTEM), "memvec");
    assert_eq!(str_attribute(query, genai::DB_COLLECTION_NAME), "docs");
    assert_eq!(int_attribute(query, genai::DB_VECTOR_QUERY_TOP_K), 5);
    assert_eq!(int_attribute(query, genai::DB_VECTOR_MATCH_COUNT), 2);
    assert_eq!(int_attribute(&spans[1], genai::DB_VECTOR_RECORD_COUNT), 1);
    assert!(matches!(spans[2].status, Status::Error { .. }));
}
