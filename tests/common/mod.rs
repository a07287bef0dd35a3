//! Shared fixtures: an in-memory span exporter and a scripted chat provider.

#![allow(dead_code)]

use async_trait::async_trait;
use langspan::instrument::{InstrumentationSettings, Instrumentor};
use langspan::provider::{
    ChatChunk, ChatMessage, ChatProvider, ChatRequest, ChatResponse, ChunkStream, Usage,
};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::Value;
use opentelemetry_sdk::trace::{InMemorySpanExporter, SdkTracer, SdkTracerProvider, SpanData};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

pub struct Harness {
    pub exporter: InMemorySpanExporter,
    pub provider: SdkTracerProvider,
    pub instrumentor: Instrumentor<SdkTracer>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(InstrumentationSettings::default())
    }

    pub fn with_settings(settings: InstrumentationSettings) -> Self {
        let exporter = InMemorySpanExporter::default();
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        let instrumentor = Instrumentor::new(provider.tracer("test"), settings);
        Self {
            exporter,
            provider,
            instrumentor,
        }
    }

    pub fn tracer(&self) -> &SdkTracer {
        self.instrumentor.tracer()
    }

    pub fn spans(&self) -> Vec<SpanData> {
        self.exporter.get_finished_spans().unwrap()
    }

    /// The single exported span; fails if there is not exactly one.
    pub fn only_span(&self) -> SpanData {
        let mut spans = self.spans();
        assert_eq!(spans.len(), 1, "expected one span, got {spans:?}");
        spans.remove(0)
    }
}

pub fn find_attribute<'a>(span: &'a SpanData, key: &str) -> Option<&'a Value> {
    span.attributes
        .iter()
        .find(|kv| kv.key.as_str() == key)
        .map(|kv| &kv.value)
}

pub fn int_attribute(span: &SpanData, key: &str) -> i64 {
    match find_attribute(span, key) {
        Some(Value::I64(v)) => *v,
        other => panic!("{key}: expected i64, got {other:?}"),
    }
}

pub fn str_attribute(span: &SpanData, key: &str) -> String {
    match find_attribute(span, key) {
        Some(Value::String(v)) => v.as_str().to_string(),
        other => panic!("{key}: expected string, got {other:?}"),
    }
}

pub fn event_names(span: &SpanData) -> Vec<String> {
    span.events
        .events
        .iter()
        .map(|event| event.name.to_string())
        .collect()
}

pub fn event_attribute(event: &opentelemetry::trace::Event, key: &str) -> Option<Value> {
    event
        .attributes
        .iter()
        .find(|kv| kv.key.as_str() == key)
        .map(|kv| kv.value.clone())
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("rate limit exceeded, retry after {retry_after_secs}s")]
pub struct RateLimitError {
    pub retry_after_secs: u64,
}

/// A chat provider that replays canned answers.
#[derive(Debug, Default)]
pub struct ScriptedChat {
    pub reply: String,
    pub chunks: Vec<String>,
    pub usage: Option<Usage>,
    pub fail_with: Option<RateLimitError>,
    pub calls: Arc<AtomicUsize>,
}

impl ScriptedChat {
    pub fn replying(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            ..Self::default()
        }
    }

    pub fn streaming(chunks: &[&str]) -> Self {
        Self {
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn failing(error: RateLimitError) -> Self {
        Self {
            fail_with: Some(error),
            ..Self::default()
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatProvider for ScriptedChat {
    type Error = RateLimitError;

    fn provider_name(&self) -> &str {
        "scripted"
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, RateLimitError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = &self.fail_with {
            return Err(error.clone());
        }
        Ok(ChatResponse {
            model: request.model,
            message: ChatMessage::assistant(self.reply.clone()),
            usage: self.usage,
            finish_reason: Some("stop".to_string()),
        })
    }

    async fn chat_stream(
        &self,
        _request: ChatRequest,
    ) -> Result<ChunkStream<RateLimitError>, RateLimitError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = &self.fail_with {
            return Err(error.clone());
        }
        let chunks: Vec<Result<ChatChunk, RateLimitError>> = self
            .chunks
            .iter()
            .map(|c| Ok(ChatChunk::text(c.clone())))
            .collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}

pub fn request(model: &str, prompt: &str) -> ChatRequest {
    ChatRequest::new(model, vec![ChatMessage::user(prompt)])
}
