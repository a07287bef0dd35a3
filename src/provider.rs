//! Provider-neutral request/response types and capability traits.
//!
//! Client crates implement these traits for their concrete SDK; the
//! instrumentation layer only ever sees this surface. Every trait carries
//! its own associated error type, which instrumentation returns untouched.

use crate::stream::StreamChunk;
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;

/// A lazily produced sequence of chat chunks.
pub type ChunkStream<E> = Pin<Box<dyn Stream<Item = Result<ChatChunk, E>> + Send>>;

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            ..Self::default()
        }
    }
}

/// Token usage as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub model: String,
    pub message: ChatMessage,
    #[serde(default)]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// One element of a streamed chat response.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChatChunk {
    #[serde(default)]
    pub delta: Option<String>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

impl ChatChunk {
    pub fn text(delta: impl Into<String>) -> Self {
        Self {
            delta: Some(delta.into()),
            finish_reason: None,
        }
    }

    pub fn finished(reason: impl Into<String>) -> Self {
        Self {
            delta: None,
            finish_reason: Some(reason.into()),
        }
    }
}

impl StreamChunk for ChatChunk {
    fn delta_text(&self) -> Option<&str> {
        self.delta.as_deref()
    }

    fn finish_reason(&self) -> Option<&str> {
        self.finish_reason.as_deref()
    }
}

// ---------------------------------------------------------------------------
// Embeddings and images
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    pub model: String,
    pub inputs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    pub model: String,
    pub embeddings: Vec<Vec<f32>>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRequest {
    pub model: String,
    pub prompt: String,
    #[serde(default = "default_image_count")]
    pub n: u32,
    #[serde(default)]
    pub size: Option<String>,
}

fn default_image_count() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedImage {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub revised_prompt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageResponse {
    pub images: Vec<GeneratedImage>,
}

// ---------------------------------------------------------------------------
// Vector stores
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorQuery {
    pub collection: String,
    pub vector: Vec<f32>,
    pub top_k: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorMatch {
    pub id: String,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub vector: Vec<f32>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// Chat completion, single-response and streaming.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    type Error: fmt::Display + Send + Sync + 'static;

    /// Provider label used in span names and attributes, e.g. `openai`.
    fn provider_name(&self) -> &str;

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, Self::Error>;

    /// Start a streamed completion. Errors before the first chunk surface
    /// here; later ones arrive as stream items.
    async fn chat_stream(&self, request: ChatRequest) -> Result<ChunkStream<Self::Error>, Self::Error>;
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    type Error: fmt::Display + Send + Sync + 'static;

    fn provider_name(&self) -> &str;

    async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse, Self::Error>;
}

#[async_trait]
pub trait ImageProvider: Send + Sync {
    type Error: fmt::Display + Send + Sync + 'static;

    fn provider_name(&self) -> &str;

    async fn generate_images(&self, request: ImageRequest) -> Result<ImageResponse, Self::Error>;
}

/// A vector database client.
#[async_trait]
pub trait VectorStore: Send + Sync {
    type Error: fmt::Display + Send + Sync + 'static;

    /// Database system label, e.g. `qdrant`.
    fn system_name(&self) -> &str;

    async fn query(&self, query: VectorQuery) -> Result<Vec<VectorMatch>, Self::Error>;

    async fn upsert(&self, collection: &str, records: Vec<VectorRecord>) -> Result<usize, Self::Error>;

    async fn delete(&self, collection: &str, ids: Vec<String>) -> Result<usize, Self::Error>;
}
