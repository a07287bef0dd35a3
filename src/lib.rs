//! # langspan
//!
//! Transparent OpenTelemetry instrumentation for generative-AI provider calls
//! (chat completion, streaming chat, embeddings, image generation) and
//! vector-store clients.
//!
//! Every instrumented call opens a span, records request parameters, response
//! content and token usage, and closes the span exactly once. Streaming
//! responses are proxied chunk by chunk so the consumer sees the same
//! sequence while usage accumulates incrementally.
//!
//! ```no_run
//! use langspan::instrument::Instrumentor;
//! # async fn demo<C: langspan::provider::ChatProvider>(client: C) {
//! let client = Instrumentor::global().instrument(client);
//! # let _ = client;
//! # }
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod instrument;
pub mod provider;
pub mod registry;
pub mod span;
pub mod stream;
pub mod telemetry;
pub mod tokens;

pub use error::{Error, Result};
