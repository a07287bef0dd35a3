//! Error types for langspan.
//!
//! These cover instrumentation failures only. Errors raised by the wrapped
//! provider calls are never converted into this type; they pass through the
//! wrappers untouched.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("operation not found: {0}")]
    NotFound(String),

    #[error("operation {operation} does not have the expected signature")]
    SignatureMismatch { operation: String },

    #[error("no tokenizer for model: {0}")]
    UnknownModel(String),

    #[error("tokenizer failed: {0}")]
    Tokenizer(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("telemetry error: {0}")]
    Telemetry(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
