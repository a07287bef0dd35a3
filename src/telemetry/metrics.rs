//! Metric instrument factories for langspan.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"langspan"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for langspan instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("langspan")
}

/// Counter: LLM token usage.
/// Labels: `model`, `provider`, `direction` ("input" | "output").
pub fn llm_tokens() -> Counter<u64> {
    meter()
        .u64_counter("langspan.llm.tokens")
        .with_description("LLM token usage")
        .build()
}

/// Histogram: instrumented operation duration in milliseconds.
/// Labels: `operation`, `provider`, `outcome` ("ok" | "error" | "cancelled").
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("langspan.operation.duration_ms")
        .with_description("Instrumented operation duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: streamed chunks forwarded through a traced stream.
pub fn stream_chunks() -> Counter<u64> {
    meter()
        .u64_counter("langspan.stream.chunks")
        .with_description("Chunks forwarded by traced streams")
        .build()
}

/// Counter: streams finalized without reaching their end.
/// Labels: `reason`.
pub fn stream_cancelled() -> Counter<u64> {
    meter()
        .u64_counter("langspan.stream.cancelled")
        .with_description("Traced streams finalized as cancelled")
        .build()
}
