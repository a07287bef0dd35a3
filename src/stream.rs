//! Streaming proxy: forward chunks untouched while the span stays open.
//!
//! [`TracedStream`] wraps a single-pass stream of `Result<chunk, error>`.
//! Each chunk is inspected (text delta, token estimate, span event) and then
//! handed to the consumer as-is. The span is finalized:
//!
//! - `Ok` once the source ends, after the last chunk was yielded;
//! - `Error` at the first `Err` item, which is still forwarded unchanged;
//! - cancelled on [`TracedStream::cancel`], a [`CancelHandle`], drop of an
//!   unfinished stream, or when no chunk arrives within the idle timeout.
//!
//! All of those paths race through [`SpanHandle::finish`], so exactly one of
//! them wins.

use crate::span::{SpanHandle, SpanStatus, exception_event};
use crate::telemetry::{genai, metrics};
use crate::tokens;
use futures::Stream;
use futures::task::AtomicWaker;
use opentelemetry::metrics::Counter;
use opentelemetry::{Array, KeyValue, StringValue, Value};
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// A streamed response chunk with optional text content.
pub trait StreamChunk {
    /// Text delta carried by this chunk.
    fn delta_text(&self) -> Option<&str>;

    /// Finish reason reported by this chunk, typically only the last one.
    fn finish_reason(&self) -> Option<&str> {
        None
    }
}

impl StreamChunk for String {
    fn delta_text(&self) -> Option<&str> {
        Some(self)
    }
}

/// Per-stream settings.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Model used to pick the tokenizer for chunk deltas.
    pub model: String,
    /// Provider label for metrics.
    pub provider: String,
    /// Operation label for metrics.
    pub operation: String,
    /// Record chunk deltas and the joined completion.
    pub capture_content: bool,
    /// Finalize the span as cancelled when no chunk arrives for this long.
    ///
    /// Idle time counts from the last chunk received, so a consumer that
    /// pauses longer than this before draining the rest of the stream also
    /// gets an `idle timeout` span. Chunks still flow after that, but the
    /// span keeps the cancelled status. A timeout too large to be added to
    /// the current instant disables the watchdog.
    pub idle_timeout: Option<Duration>,
    /// Extra attributes merged in on successful completion.
    pub final_attributes: Vec<KeyValue>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            model: String::new(),
            provider: String::new(),
            operation: String::new(),
            capture_content: true,
            idle_timeout: None,
            final_attributes: Vec::new(),
        }
    }
}

impl StreamOptions {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Self::default()
        }
    }
}

/// Running totals for one in-flight stream.
struct Accumulator {
    completion_tokens: u64,
    chunk_count: u64,
    content: String,
    finish_reasons: Vec<String>,
    last_activity: Instant,
}

/// Streaming session shared by the stream, its cancel handles and the idle
/// watchdog.
struct Session {
    span: SpanHandle,
    prompt_tokens: u64,
    options: StreamOptions,
    acc: Mutex<Accumulator>,
    cancel_requested: AtomicBool,
    waker: AtomicWaker,
    closed: Notify,
    chunks: Counter<u64>,
}

impl Session {
    fn lock(&self) -> MutexGuard<'_, Accumulator> {
        self.acc.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn observe<C: StreamChunk>(&self, chunk: &C) {
        if self.span.is_detached() {
            return;
        }
        let delta = chunk.delta_text().unwrap_or_default();
        let delta_tokens = tokens::estimate(delta, &self.options.model);

        {
            let mut acc = self.lock();
            acc.completion_tokens += delta_tokens;
            acc.chunk_count += 1;
            acc.last_activity = Instant::now();
            if self.options.capture_content {
                acc.content.push_str(delta);
            }
            if let Some(reason) = chunk.finish_reason() {
                acc.finish_reasons.push(reason.to_string());
            }
        }

        let mut attributes = vec![KeyValue::new(genai::CHUNK_TOKENS, delta_tokens as i64)];
        if self.options.capture_content {
            attributes.push(KeyValue::new(genai::CHUNK_DELTA, delta.to_string()));
        }
        self.span.add_event(genai::EVENT_COMPLETION_CHUNK, attributes);
        self.chunks.add(1, &self.labels());
    }

    fn usage_attributes(&self) -> (Vec<KeyValue>, u64) {
        let acc = self.lock();
        let total = self.prompt_tokens + acc.completion_tokens;
        let mut attributes = vec![
            KeyValue::new(genai::GEN_AI_USAGE_INPUT_TOKENS, self.prompt_tokens as i64),
            KeyValue::new(genai::GEN_AI_USAGE_OUTPUT_TOKENS, acc.completion_tokens as i64),
            KeyValue::new(genai::GEN_AI_USAGE_TOTAL_TOKENS, total as i64),
            KeyValue::new(genai::GEN_AI_USAGE_ESTIMATED, true),
            KeyValue::new(genai::STREAM_CHUNK_COUNT, acc.chunk_count as i64),
        ];
        if self.options.capture_content {
            attributes.push(KeyValue::new(genai::GEN_AI_COMPLETION, acc.content.clone()));
        }
        if !acc.finish_reasons.is_empty() {
            let reasons: Vec<StringValue> = acc
                .finish_reasons
                .iter()
                .cloned()
                .map(StringValue::from)
                .collect();
            attributes.push(KeyValue::new(
                genai::GEN_AI_RESPONSE_FINISH_REASONS,
                Value::Array(Array::from(reasons)),
            ));
        }
        (attributes, acc.completion_tokens)
    }

    fn complete(&self) {
        let (mut attributes, completion_tokens) = self.usage_attributes();
        attributes.extend(self.options.final_attributes.iter().cloned());
        if self.span.finish(SpanStatus::Ok, attributes, Vec::new()) {
            self.record_metrics(&SpanStatus::Ok, completion_tokens);
        }
        self.closed.notify_one();
    }

    fn fail<E: fmt::Display>(&self, error: &E) {
        let (attributes, completion_tokens) = self.usage_attributes();
        let status = SpanStatus::error(error.to_string());
        if self
            .span
            .finish(status.clone(), attributes, vec![exception_event(error)])
        {
            self.record_metrics(&status, completion_tokens);
        }
        self.closed.notify_one();
    }

    fn finish_cancelled(&self, reason: &str) -> bool {
        let (attributes, completion_tokens) = self.usage_attributes();
        let status = SpanStatus::cancelled(reason);
        let finalized = self.span.finish(status.clone(), attributes, Vec::new());
        if finalized && !self.span.is_detached() {
            tracing::debug!(span_id = %self.span.span_id(), reason, "stream span cancelled");
            metrics::stream_cancelled().add(1, &[KeyValue::new("reason", reason.to_string())]);
            self.record_metrics(&status, completion_tokens);
        }
        self.closed.notify_one();
        finalized
    }

    fn cancel(&self, reason: &str) -> bool {
        self.cancel_requested.store(true, Ordering::SeqCst);
        let finalized = self.finish_cancelled(reason);
        self.waker.wake();
        finalized
    }

    fn record_metrics(&self, status: &SpanStatus, completion_tokens: u64) {
        if self.span.is_detached() {
            return;
        }
        let model = KeyValue::new("model", self.options.model.clone());
        let provider = KeyValue::new("provider", self.options.provider.clone());
        let tokens = metrics::llm_tokens();
        tokens.add(
            self.prompt_tokens,
            &[model.clone(), provider.clone(), KeyValue::new("direction", "input")],
        );
        tokens.add(
            completion_tokens,
            &[model, provider.clone(), KeyValue::new("direction", "output")],
        );
        metrics::operation_duration_ms().record(
            self.span.elapsed().as_secs_f64() * 1000.0,
            &[
                KeyValue::new("operation", self.options.operation.clone()),
                provider,
                KeyValue::new("outcome", status.outcome()),
            ],
        );
    }

    fn labels(&self) -> [KeyValue; 2] {
        [
            KeyValue::new("provider", self.options.provider.clone()),
            KeyValue::new("operation", self.options.operation.clone()),
        ]
    }

    fn idle_for(&self) -> Duration {
        self.lock().last_activity.elapsed()
    }
}

/// A stream proxy that traces the chunks flowing through it.
///
/// Yields exactly the items of the wrapped stream in the same order.
pub struct TracedStream<S> {
    source: Option<Pin<Box<S>>>,
    session: Arc<Session>,
}

/// Cancels a [`TracedStream`] from outside the consuming task.
#[derive(Clone)]
pub struct CancelHandle {
    session: Arc<Session>,
}

impl CancelHandle {
    /// Finalize the span as cancelled and end the stream at its next poll.
    ///
    /// Returns `false` if the span had already been finalized.
    pub fn cancel(&self) -> bool {
        self.session.cancel("cancelled by consumer")
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("span", &self.session.span)
            .finish()
    }
}

impl<S> TracedStream<S> {
    /// Forward `source` without tracing it. Cancellation still works.
    pub fn passthrough(source: S) -> Self {
        Self::wrap(source, SpanHandle::detached(), 0, StreamOptions::default())
    }

    /// Wrap `source`, keeping `span` open until the stream settles.
    ///
    /// `prompt_tokens` is added to the completion tokens counted from the
    /// chunks to produce the total. When `options.idle_timeout` is set and a
    /// tokio runtime is available, a watchdog task bounds how long the span
    /// can stay open without progress.
    pub fn wrap(source: S, span: SpanHandle, prompt_tokens: u64, options: StreamOptions) -> Self {
        let idle_timeout = options.idle_timeout;
        let session = Arc::new(Session {
            span,
            prompt_tokens,
            options,
            acc: Mutex::new(Accumulator {
                completion_tokens: 0,
                chunk_count: 0,
                content: String::new(),
                finish_reasons: Vec::new(),
                last_activity: Instant::now(),
            }),
            cancel_requested: AtomicBool::new(false),
            waker: AtomicWaker::new(),
            closed: Notify::new(),
            chunks: metrics::stream_chunks(),
        });

        if let Some(timeout) = idle_timeout {
            spawn_idle_watchdog(Arc::clone(&session), timeout);
        }

        Self {
            source: Some(Box::pin(source)),
            session,
        }
    }

    /// The span this stream reports to.
    pub fn span(&self) -> &SpanHandle {
        &self.session.span
    }

    /// Stop consuming: finalize the span as cancelled and drop the source,
    /// which cancels the underlying transport.
    pub fn cancel(&mut self) -> bool {
        self.source = None;
        self.session.cancel("cancelled by consumer")
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            session: Arc::clone(&self.session),
        }
    }
}

impl<S, C, E> Stream for TracedStream<S>
where
    S: Stream<Item = Result<C, E>>,
    C: StreamChunk,
    E: fmt::Display,
{
    type Item = Result<C, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        this.session.waker.register(cx.waker());

        if this.session.cancel_requested.load(Ordering::SeqCst) {
            this.source = None;
        }
        let Some(source) = this.source.as_mut() else {
            return Poll::Ready(None);
        };

        // Whatever the source does while producing the next chunk runs
        // under this span, regardless of which task polls us.
        let polled = {
            let _guard = this.session.span.context().clone().attach();
            source.as_mut().poll_next(cx)
        };

        match polled {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(chunk))) => {
                this.session.observe(&chunk);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(error))) => {
                // The source stays in place: a consumer that keeps polling
                // after an error sees whatever the source yields next.
                this.session.fail(&error);
                Poll::Ready(Some(Err(error)))
            }
            Poll::Ready(None) => {
                this.source = None;
                this.session.complete();
                Poll::Ready(None)
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match &self.source {
            Some(source) => source.size_hint(),
            None => (0, Some(0)),
        }
    }
}

impl<S> Drop for TracedStream<S> {
    fn drop(&mut self) {
        if self.source.is_some() {
            self.session.finish_cancelled("dropped before completion");
        }
        self.session.closed.notify_one();
    }
}

impl<S> fmt::Debug for TracedStream<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracedStream")
            .field("span", &self.session.span)
            .field("exhausted", &self.source.is_none())
            .finish()
    }
}

fn idle_deadline(last_activity: Instant, timeout: Duration) -> Option<Instant> {
    last_activity.checked_add(timeout)
}

fn spawn_idle_watchdog(session: Arc<Session>, timeout: Duration) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        tracing::debug!("no tokio runtime, stream idle timeout disabled");
        return;
    };

    runtime.spawn(async move {
        loop {
            let Some(deadline) = idle_deadline(session.lock().last_activity, timeout) else {
                tracing::debug!(
                    timeout_secs = timeout.as_secs_f64(),
                    "stream idle timeout out of range, watchdog disabled"
                );
                return;
            };
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = session.closed.notified() => return,
            }
            if session.span.is_finished() {
                return;
            }
            if session.idle_for() >= timeout {
                tracing::warn!(
                    span_id = %session.span.span_id(),
                    timeout_secs = timeout.as_secs_f64(),
                    "stream idle, finalizing span"
                );
                session.finish_cancelled("idle timeout");
                return;
            }
        }
    });
}
