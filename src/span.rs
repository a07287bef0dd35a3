//! Span lifecycle: start, activate, finish exactly once.
//!
//! A [`SpanHandle`] owns the OpenTelemetry [`Context`] that carries the span
//! (plus the ambient attributes it was started under). Every mutation goes
//! through a single lock together with the `ended` flag, so once
//! [`SpanHandle::finish`] has run no attribute or event can be added and a
//! second `finish` from another path (a deferred stream, a drop guard, a
//! cancel hook) is a no-op.

use crate::context::{self, Attributes};
use crate::telemetry::genai;
use opentelemetry::trace::{
    SpanContext, SpanId, Status, TraceContextExt as _, TraceId, Tracer,
};
use opentelemetry::{Context, KeyValue};
use opentelemetry_semantic_conventions::attribute::{EXCEPTION_MESSAGE, EXCEPTION_TYPE};
use std::borrow::Cow;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

pub use opentelemetry::trace::SpanKind;

/// Attribute set on spans finalized as cancelled.
pub const SPAN_CANCELLED: &str = "langspan.span.cancelled";
/// Why a cancelled span was finalized.
pub const SPAN_CANCEL_REASON: &str = "langspan.span.cancel_reason";
/// Event name used for recorded errors.
pub const EXCEPTION_EVENT: &str = "exception";
/// Event name used for cancellation.
pub const CANCELLED_EVENT: &str = "cancelled";

/// Terminal status of an instrumented operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpanStatus {
    Ok,
    Error { message: String },
    /// The consumer stopped before the operation completed. Exported as an
    /// unset status plus [`SPAN_CANCELLED`], since cancellation is not a
    /// failure of the traced call.
    Cancelled { reason: String },
}

impl SpanStatus {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    /// Short label used for metrics.
    pub fn outcome(&self) -> &'static str {
        match self {
            SpanStatus::Ok => "ok",
            SpanStatus::Error { .. } => "error",
            SpanStatus::Cancelled { .. } => "cancelled",
        }
    }
}

/// A timestamped event to append when finishing a span.
#[derive(Debug, Clone)]
pub struct SpanEvent {
    pub name: Cow<'static, str>,
    pub attributes: Vec<KeyValue>,
}

impl SpanEvent {
    pub fn new(name: impl Into<Cow<'static, str>>, attributes: Vec<KeyValue>) -> Self {
        Self {
            name: name.into(),
            attributes,
        }
    }
}

/// Shared handle to an open span. Cheap to clone.
#[derive(Clone)]
pub struct SpanHandle {
    inner: Arc<Inner>,
}

struct Inner {
    cx: Context,
    ended: Mutex<bool>,
    started: Instant,
    detached: bool,
}

impl fmt::Debug for SpanHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpanHandle")
            .field("span_context", &self.span_context())
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl SpanHandle {
    fn new(cx: Context) -> Self {
        Self::build(cx, false)
    }

    /// A handle that records nothing, for operations whose instrumentation
    /// is disabled. Its context is the caller's, so nested calls keep their
    /// parent; finishing it never touches that parent span.
    pub fn detached() -> Self {
        Self::build(Context::current(), true)
    }

    fn build(cx: Context, detached: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                cx,
                ended: Mutex::new(false),
                started: Instant::now(),
                detached,
            }),
        }
    }

    pub fn is_detached(&self) -> bool {
        self.inner.detached
    }

    /// The context with this span active. Pass it as an explicit parent or
    /// attach it to make this span the parent of nested calls.
    pub fn context(&self) -> &Context {
        &self.inner.cx
    }

    pub fn span_context(&self) -> SpanContext {
        self.inner.cx.span().span_context().clone()
    }

    pub fn trace_id(&self) -> TraceId {
        self.span_context().trace_id()
    }

    pub fn span_id(&self) -> SpanId {
        self.span_context().span_id()
    }

    pub fn elapsed(&self) -> Duration {
        self.inner.started.elapsed()
    }

    pub fn is_finished(&self) -> bool {
        *self.lock()
    }

    /// Set attributes. Ignored once the span is finished.
    pub fn set_attributes(&self, attributes: impl IntoIterator<Item = KeyValue>) {
        let ended = self.lock();
        if !*ended && !self.inner.detached {
            self.inner.cx.span().set_attributes(attributes);
        }
    }

    /// Append an event. Ignored once the span is finished.
    pub fn add_event(&self, name: impl Into<Cow<'static, str>>, attributes: Vec<KeyValue>) {
        let ended = self.lock();
        if !*ended && !self.inner.detached {
            self.inner.cx.span().add_event(name, attributes);
        }
    }

    /// Record an error as an `exception` event carrying its type and message.
    pub fn record_exception<E: fmt::Display + ?Sized>(&self, error: &E) {
        self.add_event(EXCEPTION_EVENT, exception_attributes(error));
    }

    /// Record `error` and finish with an error status.
    pub fn fail<E: fmt::Display + ?Sized>(&self, error: &E) -> bool {
        self.finish(
            SpanStatus::error(error.to_string()),
            Vec::new(),
            vec![exception_event(error)],
        )
    }

    /// Finalize the span: merge `attributes`, append `events`, set the
    /// status and end it.
    ///
    /// Returns `true` if this call ended the span and `false` if it had
    /// already been finished, in which case nothing is recorded.
    pub fn finish(
        &self,
        status: SpanStatus,
        attributes: Vec<KeyValue>,
        events: Vec<SpanEvent>,
    ) -> bool {
        let mut ended = self.lock();
        if *ended {
            return false;
        }
        *ended = true;
        if self.inner.detached {
            return true;
        }

        let span = self.inner.cx.span();
        span.set_attributes(attributes);
        for event in events {
            span.add_event(event.name, event.attributes);
        }
        match status {
            SpanStatus::Ok => span.set_status(Status::Ok),
            SpanStatus::Error { message } => span.set_status(Status::error(message)),
            SpanStatus::Cancelled { reason } => {
                span.set_attribute(KeyValue::new(SPAN_CANCELLED, true));
                span.set_attribute(KeyValue::new(SPAN_CANCEL_REASON, reason.clone()));
                span.add_event(
                    CANCELLED_EVENT,
                    vec![KeyValue::new(SPAN_CANCEL_REASON, reason)],
                );
            }
        }
        span.end();
        true
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, bool> {
        self.inner
            .ended
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// The `exception` event recorded for `error`.
pub fn exception_event<E: fmt::Display + ?Sized>(error: &E) -> SpanEvent {
    SpanEvent::new(EXCEPTION_EVENT, exception_attributes(error))
}

fn exception_attributes<E: fmt::Display + ?Sized>(error: &E) -> Vec<KeyValue> {
    vec![
        KeyValue::new(EXCEPTION_TYPE, short_type_name::<E>()),
        KeyValue::new(EXCEPTION_MESSAGE, error.to_string()),
    ]
}

// `my_crate::errors::RateLimitError` -> `RateLimitError`
fn short_type_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

/// Start a span.
///
/// The parent is `parent` when given, otherwise the current context; with no
/// active span there the new span is a root. Ambient attributes of the parent
/// context are merged over `attributes`, and [`context::SPAN_NAME_OVERRIDE`]
/// replaces `name` when set.
pub fn start_span<T>(
    tracer: &T,
    name: &str,
    kind: SpanKind,
    attributes: Attributes,
    parent: Option<&Context>,
) -> SpanHandle
where
    T: Tracer,
    T::Span: Send + Sync + 'static,
{
    let parent_cx = parent.cloned().unwrap_or_else(Context::current);
    let ambient = context::attributes_in(&parent_cx);
    let name = context::span_name_override(&ambient).unwrap_or_else(|| name.to_string());

    let mut merged = attributes;
    merged.extend(ambient);

    let span = tracer
        .span_builder(name)
        .with_kind(kind)
        .with_attributes(merged.into_iter().map(|(k, v)| KeyValue::new(k, v)))
        .start_with_context(tracer, &parent_cx);

    SpanHandle::new(parent_cx.with_span(span))
}

/// Run `future` with `span` as the active span for its whole extent.
///
/// The span's context is attached on every poll, so nested calls see it as
/// their parent even when the task migrates between threads.
pub fn run_with_active_span<F>(span: &SpanHandle, future: F) -> impl Future<Output = F::Output>
where
    F: Future,
{
    use opentelemetry::context::FutureExt as _;
    future.with_context(span.context().clone())
}

/// Synchronous counterpart of [`run_with_active_span`].
pub fn run_with_active_span_sync<R>(span: &SpanHandle, f: impl FnOnce() -> R) -> R {
    let _guard = span.context().clone().attach();
    f()
}

/// Finishes the span as cancelled if the owning future is dropped while
/// still armed.
pub(crate) struct CancelOnDrop<'a> {
    span: &'a SpanHandle,
    armed: bool,
}

impl<'a> CancelOnDrop<'a> {
    pub(crate) fn new(span: &'a SpanHandle) -> Self {
        Self { span, armed: true }
    }

    /// Hand the span over to another owner.
    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed
            && self
                .span
                .finish(SpanStatus::cancelled("dropped"), Vec::new(), Vec::new())
        {
            tracing::debug!(span_id = %self.span.span_id(), "operation dropped before completion");
        }
    }
}

/// Drive a single-response operation inside `span`.
///
/// On success `on_success` derives the response attributes and the span is
/// finished `Ok`; on error the exception is recorded, the span finished with
/// an error status, and the original error returned untouched.
pub async fn trace_operation<R, E, Fut>(
    span: SpanHandle,
    operation: Fut,
    on_success: impl FnOnce(&R) -> Vec<KeyValue>,
) -> Result<R, E>
where
    Fut: Future<Output = Result<R, E>>,
    E: fmt::Display,
{
    let _guard = CancelOnDrop::new(&span);
    match run_with_active_span(&span, operation).await {
        Ok(value) => {
            let attributes = on_success(&value);
            span.finish(SpanStatus::Ok, attributes, Vec::new());
            Ok(value)
        }
        Err(error) => {
            span.fail(&error);
            Err(error)
        }
    }
}

/// Run `f` inside a fresh root span, handing it the span and trace ids.
///
/// Instrumented calls made inside `f` become children of the root span,
/// which gives them a shared trace id for correlating feedback later.
pub async fn with_root_span<T, R, E, F, Fut>(
    tracer: &T,
    name: &str,
    kind: SpanKind,
    f: F,
) -> Result<R, E>
where
    T: Tracer,
    T::Span: Send + Sync + 'static,
    F: FnOnce(SpanId, TraceId) -> Fut,
    Fut: Future<Output = Result<R, E>>,
    E: fmt::Display,
{
    let root_cx = context::context_with_attributes(&Context::new(), context::current_attributes());
    let span = start_span(
        tracer,
        name,
        kind,
        context::attributes([KeyValue::new(genai::LANGSPAN_SDK_NAME, genai::SDK_NAME)]),
        Some(&root_cx),
    );
    let future = f(span.span_id(), span.trace_id());
    trace_operation(span, future, |_| Vec::new()).await
}
