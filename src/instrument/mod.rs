//! Transparent instrumentation of provider and vector-store operations.
//!
//! The [`Instrumentor`] owns a tracer and the instrumentation settings and
//! offers one wrapper per operation. Each wrapper opens a client span named
//! `{provider}.{operation}`, runs the original call inside it, derives
//! response attributes (token usage included) and returns the original
//! result untouched. Streaming chat defers finalization to a
//! [`TracedStream`].
//!
//! The wrappers are reachable three ways:
//! - directly (`trace_chat(provider, request, |r| client.chat(r))`);
//! - as a decorator over a client ([`Instrumentor::instrument`]);
//! - installed into a shared [`MethodTable`] through an
//!   [`InterceptorRegistry`] (`install_*`).

mod adapter;
mod attributes;

pub use adapter::Instrumented;

use crate::context;
use crate::error::{Error, Result};
use crate::provider::{
    ChatRequest, ChatResponse, ChunkStream, EmbeddingRequest, EmbeddingResponse, ImageRequest,
    ImageResponse,
};
use crate::registry::{self, InterceptorRegistry, Method, MethodTable};
use crate::span::{self, CancelOnDrop, SpanHandle, SpanKind};
use crate::stream::{StreamChunk, StreamOptions, TracedStream};
use crate::telemetry::metrics;
use crate::tokens;
use attributes::ResolvedUsage;
use futures::Stream;
use opentelemetry::KeyValue;
use opentelemetry::global::BoxedTracer;
use opentelemetry::trace::Tracer;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Method-table entry names used by the `install_*` helpers.
pub mod methods {
    pub const CHAT: &str = "chat";
    pub const CHAT_STREAM: &str = "chat_stream";
    pub const EMBED: &str = "embed";
    pub const GENERATE_IMAGES: &str = "generate_images";
}

// ---------------------------------------------------------------------------
// Operations and settings
// ---------------------------------------------------------------------------

/// An instrumentable operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    ChatCompletions,
    Embeddings,
    ImagesGenerate,
    VectorQuery,
    VectorUpsert,
    VectorDelete,
}

impl Operation {
    pub const ALL: [Operation; 6] = [
        Operation::ChatCompletions,
        Operation::Embeddings,
        Operation::ImagesGenerate,
        Operation::VectorQuery,
        Operation::VectorUpsert,
        Operation::VectorDelete,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Operation::ChatCompletions => "chat.completions.create",
            Operation::Embeddings => "embeddings.create",
            Operation::ImagesGenerate => "images.generate",
            Operation::VectorQuery => "vector.query",
            Operation::VectorUpsert => "vector.upsert",
            Operation::VectorDelete => "vector.delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Operation::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| Error::Config(format!("unknown operation {s:?}")))
    }
}

/// Knobs shared by every wrapper.
#[derive(Debug, Clone)]
pub struct InstrumentationSettings {
    /// Record prompts, completions and chunk deltas.
    pub capture_content: bool,
    /// Bound on how long a stream span may stay open without a chunk.
    pub stream_idle_timeout: Option<Duration>,
    /// Operations that run without a span.
    pub disabled_operations: Vec<Operation>,
}

impl Default for InstrumentationSettings {
    fn default() -> Self {
        Self {
            capture_content: true,
            stream_idle_timeout: Some(Duration::from_secs(
                crate::config::DEFAULT_STREAM_IDLE_TIMEOUT_SECS,
            )),
            disabled_operations: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Instrumentor
// ---------------------------------------------------------------------------

/// Opens spans around provider calls.
///
/// Generic over the tracer so tests can hand in an SDK tracer; the default
/// is the globally registered one.
pub struct Instrumentor<T = BoxedTracer> {
    tracer: Arc<T>,
    settings: Arc<InstrumentationSettings>,
}

impl<T> Clone for Instrumentor<T> {
    fn clone(&self) -> Self {
        Self {
            tracer: Arc::clone(&self.tracer),
            settings: Arc::clone(&self.settings),
        }
    }
}

impl<T> fmt::Debug for Instrumentor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instrumentor")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Instrumentor<BoxedTracer> {
    /// Instrumentor over the global tracer provider with default settings.
    pub fn global() -> Self {
        Self::global_with(InstrumentationSettings::default())
    }

    pub fn global_with(settings: InstrumentationSettings) -> Self {
        let scope = opentelemetry::InstrumentationScope::builder(crate::telemetry::genai::SDK_NAME)
            .with_version(crate::telemetry::genai::SDK_VERSION)
            .build();
        Self::new(opentelemetry::global::tracer_with_scope(scope), settings)
    }
}

impl<T> Instrumentor<T>
where
    T: Tracer + Send + Sync + 'static,
    T::Span: Send + Sync + 'static,
{
    pub fn new(tracer: T, settings: InstrumentationSettings) -> Self {
        Self {
            tracer: Arc::new(tracer),
            settings: Arc::new(settings),
        }
    }

    pub fn settings(&self) -> &InstrumentationSettings {
        &self.settings
    }

    pub fn tracer(&self) -> &T {
        &self.tracer
    }

    pub fn is_enabled(&self, operation: Operation) -> bool {
        !self.settings.disabled_operations.contains(&operation)
    }

    /// Wrap `client` so that every capability it implements is traced.
    pub fn instrument<C>(&self, client: C) -> Instrumented<C, T> {
        Instrumented::new(client, self.clone())
    }

    fn start(&self, name: &str, attributes: Vec<KeyValue>) -> SpanHandle {
        span::start_span(
            &*self.tracer,
            name,
            SpanKind::Client,
            context::attributes(attributes),
            None,
        )
    }

    fn start_genai(
        &self,
        provider: &str,
        operation: Operation,
        request: Vec<KeyValue>,
    ) -> SpanHandle {
        let mut attrs = attributes::common(provider, operation);
        attrs.extend(request);
        self.start(&format!("{provider}.{operation}"), attrs)
    }

    // -----------------------------------------------------------------------
    // Core wrappers
    // -----------------------------------------------------------------------

    /// Trace a single-response chat completion.
    ///
    /// Usage reported by the provider is recorded as-is; otherwise prompt
    /// and completion tokens are estimated.
    pub async fn trace_chat<F, Fut, E>(
        &self,
        provider: &str,
        request: ChatRequest,
        call: F,
    ) -> std::result::Result<ChatResponse, E>
    where
        F: FnOnce(ChatRequest) -> Fut,
        Fut: Future<Output = std::result::Result<ChatResponse, E>>,
        E: fmt::Display,
    {
        let operation = Operation::ChatCompletions;
        if !self.is_enabled(operation) {
            return call(request).await;
        }

        let capture = self.settings.capture_content;
        let model = request.model.clone();
        let prompt_tokens = tokens::estimate_prompt(&request.messages, &model);
        let span = self.start_genai(
            provider,
            operation,
            attributes::chat_request(&request, false, capture),
        );
        let started = Instant::now();

        let mut usage = None;
        let result = span::trace_operation(span, call(request), |response| {
            let resolved = attributes::chat_usage(response, prompt_tokens, &model);
            usage = Some(resolved);
            attributes::chat_response(response, &resolved, capture)
        })
        .await;

        let outcome = Outcome::of(&result);
        record_call(provider, &model, operation, outcome, started, usage);
        result
    }

    /// Trace a streamed chat completion.
    ///
    /// The span opened here stays open inside the returned [`TracedStream`]
    /// until the stream ends, fails, is cancelled, dropped, or goes idle.
    /// Failing to establish the stream finishes the span with an error.
    pub async fn trace_chat_stream<F, Fut, S, C, E>(
        &self,
        provider: &str,
        request: ChatRequest,
        call: F,
    ) -> std::result::Result<TracedStream<S>, E>
    where
        F: FnOnce(ChatRequest) -> Fut,
        Fut: Future<Output = std::result::Result<S, E>>,
        S: Stream<Item = std::result::Result<C, E>>,
        C: StreamChunk,
        E: fmt::Display,
    {
        let operation = Operation::ChatCompletions;
        if !self.is_enabled(operation) {
            return call(request).await.map(TracedStream::passthrough);
        }

        let capture = self.settings.capture_content;
        let model = request.model.clone();
        let prompt_tokens = tokens::estimate_prompt(&request.messages, &model);
        let span = self.start_genai(
            provider,
            operation,
            attributes::chat_request(&request, true, capture),
        );
        let started = Instant::now();

        let mut guard = CancelOnDrop::new(&span);
        let established = span::run_with_active_span(&span, call(request)).await;
        guard.disarm();

        match established {
            Ok(source) => Ok(TracedStream::wrap(
                source,
                span.clone(),
                prompt_tokens,
                StreamOptions {
                    model,
                    provider: provider.to_string(),
                    operation: operation.as_str().to_string(),
                    capture_content: capture,
                    idle_timeout: self.settings.stream_idle_timeout,
                    final_attributes: Vec::new(),
                },
            )),
            Err(error) => {
                span.fail(&error);
                record_call(provider, &model, operation, Outcome::Error, started, None);
                Err(error)
            }
        }
    }

    /// Trace an embeddings call.
    pub async fn trace_embeddings<F, Fut, E>(
        &self,
        provider: &str,
        request: EmbeddingRequest,
        call: F,
    ) -> std::result::Result<EmbeddingResponse, E>
    where
        F: FnOnce(EmbeddingRequest) -> Fut,
        Fut: Future<Output = std::result::Result<EmbeddingResponse, E>>,
        E: fmt::Display,
    {
        let operation = Operation::Embeddings;
        if !self.is_enabled(operation) {
            return call(request).await;
        }

        let model = request.model.clone();
        let input_tokens = attributes::embedding_input_tokens(&request);
        let span = self.start_genai(
            provider,
            operation,
            attributes::embedding_request(&request, self.settings.capture_content),
        );
        let started = Instant::now();

        let mut usage = None;
        let result = span::trace_operation(span, call(request), |response| {
            usage = Some(ResolvedUsage::resolve(response.usage, || (input_tokens, 0)));
            attributes::embedding_response(response, input_tokens)
        })
        .await;

        record_call(provider, &model, operation, Outcome::of(&result), started, usage);
        result
    }

    /// Trace an image generation call.
    pub async fn trace_images<F, Fut, E>(
        &self,
        provider: &str,
        request: ImageRequest,
        call: F,
    ) -> std::result::Result<ImageResponse, E>
    where
        F: FnOnce(ImageRequest) -> Fut,
        Fut: Future<Output = std::result::Result<ImageResponse, E>>,
        E: fmt::Display,
    {
        let operation = Operation::ImagesGenerate;
        if !self.is_enabled(operation) {
            return call(request).await;
        }

        let capture = self.settings.capture_content;
        let model = request.model.clone();
        let span = self.start_genai(
            provider,
            operation,
            attributes::image_request(&request, capture),
        );
        let started = Instant::now();

        let result = span::trace_operation(span, call(request), |response| {
            attributes::image_response(response, capture)
        })
        .await;

        record_call(provider, &model, operation, Outcome::of(&result), started, None);
        result
    }

    /// Trace a vector-store operation against `collection`.
    ///
    /// `request` holds operation-specific attributes such as top-k; the
    /// response-derived ones come from `on_success`.
    pub async fn trace_vector<R, E, Fut>(
        &self,
        system: &str,
        operation: Operation,
        collection: &str,
        request: Vec<KeyValue>,
        call: Fut,
        on_success: impl FnOnce(&R) -> Vec<KeyValue>,
    ) -> std::result::Result<R, E>
    where
        Fut: Future<Output = std::result::Result<R, E>>,
        E: fmt::Display,
    {
        if !self.is_enabled(operation) {
            return call.await;
        }

        let mut attrs = attributes::vector(system, operation, collection);
        attrs.extend(request);
        let span = self.start(&format!("{system}.{operation}"), attrs);
        let started = Instant::now();

        let result = span::trace_operation(span, call, on_success).await;

        metrics::operation_duration_ms().record(
            elapsed_ms(started),
            &[
                KeyValue::new("operation", operation.as_str()),
                KeyValue::new("provider", system.to_string()),
                KeyValue::new("outcome", Outcome::of(&result).as_str()),
            ],
        );
        result
    }

    // -----------------------------------------------------------------------
    // Method-table factories
    // -----------------------------------------------------------------------

    /// Wrap a chat method so every call through it is traced.
    pub fn wrap_chat<E>(
        &self,
        provider: impl Into<String>,
        original: Method<ChatRequest, std::result::Result<ChatResponse, E>>,
    ) -> Method<ChatRequest, std::result::Result<ChatResponse, E>>
    where
        E: fmt::Display + Send + 'static,
    {
        let this = self.clone();
        let provider: Arc<str> = provider.into().into();
        registry::method(move |request: ChatRequest| {
            let this = this.clone();
            let provider = Arc::clone(&provider);
            let original = Arc::clone(&original);
            async move {
                this.trace_chat(&provider, request, |r| original(r))
                    .await
            }
        })
    }

    /// Wrap a streaming chat method; the stream it returns is traced.
    pub fn wrap_chat_stream<E>(
        &self,
        provider: impl Into<String>,
        original: Method<ChatRequest, std::result::Result<ChunkStream<E>, E>>,
    ) -> Method<ChatRequest, std::result::Result<ChunkStream<E>, E>>
    where
        E: fmt::Display + Send + 'static,
    {
        let this = self.clone();
        let provider: Arc<str> = provider.into().into();
        registry::method(move |request: ChatRequest| {
            let this = this.clone();
            let provider = Arc::clone(&provider);
            let original = Arc::clone(&original);
            async move {
                let traced = this
                    .trace_chat_stream(&provider, request, |r| original(r))
                    .await?;
                Ok(Box::pin(traced) as ChunkStream<E>)
            }
        })
    }

    pub fn wrap_embeddings<E>(
        &self,
        provider: impl Into<String>,
        original: Method<EmbeddingRequest, std::result::Result<EmbeddingResponse, E>>,
    ) -> Method<EmbeddingRequest, std::result::Result<EmbeddingResponse, E>>
    where
        E: fmt::Display + Send + 'static,
    {
        let this = self.clone();
        let provider: Arc<str> = provider.into().into();
        registry::method(move |request: EmbeddingRequest| {
            let this = this.clone();
            let provider = Arc::clone(&provider);
            let original = Arc::clone(&original);
            async move {
                this.trace_embeddings(&provider, request, |r| original(r))
                    .await
            }
        })
    }

    pub fn wrap_images<E>(
        &self,
        provider: impl Into<String>,
        original: Method<ImageRequest, std::result::Result<ImageResponse, E>>,
    ) -> Method<ImageRequest, std::result::Result<ImageResponse, E>>
    where
        E: fmt::Display + Send + 'static,
    {
        let this = self.clone();
        let provider: Arc<str> = provider.into().into();
        registry::method(move |request: ImageRequest| {
            let this = this.clone();
            let provider = Arc::clone(&provider);
            let original = Arc::clone(&original);
            async move {
                this.trace_images(&provider, request, |r| original(r))
                    .await
            }
        })
    }

    // -----------------------------------------------------------------------
    // Method-table installation
    // -----------------------------------------------------------------------

    /// Install the chat wrapper into `table` under [`methods::CHAT`].
    ///
    /// Disabled operations are skipped. Lookup failures are logged by the
    /// registry and returned.
    pub fn install_chat<E>(
        &self,
        registry: &InterceptorRegistry,
        table: &MethodTable,
        provider: &str,
    ) -> Result<()>
    where
        E: fmt::Display + Send + 'static,
    {
        if !self.skip_install(Operation::ChatCompletions, table, methods::CHAT) {
            registry.install(table, methods::CHAT, |original| {
                self.wrap_chat::<E>(provider, original)
            })?;
        }
        Ok(())
    }

    pub fn install_chat_stream<E>(
        &self,
        registry: &InterceptorRegistry,
        table: &MethodTable,
        provider: &str,
    ) -> Result<()>
    where
        E: fmt::Display + Send + 'static,
    {
        if !self.skip_install(Operation::ChatCompletions, table, methods::CHAT_STREAM) {
            registry.install(table, methods::CHAT_STREAM, |original| {
                self.wrap_chat_stream::<E>(provider, original)
            })?;
        }
        Ok(())
    }

    pub fn install_embeddings<E>(
        &self,
        registry: &InterceptorRegistry,
        table: &MethodTable,
        provider: &str,
    ) -> Result<()>
    where
        E: fmt::Display + Send + 'static,
    {
        if !self.skip_install(Operation::Embeddings, table, methods::EMBED) {
            registry.install(table, methods::EMBED, |original| {
                self.wrap_embeddings::<E>(provider, original)
            })?;
        }
        Ok(())
    }

    pub fn install_images<E>(
        &self,
        registry: &InterceptorRegistry,
        table: &MethodTable,
        provider: &str,
    ) -> Result<()>
    where
        E: fmt::Display + Send + 'static,
    {
        if !self.skip_install(Operation::ImagesGenerate, table, methods::GENERATE_IMAGES) {
            registry.install(table, methods::GENERATE_IMAGES, |original| {
                self.wrap_images::<E>(provider, original)
            })?;
        }
        Ok(())
    }

    fn skip_install(&self, operation: Operation, table: &MethodTable, method: &str) -> bool {
        let skip = !self.is_enabled(operation);
        if skip {
            tracing::debug!(table = table.name(), method, %operation, "operation disabled, not installing");
        }
        skip
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Ok,
    Error,
}

impl Outcome {
    fn of<R, E>(result: &std::result::Result<R, E>) -> Self {
        if result.is_ok() {
            Outcome::Ok
        } else {
            Outcome::Error
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Outcome::Ok => "ok",
            Outcome::Error => "error",
        }
    }
}

fn record_call(
    provider: &str,
    model: &str,
    operation: Operation,
    outcome: Outcome,
    started: Instant,
    usage: Option<ResolvedUsage>,
) {
    let provider_kv = KeyValue::new("provider", provider.to_string());
    metrics::operation_duration_ms().record(
        elapsed_ms(started),
        &[
            KeyValue::new("operation", operation.as_str()),
            provider_kv.clone(),
            KeyValue::new("outcome", outcome.as_str()),
        ],
    );

    if let Some(usage) = usage {
        let model_kv = KeyValue::new("model", model.to_string());
        let tokens = metrics::llm_tokens();
        tokens.add(
            usage.input,
            &[model_kv.clone(), provider_kv.clone(), KeyValue::new("direction", "input")],
        );
        tokens.add(
            usage.output,
            &[model_kv, provider_kv, KeyValue::new("direction", "output")],
        );
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}
