//! Decorator that instruments a provider client.

use super::{Instrumentor, Operation};
use crate::provider::{
    ChatProvider, ChatRequest, ChatResponse, ChunkStream, EmbeddingProvider, EmbeddingRequest,
    EmbeddingResponse, ImageProvider, ImageRequest, ImageResponse, VectorMatch, VectorQuery,
    VectorRecord, VectorStore,
};
use crate::telemetry::genai;
use async_trait::async_trait;
use opentelemetry::KeyValue;
use opentelemetry::global::BoxedTracer;
use opentelemetry::trace::Tracer;

/// A client whose calls are traced.
///
/// Implements every provider trait the wrapped client implements, with the
/// same inputs, outputs and errors.
pub struct Instrumented<C, T = BoxedTracer> {
    inner: C,
    instrumentor: Instrumentor<T>,
}

impl<C, T> Instrumented<C, T> {
    pub(super) fn new(inner: C, instrumentor: Instrumentor<T>) -> Self {
        Self {
            inner,
            instrumentor,
        }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    /// Unwrap, giving back the uninstrumented client.
    pub fn into_inner(self) -> C {
        self.inner
    }
}

impl<C: std::fmt::Debug, T> std::fmt::Debug for Instrumented<C, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instrumented")
            .field("inner", &self.inner)
            .field("instrumentor", &self.instrumentor)
            .finish()
    }
}

#[async_trait]
impl<C, T> ChatProvider for Instrumented<C, T>
where
    C: ChatProvider,
    T: Tracer + Send + Sync + 'static,
    T::Span: Send + Sync + 'static,
{
    type Error = C::Error;

    fn provider_name(&self) -> &str {
        self.inner.provider_name()
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, Self::Error> {
        self.instrumentor
            .trace_chat(self.inner.provider_name(), request, |r| self.inner.chat(r))
            .await
    }

    async fn chat_stream(
        &self,
        request: ChatRequest,
    ) -> Result<ChunkStream<Self::Error>, Self::Error> {
        let traced = self
            .instrumentor
            .trace_chat_stream(self.inner.provider_name(), request, |r| {
                self.inner.chat_stream(r)
            })
            .await?;
        Ok(Box::pin(traced))
    }
}

#[async_trait]
impl<C, T> EmbeddingProvider for Instrumented<C, T>
where
    C: EmbeddingProvider,
    T: Tracer + Send + Sync + 'static,
    T::Span: Send + Sync + 'static,
{
    type Error = C::Error;

    fn provider_name(&self) -> &str {
        self.inner.provider_name()
    }

    async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse, Self::Error> {
        self.instrumentor
            .trace_embeddings(self.inner.provider_name(), request, |r| self.inner.embed(r))
            .await
    }
}

#[async_trait]
impl<C, T> ImageProvider for Instrumented<C, T>
where
    C: ImageProvider,
    T: Tracer + Send + Sync + 'static,
    T::Span: Send + Sync + 'static,
{
    type Error = C::Error;

    fn provider_name(&self) -> &str {
        self.inner.provider_name()
    }

    async fn generate_images(&self, request: ImageRequest) -> Result<ImageResponse, Self::Error> {
        self.instrumentor
            .trace_images(self.inner.provider_name(), request, |r| {
                self.inner.generate_images(r)
            })
            .await
    }
}

#[async_trait]
impl<C, T> VectorStore for Instrumented<C, T>
where
    C: VectorStore,
    T: Tracer + Send + Sync + 'static,
    T::Span: Send + Sync + 'static,
{
    type Error = C::Error;

    fn system_name(&self) -> &str {
        self.inner.system_name()
    }

    async fn query(&self, query: VectorQuery) -> Result<Vec<VectorMatch>, Self::Error> {
        let collection = query.collection.clone();
        let top_k = vec![KeyValue::new(genai::DB_VECTOR_QUERY_TOP_K, query.top_k as i64)];
        self.instrumentor
            .trace_vector(
                self.inner.system_name(),
                Operation::VectorQuery,
                &collection,
                top_k,
                self.inner.query(query),
                |matches: &Vec<VectorMatch>| {
                    vec![KeyValue::new(genai::DB_VECTOR_MATCH_COUNT, matches.len() as i64)]
                },
            )
            .await
    }

    async fn upsert(
        &self,
        collection: &str,
        records: Vec<VectorRecord>,
    ) -> Result<usize, Self::Error> {
        let count = vec![KeyValue::new(genai::DB_VECTOR_RECORD_COUNT, records.len() as i64)];
        self.instrumentor
            .trace_vector(
                self.inner.system_name(),
                Operation::VectorUpsert,
                collection,
                count,
                self.inner.upsert(collection, records),
                |_| Vec::new(),
            )
            .await
    }

    async fn delete(&self, collection: &str, ids: Vec<String>) -> Result<usize, Self::Error> {
        let count = vec![KeyValue::new(genai::DB_VECTOR_RECORD_COUNT, ids.len() as i64)];
        self.instrumentor
            .trace_vector(
                self.inner.system_name(),
                Operation::VectorDelete,
                collection,
                count,
                self.inner.delete(collection, ids),
                |_| Vec::new(),
            )
            .await
    }
}
