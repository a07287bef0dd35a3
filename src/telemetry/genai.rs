//! GenAI semantic convention attribute keys for LLM operations.
//!
//! Follows the OpenTelemetry GenAI conventions where one exists
//! (`gen_ai.*`) and uses the `langspan.*` namespace for the rest.

/// SDK name recorded on every span.
pub const SDK_NAME: &str = "langspan";

/// SDK version recorded on every span.
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const LANGSPAN_SDK_NAME: &str = "langspan.sdk.name";
pub const LANGSPAN_VERSION: &str = "langspan.version";

pub const GEN_AI_OPERATION_NAME: &str = "gen_ai.operation.name";
pub const GEN_AI_PROVIDER_NAME: &str = "gen_ai.provider.name";

pub const GEN_AI_REQUEST_MODEL: &str = "gen_ai.request.model";
pub const GEN_AI_REQUEST_TEMPERATURE: &str = "gen_ai.request.temperature";
pub const GEN_AI_REQUEST_TOP_P: &str = "gen_ai.request.top_p";
pub const GEN_AI_REQUEST_MAX_TOKENS: &str = "gen_ai.request.max_tokens";
pub const GEN_AI_REQUEST_STREAM: &str = "gen_ai.request.stream";
pub const GEN_AI_REQUEST_EMBEDDING_INPUTS: &str = "gen_ai.request.embedding_inputs";
pub const GEN_AI_REQUEST_IMAGE_COUNT: &str = "gen_ai.request.image_count";
pub const GEN_AI_REQUEST_IMAGE_SIZE: &str = "gen_ai.request.image_size";

pub const GEN_AI_RESPONSE_MODEL: &str = "gen_ai.response.model";
pub const GEN_AI_RESPONSE_FINISH_REASONS: &str = "gen_ai.response.finish_reasons";
pub const GEN_AI_RESPONSE_IMAGE_COUNT: &str = "gen_ai.response.image_count";
pub const GEN_AI_RESPONSE_EMBEDDING_COUNT: &str = "gen_ai.response.embedding_count";

pub const GEN_AI_USAGE_INPUT_TOKENS: &str = "gen_ai.usage.input_tokens";
pub const GEN_AI_USAGE_OUTPUT_TOKENS: &str = "gen_ai.usage.output_tokens";
pub const GEN_AI_USAGE_TOTAL_TOKENS: &str = "gen_ai.usage.total_tokens";
/// Set when usage was estimated locally rather than reported by the provider.
pub const GEN_AI_USAGE_ESTIMATED: &str = "langspan.usage.estimated";

pub const GEN_AI_PROMPT: &str = "gen_ai.prompt";
pub const GEN_AI_COMPLETION: &str = "gen_ai.completion";

/// Event recorded for every streamed chunk.
pub const EVENT_COMPLETION_CHUNK: &str = "gen_ai.completion.chunk";
pub const CHUNK_DELTA: &str = "gen_ai.completion.chunk.delta";
pub const CHUNK_TOKENS: &str = "gen_ai.completion.chunk.tokens";
pub const STREAM_CHUNK_COUNT: &str = "langspan.stream.chunk_count";

pub const DB_SYSTEM: &str = "db.system";
pub const DB_OPERATION_NAME: &str = "db.operation.name";
pub const DB_COLLECTION_NAME: &str = "db.collection.name";
pub const DB_VECTOR_QUERY_TOP_K: &str = "db.vector.query.top_k";
pub const DB_VECTOR_MATCH_COUNT: &str = "db.vector.match_count";
pub const DB_VECTOR_RECORD_COUNT: &str = "db.vector.record_count";
