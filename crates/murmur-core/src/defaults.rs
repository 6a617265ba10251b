//! Centralized default constants for the murmur pipeline.
//!
//! **This module is the single source of truth** for all shared default
//! values. All crates reference these constants instead of defining their
//! own magic numbers.

// =============================================================================
// PIPELINE
// =============================================================================

/// Maximum attempts per pipeline stage before a job fails permanently.
pub const STAGE_MAX_ATTEMPTS: i32 = 3;

/// Base delay for exponential retry backoff (doubles per attempt).
pub const RETRY_BACKOFF_BASE_MS: u64 = 1_000;

/// Upper bound on a single retry delay.
pub const RETRY_BACKOFF_CAP_MS: u64 = 60_000;

/// Transcription stage timeout in seconds (long audio takes a while).
pub const TRANSCRIBE_TIMEOUT_SECS: u64 = 300;

/// Extraction stage timeout in seconds.
pub const EXTRACT_TIMEOUT_SECS: u64 = 120;

/// Embedding stage timeout in seconds.
pub const EMBED_TIMEOUT_SECS: u64 = 30;

/// A worker claim older than this is considered abandoned and reclaimable.
pub const CLAIM_STALE_AFTER_SECS: i64 = 300;

// =============================================================================
// WORKER
// =============================================================================

/// Default polling interval when the queue is empty (milliseconds).
pub const WORKER_POLL_INTERVAL_MS: u64 = 500;

/// Default maximum concurrent stage executions per worker process.
pub const WORKER_MAX_CONCURRENT: usize = 4;

/// Broadcast channel capacity for worker events.
pub const EVENT_BUS_CAPACITY: usize = 256;

// =============================================================================
// METERING
// =============================================================================

/// Default price per transcribed audio minute, in credits.
pub const COST_TRANSCRIPTION_PER_MINUTE: i64 = 10;

/// Default price per 1k LLM tokens consumed by extraction, in credits.
pub const COST_EXTRACTION_PER_1K_TOKENS: i64 = 2;

/// Default flat price per embedding call, in credits.
pub const COST_EMBEDDING_FLAT: i64 = 1;

/// Audio minutes assumed for reservation when no duration hint is available.
pub const COST_DEFAULT_AUDIO_MINUTES: i64 = 5;

/// Rough characters-per-token ratio used to estimate extraction cost.
pub const CHARS_PER_TOKEN_ESTIMATE: usize = 4;

// =============================================================================
// STREAMING
// =============================================================================

/// Idle timeout for a streaming transcription session in seconds.
pub const STREAM_IDLE_TIMEOUT_SECS: u64 = 30;

/// Expected input sample rate for streaming audio (16-bit PCM mono).
pub const STREAM_SAMPLE_RATE_HZ: u32 = 16_000;

/// Bytes per second of 16-bit PCM mono at [`STREAM_SAMPLE_RATE_HZ`].
pub const STREAM_BYTES_PER_SEC: usize = STREAM_SAMPLE_RATE_HZ as usize * 2;

/// Accumulated-audio threshold that triggers a partial transcription pass.
pub const STREAM_WINDOW_BYTES: usize = STREAM_BYTES_PER_SEC * 2;

/// Capacity of the per-session transcript event channel.
pub const STREAM_EVENT_CAPACITY: usize = 64;

// =============================================================================
// INFERENCE
// =============================================================================

/// Default transcription model name.
pub const WHISPER_MODEL: &str = "whisper-1";

/// Default extraction (LLM) model name.
pub const EXTRACT_MODEL: &str = "gpt-oss:20b";

/// Default embedding model name (Ollama).
pub const EMBED_MODEL: &str = "nomic-embed-text";

/// Default embedding vector dimension for nomic-embed-text.
pub const EMBED_DIMENSION: usize = 768;

/// Default Ollama base URL.
pub const OLLAMA_URL: &str = "http://127.0.0.1:11434";

/// Environment variable for the Whisper-compatible endpoint.
pub const ENV_WHISPER_BASE_URL: &str = "WHISPER_BASE_URL";

/// Environment variable for the transcription model name.
pub const ENV_WHISPER_MODEL: &str = "WHISPER_MODEL";

/// Environment variable for the extraction endpoint.
pub const ENV_EXTRACT_BASE_URL: &str = "EXTRACT_BASE_URL";

/// Environment variable for the extraction model name.
pub const ENV_EXTRACT_MODEL: &str = "EXTRACT_MODEL";

/// Environment variable for the embedding (Ollama) endpoint.
pub const ENV_EMBED_BASE_URL: &str = "EMBED_BASE_URL";

/// Environment variable for the embedding model name.
pub const ENV_EMBED_MODEL: &str = "EMBED_MODEL";

// =============================================================================
// RETRIEVAL
// =============================================================================

/// Weight of the semantic (vector) score in blended ranking.
pub const SEARCH_SEMANTIC_WEIGHT: f32 = 0.6;

/// Weight of the lexical (full-text) score in blended ranking.
pub const SEARCH_LEXICAL_WEIGHT: f32 = 0.4;

/// Default number of results returned by retrieval.
pub const SEARCH_TOP_K: i64 = 20;

/// Candidate pool fetched from each retrieval source before blending.
pub const SEARCH_CANDIDATE_POOL: i64 = 50;

/// Snippet/preview length in characters for search results.
pub const SNIPPET_LENGTH: usize = 200;
