//! # murmur-inference
//!
//! External-service adapters for the murmur pipeline.
//!
//! Each adapter is a thin shim over a network service, bound to the
//! capability traits in `murmur-core`:
//! - [`WhisperBackend`] — batch transcription via an OpenAI-compatible
//!   `/v1/audio/transcriptions` endpoint
//! - [`OllamaExtractionBackend`] — structured extraction via Ollama's
//!   `/api/chat` with JSON format enforcement
//! - [`OllamaEmbeddingBackend`] — embeddings via Ollama's `/api/embed`
//! - [`WindowedStreamingBackend`] — streaming transcription built on any
//!   batch backend
//!
//! Adapter failures are classified at this layer: rate limits, timeouts,
//! and 5xx responses become `TransientAdapter` errors (retryable); input
//! and policy rejections become `PermanentAdapter` errors with a stable
//! reason code (fail fast).

pub mod classify;
pub mod config;
pub mod embedding;
pub mod extraction;
pub mod streaming;
pub mod transcription;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use classify::classify_http_failure;
pub use config::InferenceConfig;
pub use embedding::OllamaEmbeddingBackend;
pub use extraction::OllamaExtractionBackend;
pub use streaming::WindowedStreamingBackend;
pub use transcription::WhisperBackend;
