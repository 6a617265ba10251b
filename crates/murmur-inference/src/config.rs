//! Environment-driven configuration for inference backends.

use std::sync::Arc;

use murmur_core::{
    defaults, EmbeddingBackend, Error, ExtractionBackend, Result, StreamingTranscriptionBackend,
    TranscriptionBackend,
};

use crate::embedding::OllamaEmbeddingBackend;
use crate::extraction::OllamaExtractionBackend;
use crate::streaming::WindowedStreamingBackend;
use crate::transcription::WhisperBackend;

/// Bundle of configured adapter backends.
///
/// Concrete providers are bound here, from configuration — callers only
/// ever see the capability traits.
pub struct InferenceConfig {
    pub transcription: Arc<dyn TranscriptionBackend>,
    pub extraction: Arc<dyn ExtractionBackend>,
    pub embedding: Arc<dyn EmbeddingBackend>,
    pub streaming: Arc<dyn StreamingTranscriptionBackend>,
}

impl InferenceConfig {
    /// Build all backends from environment variables.
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `WHISPER_BASE_URL` | (required) | Whisper-compatible endpoint |
    /// | `WHISPER_MODEL` | `whisper-1` | Transcription model |
    /// | `EXTRACT_BASE_URL` | Ollama URL | Extraction endpoint |
    /// | `EXTRACT_MODEL` | `gpt-oss:20b` | Extraction model |
    /// | `EMBED_BASE_URL` | Ollama URL | Embedding endpoint |
    /// | `EMBED_MODEL` | `nomic-embed-text` | Embedding model |
    pub fn from_env() -> Result<Self> {
        let transcription: Arc<dyn TranscriptionBackend> =
            Arc::new(WhisperBackend::from_env().ok_or_else(|| {
                Error::Config(format!(
                    "{} must be set to a Whisper-compatible endpoint",
                    defaults::ENV_WHISPER_BASE_URL
                ))
            })?);

        let extraction: Arc<dyn ExtractionBackend> =
            Arc::new(OllamaExtractionBackend::from_env());
        let embedding: Arc<dyn EmbeddingBackend> = Arc::new(OllamaEmbeddingBackend::from_env());
        let streaming: Arc<dyn StreamingTranscriptionBackend> =
            Arc::new(WindowedStreamingBackend::new(transcription.clone()));

        Ok(Self {
            transcription,
            extraction,
            embedding,
            streaming,
        })
    }
}
