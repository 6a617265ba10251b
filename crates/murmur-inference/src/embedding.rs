//! Embedding backend (Ollama embed API).

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use murmur_core::{defaults, EmbeddingBackend, Error, FailureCode, Result, Vector};

use crate::classify::classify_http_failure;

/// Timeout for embedding requests (seconds).
const EMBED_TIMEOUT_SECS: u64 = defaults::EMBED_TIMEOUT_SECS;

/// Ollama-backed embedding adapter.
pub struct OllamaEmbeddingBackend {
    base_url: String,
    model: String,
    dimension: usize,
    client: reqwest::Client,
}

impl OllamaEmbeddingBackend {
    pub fn new(base_url: String, model: String, dimension: usize) -> Self {
        Self {
            base_url,
            model,
            dimension,
            client: reqwest::Client::new(),
        }
    }

    /// Create from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let base_url = std::env::var(defaults::ENV_EMBED_BASE_URL)
            .unwrap_or_else(|_| defaults::OLLAMA_URL.to_string());
        let model = std::env::var(defaults::ENV_EMBED_MODEL)
            .unwrap_or_else(|_| defaults::EMBED_MODEL.to_string());
        Self::new(base_url, model, defaults::EMBED_DIMENSION)
    }
}

#[derive(Serialize)]
struct EmbeddingRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embeddings: Vec<Vec<f32>>,
}

#[async_trait]
impl EmbeddingBackend for OllamaEmbeddingBackend {
    #[instrument(skip(self, texts), fields(subsystem = "inference", component = "embed", op = "embed_texts", model = %self.model, input_count = texts.len()))]
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vector>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let start = Instant::now();

        let request = EmbeddingRequest {
            model: self.model.clone(),
            input: texts.to_vec(),
        };

        let response = self
            .client
            .post(format!("{}/api/embed", self.base_url))
            .timeout(Duration::from_secs(EMBED_TIMEOUT_SECS))
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::TransientAdapter(format!("embedding request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_http_failure(
                status,
                &body,
                FailureCode::AdapterError,
            ));
        }

        let result: EmbeddingResponse = response.json().await.map_err(|e| {
            Error::TransientAdapter(format!("failed to parse embedding response: {e}"))
        })?;

        for vector in &result.embeddings {
            if vector.len() != self.dimension {
                return Err(Error::TransientAdapter(format!(
                    "embedding dimension mismatch: expected {}, got {}",
                    self.dimension,
                    vector.len()
                )));
            }
        }

        let vectors: Vec<Vector> = result.embeddings.into_iter().map(Vector::from).collect();
        let elapsed = start.elapsed().as_millis() as u64;

        debug!(
            result_count = vectors.len(),
            duration_ms = elapsed,
            "Embedding complete"
        );
        if elapsed > 5_000 {
            warn!(
                duration_ms = elapsed,
                input_count = texts.len(),
                slow = true,
                "Slow embedding operation"
            );
        }
        Ok(vectors)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
