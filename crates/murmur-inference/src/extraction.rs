//! Structured extraction backend (Ollama chat API).
//!
//! Uses the `/api/chat` endpoint with JSON format enforcement, which
//! guarantees syntactically valid JSON and suppresses chain-of-thought
//! reasoning in the response. The payload is then validated against the
//! strict [`NoteExtraction`] schema.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use murmur_core::{
    defaults, Error, ExtractionBackend, ExtractionOutcome, FailureCode, NoteExtraction, Result,
};

use crate::classify::classify_http_failure;

const SYSTEM_PROMPT: &str = "You extract structured knowledge from voice-note transcripts. \
Respond with a single JSON object: \
{\"summary\": string, \
\"entities\": [{\"name\": string, \"kind\": string}], \
\"tasks\": [{\"description\": string, \"due_hint\": string|null}]}. \
Entity kinds are one of: person, organization, place, product, topic. \
If the transcript content cannot be processed for policy reasons, respond \
with exactly {\"refused\": \"content_policy\"} instead.";

/// Ollama-backed extraction adapter.
pub struct OllamaExtractionBackend {
    base_url: String,
    model: String,
    client: reqwest::Client,
    timeout_secs: u64,
}

impl OllamaExtractionBackend {
    pub fn new(base_url: String, model: String) -> Self {
        Self {
            base_url,
            model,
            client: reqwest::Client::new(),
            timeout_secs: defaults::EXTRACT_TIMEOUT_SECS,
        }
    }

    /// Create from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let base_url = std::env::var(defaults::ENV_EXTRACT_BASE_URL)
            .unwrap_or_else(|_| defaults::OLLAMA_URL.to_string());
        let model = std::env::var(defaults::ENV_EXTRACT_MODEL)
            .unwrap_or_else(|_| defaults::EXTRACT_MODEL.to_string());
        Self::new(base_url, model)
    }

    /// Parse and validate the model's JSON payload.
    fn parse_payload(content: &str) -> Result<NoteExtraction> {
        let value: serde_json::Value = serde_json::from_str(content)
            .map_err(|e| Error::TransientAdapter(format!("extraction returned invalid JSON: {e}")))?;

        if let Some(refused) = value.get("refused").and_then(|v| v.as_str()) {
            return Err(Error::PermanentAdapter {
                code: FailureCode::ContentPolicy,
                message: format!("extraction model refused: {refused}"),
            });
        }

        let extraction: NoteExtraction = serde_json::from_value(value).map_err(|e| {
            Error::TransientAdapter(format!("extraction payload failed schema: {e}"))
        })?;
        extraction.validate().map_err(|e| {
            Error::TransientAdapter(format!("extraction payload failed validation: {e}"))
        })?;
        Ok(extraction)
    }
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    /// Ollama format enforcement: `"json"` guarantees valid JSON output.
    format: &'static str,
    /// Suppress chain-of-thought for models that support it.
    think: bool,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ChatResponseMessage,
    #[serde(default)]
    prompt_eval_count: Option<i64>,
    #[serde(default)]
    eval_count: Option<i64>,
}

#[async_trait]
impl ExtractionBackend for OllamaExtractionBackend {
    #[instrument(skip(self, transcript_text), fields(subsystem = "inference", component = "extract", op = "extract", model = %self.model, prompt_len = transcript_text.len()))]
    async fn extract(
        &self,
        transcript_text: &str,
        language: Option<&str>,
    ) -> Result<ExtractionOutcome> {
        let start = Instant::now();

        let mut prompt = String::with_capacity(transcript_text.len() + 64);
        if let Some(lang) = language {
            prompt.push_str(&format!("Transcript language: {lang}\n\n"));
        }
        prompt.push_str("Transcript:\n");
        prompt.push_str(transcript_text);

        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            stream: false,
            format: "json",
            think: false,
        };

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .timeout(Duration::from_secs(self.timeout_secs))
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::TransientAdapter(format!("extraction request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_http_failure(
                status,
                &body,
                FailureCode::AdapterError,
            ));
        }

        let result: ChatResponse = response.json().await.map_err(|e| {
            Error::TransientAdapter(format!("failed to parse extraction response: {e}"))
        })?;

        let tokens_used =
            result.prompt_eval_count.unwrap_or(0) + result.eval_count.unwrap_or(0);
        let extraction = Self::parse_payload(&result.message.content)?;

        let elapsed = start.elapsed().as_millis() as u64;
        debug!(
            duration_ms = elapsed,
            tokens_used,
            entity_count = extraction.entities.len(),
            task_count = extraction.tasks.len(),
            "Extraction complete"
        );
        if elapsed > 30_000 {
            warn!(duration_ms = elapsed, slow = true, "Slow extraction operation");
        }

        Ok(ExtractionOutcome {
            extraction,
            tokens_used,
            model: self.model.clone(),
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
