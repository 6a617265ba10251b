//! Batch transcription backend (OpenAI-compatible Whisper endpoint).

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, instrument};

use murmur_core::{
    defaults, Error, FailureCode, Result, Transcript, TranscriptSegment, TranscriptionBackend,
};

use crate::classify::classify_http_failure;

/// OpenAI-compatible Whisper backend (works with Speaches/faster-whisper-server).
pub struct WhisperBackend {
    base_url: String,
    model: String,
    client: reqwest::Client,
    timeout_secs: u64,
}

impl WhisperBackend {
    pub fn new(base_url: String, model: String) -> Self {
        Self {
            base_url,
            model,
            client: reqwest::Client::new(),
            timeout_secs: defaults::TRANSCRIBE_TIMEOUT_SECS,
        }
    }

    /// Create from environment variables.
    /// Returns None if WHISPER_BASE_URL is not set.
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var(defaults::ENV_WHISPER_BASE_URL).ok()?;
        if base_url.is_empty() {
            return None;
        }
        let model = std::env::var(defaults::ENV_WHISPER_MODEL)
            .unwrap_or_else(|_| defaults::WHISPER_MODEL.to_string());
        Some(Self::new(base_url, model))
    }

    fn extension_for_mime(mime_type: &str) -> Result<&'static str> {
        match mime_type {
            "audio/mpeg" | "audio/mp3" => Ok("mp3"),
            "audio/wav" | "audio/x-wav" => Ok("wav"),
            "audio/ogg" => Ok("ogg"),
            "audio/flac" => Ok("flac"),
            "audio/aac" => Ok("aac"),
            "audio/webm" => Ok("webm"),
            other => Err(Error::PermanentAdapter {
                code: FailureCode::UnsupportedMedia,
                message: format!("unsupported audio mime type: {other}"),
            }),
        }
    }
}

/// OpenAI Whisper API verbose response format.
#[derive(Deserialize)]
struct WhisperResponse {
    text: String,
    #[serde(default)]
    segments: Option<Vec<WhisperSegment>>,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
}

#[derive(Deserialize)]
struct WhisperSegment {
    start: f64,
    end: f64,
    text: String,
    /// Average log probability; mapped to a 0..1 confidence.
    #[serde(default)]
    avg_logprob: Option<f64>,
}

impl WhisperSegment {
    fn confidence(&self) -> Option<f32> {
        // exp(avg_logprob) approximates per-token probability.
        self.avg_logprob.map(|lp| lp.exp().clamp(0.0, 1.0) as f32)
    }
}

#[async_trait]
impl TranscriptionBackend for WhisperBackend {
    #[instrument(skip(self, audio_data), fields(subsystem = "inference", component = "whisper", op = "transcribe", model = %self.model, audio_bytes = audio_data.len()))]
    async fn transcribe(
        &self,
        audio_data: &[u8],
        mime_type: &str,
        language: Option<&str>,
    ) -> Result<Transcript> {
        let url = format!("{}/v1/audio/transcriptions", self.base_url);
        let ext = Self::extension_for_mime(mime_type)?;

        let file_part = reqwest::multipart::Part::bytes(audio_data.to_vec())
            .file_name(format!("audio.{}", ext))
            .mime_str(mime_type)
            .map_err(|e| Error::Internal(format!("Failed to create multipart: {}", e)))?;

        let mut form = reqwest::multipart::Form::new()
            .part("file", file_part)
            .text("model", self.model.clone())
            .text("response_format", "verbose_json");

        if let Some(lang) = language {
            form = form.text("language", lang.to_string());
        }

        let response = self
            .client
            .post(&url)
            .multipart(form)
            .timeout(std::time::Duration::from_secs(self.timeout_secs))
            .send()
            .await
            .map_err(|e| Error::TransientAdapter(format!("transcription request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_http_failure(
                status,
                &body,
                FailureCode::UnsupportedMedia,
            ));
        }

        let result: WhisperResponse = response.json().await.map_err(|e| {
            Error::TransientAdapter(format!("failed to parse whisper response: {e}"))
        })?;

        let segments = result
            .segments
            .unwrap_or_default()
            .into_iter()
            .map(|s| TranscriptSegment {
                start_secs: s.start,
                end_secs: s.end,
                confidence: s.confidence(),
                text: s.text,
            })
            .collect();

        debug!(
            text_len = result.text.len(),
            duration_secs = result.duration,
            "Transcription complete"
        );

        Ok(Transcript {
            full_text: result.text,
            segments,
            language: result.language,
            duration_secs: result.duration,
        })
    }

    async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/health", self.base_url);
        match self
            .client
            .get(&url)
            .timeout(std::time::Duration::from_secs(5))
            .send()
            .await
        {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(_) => Ok(false),
        }
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_extension_mapping() {
        assert_eq!(WhisperBackend::extension_for_mime("audio/mpeg").unwrap(), "mp3");
        assert_eq!(WhisperBackend::extension_for_mime("audio/wav").unwrap(), "wav");
        assert_eq!(WhisperBackend::extension_for_mime("audio/webm").unwrap(), "webm");

        let err = WhisperBackend::extension_for_mime("video/mp4").unwrap_err();
        assert!(matches!(
            err,
            Error::PermanentAdapter {
                code: FailureCode::UnsupportedMedia,
                ..
            }
        ));
    }

    #[test]
    fn test_whisper_response_deserialization() {
        let json = r#"{
            "text": "Hello world",
            "segments": [
                {"start": 0.0, "end": 2.5, "text": "Hello", "avg_logprob": -0.1},
                {"start": 2.5, "end": 5.0, "text": "world"}
            ],
            "language": "en",
            "duration": 5.0
        }"#;

        let response: WhisperResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.text, "Hello world");
        let segments = response.segments.unwrap();
        assert_eq!(segments.len(), 2);
        assert!(segments[0].confidence().unwrap() > 0.8);
        assert!(segments[1].confidence().is_none());
        assert_eq!(response.duration.unwrap(), 5.0);
    }

    #[test]
    fn test_whisper_response_minimal() {
        let response: WhisperResponse = serde_json::from_str(r#"{"text": "hi"}"#).unwrap();
        assert_eq!(response.text, "hi");
        assert!(response.segments.is_none());
    }

    #[tokio::test]
    async fn test_transcribe_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/audio/transcriptions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "text": "meeting notes about the launch",
                "segments": [
                    {"start": 0.0, "end": 3.2, "text": "meeting notes", "avg_logprob": -0.2},
                    {"start": 3.2, "end": 6.0, "text": "about the launch", "avg_logprob": -0.3}
                ],
                "language": "en",
                "duration": 6.0
            })))
            .mount(&server)
            .await;

        let backend = WhisperBackend::new(server.uri(), "whisper-1".into());
        let transcript = backend
            .transcribe(b"fake-bytes", "audio/wav", Some("en"))
            .await
            .unwrap();

        assert_eq!(transcript.full_text, "meeting notes about the launch");
        assert_eq!(transcript.segments.len(), 2);
        assert_eq!(transcript.duration_secs, Some(6.0));
        assert_eq!(transcript.billable_minutes(), 1);
    }

    #[tokio::test]
    async fn test_transcribe_rate_limit_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/audio/transcriptions"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&server)
            .await;

        let backend = WhisperBackend::new(server.uri(), "whisper-1".into());
        let err = backend
            .transcribe(b"fake-bytes", "audio/wav", None)
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_transcribe_bad_request_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/audio/transcriptions"))
            .respond_with(ResponseTemplate::new(400).set_body_string("corrupt audio"))
            .mount(&server)
            .await;

        let backend = WhisperBackend::new(server.uri(), "whisper-1".into());
        let err = backend
            .transcribe(b"fake-bytes", "audio/wav", None)
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(err.failure_code(), FailureCode::UnsupportedMedia);
    }
}
