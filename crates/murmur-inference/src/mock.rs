//! Mock adapter backends for deterministic testing.
//!
//! Each mock returns fixed outputs, records calls for assertions, and can
//! be loaded with a script of failures to produce before succeeding —
//! which is how retry behavior is exercised without a network.
//!
//! ## Usage
//!
//! ```rust
//! use murmur_inference::mock::MockTranscriptionBackend;
//! use murmur_core::TranscriptionBackend;
//!
//! # async fn example() {
//! let backend = MockTranscriptionBackend::new("hello world", 30.0)
//!     .fail_transient_times(2);
//!
//! // First two calls fail transiently, the third succeeds.
//! assert!(backend.transcribe(b"a", "audio/wav", None).await.is_err());
//! assert!(backend.transcribe(b"a", "audio/wav", None).await.is_err());
//! assert!(backend.transcribe(b"a", "audio/wav", None).await.is_ok());
//! # }
//! ```

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use murmur_core::{
    EmbeddingBackend, Error, ExtractedEntity, ExtractedTask, ExtractionBackend,
    ExtractionOutcome, FailureCode, NoteExtraction, Result, Transcript, TranscriptSegment,
    TranscriptionBackend, Vector,
};

/// A scripted failure to produce before the mock starts succeeding.
#[derive(Debug, Clone)]
pub enum MockFailure {
    Transient(String),
    Permanent(FailureCode, String),
}

impl MockFailure {
    fn into_error(self) -> Error {
        match self {
            MockFailure::Transient(msg) => Error::TransientAdapter(msg),
            MockFailure::Permanent(code, message) => Error::PermanentAdapter { code, message },
        }
    }
}

#[derive(Default)]
struct FailureScript {
    queue: Mutex<VecDeque<MockFailure>>,
}

impl FailureScript {
    fn push(&self, failure: MockFailure) {
        self.queue.lock().unwrap().push_back(failure);
    }

    fn next(&self) -> Option<Error> {
        self.queue
            .lock()
            .unwrap()
            .pop_front()
            .map(MockFailure::into_error)
    }
}

// =============================================================================
// TRANSCRIPTION
// =============================================================================

/// Mock transcription backend with fixed output and scripted failures.
pub struct MockTranscriptionBackend {
    text: String,
    duration_secs: f64,
    delay_ms: u64,
    script: FailureScript,
    calls: Mutex<u32>,
    last_audio_len: Mutex<usize>,
}

impl MockTranscriptionBackend {
    pub fn new(text: impl Into<String>, duration_secs: f64) -> Self {
        Self {
            text: text.into(),
            duration_secs,
            delay_ms: 0,
            script: FailureScript::default(),
            calls: Mutex::new(0),
            last_audio_len: Mutex::new(0),
        }
    }

    /// Simulate adapter latency (for cancellation/race tests).
    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    /// Queue `n` transient failures before calls succeed.
    pub fn fail_transient_times(self, n: u32) -> Self {
        for _ in 0..n {
            self.script
                .push(MockFailure::Transient("simulated transient failure".into()));
        }
        self
    }

    /// Queue a single permanent failure.
    pub fn fail_permanent(self, code: FailureCode, message: impl Into<String>) -> Self {
        self.script.push(MockFailure::Permanent(code, message.into()));
        self
    }

    /// Number of transcribe calls made.
    pub fn call_count(&self) -> u32 {
        *self.calls.lock().unwrap()
    }

    /// Byte length of the audio passed to the most recent call.
    pub fn last_audio_len(&self) -> usize {
        *self.last_audio_len.lock().unwrap()
    }
}

#[async_trait]
impl TranscriptionBackend for MockTranscriptionBackend {
    async fn transcribe(
        &self,
        audio_data: &[u8],
        _mime_type: &str,
        language: Option<&str>,
    ) -> Result<Transcript> {
        *self.calls.lock().unwrap() += 1;
        *self.last_audio_len.lock().unwrap() = audio_data.len();

        if self.delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
        }

        if let Some(err) = self.script.next() {
            return Err(err);
        }

        Ok(Transcript {
            full_text: self.text.clone(),
            segments: vec![TranscriptSegment {
                start_secs: 0.0,
                end_secs: self.duration_secs,
                text: self.text.clone(),
                confidence: Some(0.95),
            }],
            language: language.map(String::from),
            duration_secs: Some(self.duration_secs),
        })
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    fn model_name(&self) -> &str {
        "mock-transcription"
    }
}

// =============================================================================
// EXTRACTION
// =============================================================================

/// Mock extraction backend with fixed output and scripted failures.
pub struct MockExtractionBackend {
    extraction: NoteExtraction,
    tokens_used: i64,
    script: FailureScript,
    calls: Mutex<u32>,
}

impl MockExtractionBackend {
    pub fn new(summary: impl Into<String>, tokens_used: i64) -> Self {
        Self {
            extraction: NoteExtraction {
                summary: summary.into(),
                entities: vec![ExtractedEntity {
                    name: "Acme".into(),
                    kind: "organization".into(),
                }],
                tasks: vec![ExtractedTask {
                    description: "Follow up".into(),
                    due_hint: None,
                }],
            },
            tokens_used,
            script: FailureScript::default(),
            calls: Mutex::new(0),
        }
    }

    /// Replace the fixed extraction payload.
    pub fn with_extraction(mut self, extraction: NoteExtraction) -> Self {
        self.extraction = extraction;
        self
    }

    /// Queue `n` transient failures before calls succeed.
    pub fn fail_transient_times(self, n: u32) -> Self {
        for _ in 0..n {
            self.script
                .push(MockFailure::Transient("simulated transient failure".into()));
        }
        self
    }

    /// Queue a single permanent failure.
    pub fn fail_permanent(self, code: FailureCode, message: impl Into<String>) -> Self {
        self.script.push(MockFailure::Permanent(code, message.into()));
        self
    }

    /// Number of extract calls made.
    pub fn call_count(&self) -> u32 {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl ExtractionBackend for MockExtractionBackend {
    async fn extract(
        &self,
        _transcript_text: &str,
        _language: Option<&str>,
    ) -> Result<ExtractionOutcome> {
        *self.calls.lock().unwrap() += 1;

        if let Some(err) = self.script.next() {
            return Err(err);
        }

        Ok(ExtractionOutcome {
            extraction: self.extraction.clone(),
            tokens_used: self.tokens_used,
            model: "mock-extraction".into(),
        })
    }

    fn model_name(&self) -> &str {
        "mock-extraction"
    }
}

// =============================================================================
// EMBEDDING
// =============================================================================

/// Mock embedding backend producing deterministic vectors.
///
/// Vectors are derived from the input text's bytes, so identical text
/// always embeds identically and different texts (almost always) differ.
pub struct MockEmbeddingBackend {
    dimension: usize,
    script: FailureScript,
    calls: Mutex<u32>,
}

impl MockEmbeddingBackend {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            script: FailureScript::default(),
            calls: Mutex::new(0),
        }
    }

    /// Queue `n` transient failures before calls succeed.
    pub fn fail_transient_times(self, n: u32) -> Self {
        for _ in 0..n {
            self.script
                .push(MockFailure::Transient("simulated transient failure".into()));
        }
        self
    }

    /// Number of embed calls made.
    pub fn call_count(&self) -> u32 {
        *self.calls.lock().unwrap()
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let bytes = text.as_bytes();
        let mut vector = Vec::with_capacity(self.dimension);
        for i in 0..self.dimension {
            let byte = bytes.get(i % bytes.len().max(1)).copied().unwrap_or(0);
            vector.push((byte as f32 + i as f32) / 512.0);
        }
        vector
    }
}

#[async_trait]
impl EmbeddingBackend for MockEmbeddingBackend {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vector>> {
        *self.calls.lock().unwrap() += 1;

        if let Some(err) = self.script.next() {
            return Err(err);
        }

        Ok(texts
            .iter()
            .map(|t| Vector::from(self.embed_one(t)))
            .collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        "mock-embedding"
    }
}
