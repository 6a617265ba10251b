//! Streaming transcription built on a batch backend.
//!
//! [`WindowedStreamingBackend`] adapts any [`TranscriptionBackend`] into a
//! streaming one: audio chunks accumulate in a buffer, and every time the
//! un-transcribed tail grows past the window threshold the whole buffer is
//! re-transcribed to emit a `partial` event. `finish()` runs one final pass
//! over all audio received and yields the `final` event's transcript.
//!
//! Event order follows chunk arrival order; a session never emits a
//! `partial` for audio it has not received.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use murmur_core::{
    defaults, Result, StreamEvent, StreamingTranscription, StreamingTranscriptionBackend,
    Transcript, TranscriptionBackend,
};

/// Factory wrapping a batch backend for streaming use.
pub struct WindowedStreamingBackend {
    inner: Arc<dyn TranscriptionBackend>,
    /// Buffered-bytes threshold that triggers a partial pass.
    window_bytes: usize,
}

impl WindowedStreamingBackend {
    pub fn new(inner: Arc<dyn TranscriptionBackend>) -> Self {
        Self {
            inner,
            window_bytes: defaults::STREAM_WINDOW_BYTES,
        }
    }

    /// Override the partial-pass window size (mainly for tests).
    pub fn with_window_bytes(mut self, window_bytes: usize) -> Self {
        self.window_bytes = window_bytes.max(1);
        self
    }
}

#[async_trait]
impl StreamingTranscriptionBackend for WindowedStreamingBackend {
    async fn open(&self, language: Option<&str>) -> Result<Box<dyn StreamingTranscription>> {
        Ok(Box::new(WindowedSession {
            inner: self.inner.clone(),
            language: language.map(String::from),
            window_bytes: self.window_bytes,
            buffer: Vec::new(),
            bytes_since_pass: 0,
            pending: Vec::new(),
        }))
    }
}

struct WindowedSession {
    inner: Arc<dyn TranscriptionBackend>,
    language: Option<String>,
    window_bytes: usize,
    /// All PCM received so far (16-bit mono).
    buffer: Vec<u8>,
    bytes_since_pass: usize,
    pending: Vec<StreamEvent>,
}

impl WindowedSession {
    fn mean_confidence(transcript: &Transcript) -> Option<f32> {
        let confidences: Vec<f32> = transcript
            .segments
            .iter()
            .filter_map(|s| s.confidence)
            .collect();
        if confidences.is_empty() {
            None
        } else {
            Some(confidences.iter().sum::<f32>() / confidences.len() as f32)
        }
    }
}

#[async_trait]
impl StreamingTranscription for WindowedSession {
    async fn push_audio(&mut self, chunk: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(chunk);
        self.bytes_since_pass += chunk.len();

        if self.bytes_since_pass >= self.window_bytes {
            let transcript = self
                .inner
                .transcribe(&self.buffer, "audio/wav", self.language.as_deref())
                .await?;
            debug!(
                subsystem = "inference",
                component = "stream",
                buffered_bytes = self.buffer.len(),
                text_len = transcript.full_text.len(),
                "Partial transcription pass"
            );
            self.pending.push(StreamEvent::Transcript {
                confidence: Self::mean_confidence(&transcript),
                text: transcript.full_text,
                is_final: false,
            });
            self.bytes_since_pass = 0;
        }
        Ok(())
    }

    async fn poll_events(&mut self) -> Result<Vec<StreamEvent>> {
        Ok(std::mem::take(&mut self.pending))
    }

    async fn finish(&mut self) -> Result<Transcript> {
        let transcript = self
            .inner
            .transcribe(&self.buffer, "audio/wav", self.language.as_deref())
            .await?;
        self.pending.push(StreamEvent::Transcript {
            confidence: Self::mean_confidence(&transcript),
            text: transcript.full_text.clone(),
            is_final: true,
        });
        Ok(transcript)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTranscriptionBackend;

    #[tokio::test]
    async fn test_partials_emitted_per_window() {
        let batch = Arc::new(MockTranscriptionBackend::new("partial text", 4.0));
        let backend = WindowedStreamingBackend::new(batch.clone()).with_window_bytes(8);
        let mut session = backend.open(None).await.unwrap();

        // 4 bytes: below the window, no event yet.
        session.push_audio(&[0u8; 4]).await.unwrap();
        assert!(session.poll_events().await.unwrap().is_empty());

        // 4 more: window reached, one partial.
        session.push_audio(&[0u8; 4]).await.unwrap();
        let events = session.poll_events().await.unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::Transcript { text, is_final, .. } => {
                assert_eq!(text, "partial text");
                assert!(!is_final);
            }
        }
    }

    #[tokio::test]
    async fn test_finish_emits_final_over_all_audio() {
        let batch = Arc::new(MockTranscriptionBackend::new("the whole thing", 12.0));
        let backend = WindowedStreamingBackend::new(batch.clone()).with_window_bytes(1024);
        let mut session = backend.open(Some("en")).await.unwrap();

        for _ in 0..5 {
            session.push_audio(&[1u8; 16]).await.unwrap();
        }
        let transcript = session.finish().await.unwrap();
        assert_eq!(transcript.full_text, "the whole thing");

        let events = session.poll_events().await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            StreamEvent::Transcript { is_final: true, .. }
        ));

        // The final pass saw every byte pushed.
        assert_eq!(batch.last_audio_len(), 80);
    }
}
