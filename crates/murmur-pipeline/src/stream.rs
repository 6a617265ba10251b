//! Streaming transcription session.
//!
//! A connection-scoped duplex channel: the client pushes binary audio
//! frames (16-bit PCM mono) and receives ordered transcript events. The
//! session does not advance the note state machine itself — on `finish`,
//! the accumulated final transcript is handed to the orchestrator, which
//! meters it and short-circuits `RECEIVED` into `EXTRACTING`. A session
//! dropped before its final event leaves the job in `RECEIVED`, so batch
//! transcription runs on the durably stored audio.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use murmur_core::{
    defaults, AudioStore, Error, NoteInput, Result, StreamEvent, StreamingTranscription,
    StreamingTranscriptionBackend, SubmitNoteRequest,
};

use crate::orchestrator::{AdvanceOutcome, Orchestrator};

/// Configuration for streaming sessions.
#[derive(Debug, Clone)]
pub struct StreamingSessionConfig {
    /// A session with no audio for this long is closed.
    pub idle_timeout: Duration,
    /// Capacity of the outbound transcript event channel.
    pub event_capacity: usize,
}

impl Default for StreamingSessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(defaults::STREAM_IDLE_TIMEOUT_SECS),
            event_capacity: defaults::STREAM_EVENT_CAPACITY,
        }
    }
}

impl StreamingSessionConfig {
    /// Set the idle timeout.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

/// Request to open a streaming session.
#[derive(Debug, Clone)]
pub struct StreamOpenRequest {
    pub user_id: Uuid,
    pub title: Option<String>,
    pub language: Option<String>,
}

/// One in-flight streaming transcription session.
pub struct StreamingSession {
    orchestrator: Arc<Orchestrator>,
    audio_store: Arc<dyn AudioStore>,
    backend: Box<dyn StreamingTranscription>,
    events_tx: mpsc::Sender<StreamEvent>,
    note_id: Uuid,
    job_id: Uuid,
    audio_ref: String,
    /// All audio received, mirrored to durable storage for fallback.
    buffer: Vec<u8>,
    last_activity: Instant,
    idle_timeout: Duration,
    closed: bool,
}

impl StreamingSession {
    /// Open a session: creates the note and its job (state `RECEIVED`) and
    /// returns the session plus the receiver for transcript events.
    #[instrument(skip(orchestrator, audio_store, streaming, config), fields(subsystem = "stream", component = "session", user_id = %req.user_id))]
    pub async fn open(
        orchestrator: Arc<Orchestrator>,
        audio_store: Arc<dyn AudioStore>,
        streaming: Arc<dyn StreamingTranscriptionBackend>,
        req: StreamOpenRequest,
        config: StreamingSessionConfig,
    ) -> Result<(Self, mpsc::Receiver<StreamEvent>)> {
        let session_id = Uuid::new_v4();
        let audio_ref = format!("stream/{session_id}.wav");

        // Each session is a distinct input; its key never collides with a
        // batch submission of the same note.
        let (note, job) = orchestrator
            .intake(SubmitNoteRequest {
                user_id: req.user_id,
                input: NoteInput::Audio {
                    audio_ref: audio_ref.clone(),
                    mime_type: "audio/wav".into(),
                    checksum: format!("stream-{session_id}"),
                },
                title: req.title,
                language: req.language.clone(),
                reprocess: false,
            })
            .await?;

        let backend = streaming.open(req.language.as_deref()).await?;
        let (events_tx, events_rx) = mpsc::channel(config.event_capacity);

        info!(note_id = %note.id, job_id = %job.id, "Streaming session opened");

        Ok((
            Self {
                orchestrator,
                audio_store,
                backend,
                events_tx,
                note_id: note.id,
                job_id: job.id,
                audio_ref,
                buffer: Vec::new(),
                last_activity: Instant::now(),
                idle_timeout: config.idle_timeout,
                closed: false,
            },
            events_rx,
        ))
    }

    pub fn note_id(&self) -> Uuid {
        self.note_id
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Feed one audio frame. Transcript events produced by the backend are
    /// forwarded to the session's event channel in arrival order.
    pub async fn push_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::Conflict("streaming session is closed".into()));
        }
        if self.last_activity.elapsed() > self.idle_timeout {
            warn!(job_id = %self.job_id, "Streaming session idle timeout");
            self.closed = true;
            return Err(Error::Conflict("streaming session timed out".into()));
        }
        self.last_activity = Instant::now();

        // Mirror to durable storage first: a dropped connection must leave
        // everything received so far recoverable by batch transcription.
        self.buffer.extend_from_slice(chunk);
        self.audio_store
            .store_audio(&self.audio_ref, &self.buffer)
            .await?;

        self.backend.push_audio(chunk).await?;
        self.forward_events().await
    }

    /// Close the session and reconcile the final transcript into the
    /// state machine.
    #[instrument(skip(self), fields(subsystem = "stream", component = "session", job_id = %self.job_id))]
    pub async fn finish(mut self) -> Result<AdvanceOutcome> {
        if self.closed {
            return Err(Error::Conflict("streaming session is closed".into()));
        }
        self.closed = true;

        let transcript = self.backend.finish().await?;
        self.forward_events().await?;

        debug!(
            text_len = transcript.full_text.len(),
            duration_secs = transcript.duration_secs,
            "Streaming session finished"
        );
        self.orchestrator
            .reconcile_stream_transcript(self.job_id, transcript)
            .await
    }

    /// Abandon the session without a final event.
    ///
    /// The job stays in `RECEIVED`; whatever audio was durably stored is
    /// picked up by the batch transcription stage.
    pub async fn abort(mut self) -> Result<()> {
        self.closed = true;
        info!(
            job_id = %self.job_id,
            buffered_bytes = self.buffer.len(),
            "Streaming session aborted; batch transcription will take over"
        );
        Ok(())
    }

    async fn forward_events(&mut self) -> Result<()> {
        for event in self.backend.poll_events().await? {
            if self.events_tx.send(event).await.is_err() {
                // Receiver dropped: the client went away. Keep transcribing;
                // reconciliation or fallback still applies.
                debug!(job_id = %self.job_id, "Transcript event receiver dropped");
                break;
            }
        }
        Ok(())
    }
}
