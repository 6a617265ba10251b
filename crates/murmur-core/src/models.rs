//! Core data models for the murmur pipeline.
//!
//! These types are shared across all murmur crates and represent the
//! domain entities: notes, transcripts, extractions, processing jobs,
//! ledger reservations, and search results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

// =============================================================================
// STATE MACHINE TYPES
// =============================================================================

/// Embedding vector type (re-exported from pgvector).
pub use pgvector::Vector;

/// Processing state of a note / its job.
///
/// States only advance forward (`Received → Transcribing → Extracting →
/// Embedding → Done`). `Failed` is reachable from any non-terminal state
/// and is re-enterable only through an explicit retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingState {
    Received,
    Transcribing,
    Extracting,
    Embedding,
    Done,
    Failed,
}

impl ProcessingState {
    /// Whether no further automatic transition occurs from this state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessingState::Done | ProcessingState::Failed)
    }

    /// The stage that executes while the job is in this state.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            ProcessingState::Received | ProcessingState::Transcribing => {
                Some(Stage::Transcription)
            }
            ProcessingState::Extracting => Some(Stage::Extraction),
            ProcessingState::Embedding => Some(Stage::Embedding),
            ProcessingState::Done | ProcessingState::Failed => None,
        }
    }

    /// Position in the forward-only progression. `Failed` sorts last.
    pub fn ordinal(&self) -> u8 {
        match self {
            ProcessingState::Received => 0,
            ProcessingState::Transcribing => 1,
            ProcessingState::Extracting => 2,
            ProcessingState::Embedding => 3,
            ProcessingState::Done => 4,
            ProcessingState::Failed => 5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingState::Received => "received",
            ProcessingState::Transcribing => "transcribing",
            ProcessingState::Extracting => "extracting",
            ProcessingState::Embedding => "embedding",
            ProcessingState::Done => "done",
            ProcessingState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "received" => Ok(ProcessingState::Received),
            "transcribing" => Ok(ProcessingState::Transcribing),
            "extracting" => Ok(ProcessingState::Extracting),
            "embedding" => Ok(ProcessingState::Embedding),
            "done" => Ok(ProcessingState::Done),
            "failed" => Ok(ProcessingState::Failed),
            other => Err(Error::InvalidInput(format!(
                "unknown processing state: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One metered step of the note pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Transcription,
    Extraction,
    Embedding,
}

impl Stage {
    /// The state a job carries while this stage is running.
    pub fn running_state(&self) -> ProcessingState {
        match self {
            Stage::Transcription => ProcessingState::Transcribing,
            Stage::Extraction => ProcessingState::Extracting,
            Stage::Embedding => ProcessingState::Embedding,
        }
    }

    /// The state a job advances to when this stage succeeds.
    pub fn next_state(&self) -> ProcessingState {
        match self {
            Stage::Transcription => ProcessingState::Extracting,
            Stage::Extraction => ProcessingState::Embedding,
            Stage::Embedding => ProcessingState::Done,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Transcription => "transcription",
            Stage::Extraction => "extraction",
            Stage::Embedding => "embedding",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "transcription" => Ok(Stage::Transcription),
            "extraction" => Ok(Stage::Extraction),
            "embedding" => Ok(Stage::Embedding),
            other => Err(Error::InvalidInput(format!("unknown stage: {other}"))),
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable machine-readable reason code for a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCode {
    /// Reservation was rejected for insufficient balance.
    BillingRejected,
    /// The extraction model refused the content.
    ContentPolicy,
    /// The audio format or payload cannot be processed.
    UnsupportedMedia,
    /// An adapter failed and retries were exhausted.
    RetriesExhausted,
    /// Unclassified adapter failure.
    AdapterError,
    /// The user cancelled the job.
    UserCancelled,
}

impl FailureCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCode::BillingRejected => "billing_rejected",
            FailureCode::ContentPolicy => "content_policy",
            FailureCode::UnsupportedMedia => "unsupported_media",
            FailureCode::RetriesExhausted => "retries_exhausted",
            FailureCode::AdapterError => "adapter_error",
            FailureCode::UserCancelled => "user_cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "billing_rejected" => Ok(FailureCode::BillingRejected),
            "content_policy" => Ok(FailureCode::ContentPolicy),
            "unsupported_media" => Ok(FailureCode::UnsupportedMedia),
            "retries_exhausted" => Ok(FailureCode::RetriesExhausted),
            "adapter_error" => Ok(FailureCode::AdapterError),
            "user_cancelled" => Ok(FailureCode::UserCancelled),
            other => Err(Error::InvalidInput(format!(
                "unknown failure code: {other}"
            ))),
        }
    }

    /// Human-readable message to accompany the code in status responses.
    pub fn message(&self) -> &'static str {
        match self {
            FailureCode::BillingRejected => "Not enough balance to process this note",
            FailureCode::ContentPolicy => "The content was rejected by the provider's policy",
            FailureCode::UnsupportedMedia => "The audio format is not supported",
            FailureCode::RetriesExhausted => "Processing failed repeatedly and was given up",
            FailureCode::AdapterError => "An external service failed while processing",
            FailureCode::UserCancelled => "Processing was cancelled",
        }
    }
}

impl std::fmt::Display for FailureCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// NOTE TYPES
// =============================================================================

/// A voice (or text) note owned by a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Note {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: Option<String>,
    /// Object-store key of the raw audio. Absent for text-only notes.
    pub audio_ref: Option<String>,
    pub audio_mime: Option<String>,
    /// Raw text for text-only notes (becomes the transcript directly).
    pub source_text: Option<String>,
    /// ISO 639-1 language hint forwarded to adapters.
    pub language: Option<String>,
    pub state: ProcessingState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Request to create a note.
#[derive(Debug, Clone)]
pub struct NewNote {
    pub user_id: Uuid,
    pub title: Option<String>,
    pub audio_ref: Option<String>,
    pub audio_mime: Option<String>,
    pub source_text: Option<String>,
    pub language: Option<String>,
    pub state: ProcessingState,
}

// =============================================================================
// TRANSCRIPT TYPES
// =============================================================================

/// A segment of transcribed audio with timestamps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscriptSegment {
    pub start_secs: f64,
    pub end_secs: f64,
    pub text: String,
    pub confidence: Option<f32>,
}

/// Result of audio transcription. Immutable once the transcription stage
/// is marked complete.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transcript {
    /// Full transcribed text.
    pub full_text: String,
    /// Timestamped segments, ordered by start time.
    pub segments: Vec<TranscriptSegment>,
    /// Detected language (ISO 639-1 code).
    pub language: Option<String>,
    /// Total audio duration in seconds.
    pub duration_secs: Option<f64>,
}

impl Transcript {
    /// Build a transcript from plain text (text-only notes, no timing).
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            full_text: text.into(),
            segments: Vec::new(),
            language: None,
            duration_secs: None,
        }
    }

    /// Billable audio minutes, rounded up. Zero for untimed transcripts.
    pub fn billable_minutes(&self) -> i64 {
        match self.duration_secs {
            Some(secs) if secs > 0.0 => (secs / 60.0).ceil() as i64,
            _ => 0,
        }
    }
}

// =============================================================================
// EXTRACTION TYPES
// =============================================================================

/// A named entity surfaced by extraction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractedEntity {
    pub name: String,
    /// Entity kind, e.g. "person", "organization", "place", "topic".
    pub kind: String,
}

/// A candidate task surfaced by extraction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractedTask {
    pub description: String,
    /// Free-form due hint as spoken ("next Tuesday", "end of month").
    pub due_hint: Option<String>,
}

/// Structured payload produced by the extraction stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NoteExtraction {
    pub summary: String,
    #[serde(default)]
    pub entities: Vec<ExtractedEntity>,
    #[serde(default)]
    pub tasks: Vec<ExtractedTask>,
}

impl NoteExtraction {
    /// Validate the payload against the strict schema contract.
    pub fn validate(&self) -> Result<()> {
        if self.summary.trim().is_empty() {
            return Err(Error::InvalidInput(
                "extraction summary must not be empty".into(),
            ));
        }
        if self.entities.iter().any(|e| e.name.trim().is_empty()) {
            return Err(Error::InvalidInput(
                "extraction entity names must not be empty".into(),
            ));
        }
        if self.tasks.iter().any(|t| t.description.trim().is_empty()) {
            return Err(Error::InvalidInput(
                "extraction task descriptions must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Extraction adapter output, including usage for metering.
#[derive(Debug, Clone)]
pub struct ExtractionOutcome {
    pub extraction: NoteExtraction,
    /// Total tokens consumed by the model call (prompt + completion).
    pub tokens_used: i64,
    pub model: String,
}

// =============================================================================
// JOB TYPES
// =============================================================================

/// One processing attempt for a note.
///
/// `version` increases monotonically on every persisted update and backs
/// the optimistic-concurrency check: two workers racing on the same job
/// cannot both win an update against the same observed version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingJob {
    pub id: Uuid,
    pub note_id: Uuid,
    pub user_id: Uuid,
    /// Deterministic key over `(note_id, input checksum)`.
    pub idempotency_key: String,
    pub state: ProcessingState,
    pub transcribe_attempts: i32,
    pub extract_attempts: i32,
    pub embed_attempts: i32,
    pub max_attempts: i32,
    pub version: i64,
    pub failure_code: Option<FailureCode>,
    pub failure_message: Option<String>,
    /// Earliest time the next attempt may run (retry backoff).
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ProcessingJob {
    /// Attempt count recorded for a stage.
    pub fn attempts_for(&self, stage: Stage) -> i32 {
        match stage {
            Stage::Transcription => self.transcribe_attempts,
            Stage::Extraction => self.extract_attempts,
            Stage::Embedding => self.embed_attempts,
        }
    }

    /// Increment the attempt counter for a stage.
    pub fn bump_attempts(&mut self, stage: Stage) {
        match stage {
            Stage::Transcription => self.transcribe_attempts += 1,
            Stage::Extraction => self.extract_attempts += 1,
            Stage::Embedding => self.embed_attempts += 1,
        }
    }

    /// The stage this job will run next, if any.
    pub fn current_stage(&self) -> Option<Stage> {
        self.state.stage()
    }

    /// Whether the job is in the transient retrying substate: non-terminal,
    /// at least one failed attempt for the current stage, and a scheduled
    /// next attempt.
    pub fn is_retrying(&self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        match self.current_stage() {
            Some(stage) => self.attempts_for(stage) > 0 && self.next_attempt_at.is_some(),
            None => false,
        }
    }
}

/// Request to create a processing job.
#[derive(Debug, Clone)]
pub struct NewProcessingJob {
    pub note_id: Uuid,
    pub user_id: Uuid,
    pub idempotency_key: String,
    pub initial_state: ProcessingState,
    pub max_attempts: i32,
}

// =============================================================================
// LEDGER TYPES
// =============================================================================

/// Lifecycle status of a ledger reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    Reserved,
    Committed,
    Released,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Reserved => "reserved",
            ReservationStatus::Committed => "committed",
            ReservationStatus::Released => "released",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "reserved" => Ok(ReservationStatus::Reserved),
            "committed" => Ok(ReservationStatus::Committed),
            "released" => Ok(ReservationStatus::Released),
            other => Err(Error::InvalidInput(format!(
                "unknown reservation status: {other}"
            ))),
        }
    }
}

/// A hold against a user's balance for one stage of one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerReservation {
    pub id: Uuid,
    pub user_id: Uuid,
    pub job_id: Uuid,
    pub stage: Stage,
    pub estimated_cost: i64,
    /// Set on commit; the debit uses this, not the estimate.
    pub actual_cost: Option<i64>,
    pub status: ReservationStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Opaque handle returned by `reserve`, consumed by `commit`/`release`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservationHandle {
    pub id: Uuid,
    pub job_id: Uuid,
    pub stage: Stage,
}

// =============================================================================
// SEARCH TYPES
// =============================================================================

/// A raw hit from one retrieval source (vector or full-text).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub note_id: Uuid,
    pub score: f32,
    pub snippet: Option<String>,
    pub title: Option<String>,
    /// Last update time of the note, used for recency tie-breaks.
    pub updated_at: DateTime<Utc>,
}

/// A blended, ranked retrieval result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedNote {
    pub note_id: Uuid,
    pub score: f32,
    pub snippet: Option<String>,
    pub title: Option<String>,
}

// =============================================================================
// BOUNDARY TYPES
// =============================================================================

/// Input for a note submission.
#[derive(Debug, Clone)]
pub enum NoteInput {
    Audio {
        audio_ref: String,
        mime_type: String,
        /// sha-256 hex checksum of the audio bytes.
        checksum: String,
    },
    Text {
        text: String,
    },
}

/// Intake-boundary request: submit a note for processing.
#[derive(Debug, Clone)]
pub struct SubmitNoteRequest {
    pub user_id: Uuid,
    pub input: NoteInput,
    pub title: Option<String>,
    pub language: Option<String>,
    /// Explicitly re-process a note that already reached `Done`.
    pub reprocess: bool,
}

/// Status-boundary response for a note.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoteStatus {
    pub note_id: Uuid,
    pub state: ProcessingState,
    /// True while a failed attempt awaits its scheduled retry.
    pub retrying: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript: Option<Transcript>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extraction: Option<NoteExtraction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StatusError>,
}

/// Failure detail surfaced by status queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusError {
    pub code: FailureCode,
    pub message: String,
}

/// Event emitted over the streaming transcription channel.
///
/// Serialized as `{"type":"transcript","text":...,"is_final":...,"confidence":...}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Transcript {
        text: String,
        is_final: bool,
        confidence: Option<f32>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_forward_order() {
        let order = [
            ProcessingState::Received,
            ProcessingState::Transcribing,
            ProcessingState::Extracting,
            ProcessingState::Embedding,
            ProcessingState::Done,
        ];
        for pair in order.windows(2) {
            assert!(pair[0].ordinal() < pair[1].ordinal());
        }
    }

    #[test]
    fn test_state_terminality() {
        assert!(ProcessingState::Done.is_terminal());
        assert!(ProcessingState::Failed.is_terminal());
        assert!(!ProcessingState::Received.is_terminal());
        assert!(!ProcessingState::Transcribing.is_terminal());
        assert!(!ProcessingState::Extracting.is_terminal());
        assert!(!ProcessingState::Embedding.is_terminal());
    }

    #[test]
    fn test_state_stage_mapping() {
        assert_eq!(
            ProcessingState::Received.stage(),
            Some(Stage::Transcription)
        );
        assert_eq!(
            ProcessingState::Transcribing.stage(),
            Some(Stage::Transcription)
        );
        assert_eq!(ProcessingState::Extracting.stage(), Some(Stage::Extraction));
        assert_eq!(ProcessingState::Embedding.stage(), Some(Stage::Embedding));
        assert_eq!(ProcessingState::Done.stage(), None);
        assert_eq!(ProcessingState::Failed.stage(), None);
    }

    #[test]
    fn test_stage_transitions() {
        assert_eq!(
            Stage::Transcription.next_state(),
            ProcessingState::Extracting
        );
        assert_eq!(Stage::Extraction.next_state(), ProcessingState::Embedding);
        assert_eq!(Stage::Embedding.next_state(), ProcessingState::Done);
    }

    #[test]
    fn test_state_round_trip() {
        for state in [
            ProcessingState::Received,
            ProcessingState::Transcribing,
            ProcessingState::Extracting,
            ProcessingState::Embedding,
            ProcessingState::Done,
            ProcessingState::Failed,
        ] {
            assert_eq!(ProcessingState::parse(state.as_str()).unwrap(), state);
        }
        assert!(ProcessingState::parse("bogus").is_err());
    }

    #[test]
    fn test_stage_round_trip() {
        for stage in [Stage::Transcription, Stage::Extraction, Stage::Embedding] {
            assert_eq!(Stage::parse(stage.as_str()).unwrap(), stage);
        }
        assert!(Stage::parse("").is_err());
    }

    #[test]
    fn test_failure_code_round_trip() {
        for code in [
            FailureCode::BillingRejected,
            FailureCode::ContentPolicy,
            FailureCode::UnsupportedMedia,
            FailureCode::RetriesExhausted,
            FailureCode::AdapterError,
            FailureCode::UserCancelled,
        ] {
            assert_eq!(FailureCode::parse(code.as_str()).unwrap(), code);
            assert!(!code.message().is_empty());
        }
    }

    #[test]
    fn test_transcript_billable_minutes() {
        let mut t = Transcript::from_text("hello");
        assert_eq!(t.billable_minutes(), 0);

        t.duration_secs = Some(59.0);
        assert_eq!(t.billable_minutes(), 1);

        t.duration_secs = Some(60.0);
        assert_eq!(t.billable_minutes(), 1);

        t.duration_secs = Some(61.0);
        assert_eq!(t.billable_minutes(), 2);

        t.duration_secs = Some(0.0);
        assert_eq!(t.billable_minutes(), 0);
    }

    #[test]
    fn test_extraction_validate() {
        let good = NoteExtraction {
            summary: "A short summary".into(),
            entities: vec![ExtractedEntity {
                name: "Acme".into(),
                kind: "organization".into(),
            }],
            tasks: vec![ExtractedTask {
                description: "Send the report".into(),
                due_hint: Some("Friday".into()),
            }],
        };
        assert!(good.validate().is_ok());

        let empty_summary = NoteExtraction {
            summary: "  ".into(),
            entities: vec![],
            tasks: vec![],
        };
        assert!(empty_summary.validate().is_err());

        let empty_entity = NoteExtraction {
            summary: "ok".into(),
            entities: vec![ExtractedEntity {
                name: "".into(),
                kind: "person".into(),
            }],
            tasks: vec![],
        };
        assert!(empty_entity.validate().is_err());
    }

    #[test]
    fn test_extraction_deserializes_with_defaults() {
        let json = r#"{"summary":"just a summary"}"#;
        let extraction: NoteExtraction = serde_json::from_str(json).unwrap();
        assert_eq!(extraction.summary, "just a summary");
        assert!(extraction.entities.is_empty());
        assert!(extraction.tasks.is_empty());
    }

    #[test]
    fn test_job_attempts_per_stage() {
        let mut job = test_job(ProcessingState::Transcribing);
        assert_eq!(job.attempts_for(Stage::Transcription), 0);

        job.bump_attempts(Stage::Transcription);
        job.bump_attempts(Stage::Transcription);
        job.bump_attempts(Stage::Extraction);

        assert_eq!(job.attempts_for(Stage::Transcription), 2);
        assert_eq!(job.attempts_for(Stage::Extraction), 1);
        assert_eq!(job.attempts_for(Stage::Embedding), 0);
    }

    #[test]
    fn test_job_retrying_substate() {
        let mut job = test_job(ProcessingState::Transcribing);
        assert!(!job.is_retrying());

        job.bump_attempts(Stage::Transcription);
        job.next_attempt_at = Some(Utc::now());
        assert!(job.is_retrying());

        job.state = ProcessingState::Failed;
        assert!(!job.is_retrying());
    }

    #[test]
    fn test_stream_event_wire_format() {
        let event = StreamEvent::Transcript {
            text: "hello world".into(),
            is_final: false,
            confidence: Some(0.92),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "transcript");
        assert_eq!(json["text"], "hello world");
        assert_eq!(json["is_final"], false);

        let back: StreamEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    fn test_job(state: ProcessingState) -> ProcessingJob {
        ProcessingJob {
            id: Uuid::new_v4(),
            note_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            idempotency_key: "key".into(),
            state,
            transcribe_attempts: 0,
            extract_attempts: 0,
            embed_attempts: 0,
            max_attempts: 3,
            version: 1,
            failure_code: None,
            failure_message: None,
            next_attempt_at: None,
            claimed_by: None,
            claimed_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            completed_at: None,
        }
    }
}
