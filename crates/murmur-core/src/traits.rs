//! Core traits for murmur abstractions.
//!
//! These traits define the seams between the orchestrator and its
//! collaborators: persistence stores, the usage ledger, the vector/text
//! index, and the external-service adapters. Concrete providers are bound
//! through configuration, never discovered at runtime.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::models::*;

// =============================================================================
// STORE TRAITS
// =============================================================================

/// Persistence for notes and their stage outputs.
#[async_trait]
pub trait NoteStore: Send + Sync {
    /// Insert a new note.
    async fn insert(&self, note: NewNote) -> Result<Note>;

    /// Fetch a note by ID.
    async fn fetch(&self, id: Uuid) -> Result<Note>;

    /// Update the note's processing state (mirrors the job's state for
    /// status reads).
    async fn set_state(&self, id: Uuid, state: ProcessingState) -> Result<()>;

    /// Persist the transcript and its segments, replacing any previous ones.
    async fn store_transcript(&self, id: Uuid, transcript: &Transcript) -> Result<()>;

    /// Load the transcript, if the transcription stage has produced one.
    async fn fetch_transcript(&self, id: Uuid) -> Result<Option<Transcript>>;

    /// Persist the structured extraction payload.
    async fn store_extraction(&self, id: Uuid, extraction: &NoteExtraction) -> Result<()>;

    /// Load the extraction payload, if the extraction stage has produced one.
    async fn fetch_extraction(&self, id: Uuid) -> Result<Option<NoteExtraction>>;

    /// Soft-delete a note. Stage outputs are retained until garbage
    /// collection runs.
    async fn soft_delete(&self, id: Uuid) -> Result<()>;
}

/// Persistence and claiming for processing jobs.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Atomically create a job, or return the existing job carrying the
    /// same idempotency key. The boolean is true when a new job was created.
    async fn create_or_get(&self, job: NewProcessingJob) -> Result<(ProcessingJob, bool)>;

    /// Fetch a job by ID.
    async fn get(&self, id: Uuid) -> Result<ProcessingJob>;

    /// Fetch a job by idempotency key.
    async fn get_by_key(&self, key: &str) -> Result<Option<ProcessingJob>>;

    /// All jobs for a note, newest first.
    async fn get_for_note(&self, note_id: Uuid) -> Result<Vec<ProcessingJob>>;

    /// Persist the job under an optimistic version check.
    ///
    /// Fails with `StaleVersion` when the stored version no longer equals
    /// `expected_version`; the caller must re-read and retry. On success
    /// the returned job carries the bumped version.
    async fn update(&self, job: &ProcessingJob, expected_version: i64) -> Result<ProcessingJob>;

    /// Claim the next runnable job for a worker: non-terminal, past its
    /// `next_attempt_at`, and either unclaimed or claimed longer than
    /// `stale_after_secs` ago (crash recovery).
    async fn claim_next(
        &self,
        worker_id: &str,
        stale_after_secs: i64,
    ) -> Result<Option<ProcessingJob>>;

    /// Drop the worker claim so the job is claimable again.
    async fn release_claim(&self, id: Uuid) -> Result<()>;

    /// Number of jobs currently runnable.
    async fn runnable_count(&self) -> Result<i64>;
}

// =============================================================================
// LEDGER TRAIT
// =============================================================================

/// Atomic debit/credit of per-user balances against metered operations.
///
/// No pipeline stage may execute without a successful reservation. All
/// three operations are atomic relative to concurrent balance reads: the
/// available balance (`balance - sum(open reservations)`) never goes
/// negative.
#[async_trait]
pub trait UsageLedger: Send + Sync {
    /// Place a hold of `estimated_cost` credits for one stage of one job.
    ///
    /// Fails with `InsufficientBalance` when the available balance does
    /// not cover the estimate.
    async fn reserve(
        &self,
        user_id: Uuid,
        job_id: Uuid,
        stage: Stage,
        estimated_cost: i64,
    ) -> Result<ReservationHandle>;

    /// Convert the reservation into a debit of `actual_cost` (which may
    /// differ from the estimate).
    async fn commit(&self, handle: &ReservationHandle, actual_cost: i64) -> Result<()>;

    /// Return the held amount to the available balance. Idempotent:
    /// releasing an already-released handle is a no-op.
    async fn release(&self, handle: &ReservationHandle) -> Result<()>;

    /// Release every open reservation for a job (cancellation, crash
    /// recovery). Returns the number of reservations released.
    async fn release_open_for_job(&self, job_id: Uuid) -> Result<u64>;

    /// The user's settled balance (ignoring open reservations).
    async fn balance(&self, user_id: Uuid) -> Result<i64>;

    /// Sum of the user's open (non-released, non-committed) reservations.
    async fn open_reservation_total(&self, user_id: Uuid) -> Result<i64>;
}

// =============================================================================
// INDEX TRAITS
// =============================================================================

/// Vector index over note embeddings.
#[async_trait]
pub trait EmbeddingIndex: Send + Sync {
    /// Upsert the single live embedding for a note, deleting any
    /// superseded row in the same transaction. Last write wins, keyed by
    /// note id.
    async fn replace_for_note(
        &self,
        note_id: Uuid,
        user_id: Uuid,
        source_hash: &str,
        vector: &Vector,
        model: &str,
    ) -> Result<()>;

    /// Delete the note's embedding (garbage collection).
    async fn delete_for_note(&self, note_id: Uuid) -> Result<()>;

    /// Nearest neighbors among the user's completed notes, by cosine
    /// similarity, best first.
    async fn find_similar(
        &self,
        user_id: Uuid,
        query: &Vector,
        limit: i64,
    ) -> Result<Vec<SearchHit>>;
}

/// Lexical full-text search over transcripts and extraction summaries.
#[async_trait]
pub trait TextSearch: Send + Sync {
    /// Rank the user's completed notes against a keyword query.
    async fn search_text(&self, user_id: Uuid, query: &str, limit: i64) -> Result<Vec<SearchHit>>;
}

// =============================================================================
// AUDIO STORAGE
// =============================================================================

/// Durable storage for raw audio, addressed by opaque reference.
///
/// The real object store lives outside this system; this trait is the
/// capability the pipeline consumes from it.
#[async_trait]
pub trait AudioStore: Send + Sync {
    /// Fetch stored audio bytes.
    async fn fetch_audio(&self, audio_ref: &str) -> Result<Vec<u8>>;

    /// Store audio bytes under the given reference.
    async fn store_audio(&self, audio_ref: &str, data: &[u8]) -> Result<()>;
}

// =============================================================================
// ADAPTER TRAITS
// =============================================================================

/// Backend for batch audio transcription.
#[async_trait]
pub trait TranscriptionBackend: Send + Sync {
    /// Transcribe audio data.
    async fn transcribe(
        &self,
        audio_data: &[u8],
        mime_type: &str,
        language: Option<&str>,
    ) -> Result<Transcript>;

    /// Check if the backend is available and responding.
    async fn health_check(&self) -> Result<bool>;

    /// Get the model name being used.
    fn model_name(&self) -> &str;
}

/// Backend for structured extraction via a language model.
#[async_trait]
pub trait ExtractionBackend: Send + Sync {
    /// Extract summary, entities, and candidate tasks from transcript text.
    /// The result is validated against the strict schema before it is
    /// returned.
    async fn extract(
        &self,
        transcript_text: &str,
        language: Option<&str>,
    ) -> Result<ExtractionOutcome>;

    /// Get the model name being used.
    fn model_name(&self) -> &str;
}

/// Backend for generating text embeddings.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Generate embeddings for the given texts, one vector per input.
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vector>>;

    /// Get the expected dimension of embedding vectors.
    fn dimension(&self) -> usize;

    /// Get the model name being used.
    fn model_name(&self) -> &str;
}

// =============================================================================
// STREAMING TRAITS
// =============================================================================

/// Factory for connection-scoped streaming transcription sessions.
#[async_trait]
pub trait StreamingTranscriptionBackend: Send + Sync {
    /// Open a new streaming transcription.
    async fn open(&self, language: Option<&str>) -> Result<Box<dyn StreamingTranscription>>;
}

/// One in-flight streaming transcription.
///
/// Events are produced in the order audio chunks were pushed.
#[async_trait]
pub trait StreamingTranscription: Send {
    /// Feed a chunk of 16-bit PCM mono audio.
    async fn push_audio(&mut self, chunk: &[u8]) -> Result<()>;

    /// Drain events produced since the last call, in arrival order.
    async fn poll_events(&mut self) -> Result<Vec<StreamEvent>>;

    /// Finish the session and return the final transcript over all audio
    /// received.
    async fn finish(&mut self) -> Result<Transcript>;
}
