//! Note-processing orchestrator.
//!
//! Owns the per-note state machine (`RECEIVED → TRANSCRIBING → EXTRACTING
//! → EMBEDDING → DONE`, `FAILED` from any non-terminal state), sequences
//! adapter calls one stage per `advance` invocation, and enforces the
//! ledger discipline: reserve before a stage runs, commit the actual cost
//! only after its output is persisted, release on every failure path.
//!
//! Concurrency model: each repository call is its own transaction; nothing
//! is held across a suspending adapter call. Racing writers are serialized
//! by the job's optimistic version check — the loser's work is discarded,
//! never overwritten.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::time::{timeout, Duration};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use murmur_core::{
    defaults, idempotency_key, input_checksum, AudioStore, CostModel, EmbeddingBackend,
    EmbeddingIndex, Error, ExtractionBackend, ExtractionOutcome, FailureCode, JobStore, NewNote,
    NewProcessingJob, Note, NoteInput, NoteStatus, NoteStore, ProcessingJob, ProcessingState,
    ReservationHandle, Result, Stage, StatusError, SubmitNoteRequest, Transcript,
    TranscriptionBackend, UsageLedger, Vector,
};

/// Timing and retry configuration for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum attempts per stage before the job fails permanently.
    pub max_attempts: i32,
    /// Base delay for exponential retry backoff.
    pub backoff_base_ms: u64,
    /// Upper bound on a single retry delay.
    pub backoff_cap_ms: u64,
    /// Per-stage adapter timeouts.
    pub transcribe_timeout: Duration,
    pub extract_timeout: Duration,
    pub embed_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_attempts: defaults::STAGE_MAX_ATTEMPTS,
            backoff_base_ms: defaults::RETRY_BACKOFF_BASE_MS,
            backoff_cap_ms: defaults::RETRY_BACKOFF_CAP_MS,
            transcribe_timeout: Duration::from_secs(defaults::TRANSCRIBE_TIMEOUT_SECS),
            extract_timeout: Duration::from_secs(defaults::EXTRACT_TIMEOUT_SECS),
            embed_timeout: Duration::from_secs(defaults::EMBED_TIMEOUT_SECS),
        }
    }
}

impl OrchestratorConfig {
    /// Set the per-stage attempt cap.
    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the backoff base delay in milliseconds.
    pub fn with_backoff_base_ms(mut self, ms: u64) -> Self {
        self.backoff_base_ms = ms;
        self
    }

    fn stage_timeout(&self, stage: Stage) -> Duration {
        match stage {
            Stage::Transcription => self.transcribe_timeout,
            Stage::Extraction => self.extract_timeout,
            Stage::Embedding => self.embed_timeout,
        }
    }

    /// Exponential backoff for the given (1-based) attempt number.
    fn backoff_delay_ms(&self, attempt: i32) -> u64 {
        let shift = (attempt - 1).clamp(0, 16) as u32;
        self.backoff_base_ms
            .saturating_mul(1u64 << shift)
            .min(self.backoff_cap_ms)
    }
}

/// Collaborators the orchestrator is wired with.
pub struct OrchestratorDeps {
    pub notes: Arc<dyn NoteStore>,
    pub jobs: Arc<dyn JobStore>,
    pub ledger: Arc<dyn UsageLedger>,
    pub index: Arc<dyn EmbeddingIndex>,
    pub audio: Arc<dyn AudioStore>,
    pub transcription: Arc<dyn TranscriptionBackend>,
    pub extraction: Arc<dyn ExtractionBackend>,
    pub embedding: Arc<dyn EmbeddingBackend>,
}

/// Result of one `advance` invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum AdvanceOutcome {
    /// The stage succeeded and the job moved to this state.
    Progressed(ProcessingState),
    /// The stage failed transiently; a retry is scheduled.
    RetryScheduled {
        stage: Stage,
        attempt: i32,
        next_attempt_at: DateTime<Utc>,
    },
    /// The job reached `FAILED` with this reason.
    Failed(FailureCode),
    /// A concurrent writer advanced the job first; this invocation's work
    /// was discarded.
    Discarded,
    /// The job's scheduled retry time has not arrived yet.
    NotDue { next_attempt_at: DateTime<Utc> },
    /// The job is already in a terminal state.
    AlreadyTerminal,
}

/// Output of one stage execution, before persistence.
enum StageOutput {
    Transcript(Transcript),
    Extraction(ExtractionOutcome),
    Embedding {
        vector: Vector,
        source_hash: String,
        model: String,
    },
}

/// The note-processing orchestrator.
pub struct Orchestrator {
    notes: Arc<dyn NoteStore>,
    jobs: Arc<dyn JobStore>,
    ledger: Arc<dyn UsageLedger>,
    index: Arc<dyn EmbeddingIndex>,
    audio: Arc<dyn AudioStore>,
    transcription: Arc<dyn TranscriptionBackend>,
    extraction: Arc<dyn ExtractionBackend>,
    embedding: Arc<dyn EmbeddingBackend>,
    costs: CostModel,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(deps: OrchestratorDeps, costs: CostModel, config: OrchestratorConfig) -> Self {
        Self {
            notes: deps.notes,
            jobs: deps.jobs,
            ledger: deps.ledger,
            index: deps.index,
            audio: deps.audio,
            transcription: deps.transcription,
            extraction: deps.extraction,
            embedding: deps.embedding,
            costs,
            config,
        }
    }

    /// Intake boundary: create a note from raw input and submit it.
    pub async fn intake(&self, req: SubmitNoteRequest) -> Result<(Note, ProcessingJob)> {
        let new_note = match &req.input {
            NoteInput::Audio {
                audio_ref,
                mime_type,
                ..
            } => NewNote {
                user_id: req.user_id,
                title: req.title.clone(),
                audio_ref: Some(audio_ref.clone()),
                audio_mime: Some(mime_type.clone()),
                source_text: None,
                language: req.language.clone(),
                state: ProcessingState::Received,
            },
            NoteInput::Text { text } => NewNote {
                user_id: req.user_id,
                title: req.title.clone(),
                audio_ref: None,
                audio_mime: None,
                source_text: Some(text.clone()),
                language: req.language.clone(),
                state: initial_state_for_text(),
            },
        };
        let note = self.notes.insert(new_note).await?;
        let job = self.submit(note.id, &req.input, req.reprocess).await?;
        Ok((note, job))
    }

    /// Submit a note for processing.
    ///
    /// Creates or reuses a job keyed by `(note_id, input checksum)`: while
    /// a job for the same input is non-terminal, the same job is returned
    /// and no duplicate reservation is created. A note already `Done`
    /// conflicts unless `reprocess` is set.
    #[instrument(skip(self, input), fields(subsystem = "pipeline", component = "orchestrator", op = "submit", note_id = %note_id))]
    pub async fn submit(
        &self,
        note_id: Uuid,
        input: &NoteInput,
        reprocess: bool,
    ) -> Result<ProcessingJob> {
        let note = self.notes.fetch(note_id).await?;
        if note.deleted_at.is_some() {
            return Err(Error::Conflict(format!("note {note_id} is deleted")));
        }

        let (checksum, initial_state) = match input {
            NoteInput::Audio { checksum, .. } => (checksum.clone(), ProcessingState::Received),
            NoteInput::Text { text } => {
                (input_checksum(text.as_bytes()), initial_state_for_text())
            }
        };
        let key = idempotency_key(note_id, &checksum);

        if let Some(existing) = self.jobs.get_by_key(&key).await? {
            return self
                .resolve_resubmission(existing, input, initial_state, reprocess)
                .await;
        }

        // Text-only input short-circuits the transcription stage: the text
        // is the transcript, persisted before the job can reach EXTRACTING.
        if let NoteInput::Text { text } = input {
            self.notes
                .store_transcript(note_id, &Transcript::from_text(text.clone()))
                .await?;
        }

        let (job, created) = self
            .jobs
            .create_or_get(NewProcessingJob {
                note_id,
                user_id: note.user_id,
                idempotency_key: key,
                initial_state,
                max_attempts: self.config.max_attempts,
            })
            .await?;

        if created {
            if note.state != job.state {
                self.notes.set_state(note_id, job.state).await?;
            }
            info!(job_id = %job.id, state = %job.state, "Job submitted");
            Ok(job)
        } else {
            // Lost a creation race; resolve like any resubmission.
            self.resolve_resubmission(job, input, initial_state, reprocess)
                .await
        }
    }

    async fn resolve_resubmission(
        &self,
        existing: ProcessingJob,
        input: &NoteInput,
        initial_state: ProcessingState,
        reprocess: bool,
    ) -> Result<ProcessingJob> {
        if !existing.state.is_terminal() {
            debug!(job_id = %existing.id, "Returning in-flight job for duplicate submission");
            return Ok(existing);
        }

        if existing.state == ProcessingState::Done && !reprocess {
            return Err(Error::Conflict(format!(
                "note {} is already processed; re-processing was not requested",
                existing.note_id
            )));
        }

        if existing.state == ProcessingState::Failed && !reprocess {
            // The failed job is returned as-is; re-entry happens through
            // an explicit `retry` or a reprocess submission.
            return Ok(existing);
        }

        // Explicit re-processing: reset the job and run the pipeline again.
        if let NoteInput::Text { text } = input {
            self.notes
                .store_transcript(existing.note_id, &Transcript::from_text(text.clone()))
                .await?;
        }

        let mut reset = existing.clone();
        reset.state = initial_state;
        reset.transcribe_attempts = 0;
        reset.extract_attempts = 0;
        reset.embed_attempts = 0;
        reset.failure_code = None;
        reset.failure_message = None;
        reset.next_attempt_at = None;
        reset.claimed_by = None;
        reset.claimed_at = None;
        reset.completed_at = None;

        let updated = self.jobs.update(&reset, existing.version).await?;
        self.notes.set_state(updated.note_id, updated.state).await?;
        info!(job_id = %updated.id, state = %updated.state, "Job reset for re-processing");
        Ok(updated)
    }

    /// Execute exactly one stage of a job.
    ///
    /// Persist-then-call-then-persist: the running state is written (under
    /// the version check) before the adapter call, and outputs are
    /// persisted before the state advances. The ledger reservation for the
    /// stage is committed only after persistence succeeds.
    #[instrument(skip(self), fields(subsystem = "pipeline", component = "orchestrator", op = "advance", job_id = %job_id))]
    pub async fn advance(&self, job_id: Uuid) -> Result<AdvanceOutcome> {
        let job = self.jobs.get(job_id).await?;

        if job.state.is_terminal() {
            return Ok(AdvanceOutcome::AlreadyTerminal);
        }
        if let Some(at) = job.next_attempt_at {
            if at > Utc::now() {
                return Ok(AdvanceOutcome::NotDue {
                    next_attempt_at: at,
                });
            }
        }

        let stage = job
            .current_stage()
            .ok_or_else(|| Error::Internal(format!("non-terminal job {job_id} has no stage")))?;
        let note = self.notes.fetch(job.note_id).await?;

        // Serialize racing advances: the loser aborts here and discards.
        let mut running = job.clone();
        running.state = stage.running_state();
        running.next_attempt_at = None;
        let running = match self.jobs.update(&running, job.version).await {
            Ok(updated) => updated,
            Err(Error::StaleVersion(_)) => return Ok(AdvanceOutcome::Discarded),
            Err(e) => return Err(e),
        };
        if note.state != running.state {
            self.notes.set_state(note.id, running.state).await?;
        }

        // Reserve before the stage may run. Insufficient funds fail the
        // job without attempting the stage.
        let estimate = self.estimate_stage_cost(stage, &note).await?;
        let handle = match self
            .ledger
            .reserve(running.user_id, running.id, stage, estimate)
            .await
        {
            Ok(handle) => handle,
            Err(Error::InsufficientBalance {
                required,
                available,
            }) => {
                warn!(
                    job_id = %running.id,
                    stage = %stage,
                    required,
                    available,
                    "Reservation rejected; failing job"
                );
                let message =
                    format!("stage {stage} needs {required} credits, {available} available");
                return self
                    .fail_job(running, FailureCode::BillingRejected, message)
                    .await;
            }
            Err(e) => return Err(e),
        };

        let start = Instant::now();
        let result = self.execute_stage(stage, &note).await;
        let elapsed = start.elapsed().as_millis() as u64;

        match result {
            Ok(output) => {
                debug!(job_id = %running.id, stage = %stage, duration_ms = elapsed, "Stage succeeded");
                self.complete_stage(running, stage, output, handle).await
            }
            Err(err) => {
                warn!(job_id = %running.id, stage = %stage, duration_ms = elapsed, error = %err, "Stage failed");
                self.handle_stage_failure(running, stage, err, handle).await
            }
        }
    }

    /// Cancel a non-terminal job and release its open reservations.
    #[instrument(skip(self), fields(subsystem = "pipeline", component = "orchestrator", op = "cancel", job_id = %job_id))]
    pub async fn cancel(&self, job_id: Uuid) -> Result<()> {
        // The version check can lose against an in-flight advance; re-read
        // and try again — StaleVersion is internal, not caller-visible.
        for _ in 0..3 {
            let job = self.jobs.get(job_id).await?;
            if job.state.is_terminal() {
                return Err(Error::Conflict(format!(
                    "job {job_id} is already {}",
                    job.state
                )));
            }
            let mut cancelled = job.clone();
            cancelled.state = ProcessingState::Failed;
            cancelled.failure_code = Some(FailureCode::UserCancelled);
            cancelled.failure_message = Some(FailureCode::UserCancelled.message().to_string());
            cancelled.next_attempt_at = None;
            cancelled.claimed_by = None;
            cancelled.claimed_at = None;
            cancelled.completed_at = Some(Utc::now());

            match self.jobs.update(&cancelled, job.version).await {
                Ok(updated) => {
                    self.notes
                        .set_state(updated.note_id, ProcessingState::Failed)
                        .await?;
                    let released = self.ledger.release_open_for_job(job_id).await?;
                    info!(job_id = %job_id, released, "Job cancelled");
                    return Ok(());
                }
                Err(Error::StaleVersion(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::Internal(format!(
            "could not cancel job {job_id}: version kept moving"
        )))
    }

    /// Explicitly re-enter a failed job at the stage that failed.
    ///
    /// The re-entered stage gets a fresh attempt budget. The stage is
    /// derived from which outputs are already persisted, so completed
    /// stages are never re-run (and never re-charged).
    #[instrument(skip(self), fields(subsystem = "pipeline", component = "orchestrator", op = "retry", job_id = %job_id))]
    pub async fn retry(&self, job_id: Uuid) -> Result<ProcessingJob> {
        let job = self.jobs.get(job_id).await?;
        if job.state != ProcessingState::Failed {
            return Err(Error::Conflict(format!(
                "job {job_id} is {}, only failed jobs can be retried",
                job.state
            )));
        }

        let note = self.notes.fetch(job.note_id).await?;
        let transcript = self.notes.fetch_transcript(note.id).await?;
        let extraction = self.notes.fetch_extraction(note.id).await?;

        let resume_state = if transcript.is_none() {
            ProcessingState::Received
        } else if extraction.is_none() {
            ProcessingState::Extracting
        } else {
            ProcessingState::Embedding
        };
        let resume_stage = resume_state
            .stage()
            .expect("resume state always has a stage");

        let mut resumed = job.clone();
        resumed.state = resume_state;
        match resume_stage {
            Stage::Transcription => resumed.transcribe_attempts = 0,
            Stage::Extraction => resumed.extract_attempts = 0,
            Stage::Embedding => resumed.embed_attempts = 0,
        }
        resumed.failure_code = None;
        resumed.failure_message = None;
        resumed.next_attempt_at = None;
        resumed.claimed_by = None;
        resumed.claimed_at = None;
        resumed.completed_at = None;

        let updated = self.jobs.update(&resumed, job.version).await?;
        self.notes.set_state(note.id, updated.state).await?;
        info!(job_id = %job_id, state = %updated.state, "Job re-entered after failure");
        Ok(updated)
    }

    /// Status boundary: current state plus persisted outputs.
    ///
    /// Push and pull observers both read from here; retries are invisible
    /// except for elapsed time and the `retrying` flag.
    pub async fn status(&self, note_id: Uuid) -> Result<NoteStatus> {
        let note = self.notes.fetch(note_id).await?;
        let jobs = self.jobs.get_for_note(note_id).await?;
        let latest = jobs.first();

        let transcript = self.notes.fetch_transcript(note_id).await?;
        let extraction = self.notes.fetch_extraction(note_id).await?;

        let error = latest.and_then(|job| {
            if job.state != ProcessingState::Failed {
                return None;
            }
            let code = job.failure_code.unwrap_or(FailureCode::AdapterError);
            Some(StatusError {
                code,
                message: job
                    .failure_message
                    .clone()
                    .unwrap_or_else(|| code.message().to_string()),
            })
        });

        Ok(NoteStatus {
            note_id,
            state: note.state,
            retrying: latest.map(|j| j.is_retrying()).unwrap_or(false),
            transcript,
            extraction,
            error,
        })
    }

    /// Streaming reconciliation: accept a session's final transcript as
    /// the transcription-stage output, metering it by actual duration, and
    /// short-circuit `RECEIVED` directly into `EXTRACTING`.
    #[instrument(skip(self, transcript), fields(subsystem = "pipeline", component = "orchestrator", op = "reconcile_stream", job_id = %job_id))]
    pub async fn reconcile_stream_transcript(
        &self,
        job_id: Uuid,
        transcript: Transcript,
    ) -> Result<AdvanceOutcome> {
        let job = self.jobs.get(job_id).await?;
        match job.state {
            ProcessingState::Received | ProcessingState::Transcribing => {}
            other => {
                return Err(Error::Conflict(format!(
                    "job {job_id} is {other}; streaming transcript cannot be reconciled"
                )))
            }
        }

        // The session already consumed the minutes; reserve and commit the
        // actual in one motion so the debit ledger matches real usage.
        let actual = self
            .costs
            .transcription_actual(transcript.billable_minutes());
        let handle = match self
            .ledger
            .reserve(job.user_id, job.id, Stage::Transcription, actual)
            .await
        {
            Ok(handle) => handle,
            Err(Error::InsufficientBalance {
                required,
                available,
            }) => {
                let message =
                    format!("streamed transcription needs {required} credits, {available} available");
                return self
                    .fail_job(job, FailureCode::BillingRejected, message)
                    .await;
            }
            Err(e) => return Err(e),
        };

        self.notes.store_transcript(job.note_id, &transcript).await?;

        let mut advanced = job.clone();
        advanced.state = ProcessingState::Extracting;
        advanced.next_attempt_at = None;
        match self.jobs.update(&advanced, job.version).await {
            Ok(updated) => {
                self.notes.set_state(updated.note_id, updated.state).await?;
                self.ledger.commit(&handle, actual).await?;
                info!(job_id = %job_id, cost = actual, "Streamed transcript reconciled");
                Ok(AdvanceOutcome::Progressed(updated.state))
            }
            Err(Error::StaleVersion(_)) => {
                self.ledger.release(&handle).await?;
                Ok(AdvanceOutcome::Discarded)
            }
            Err(e) => {
                self.ledger.release(&handle).await?;
                Err(e)
            }
        }
    }

    // =========================================================================
    // Stage execution internals
    // =========================================================================

    async fn estimate_stage_cost(&self, stage: Stage, note: &Note) -> Result<i64> {
        let input_len = match stage {
            Stage::Transcription => 0,
            Stage::Extraction | Stage::Embedding => self
                .notes
                .fetch_transcript(note.id)
                .await?
                .map(|t| t.full_text.len())
                .unwrap_or(0),
        };
        Ok(self.costs.estimate(stage, None, input_len))
    }

    async fn execute_stage(&self, stage: Stage, note: &Note) -> Result<StageOutput> {
        let stage_timeout = self.config.stage_timeout(stage);
        match stage {
            Stage::Transcription => {
                let audio_ref = note.audio_ref.as_deref().ok_or_else(|| {
                    Error::Internal(format!("note {} has no stored audio", note.id))
                })?;
                let audio = self.audio.fetch_audio(audio_ref).await?;
                let mime = note.audio_mime.as_deref().unwrap_or("audio/wav");

                let transcript = timeout(
                    stage_timeout,
                    self.transcription
                        .transcribe(&audio, mime, note.language.as_deref()),
                )
                .await
                .map_err(|_| Error::TransientAdapter("transcription timed out".into()))??;
                Ok(StageOutput::Transcript(transcript))
            }
            Stage::Extraction => {
                let transcript = self
                    .notes
                    .fetch_transcript(note.id)
                    .await?
                    .ok_or_else(|| {
                        Error::Internal(format!("note {} has no transcript to extract", note.id))
                    })?;

                let outcome = timeout(
                    stage_timeout,
                    self.extraction
                        .extract(&transcript.full_text, note.language.as_deref()),
                )
                .await
                .map_err(|_| Error::TransientAdapter("extraction timed out".into()))??;
                Ok(StageOutput::Extraction(outcome))
            }
            Stage::Embedding => {
                // Embedding input is the extraction summary when present,
                // else the raw transcript. Fixed choice, applied to every
                // note.
                let extraction = self.notes.fetch_extraction(note.id).await?;
                let text = match extraction {
                    Some(extraction) => extraction.summary,
                    None => {
                        self.notes
                            .fetch_transcript(note.id)
                            .await?
                            .ok_or_else(|| {
                                Error::Internal(format!(
                                    "note {} has no text to embed",
                                    note.id
                                ))
                            })?
                            .full_text
                    }
                };

                let source_hash = input_checksum(text.as_bytes());
                let mut vectors = timeout(
                    stage_timeout,
                    self.embedding.embed_texts(&[text]),
                )
                .await
                .map_err(|_| Error::TransientAdapter("embedding timed out".into()))??;

                let vector = vectors.pop().ok_or_else(|| {
                    Error::TransientAdapter("embedding backend returned no vector".into())
                })?;
                Ok(StageOutput::Embedding {
                    vector,
                    source_hash,
                    model: self.embedding.model_name().to_string(),
                })
            }
        }
    }

    async fn complete_stage(
        &self,
        job: ProcessingJob,
        stage: Stage,
        output: StageOutput,
        handle: ReservationHandle,
    ) -> Result<AdvanceOutcome> {
        // Persist the stage output before the state advances, so EXTRACTING
        // always implies a stored transcript (and so on down the pipeline).
        let actual_cost = match output {
            StageOutput::Transcript(transcript) => {
                let cost = self
                    .costs
                    .transcription_actual(transcript.billable_minutes());
                self.notes.store_transcript(job.note_id, &transcript).await?;
                cost
            }
            StageOutput::Extraction(outcome) => {
                self.notes
                    .store_extraction(job.note_id, &outcome.extraction)
                    .await?;
                self.costs.extraction_actual(outcome.tokens_used)
            }
            StageOutput::Embedding {
                vector,
                source_hash,
                model,
            } => {
                // A failed index write must leave the job in EMBEDDING; it
                // surfaces as a retryable error through the failure path.
                if let Err(e) = self
                    .index
                    .replace_for_note(job.note_id, job.user_id, &source_hash, &vector, &model)
                    .await
                {
                    return self.handle_stage_failure(job, stage, e, handle).await;
                }
                self.costs.embedding_actual()
            }
        };

        let next_state = stage.next_state();
        let mut advanced = job.clone();
        advanced.state = next_state;
        advanced.next_attempt_at = None;
        advanced.claimed_by = None;
        advanced.claimed_at = None;
        if next_state == ProcessingState::Done {
            advanced.completed_at = Some(Utc::now());
        }

        match self.jobs.update(&advanced, job.version).await {
            Ok(updated) => {
                self.notes.set_state(updated.note_id, next_state).await?;
                self.ledger.commit(&handle, actual_cost).await?;
                info!(
                    job_id = %updated.id,
                    stage = %stage,
                    state = %next_state,
                    cost = actual_cost,
                    "Stage committed"
                );
                Ok(AdvanceOutcome::Progressed(next_state))
            }
            Err(Error::StaleVersion(_)) => {
                // A concurrent writer (cancel, another worker) won. Discard
                // this execution: funds return, the late result is dropped.
                self.ledger.release(&handle).await?;
                Ok(AdvanceOutcome::Discarded)
            }
            Err(e) => {
                self.ledger.release(&handle).await?;
                Err(e)
            }
        }
    }

    async fn handle_stage_failure(
        &self,
        job: ProcessingJob,
        stage: Stage,
        err: Error,
        handle: ReservationHandle,
    ) -> Result<AdvanceOutcome> {
        // Failed attempts net to zero balance change.
        self.ledger.release(&handle).await?;

        if !err.is_transient() {
            let code = err.failure_code();
            return self.fail_job(job, code, err.to_string()).await;
        }

        let mut retried = job.clone();
        retried.bump_attempts(stage);
        let attempt = retried.attempts_for(stage);

        if attempt >= retried.max_attempts {
            let message = format!(
                "stage {stage} failed {attempt} times, last error: {err}"
            );
            return self
                .fail_job(retried, FailureCode::RetriesExhausted, message)
                .await;
        }

        let delay_ms = self.config.backoff_delay_ms(attempt);
        let next_attempt_at = Utc::now() + ChronoDuration::milliseconds(delay_ms as i64);
        retried.next_attempt_at = Some(next_attempt_at);
        retried.failure_message = Some(err.to_string());
        retried.claimed_by = None;
        retried.claimed_at = None;

        match self.jobs.update(&retried, job.version).await {
            Ok(updated) => {
                debug!(
                    job_id = %updated.id,
                    stage = %stage,
                    attempt,
                    delay_ms,
                    "Retry scheduled"
                );
                Ok(AdvanceOutcome::RetryScheduled {
                    stage,
                    attempt,
                    next_attempt_at,
                })
            }
            Err(Error::StaleVersion(_)) => Ok(AdvanceOutcome::Discarded),
            Err(e) => Err(e),
        }
    }

    async fn fail_job(
        &self,
        job: ProcessingJob,
        code: FailureCode,
        message: String,
    ) -> Result<AdvanceOutcome> {
        let mut failed = job.clone();
        failed.state = ProcessingState::Failed;
        failed.failure_code = Some(code);
        failed.failure_message = Some(message);
        failed.next_attempt_at = None;
        failed.claimed_by = None;
        failed.claimed_at = None;
        failed.completed_at = Some(Utc::now());

        match self.jobs.update(&failed, job.version).await {
            Ok(updated) => {
                self.notes
                    .set_state(updated.note_id, ProcessingState::Failed)
                    .await?;
                // Crash-recovery safe: releasing already-released holds is
                // a no-op.
                self.ledger.release_open_for_job(updated.id).await?;
                warn!(job_id = %updated.id, code = %code, "Job failed");
                Ok(AdvanceOutcome::Failed(code))
            }
            Err(Error::StaleVersion(_)) => Ok(AdvanceOutcome::Discarded),
            Err(e) => Err(e),
        }
    }
}

/// Text-only notes enter the pipeline with the transcript already stored.
fn initial_state_for_text() -> ProcessingState {
    ProcessingState::Extracting
}
