//! End-to-end orchestrator tests against the in-memory stores and
//! scripted mock adapters.
//!
//! Covers the pipeline's contract properties: idempotent submission, no
//! double-charge on retry, forward-only progression, billing rejection
//! without stage execution, cancellation, and explicit re-entry after
//! failure.

use std::sync::Arc;

use uuid::Uuid;

use murmur_core::{
    input_checksum, AudioStore, CostModel, FailureCode, JobStore, Note, NoteInput, NoteStore,
    ProcessingJob, ProcessingState, ReservationStatus, SubmitNoteRequest, UsageLedger,
};
use murmur_inference::mock::{
    MockEmbeddingBackend, MockExtractionBackend, MockTranscriptionBackend,
};
use murmur_pipeline::{
    AdvanceOutcome, MemoryBackend, Orchestrator, OrchestratorConfig, OrchestratorDeps,
};

/// Stage prices used throughout: transcription 10/min, extraction
/// 2/1k-tokens, embedding 5 flat. The mocks produce 60s of audio and
/// 10k tokens, so a full run costs 10 + 20 + 5 = 35.
fn test_costs() -> CostModel {
    CostModel {
        transcription_per_minute: 10,
        extraction_per_1k_tokens: 2,
        embedding_flat: 5,
        default_audio_minutes: 3,
    }
}

struct Harness {
    backend: MemoryBackend,
    orchestrator: Arc<Orchestrator>,
    transcription: Arc<MockTranscriptionBackend>,
    extraction: Arc<MockExtractionBackend>,
    embedding: Arc<MockEmbeddingBackend>,
    user_id: Uuid,
}

fn harness_with(
    transcription: MockTranscriptionBackend,
    extraction: MockExtractionBackend,
    config: OrchestratorConfig,
) -> Harness {
    let backend = MemoryBackend::new();
    let transcription = Arc::new(transcription);
    let extraction = Arc::new(extraction);
    let embedding = Arc::new(MockEmbeddingBackend::new(8));

    let orchestrator = Arc::new(Orchestrator::new(
        OrchestratorDeps {
            notes: Arc::new(backend.clone()),
            jobs: Arc::new(backend.clone()),
            ledger: Arc::new(backend.clone()),
            index: Arc::new(backend.clone()),
            audio: Arc::new(backend.clone()),
            transcription: transcription.clone(),
            extraction: extraction.clone(),
            embedding: embedding.clone(),
        },
        test_costs(),
        config,
    ));

    let user_id = Uuid::new_v4();
    backend.set_balance(user_id, 100);

    Harness {
        backend,
        orchestrator,
        transcription,
        extraction,
        embedding,
        user_id,
    }
}

fn harness() -> Harness {
    harness_with(
        MockTranscriptionBackend::new("we discussed the quarterly launch", 60.0),
        MockExtractionBackend::new("Quarterly launch discussion", 10_000),
        OrchestratorConfig::default().with_backoff_base_ms(0),
    )
}

async fn submit_audio(h: &Harness, bytes: &[u8]) -> (Note, ProcessingJob) {
    let audio_ref = format!("audio/{}.wav", Uuid::new_v4());
    h.backend.store_audio(&audio_ref, bytes).await.unwrap();
    h.orchestrator
        .intake(SubmitNoteRequest {
            user_id: h.user_id,
            input: NoteInput::Audio {
                audio_ref,
                mime_type: "audio/wav".into(),
                checksum: input_checksum(bytes),
            },
            title: Some("voice note".into()),
            language: Some("en".into()),
            reprocess: false,
        })
        .await
        .unwrap()
}

/// Drive a job until it reaches a terminal state.
async fn run_to_terminal(h: &Harness, job_id: Uuid) -> ProcessingState {
    for _ in 0..32 {
        let outcome = h.orchestrator.advance(job_id).await.unwrap();
        if matches!(
            outcome,
            AdvanceOutcome::AlreadyTerminal | AdvanceOutcome::Failed(_)
        ) {
            break;
        }
        if let AdvanceOutcome::Progressed(state) = outcome {
            if state.is_terminal() {
                break;
            }
        }
    }
    h.backend.get(job_id).await.unwrap().state
}

// =============================================================================
// Scenario A: full pipeline, metered costs
// =============================================================================

#[tokio::test]
async fn test_full_pipeline_debits_actual_costs() {
    let h = harness();
    let (note, job) = submit_audio(&h, b"audio-bytes").await;

    assert_eq!(job.state, ProcessingState::Received);
    let final_state = run_to_terminal(&h, job.id).await;

    assert_eq!(final_state, ProcessingState::Done);
    assert_eq!(h.backend.balance(h.user_id).await.unwrap(), 65);
    assert_eq!(h.backend.committed_total_for_job(job.id), 35);
    assert_eq!(h.backend.open_reservation_total(h.user_id).await.unwrap(), 0);

    // Outputs persisted and indexed.
    let transcript = h.backend.fetch_transcript(note.id).await.unwrap().unwrap();
    assert_eq!(transcript.full_text, "we discussed the quarterly launch");
    let extraction = h.backend.fetch_extraction(note.id).await.unwrap().unwrap();
    assert!(h.backend.has_embedding(note.id));

    // The embedding was built from the extraction summary.
    let (source_hash, model) = h.backend.embedding_provenance(note.id).unwrap();
    assert_eq!(source_hash, input_checksum(extraction.summary.as_bytes()));
    assert_eq!(model, "mock-embedding");

    let status = h.orchestrator.status(note.id).await.unwrap();
    assert_eq!(status.state, ProcessingState::Done);
    assert!(status.error.is_none());
    assert!(!status.retrying);
}

// =============================================================================
// Idempotent submission
// =============================================================================

#[tokio::test]
async fn test_duplicate_submission_returns_same_job() {
    let h = harness();
    let audio_ref = format!("audio/{}.wav", Uuid::new_v4());
    h.backend.store_audio(&audio_ref, b"bytes").await.unwrap();

    let note = h
        .backend
        .insert(murmur_core::NewNote {
            user_id: h.user_id,
            title: None,
            audio_ref: Some(audio_ref.clone()),
            audio_mime: Some("audio/wav".into()),
            source_text: None,
            language: None,
            state: ProcessingState::Received,
        })
        .await
        .unwrap();

    let input = NoteInput::Audio {
        audio_ref,
        mime_type: "audio/wav".into(),
        checksum: input_checksum(b"bytes"),
    };

    let first = h.orchestrator.submit(note.id, &input, false).await.unwrap();
    let second = h.orchestrator.submit(note.id, &input, false).await.unwrap();
    assert_eq!(first.id, second.id);

    // Resubmission placed no ledger reservation.
    assert!(h.backend.reservations_for_job(first.id).is_empty());

    // Still the same job mid-pipeline.
    h.orchestrator.advance(first.id).await.unwrap();
    let third = h.orchestrator.submit(note.id, &input, false).await.unwrap();
    assert_eq!(first.id, third.id);
}

#[tokio::test]
async fn test_done_note_conflicts_without_reprocess() {
    let h = harness();
    let (note, job) = submit_audio(&h, b"payload").await;
    run_to_terminal(&h, job.id).await;

    let input = NoteInput::Audio {
        audio_ref: h.backend.fetch(note.id).await.unwrap().audio_ref.unwrap(),
        mime_type: "audio/wav".into(),
        checksum: input_checksum(b"payload"),
    };

    let err = h
        .orchestrator
        .submit(note.id, &input, false)
        .await
        .unwrap_err();
    assert!(matches!(err, murmur_core::Error::Conflict(_)));

    // Explicit re-processing resets the job into the pipeline.
    let reset = h.orchestrator.submit(note.id, &input, true).await.unwrap();
    assert_eq!(reset.id, job.id);
    assert_eq!(reset.state, ProcessingState::Received);
    assert!(reset.completed_at.is_none());
}

// =============================================================================
// Scenario B: transient failures retry, one debit only
// =============================================================================

#[tokio::test]
async fn test_retry_then_success_charges_once() {
    let h = harness_with(
        MockTranscriptionBackend::new("take two", 60.0).fail_transient_times(2),
        MockExtractionBackend::new("summary", 10_000),
        OrchestratorConfig::default().with_backoff_base_ms(0),
    );
    let (_, job) = submit_audio(&h, b"flaky").await;

    let first = h.orchestrator.advance(job.id).await.unwrap();
    assert!(matches!(
        first,
        AdvanceOutcome::RetryScheduled {
            attempt: 1,
            stage: murmur_core::Stage::Transcription,
            ..
        }
    ));

    let second = h.orchestrator.advance(job.id).await.unwrap();
    assert!(matches!(second, AdvanceOutcome::RetryScheduled { attempt: 2, .. }));

    let third = h.orchestrator.advance(job.id).await.unwrap();
    assert_eq!(third, AdvanceOutcome::Progressed(ProcessingState::Extracting));
    assert_eq!(h.transcription.call_count(), 3);

    let final_state = run_to_terminal(&h, job.id).await;
    assert_eq!(final_state, ProcessingState::Done);

    // Exactly one committed transcription debit; the failed attempts'
    // reservations were released and net to zero.
    let reservations = h.backend.reservations_for_job(job.id);
    let transcription: Vec<_> = reservations
        .iter()
        .filter(|r| r.stage == murmur_core::Stage::Transcription)
        .collect();
    assert_eq!(transcription.len(), 3);
    assert_eq!(
        transcription
            .iter()
            .filter(|r| r.status == ReservationStatus::Committed)
            .count(),
        1
    );
    assert_eq!(
        transcription
            .iter()
            .filter(|r| r.status == ReservationStatus::Released)
            .count(),
        2
    );
    assert_eq!(h.backend.balance(h.user_id).await.unwrap(), 65);
}

#[tokio::test]
async fn test_retries_exhausted_fails_job() {
    let h = harness_with(
        MockTranscriptionBackend::new("never", 60.0).fail_transient_times(5),
        MockExtractionBackend::new("summary", 1_000),
        OrchestratorConfig::default().with_backoff_base_ms(0),
    );
    let (note, job) = submit_audio(&h, b"doomed").await;

    let final_state = run_to_terminal(&h, job.id).await;
    assert_eq!(final_state, ProcessingState::Failed);

    let stored = h.backend.get(job.id).await.unwrap();
    assert_eq!(stored.failure_code, Some(FailureCode::RetriesExhausted));
    assert_eq!(stored.transcribe_attempts, 3);

    // No money moved.
    assert_eq!(h.backend.balance(h.user_id).await.unwrap(), 100);
    assert_eq!(h.backend.committed_total_for_job(job.id), 0);

    let status = h.orchestrator.status(note.id).await.unwrap();
    assert_eq!(status.error.unwrap().code, FailureCode::RetriesExhausted);
}

// =============================================================================
// Scenario C: permanent failure short-circuits
// =============================================================================

#[tokio::test]
async fn test_content_policy_fails_fast_keeps_earlier_debits() {
    let h = harness_with(
        MockTranscriptionBackend::new("sensitive transcript", 60.0),
        MockExtractionBackend::new("unused", 10_000)
            .fail_permanent(FailureCode::ContentPolicy, "model refused the content"),
        OrchestratorConfig::default().with_backoff_base_ms(0),
    );
    let (note, job) = submit_audio(&h, b"audio").await;

    // Transcription succeeds and commits.
    let first = h.orchestrator.advance(job.id).await.unwrap();
    assert_eq!(first, AdvanceOutcome::Progressed(ProcessingState::Extracting));

    // Extraction refuses: straight to FAILED, no retries.
    let second = h.orchestrator.advance(job.id).await.unwrap();
    assert_eq!(second, AdvanceOutcome::Failed(FailureCode::ContentPolicy));
    assert_eq!(h.extraction.call_count(), 1);

    // Transcription debit stays committed, extraction reservation was
    // released, embedding never ran.
    assert_eq!(h.backend.balance(h.user_id).await.unwrap(), 90);
    assert_eq!(h.backend.committed_total_for_job(job.id), 10);
    assert_eq!(h.embedding.call_count(), 0);
    assert!(!h.backend.has_embedding(note.id));

    let status = h.orchestrator.status(note.id).await.unwrap();
    assert_eq!(status.state, ProcessingState::Failed);
    assert_eq!(status.error.unwrap().code, FailureCode::ContentPolicy);
}

// =============================================================================
// Billing rejection
// =============================================================================

#[tokio::test]
async fn test_insufficient_balance_fails_without_running_stage() {
    let h = harness();
    h.backend.set_balance(h.user_id, 5);
    let (_, job) = submit_audio(&h, b"too poor").await;

    // Transcription estimate is default_audio_minutes(3) * 10 = 30 > 5.
    let outcome = h.orchestrator.advance(job.id).await.unwrap();
    assert_eq!(outcome, AdvanceOutcome::Failed(FailureCode::BillingRejected));

    // The stage adapter was never invoked.
    assert_eq!(h.transcription.call_count(), 0);

    let stored = h.backend.get(job.id).await.unwrap();
    assert_eq!(stored.failure_code, Some(FailureCode::BillingRejected));
    assert_eq!(h.backend.balance(h.user_id).await.unwrap(), 5);
}

// =============================================================================
// Forward-only progression
// =============================================================================

#[tokio::test]
async fn test_states_progress_forward_only() {
    let h = harness();
    let (note, job) = submit_audio(&h, b"ordered").await;

    let mut seen = vec![h.backend.get(job.id).await.unwrap().state];
    loop {
        match h.orchestrator.advance(job.id).await.unwrap() {
            AdvanceOutcome::Progressed(state) => {
                // A job only reaches EXTRACTING with a persisted transcript.
                if state == ProcessingState::Extracting {
                    assert!(h
                        .backend
                        .fetch_transcript(note.id)
                        .await
                        .unwrap()
                        .is_some());
                }
                seen.push(state);
                if state.is_terminal() {
                    break;
                }
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    assert_eq!(
        seen,
        vec![
            ProcessingState::Received,
            ProcessingState::Extracting,
            ProcessingState::Embedding,
            ProcessingState::Done,
        ]
    );
    for pair in seen.windows(2) {
        assert!(pair[0].ordinal() < pair[1].ordinal());
    }
}

// =============================================================================
// Negative balance impossible
// =============================================================================

#[tokio::test]
async fn test_concurrent_reservations_never_overdraw() {
    let h = harness();
    let user = Uuid::new_v4();
    h.backend.set_balance(user, 50);

    // Ten concurrent 20-credit holds against a 50 balance: at most two
    // can win.
    let mut handles = Vec::new();
    for _ in 0..10 {
        let ledger = h.backend.clone();
        handles.push(tokio::spawn(async move {
            ledger
                .reserve(user, Uuid::new_v4(), murmur_core::Stage::Transcription, 20)
                .await
        }));
    }

    let mut granted = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            granted += 1;
        }
    }
    assert_eq!(granted, 2);

    let open = h.backend.open_reservation_total(user).await.unwrap();
    let balance = h.backend.balance(user).await.unwrap();
    assert!(balance - open >= 0);
}

// =============================================================================
// Cancellation
// =============================================================================

#[tokio::test]
async fn test_cancel_releases_reservations() {
    let h = harness();
    let (note, job) = submit_audio(&h, b"cancel me").await;

    h.orchestrator.cancel(job.id).await.unwrap();

    let stored = h.backend.get(job.id).await.unwrap();
    assert_eq!(stored.state, ProcessingState::Failed);
    assert_eq!(stored.failure_code, Some(FailureCode::UserCancelled));
    assert_eq!(h.backend.open_reservation_total(h.user_id).await.unwrap(), 0);

    let status = h.orchestrator.status(note.id).await.unwrap();
    assert_eq!(status.error.unwrap().code, FailureCode::UserCancelled);

    // Cancelling a terminal job is a conflict.
    assert!(h.orchestrator.cancel(job.id).await.is_err());
}

#[tokio::test]
async fn test_cancel_discards_in_flight_result() {
    let h = harness_with(
        MockTranscriptionBackend::new("late result", 60.0).with_delay_ms(300),
        MockExtractionBackend::new("summary", 1_000),
        OrchestratorConfig::default().with_backoff_base_ms(0),
    );
    let (_, job) = submit_audio(&h, b"slow audio").await;

    let orchestrator = h.orchestrator.clone();
    let job_id = job.id;
    let advance = tokio::spawn(async move { orchestrator.advance(job_id).await });

    // Let the advance enter its adapter call, then cancel underneath it.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    h.orchestrator.cancel(job.id).await.unwrap();

    let outcome = advance.await.unwrap().unwrap();
    assert_eq!(outcome, AdvanceOutcome::Discarded);

    // The late result changed nothing: job stays cancelled, funds intact.
    let stored = h.backend.get(job.id).await.unwrap();
    assert_eq!(stored.state, ProcessingState::Failed);
    assert_eq!(stored.failure_code, Some(FailureCode::UserCancelled));
    assert_eq!(h.backend.balance(h.user_id).await.unwrap(), 100);
    assert_eq!(h.backend.committed_total_for_job(job.id), 0);
}

// =============================================================================
// Explicit retry after failure
// =============================================================================

#[tokio::test]
async fn test_retry_reenters_failed_stage_without_recharging_done_stages() {
    let h = harness_with(
        MockTranscriptionBackend::new("fine transcript", 60.0),
        MockExtractionBackend::new("summary", 10_000).fail_transient_times(5),
        OrchestratorConfig::default().with_backoff_base_ms(0),
    );
    let (_, job) = submit_audio(&h, b"partial").await;

    let final_state = run_to_terminal(&h, job.id).await;
    assert_eq!(final_state, ProcessingState::Failed);
    // Transcription committed before extraction gave up.
    assert_eq!(h.backend.balance(h.user_id).await.unwrap(), 90);

    // Re-enter at extraction with a fresh attempt budget; the two
    // remaining scripted failures fit inside it.
    let resumed = h.orchestrator.retry(job.id).await.unwrap();
    assert_eq!(resumed.state, ProcessingState::Extracting);
    assert_eq!(resumed.extract_attempts, 0);

    let final_state = run_to_terminal(&h, job.id).await;
    assert_eq!(final_state, ProcessingState::Done);

    // Transcription was charged exactly once across the whole history.
    let transcription_commits = h
        .backend
        .reservations_for_job(job.id)
        .iter()
        .filter(|r| {
            r.stage == murmur_core::Stage::Transcription
                && r.status == ReservationStatus::Committed
        })
        .count();
    assert_eq!(transcription_commits, 1);
    assert_eq!(h.transcription.call_count(), 1);
    assert_eq!(h.backend.balance(h.user_id).await.unwrap(), 65);
}

#[tokio::test]
async fn test_retry_requires_failed_state() {
    let h = harness();
    let (_, job) = submit_audio(&h, b"running").await;
    assert!(h.orchestrator.retry(job.id).await.is_err());
}

// =============================================================================
// Text-only notes
// =============================================================================

#[tokio::test]
async fn test_text_note_skips_transcription_and_its_charge() {
    let h = harness();
    let (note, job) = h
        .orchestrator
        .intake(SubmitNoteRequest {
            user_id: h.user_id,
            input: NoteInput::Text {
                text: "typed instead of spoken".into(),
            },
            title: None,
            language: None,
            reprocess: false,
        })
        .await
        .unwrap();

    assert_eq!(job.state, ProcessingState::Extracting);
    let transcript = h.backend.fetch_transcript(note.id).await.unwrap().unwrap();
    assert_eq!(transcript.full_text, "typed instead of spoken");

    let final_state = run_to_terminal(&h, job.id).await;
    assert_eq!(final_state, ProcessingState::Done);

    // Only extraction (20) and embedding (5) were metered.
    assert_eq!(h.backend.balance(h.user_id).await.unwrap(), 75);
    assert_eq!(h.transcription.call_count(), 0);
}

// =============================================================================
// Retry visibility
// =============================================================================

#[tokio::test]
async fn test_status_reports_retrying_substate() {
    let h = harness_with(
        MockTranscriptionBackend::new("eventually", 60.0).fail_transient_times(1),
        MockExtractionBackend::new("summary", 1_000),
        // Long backoff keeps the retry pending while we observe it.
        OrchestratorConfig::default(),
    );
    let (note, job) = submit_audio(&h, b"watch me retry").await;

    let outcome = h.orchestrator.advance(job.id).await.unwrap();
    assert!(matches!(outcome, AdvanceOutcome::RetryScheduled { .. }));

    let status = h.orchestrator.status(note.id).await.unwrap();
    assert_eq!(status.state, ProcessingState::Transcribing);
    assert!(status.retrying);
    assert!(status.error.is_none());

    // The scheduled attempt is not due yet.
    let outcome = h.orchestrator.advance(job.id).await.unwrap();
    assert!(matches!(outcome, AdvanceOutcome::NotDue { .. }));
}
