//! Streaming transcription session tests: ordered events, reconciliation
//! into the state machine, and batch fallback after a dropped connection.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use murmur_core::{
    CostModel, JobStore, NoteStore, ProcessingState, StreamEvent, UsageLedger,
};
use murmur_inference::mock::{
    MockEmbeddingBackend, MockExtractionBackend, MockTranscriptionBackend,
};
use murmur_inference::WindowedStreamingBackend;
use murmur_pipeline::{
    AdvanceOutcome, MemoryBackend, Orchestrator, OrchestratorConfig, OrchestratorDeps,
    StreamOpenRequest, StreamingSession, StreamingSessionConfig,
};

struct Harness {
    backend: MemoryBackend,
    orchestrator: Arc<Orchestrator>,
    transcription: Arc<MockTranscriptionBackend>,
    streaming: Arc<WindowedStreamingBackend>,
    user_id: Uuid,
}

fn harness() -> Harness {
    let backend = MemoryBackend::new();
    let transcription = Arc::new(MockTranscriptionBackend::new("streamed words", 60.0));
    let streaming = Arc::new(
        WindowedStreamingBackend::new(transcription.clone()).with_window_bytes(8),
    );

    let orchestrator = Arc::new(Orchestrator::new(
        OrchestratorDeps {
            notes: Arc::new(backend.clone()),
            jobs: Arc::new(backend.clone()),
            ledger: Arc::new(backend.clone()),
            index: Arc::new(backend.clone()),
            audio: Arc::new(backend.clone()),
            transcription: transcription.clone(),
            extraction: Arc::new(MockExtractionBackend::new("summary", 1_000)),
            embedding: Arc::new(MockEmbeddingBackend::new(8)),
        },
        CostModel {
            transcription_per_minute: 10,
            extraction_per_1k_tokens: 2,
            embedding_flat: 5,
            default_audio_minutes: 3,
        },
        OrchestratorConfig::default().with_backoff_base_ms(0),
    ));

    let user_id = Uuid::new_v4();
    backend.set_balance(user_id, 100);

    Harness {
        backend,
        orchestrator,
        transcription,
        streaming,
        user_id,
    }
}

async fn open_session(
    h: &Harness,
    config: StreamingSessionConfig,
) -> (StreamingSession, tokio::sync::mpsc::Receiver<StreamEvent>) {
    StreamingSession::open(
        h.orchestrator.clone(),
        Arc::new(h.backend.clone()),
        h.streaming.clone(),
        StreamOpenRequest {
            user_id: h.user_id,
            title: Some("live note".into()),
            language: Some("en".into()),
        },
        config,
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn test_session_emits_ordered_partials_then_final() {
    let h = harness();
    let (mut session, mut events) = open_session(&h, StreamingSessionConfig::default()).await;

    // Window is 8 bytes: every second 4-byte chunk produces a partial.
    for _ in 0..4 {
        session.push_chunk(&[0u8; 4]).await.unwrap();
    }
    let outcome = session.finish().await.unwrap();
    assert_eq!(outcome, AdvanceOutcome::Progressed(ProcessingState::Extracting));

    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }
    assert_eq!(received.len(), 3);

    // Partials first, final last — event order follows audio order.
    for event in &received[..2] {
        assert!(matches!(
            event,
            StreamEvent::Transcript { is_final: false, .. }
        ));
    }
    assert!(matches!(
        received[2],
        StreamEvent::Transcript { is_final: true, .. }
    ));
}

#[tokio::test]
async fn test_finish_reconciles_and_meters_by_duration() {
    let h = harness();
    let (mut session, _events) = open_session(&h, StreamingSessionConfig::default()).await;
    let note_id = session.note_id();
    let job_id = session.job_id();

    session.push_chunk(&[1u8; 16]).await.unwrap();
    session.finish().await.unwrap();

    // Transcript persisted, state short-circuited into EXTRACTING.
    let transcript = h.backend.fetch_transcript(note_id).await.unwrap().unwrap();
    assert_eq!(transcript.full_text, "streamed words");
    let job = h.backend.get(job_id).await.unwrap();
    assert_eq!(job.state, ProcessingState::Extracting);

    // One minute of audio was committed at 10 credits.
    assert_eq!(h.backend.balance(h.user_id).await.unwrap(), 90);
    assert_eq!(h.backend.committed_total_for_job(job_id), 10);
}

#[tokio::test]
async fn test_dropped_session_falls_back_to_batch_transcription() {
    let h = harness();
    let (mut session, _events) = open_session(&h, StreamingSessionConfig::default()).await;
    let job_id = session.job_id();

    // Five chunks arrive, then the connection dies before any final event.
    for _ in 0..5 {
        session.push_chunk(&[2u8; 4]).await.unwrap();
    }
    session.abort().await.unwrap();

    // The job never left RECEIVED.
    let job = h.backend.get(job_id).await.unwrap();
    assert_eq!(job.state, ProcessingState::Received);
    assert_eq!(h.backend.committed_total_for_job(job_id), 0);

    let calls_before = h.transcription.call_count();
    let outcome = h.orchestrator.advance(job_id).await.unwrap();
    assert_eq!(outcome, AdvanceOutcome::Progressed(ProcessingState::Extracting));

    // Batch transcription ran over the durably stored audio (5 * 4 bytes).
    assert_eq!(h.transcription.call_count(), calls_before + 1);
    assert_eq!(h.transcription.last_audio_len(), 20);
}

#[tokio::test]
async fn test_idle_session_rejects_late_chunks() {
    let h = harness();
    let config = StreamingSessionConfig::default().with_idle_timeout(Duration::from_millis(10));
    let (mut session, _events) = open_session(&h, config).await;

    session.push_chunk(&[3u8; 4]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = session.push_chunk(&[3u8; 4]).await.unwrap_err();
    assert!(matches!(err, murmur_core::Error::Conflict(_)));
}

#[tokio::test]
async fn test_closed_session_rejects_further_use() {
    let h = harness();
    let (session, _events) = open_session(&h, StreamingSessionConfig::default()).await;
    let note_id = session.note_id();
    session.abort().await.unwrap();

    // The note still exists and is queryable through the status boundary.
    let status = h.orchestrator.status(note_id).await.unwrap();
    assert_eq!(status.state, ProcessingState::Received);
}
