//! In-memory store implementations.
//!
//! One [`MemoryBackend`] implements every store trait against a single
//! shared map, mirroring the Postgres semantics (idempotent job creation,
//! optimistic versioning, claim staleness, ledger atomicity). Integration
//! tests and local development run the full pipeline against it without a
//! database.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use uuid::Uuid;

use murmur_core::{
    AudioStore, EmbeddingIndex, Error, JobStore, LedgerReservation, NewNote, NewProcessingJob,
    Note, NoteExtraction, NoteStore, ProcessingJob, ProcessingState, ReservationHandle,
    ReservationStatus, Result, SearchHit, Stage, TextSearch, Transcript, UsageLedger, Vector,
};

struct EmbeddingRow {
    user_id: Uuid,
    source_hash: String,
    vector: Vec<f32>,
    model: String,
}

#[derive(Default)]
struct Inner {
    notes: HashMap<Uuid, Note>,
    transcripts: HashMap<Uuid, Transcript>,
    extractions: HashMap<Uuid, NoteExtraction>,
    jobs: HashMap<Uuid, ProcessingJob>,
    job_keys: HashMap<String, Uuid>,
    accounts: HashMap<Uuid, i64>,
    reservations: HashMap<Uuid, LedgerReservation>,
    embeddings: HashMap<Uuid, EmbeddingRow>,
    audio: HashMap<String, Vec<u8>>,
}

/// Shared in-memory backend implementing all store traits.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a user's balance directly (test/billing hook).
    pub fn set_balance(&self, user_id: Uuid, balance: i64) {
        self.inner.lock().unwrap().accounts.insert(user_id, balance);
    }

    /// All reservations recorded for a job, in creation order.
    pub fn reservations_for_job(&self, job_id: Uuid) -> Vec<LedgerReservation> {
        let inner = self.inner.lock().unwrap();
        let mut reservations: Vec<LedgerReservation> = inner
            .reservations
            .values()
            .filter(|r| r.job_id == job_id)
            .cloned()
            .collect();
        reservations.sort_by_key(|r| r.created_at);
        reservations
    }

    /// Sum of committed debits for a job.
    pub fn committed_total_for_job(&self, job_id: Uuid) -> i64 {
        self.reservations_for_job(job_id)
            .iter()
            .filter(|r| r.status == ReservationStatus::Committed)
            .map(|r| r.actual_cost.unwrap_or(0))
            .sum()
    }

    /// Whether the index currently holds an embedding for the note.
    pub fn has_embedding(&self, note_id: Uuid) -> bool {
        self.inner.lock().unwrap().embeddings.contains_key(&note_id)
    }

    /// Source-text hash and model of the note's live embedding, if any.
    pub fn embedding_provenance(&self, note_id: Uuid) -> Option<(String, String)> {
        self.inner
            .lock()
            .unwrap()
            .embeddings
            .get(&note_id)
            .map(|row| (row.source_hash.clone(), row.model.clone()))
    }

    fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
        if a.len() != b.len() || a.is_empty() {
            return 0.0;
        }
        let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm_a == 0.0 || norm_b == 0.0 {
            0.0
        } else {
            dot / (norm_a * norm_b)
        }
    }
}

#[async_trait]
impl NoteStore for MemoryBackend {
    async fn insert(&self, note: NewNote) -> Result<Note> {
        let now = Utc::now();
        let stored = Note {
            id: Uuid::new_v4(),
            user_id: note.user_id,
            title: note.title,
            audio_ref: note.audio_ref,
            audio_mime: note.audio_mime,
            source_text: note.source_text,
            language: note.language,
            state: note.state,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        self.inner
            .lock()
            .unwrap()
            .notes
            .insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn fetch(&self, id: Uuid) -> Result<Note> {
        self.inner
            .lock()
            .unwrap()
            .notes
            .get(&id)
            .cloned()
            .ok_or(Error::NoteNotFound(id))
    }

    async fn set_state(&self, id: Uuid, state: ProcessingState) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let note = inner.notes.get_mut(&id).ok_or(Error::NoteNotFound(id))?;
        note.state = state;
        note.updated_at = Utc::now();
        Ok(())
    }

    async fn store_transcript(&self, id: Uuid, transcript: &Transcript) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.notes.contains_key(&id) {
            return Err(Error::NoteNotFound(id));
        }
        inner.transcripts.insert(id, transcript.clone());
        Ok(())
    }

    async fn fetch_transcript(&self, id: Uuid) -> Result<Option<Transcript>> {
        Ok(self.inner.lock().unwrap().transcripts.get(&id).cloned())
    }

    async fn store_extraction(&self, id: Uuid, extraction: &NoteExtraction) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.notes.contains_key(&id) {
            return Err(Error::NoteNotFound(id));
        }
        inner.extractions.insert(id, extraction.clone());
        Ok(())
    }

    async fn fetch_extraction(&self, id: Uuid) -> Result<Option<NoteExtraction>> {
        Ok(self.inner.lock().unwrap().extractions.get(&id).cloned())
    }

    async fn soft_delete(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let note = inner.notes.get_mut(&id).ok_or(Error::NoteNotFound(id))?;
        note.deleted_at = Some(Utc::now());
        note.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryBackend {
    async fn create_or_get(&self, job: NewProcessingJob) -> Result<(ProcessingJob, bool)> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing_id) = inner.job_keys.get(&job.idempotency_key) {
            let existing = inner.jobs[existing_id].clone();
            return Ok((existing, false));
        }

        let now = Utc::now();
        let stored = ProcessingJob {
            id: Uuid::new_v4(),
            note_id: job.note_id,
            user_id: job.user_id,
            idempotency_key: job.idempotency_key.clone(),
            state: job.initial_state,
            transcribe_attempts: 0,
            extract_attempts: 0,
            embed_attempts: 0,
            max_attempts: job.max_attempts,
            version: 1,
            failure_code: None,
            failure_message: None,
            next_attempt_at: None,
            claimed_by: None,
            claimed_at: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        inner.job_keys.insert(job.idempotency_key, stored.id);
        inner.jobs.insert(stored.id, stored.clone());
        Ok((stored, true))
    }

    async fn get(&self, id: Uuid) -> Result<ProcessingJob> {
        self.inner
            .lock()
            .unwrap()
            .jobs
            .get(&id)
            .cloned()
            .ok_or(Error::JobNotFound(id))
    }

    async fn get_by_key(&self, key: &str) -> Result<Option<ProcessingJob>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .job_keys
            .get(key)
            .and_then(|id| inner.jobs.get(id))
            .cloned())
    }

    async fn get_for_note(&self, note_id: Uuid) -> Result<Vec<ProcessingJob>> {
        let inner = self.inner.lock().unwrap();
        let mut jobs: Vec<ProcessingJob> = inner
            .jobs
            .values()
            .filter(|j| j.note_id == note_id)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    async fn update(&self, job: &ProcessingJob, expected_version: i64) -> Result<ProcessingJob> {
        let mut inner = self.inner.lock().unwrap();
        let stored = inner
            .jobs
            .get_mut(&job.id)
            .ok_or(Error::JobNotFound(job.id))?;
        if stored.version != expected_version {
            return Err(Error::StaleVersion(job.id));
        }
        let mut updated = job.clone();
        updated.version = expected_version + 1;
        updated.updated_at = Utc::now();
        updated.created_at = stored.created_at;
        *stored = updated.clone();
        Ok(updated)
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        stale_after_secs: i64,
    ) -> Result<Option<ProcessingJob>> {
        let now = Utc::now();
        let stale_cutoff = now - Duration::seconds(stale_after_secs);
        let mut inner = self.inner.lock().unwrap();

        let mut candidate: Option<Uuid> = None;
        let mut earliest = None;
        for job in inner.jobs.values() {
            if job.state.is_terminal() {
                continue;
            }
            if job.next_attempt_at.map(|at| at > now).unwrap_or(false) {
                continue;
            }
            if job.claimed_at.map(|at| at >= stale_cutoff).unwrap_or(false) {
                continue;
            }
            if earliest.map(|e| job.created_at < e).unwrap_or(true) {
                earliest = Some(job.created_at);
                candidate = Some(job.id);
            }
        }

        let Some(id) = candidate else {
            return Ok(None);
        };
        let job = inner.jobs.get_mut(&id).expect("candidate exists");
        job.claimed_by = Some(worker_id.to_string());
        job.claimed_at = Some(now);
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn release_claim(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(job) = inner.jobs.get_mut(&id) {
            job.claimed_by = None;
            job.claimed_at = None;
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn runnable_count(&self) -> Result<i64> {
        let now = Utc::now();
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .jobs
            .values()
            .filter(|j| {
                !j.state.is_terminal() && !j.next_attempt_at.map(|at| at > now).unwrap_or(false)
            })
            .count() as i64)
    }
}

#[async_trait]
impl UsageLedger for MemoryBackend {
    async fn reserve(
        &self,
        user_id: Uuid,
        job_id: Uuid,
        stage: Stage,
        estimated_cost: i64,
    ) -> Result<ReservationHandle> {
        if estimated_cost < 0 {
            return Err(Error::InvalidInput("estimated cost must be >= 0".into()));
        }
        let mut inner = self.inner.lock().unwrap();

        let open_for_pair = inner.reservations.values().any(|r| {
            r.job_id == job_id && r.stage == stage && r.status == ReservationStatus::Reserved
        });
        if open_for_pair {
            return Err(Error::Conflict(format!(
                "job {job_id} already holds an open {stage} reservation"
            )));
        }

        let balance = inner.accounts.get(&user_id).copied().unwrap_or(0);
        let open: i64 = inner
            .reservations
            .values()
            .filter(|r| r.user_id == user_id && r.status == ReservationStatus::Reserved)
            .map(|r| r.estimated_cost)
            .sum();
        let available = balance - open;
        if available < estimated_cost {
            return Err(Error::InsufficientBalance {
                required: estimated_cost,
                available,
            });
        }

        let id = Uuid::new_v4();
        inner.reservations.insert(
            id,
            LedgerReservation {
                id,
                user_id,
                job_id,
                stage,
                estimated_cost,
                actual_cost: None,
                status: ReservationStatus::Reserved,
                created_at: Utc::now(),
                resolved_at: None,
            },
        );
        Ok(ReservationHandle { id, job_id, stage })
    }

    async fn commit(&self, handle: &ReservationHandle, actual_cost: i64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let reservation = inner
            .reservations
            .get_mut(&handle.id)
            .ok_or_else(|| Error::NotFound(format!("reservation {}", handle.id)))?;

        match reservation.status {
            ReservationStatus::Committed => return Ok(()),
            ReservationStatus::Released => {
                return Err(Error::Conflict(format!(
                    "reservation {} was already released",
                    handle.id
                )));
            }
            ReservationStatus::Reserved => {}
        }

        reservation.status = ReservationStatus::Committed;
        reservation.actual_cost = Some(actual_cost);
        reservation.resolved_at = Some(Utc::now());
        let user_id = reservation.user_id;

        *inner.accounts.entry(user_id).or_insert(0) -= actual_cost;
        Ok(())
    }

    async fn release(&self, handle: &ReservationHandle) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let Some(reservation) = inner.reservations.get_mut(&handle.id) else {
            return Ok(());
        };
        match reservation.status {
            ReservationStatus::Released => Ok(()),
            ReservationStatus::Committed => Err(Error::Conflict(format!(
                "reservation {} was already committed",
                handle.id
            ))),
            ReservationStatus::Reserved => {
                reservation.status = ReservationStatus::Released;
                reservation.resolved_at = Some(Utc::now());
                Ok(())
            }
        }
    }

    async fn release_open_for_job(&self, job_id: Uuid) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let mut released = 0;
        for reservation in inner.reservations.values_mut() {
            if reservation.job_id == job_id && reservation.status == ReservationStatus::Reserved {
                reservation.status = ReservationStatus::Released;
                reservation.resolved_at = Some(now);
                released += 1;
            }
        }
        Ok(released)
    }

    async fn balance(&self, user_id: Uuid) -> Result<i64> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .accounts
            .get(&user_id)
            .copied()
            .unwrap_or(0))
    }

    async fn open_reservation_total(&self, user_id: Uuid) -> Result<i64> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .reservations
            .values()
            .filter(|r| r.user_id == user_id && r.status == ReservationStatus::Reserved)
            .map(|r| r.estimated_cost)
            .sum())
    }
}

#[async_trait]
impl EmbeddingIndex for MemoryBackend {
    async fn replace_for_note(
        &self,
        note_id: Uuid,
        user_id: Uuid,
        source_hash: &str,
        vector: &Vector,
        model: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.embeddings.insert(
            note_id,
            EmbeddingRow {
                user_id,
                source_hash: source_hash.to_string(),
                vector: vector.as_slice().to_vec(),
                model: model.to_string(),
            },
        );
        Ok(())
    }

    async fn delete_for_note(&self, note_id: Uuid) -> Result<()> {
        self.inner.lock().unwrap().embeddings.remove(&note_id);
        Ok(())
    }

    async fn find_similar(
        &self,
        user_id: Uuid,
        query: &Vector,
        limit: i64,
    ) -> Result<Vec<SearchHit>> {
        let inner = self.inner.lock().unwrap();
        let query = query.as_slice();

        let mut hits: Vec<SearchHit> = inner
            .embeddings
            .iter()
            .filter(|(_, row)| row.user_id == user_id)
            .filter_map(|(note_id, row)| {
                let note = inner.notes.get(note_id)?;
                if note.state != ProcessingState::Done || note.deleted_at.is_some() {
                    return None;
                }
                let snippet = inner
                    .transcripts
                    .get(note_id)
                    .map(|t| t.full_text.chars().take(200).collect::<String>());
                Some(SearchHit {
                    note_id: *note_id,
                    score: Self::cosine_similarity(query, &row.vector),
                    snippet,
                    title: note.title.clone(),
                    updated_at: note.updated_at,
                })
            })
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit as usize);
        Ok(hits)
    }
}

#[async_trait]
impl TextSearch for MemoryBackend {
    async fn search_text(&self, user_id: Uuid, query: &str, limit: i64) -> Result<Vec<SearchHit>> {
        let terms: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .map(String::from)
            .collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let inner = self.inner.lock().unwrap();
        let mut hits: Vec<SearchHit> = inner
            .notes
            .values()
            .filter(|n| {
                n.user_id == user_id
                    && n.state == ProcessingState::Done
                    && n.deleted_at.is_none()
            })
            .filter_map(|note| {
                let mut haystack = inner
                    .transcripts
                    .get(&note.id)
                    .map(|t| t.full_text.to_lowercase())
                    .unwrap_or_default();
                if let Some(extraction) = inner.extractions.get(&note.id) {
                    haystack.push(' ');
                    haystack.push_str(&extraction.summary.to_lowercase());
                }
                let matched = terms.iter().filter(|t| haystack.contains(t.as_str())).count();
                if matched == 0 {
                    return None;
                }
                let snippet = inner
                    .transcripts
                    .get(&note.id)
                    .map(|t| t.full_text.chars().take(200).collect::<String>());
                Some(SearchHit {
                    note_id: note.id,
                    score: matched as f32 / terms.len() as f32,
                    snippet,
                    title: note.title.clone(),
                    updated_at: note.updated_at,
                })
            })
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit as usize);
        Ok(hits)
    }
}

#[async_trait]
impl AudioStore for MemoryBackend {
    async fn fetch_audio(&self, audio_ref: &str) -> Result<Vec<u8>> {
        self.inner
            .lock()
            .unwrap()
            .audio
            .get(audio_ref)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("audio {audio_ref}")))
    }

    async fn store_audio(&self, audio_ref: &str, data: &[u8]) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .audio
            .insert(audio_ref.to_string(), data.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_job_versioning() {
        let backend = MemoryBackend::new();
        let note = backend
            .insert(NewNote {
                user_id: Uuid::new_v4(),
                title: None,
                audio_ref: None,
                audio_mime: None,
                source_text: Some("text".into()),
                language: None,
                state: ProcessingState::Extracting,
            })
            .await
            .unwrap();

        let (job, created) = backend
            .create_or_get(NewProcessingJob {
                note_id: note.id,
                user_id: note.user_id,
                idempotency_key: "k".into(),
                initial_state: ProcessingState::Extracting,
                max_attempts: 3,
            })
            .await
            .unwrap();
        assert!(created);
        assert_eq!(job.version, 1);

        let mut updated = job.clone();
        updated.state = ProcessingState::Embedding;
        let updated = backend.update(&updated, 1).await.unwrap();
        assert_eq!(updated.version, 2);

        let stale = backend.update(&job, 1).await.unwrap_err();
        assert!(matches!(stale, Error::StaleVersion(_)));
    }

    #[tokio::test]
    async fn test_claim_respects_staleness() {
        let backend = MemoryBackend::new();
        let note = backend
            .insert(NewNote {
                user_id: Uuid::new_v4(),
                title: None,
                audio_ref: Some("a".into()),
                audio_mime: Some("audio/wav".into()),
                source_text: None,
                language: None,
                state: ProcessingState::Received,
            })
            .await
            .unwrap();
        backend
            .create_or_get(NewProcessingJob {
                note_id: note.id,
                user_id: note.user_id,
                idempotency_key: "k".into(),
                initial_state: ProcessingState::Received,
                max_attempts: 3,
            })
            .await
            .unwrap();

        let first = backend.claim_next("w1", 300).await.unwrap();
        assert!(first.is_some());

        // Fresh claim blocks a second worker.
        let second = backend.claim_next("w2", 300).await.unwrap();
        assert!(second.is_none());

        // A zero staleness threshold treats any claim as abandoned.
        let reclaimed = backend.claim_next("w2", 0).await.unwrap();
        assert!(reclaimed.is_some());
        assert_eq!(reclaimed.unwrap().claimed_by.as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn test_ledger_available_balance() {
        let backend = MemoryBackend::new();
        let user = Uuid::new_v4();
        let job = Uuid::new_v4();
        backend.set_balance(user, 100);

        let h1 = backend
            .reserve(user, job, Stage::Transcription, 60)
            .await
            .unwrap();
        assert_eq!(backend.open_reservation_total(user).await.unwrap(), 60);

        // Only 40 available now.
        let err = backend
            .reserve(user, job, Stage::Extraction, 50)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientBalance { .. }));

        backend.commit(&h1, 10).await.unwrap();
        assert_eq!(backend.balance(user).await.unwrap(), 90);
        assert_eq!(backend.open_reservation_total(user).await.unwrap(), 0);
    }
}
