//! Processing-job repository implementation.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use murmur_core::{
    Error, FailureCode, JobStore, NewProcessingJob, ProcessingJob, ProcessingState, Result,
};

const JOB_COLUMNS: &str = "id, note_id, user_id, idempotency_key, state, transcribe_attempts, \
     extract_attempts, embed_attempts, max_attempts, version, failure_code, failure_message, \
     next_attempt_at, claimed_by, claimed_at, created_at, updated_at, completed_at";

/// PostgreSQL implementation of JobStore.
///
/// Claiming uses `FOR UPDATE SKIP LOCKED` so concurrent workers never pull
/// the same job; `update` enforces the optimistic version check that
/// serializes racing `advance` calls.
#[derive(Clone)]
pub struct PgJobStore {
    pool: Pool<Postgres>,
}

impl PgJobStore {
    /// Create a new PgJobStore with the given connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_job_row(row: sqlx::postgres::PgRow) -> Result<ProcessingJob> {
        let state: String = row.get("state");
        let failure_code: Option<String> = row.get("failure_code");
        Ok(ProcessingJob {
            id: row.get("id"),
            note_id: row.get("note_id"),
            user_id: row.get("user_id"),
            idempotency_key: row.get("idempotency_key"),
            state: ProcessingState::parse(&state)?,
            transcribe_attempts: row.get("transcribe_attempts"),
            extract_attempts: row.get("extract_attempts"),
            embed_attempts: row.get("embed_attempts"),
            max_attempts: row.get("max_attempts"),
            version: row.get("version"),
            failure_code: failure_code.as_deref().map(FailureCode::parse).transpose()?,
            failure_message: row.get("failure_message"),
            next_attempt_at: row.get("next_attempt_at"),
            claimed_by: row.get("claimed_by"),
            claimed_at: row.get("claimed_at"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            completed_at: row.get("completed_at"),
        })
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create_or_get(&self, job: NewProcessingJob) -> Result<(ProcessingJob, bool)> {
        let id = Uuid::new_v4();
        let now = Utc::now();

        // Atomic create-or-reuse: the unique idempotency key turns
        // concurrent duplicate submissions into a single job row.
        let query = format!(
            "INSERT INTO processing_job
                 (id, note_id, user_id, idempotency_key, state, max_attempts,
                  created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
             ON CONFLICT (idempotency_key) DO NOTHING
             RETURNING {JOB_COLUMNS}"
        );
        let inserted = sqlx::query(&query)
            .bind(id)
            .bind(job.note_id)
            .bind(job.user_id)
            .bind(&job.idempotency_key)
            .bind(job.initial_state.as_str())
            .bind(job.max_attempts)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        if let Some(row) = inserted {
            return Ok((Self::parse_job_row(row)?, true));
        }

        let existing = self
            .get_by_key(&job.idempotency_key)
            .await?
            .ok_or_else(|| Error::Internal("job vanished after conflicting insert".into()))?;
        Ok((existing, false))
    }

    async fn get(&self, id: Uuid) -> Result<ProcessingJob> {
        let query = format!("SELECT {JOB_COLUMNS} FROM processing_job WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?
            .ok_or(Error::JobNotFound(id))?;
        Self::parse_job_row(row)
    }

    async fn get_by_key(&self, key: &str) -> Result<Option<ProcessingJob>> {
        let query = format!("SELECT {JOB_COLUMNS} FROM processing_job WHERE idempotency_key = $1");
        let row = sqlx::query(&query)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        row.map(Self::parse_job_row).transpose()
    }

    async fn get_for_note(&self, note_id: Uuid) -> Result<Vec<ProcessingJob>> {
        let query = format!(
            "SELECT {JOB_COLUMNS} FROM processing_job
             WHERE note_id = $1 ORDER BY created_at DESC"
        );
        let rows = sqlx::query(&query)
            .bind(note_id)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        rows.into_iter().map(Self::parse_job_row).collect()
    }

    async fn update(&self, job: &ProcessingJob, expected_version: i64) -> Result<ProcessingJob> {
        let now = Utc::now();
        let query = format!(
            "UPDATE processing_job
             SET state = $1,
                 transcribe_attempts = $2,
                 extract_attempts = $3,
                 embed_attempts = $4,
                 failure_code = $5,
                 failure_message = $6,
                 next_attempt_at = $7,
                 claimed_by = $8,
                 claimed_at = $9,
                 completed_at = $10,
                 version = version + 1,
                 updated_at = $11
             WHERE id = $12 AND version = $13
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(job.state.as_str())
            .bind(job.transcribe_attempts)
            .bind(job.extract_attempts)
            .bind(job.embed_attempts)
            .bind(job.failure_code.map(|c| c.as_str()))
            .bind(&job.failure_message)
            .bind(job.next_attempt_at)
            .bind(&job.claimed_by)
            .bind(job.claimed_at)
            .bind(job.completed_at)
            .bind(now)
            .bind(job.id)
            .bind(expected_version)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        match row {
            Some(row) => Self::parse_job_row(row),
            None => Err(Error::StaleVersion(job.id)),
        }
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        stale_after_secs: i64,
    ) -> Result<Option<ProcessingJob>> {
        let now = Utc::now();
        let stale_cutoff = now - Duration::seconds(stale_after_secs);

        // FOR UPDATE SKIP LOCKED keeps concurrent workers from pulling the
        // same row. A claim older than the staleness cutoff belongs to a
        // crashed worker and is eligible for re-claim.
        let query = format!(
            "UPDATE processing_job
             SET claimed_by = $1, claimed_at = $2, updated_at = $2
             WHERE id = (
                 SELECT id FROM processing_job
                 WHERE state IN ('received', 'transcribing', 'extracting', 'embedding')
                   AND (next_attempt_at IS NULL OR next_attempt_at <= $2)
                   AND (claimed_at IS NULL OR claimed_at < $3)
                 ORDER BY created_at ASC
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(worker_id)
            .bind(now)
            .bind(stale_cutoff)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        row.map(Self::parse_job_row).transpose()
    }

    async fn release_claim(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE processing_job
             SET claimed_by = NULL, claimed_at = NULL, updated_at = $1
             WHERE id = $2",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn runnable_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM processing_job
             WHERE state IN ('received', 'transcribing', 'extracting', 'embedding')
               AND (next_attempt_at IS NULL OR next_attempt_at <= $1)",
        )
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(count)
    }
}
