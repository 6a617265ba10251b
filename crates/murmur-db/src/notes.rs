//! Note repository implementation.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use murmur_core::{
    Error, NewNote, Note, NoteExtraction, NoteStore, ProcessingState, Result, Transcript,
    TranscriptSegment,
};

/// PostgreSQL implementation of NoteStore.
#[derive(Clone)]
pub struct PgNoteStore {
    pool: Pool<Postgres>,
}

impl PgNoteStore {
    /// Create a new PgNoteStore with the given connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_note_row(row: sqlx::postgres::PgRow) -> Result<Note> {
        let state: String = row.get("state");
        Ok(Note {
            id: row.get("id"),
            user_id: row.get("user_id"),
            title: row.get("title"),
            audio_ref: row.get("audio_ref"),
            audio_mime: row.get("audio_mime"),
            source_text: row.get("source_text"),
            language: row.get("language"),
            state: ProcessingState::parse(&state)?,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            deleted_at: row.get("deleted_at"),
        })
    }
}

#[async_trait]
impl NoteStore for PgNoteStore {
    async fn insert(&self, note: NewNote) -> Result<Note> {
        let id = Uuid::new_v4();
        let now = Utc::now();

        let row = sqlx::query(
            "INSERT INTO note (id, user_id, title, audio_ref, audio_mime, source_text,
                               language, state, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
             RETURNING id, user_id, title, audio_ref, audio_mime, source_text, language,
                       state, created_at, updated_at, deleted_at",
        )
        .bind(id)
        .bind(note.user_id)
        .bind(&note.title)
        .bind(&note.audio_ref)
        .bind(&note.audio_mime)
        .bind(&note.source_text)
        .bind(&note.language)
        .bind(note.state.as_str())
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Self::parse_note_row(row)
    }

    async fn fetch(&self, id: Uuid) -> Result<Note> {
        let row = sqlx::query(
            "SELECT id, user_id, title, audio_ref, audio_mime, source_text, language,
                    state, created_at, updated_at, deleted_at
             FROM note WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?
        .ok_or(Error::NoteNotFound(id))?;

        Self::parse_note_row(row)
    }

    async fn set_state(&self, id: Uuid, state: ProcessingState) -> Result<()> {
        let result = sqlx::query("UPDATE note SET state = $1, updated_at = $2 WHERE id = $3")
            .bind(state.as_str())
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::NoteNotFound(id));
        }
        Ok(())
    }

    async fn store_transcript(&self, id: Uuid, transcript: &Transcript) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        sqlx::query(
            "INSERT INTO note_transcript (note_id, full_text, language, duration_secs, created_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (note_id) DO UPDATE
             SET full_text = EXCLUDED.full_text,
                 language = EXCLUDED.language,
                 duration_secs = EXCLUDED.duration_secs,
                 created_at = EXCLUDED.created_at",
        )
        .bind(id)
        .bind(&transcript.full_text)
        .bind(&transcript.language)
        .bind(transcript.duration_secs)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        // Segments are replaced wholesale; they are immutable once the
        // transcription stage completes.
        sqlx::query("DELETE FROM transcript_segment WHERE note_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

        for (seq, segment) in transcript.segments.iter().enumerate() {
            sqlx::query(
                "INSERT INTO transcript_segment (note_id, seq, start_secs, end_secs, text, confidence)
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(id)
            .bind(seq as i32)
            .bind(segment.start_secs)
            .bind(segment.end_secs)
            .bind(&segment.text)
            .bind(segment.confidence)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        }

        tx.commit().await.map_err(Error::Database)?;
        Ok(())
    }

    async fn fetch_transcript(&self, id: Uuid) -> Result<Option<Transcript>> {
        let row = sqlx::query(
            "SELECT full_text, language, duration_secs FROM note_transcript WHERE note_id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let segment_rows = sqlx::query(
            "SELECT start_secs, end_secs, text, confidence
             FROM transcript_segment WHERE note_id = $1 ORDER BY seq",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        let segments = segment_rows
            .into_iter()
            .map(|r| TranscriptSegment {
                start_secs: r.get("start_secs"),
                end_secs: r.get("end_secs"),
                text: r.get("text"),
                confidence: r.get("confidence"),
            })
            .collect();

        Ok(Some(Transcript {
            full_text: row.get("full_text"),
            segments,
            language: row.get("language"),
            duration_secs: row.get("duration_secs"),
        }))
    }

    async fn store_extraction(&self, id: Uuid, extraction: &NoteExtraction) -> Result<()> {
        let payload = serde_json::to_value(extraction)?;
        sqlx::query(
            "INSERT INTO note_extraction (note_id, summary, payload, created_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (note_id) DO UPDATE
             SET summary = EXCLUDED.summary,
                 payload = EXCLUDED.payload,
                 created_at = EXCLUDED.created_at",
        )
        .bind(id)
        .bind(&extraction.summary)
        .bind(&payload)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn fetch_extraction(&self, id: Uuid) -> Result<Option<NoteExtraction>> {
        let row = sqlx::query("SELECT payload FROM note_extraction WHERE note_id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        match row {
            Some(row) => {
                let payload: serde_json::Value = row.get("payload");
                Ok(Some(serde_json::from_value(payload)?))
            }
            None => Ok(None),
        }
    }

    async fn soft_delete(&self, id: Uuid) -> Result<()> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE note SET deleted_at = $1, updated_at = $1 WHERE id = $2 AND deleted_at IS NULL",
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::NoteNotFound(id));
        }
        Ok(())
    }
}
