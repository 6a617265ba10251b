//! Embedding index implementation (pgvector).
//!
//! Similarity is cosine: pgvector's `<=>` operator returns cosine distance,
//! and scores are reported as `1 - distance`. This choice is fixed across
//! the system; the retrieval blend depends on it.

use async_trait::async_trait;
use chrono::Utc;
use pgvector::Vector;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use murmur_core::{EmbeddingIndex, Error, Result, SearchHit};

/// PostgreSQL implementation of EmbeddingIndex.
#[derive(Clone)]
pub struct PgEmbeddingIndex {
    pool: Pool<Postgres>,
}

impl PgEmbeddingIndex {
    /// Create a new PgEmbeddingIndex with the given connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EmbeddingIndex for PgEmbeddingIndex {
    async fn replace_for_note(
        &self,
        note_id: Uuid,
        user_id: Uuid,
        source_hash: &str,
        vector: &Vector,
        model: &str,
    ) -> Result<()> {
        // Upsert keyed by note id: superseded embeddings are replaced, not
        // accumulated, so queries stay consistent with current content.
        sqlx::query(
            "INSERT INTO note_embedding (note_id, user_id, source_hash, vector, model, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (note_id) DO UPDATE
             SET user_id = EXCLUDED.user_id,
                 source_hash = EXCLUDED.source_hash,
                 vector = EXCLUDED.vector,
                 model = EXCLUDED.model,
                 updated_at = EXCLUDED.updated_at",
        )
        .bind(note_id)
        .bind(user_id)
        .bind(source_hash)
        .bind(vector)
        .bind(model)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::IndexWrite(e.to_string()))?;
        Ok(())
    }

    async fn delete_for_note(&self, note_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM note_embedding WHERE note_id = $1")
            .bind(note_id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn find_similar(
        &self,
        user_id: Uuid,
        query: &Vector,
        limit: i64,
    ) -> Result<Vec<SearchHit>> {
        // Notes still mid-pipeline are excluded: their embeddings are
        // absent or stale.
        let rows = sqlx::query(
            "SELECT e.note_id,
                    1.0 - (e.vector <=> $2::vector) AS score,
                    substring(t.full_text for 200) AS snippet,
                    n.title,
                    n.updated_at
             FROM note_embedding e
             JOIN note n ON n.id = e.note_id
             LEFT JOIN note_transcript t ON t.note_id = e.note_id
             WHERE e.user_id = $1
               AND n.state = 'done'
               AND n.deleted_at IS NULL
             ORDER BY e.vector <=> $2::vector
             LIMIT $3",
        )
        .bind(user_id)
        .bind(query)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        let hits = rows
            .into_iter()
            .map(|row| SearchHit {
                note_id: row.get("note_id"),
                score: row.get::<f64, _>("score") as f32,
                snippet: row.get("snippet"),
                title: row.get("title"),
                updated_at: row.get("updated_at"),
            })
            .collect();

        Ok(hits)
    }
}
