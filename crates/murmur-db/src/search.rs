//! Full-text search over transcripts and extraction summaries.

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use murmur_core::{Error, Result, SearchHit, TextSearch};

/// PostgreSQL tsvector implementation of TextSearch.
#[derive(Clone)]
pub struct PgTextSearch {
    pool: Pool<Postgres>,
}

impl PgTextSearch {
    /// Create a new PgTextSearch with the given connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TextSearch for PgTextSearch {
    async fn search_text(&self, user_id: Uuid, query: &str, limit: i64) -> Result<Vec<SearchHit>> {
        let trimmed = query.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }

        // Transcript text and the extraction summary rank together; only
        // completed notes are searchable.
        let rows = sqlx::query(
            "SELECT n.id AS note_id,
                    ts_rank(t.tsv || to_tsvector('english', COALESCE(x.summary, '')),
                            plainto_tsquery('english', $2)) AS score,
                    ts_headline('english', t.full_text, plainto_tsquery('english', $2),
                                'MaxWords=30, MinWords=10') AS snippet,
                    n.title,
                    n.updated_at
             FROM note n
             JOIN note_transcript t ON t.note_id = n.id
             LEFT JOIN note_extraction x ON x.note_id = n.id
             WHERE n.user_id = $1
               AND n.state = 'done'
               AND n.deleted_at IS NULL
               AND (t.tsv || to_tsvector('english', COALESCE(x.summary, '')))
                   @@ plainto_tsquery('english', $2)
             ORDER BY score DESC, n.updated_at DESC
             LIMIT $3",
        )
        .bind(user_id)
        .bind(trimmed)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        let hits = rows
            .into_iter()
            .map(|row| SearchHit {
                note_id: row.get("note_id"),
                score: row.get::<f32, _>("score"),
                snippet: row.get("snippet"),
                title: row.get("title"),
                updated_at: row.get("updated_at"),
            })
            .collect();

        Ok(hits)
    }
}
