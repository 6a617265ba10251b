//! # murmur-db
//!
//! PostgreSQL persistence layer for the murmur pipeline.
//!
//! This crate provides:
//! - Connection pool management
//! - Repository implementations for notes, processing jobs, the usage
//!   ledger, and the embedding index
//! - Full-text search with PostgreSQL tsvector
//! - Vector search with pgvector (cosine distance)
//!
//! ## Example
//!
//! ```rust,ignore
//! use murmur_db::Database;
//! use murmur_core::{NewNote, NoteStore, ProcessingState};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/murmur").await?;
//!
//!     let note = db.notes.insert(NewNote {
//!         user_id: uuid::Uuid::new_v4(),
//!         title: Some("Standup".into()),
//!         audio_ref: Some("audio/standup.wav".into()),
//!         audio_mime: Some("audio/wav".into()),
//!         source_text: None,
//!         language: None,
//!         state: ProcessingState::Received,
//!     }).await?;
//!
//!     println!("Created note: {}", note.id);
//!     Ok(())
//! }
//! ```

pub mod embeddings;
pub mod jobs;
pub mod ledger;
pub mod notes;
pub mod pool;
pub mod search;

// Re-export core types
pub use murmur_core::*;

pub use embeddings::PgEmbeddingIndex;
pub use jobs::PgJobStore;
pub use ledger::PgUsageLedger;
pub use notes::PgNoteStore;
pub use pool::{create_pool, create_pool_with_config, log_pool_metrics, PoolConfig};
pub use search::PgTextSearch;

/// Combined database context with all repositories.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    /// Note repository.
    pub notes: PgNoteStore,
    /// Processing-job repository.
    pub jobs: PgJobStore,
    /// Usage ledger.
    pub ledger: PgUsageLedger,
    /// Embedding index (pgvector).
    pub embeddings: PgEmbeddingIndex,
    /// Full-text search over transcripts and summaries.
    pub search: PgTextSearch,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            notes: PgNoteStore::new(pool.clone()),
            jobs: PgJobStore::new(pool.clone()),
            ledger: PgUsageLedger::new(pool.clone()),
            embeddings: PgEmbeddingIndex::new(pool.clone()),
            search: PgTextSearch::new(pool.clone()),
            pool,
        }
    }

    /// Create a new Database instance by connecting to the given URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = create_pool(url).await?;
        Ok(Self::new(pool))
    }

    /// Create with custom pool configuration.
    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool_with_config(url, config).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }
}
