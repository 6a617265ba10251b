//! Retrieval service: blended semantic + lexical search.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, instrument, warn};
use uuid::Uuid;

use murmur_core::{
    defaults, EmbeddingBackend, EmbeddingIndex, RankedNote, Result, TextSearch,
};

use crate::blend::{blend, BlendConfig};

/// Configuration for the retrieval service.
#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    /// Blend weights for the two sources.
    pub blend: BlendConfig,
    /// Candidate pool fetched from each source before blending.
    pub candidate_pool: i64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            blend: BlendConfig::default(),
            candidate_pool: defaults::SEARCH_CANDIDATE_POOL,
        }
    }
}

/// Answers search queries over a user's completed notes.
pub struct RetrievalService {
    index: Arc<dyn EmbeddingIndex>,
    text: Arc<dyn TextSearch>,
    embedder: Arc<dyn EmbeddingBackend>,
    config: RetrievalConfig,
}

impl RetrievalService {
    pub fn new(
        index: Arc<dyn EmbeddingIndex>,
        text: Arc<dyn TextSearch>,
        embedder: Arc<dyn EmbeddingBackend>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            index,
            text,
            embedder,
            config,
        }
    }

    /// Retrieval boundary: ranked notes for a query, at most `top_k`.
    ///
    /// The vector and full-text queries run concurrently. If the query
    /// cannot be embedded (backend down), retrieval degrades to lexical
    /// results rather than failing the search.
    #[instrument(skip(self, query), fields(subsystem = "search", component = "retrieval", op = "search", user_id = %user_id, top_k))]
    pub async fn search(
        &self,
        user_id: Uuid,
        query: &str,
        top_k: i64,
    ) -> Result<Vec<RankedNote>> {
        let query = query.trim();
        if query.is_empty() || top_k <= 0 {
            return Ok(Vec::new());
        }

        let start = Instant::now();
        let pool = self.config.candidate_pool.max(top_k);

        let query_vector = match self.embedder.embed_texts(&[query.to_string()]).await {
            Ok(mut vectors) => vectors.pop(),
            Err(e) => {
                warn!(error = %e, "Query embedding failed; lexical-only retrieval");
                None
            }
        };

        let (semantic, lexical) = match query_vector {
            Some(vector) => {
                futures::future::try_join(
                    self.index.find_similar(user_id, &vector, pool),
                    self.text.search_text(user_id, query, pool),
                )
                .await?
            }
            None => (Vec::new(), self.text.search_text(user_id, query, pool).await?),
        };

        let results = blend(semantic, lexical, &self.config.blend, top_k as usize);

        debug!(
            result_count = results.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Search complete"
        );
        Ok(results)
    }
}
