//! Score blending for hybrid retrieval.
//!
//! Each source list is max-normalized to 0.0–1.0 and combined by a
//! weighted sum. Notes found by both sources score higher than notes
//! found by one; exact ties are broken by most recent update.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use murmur_core::{defaults, RankedNote, SearchHit};

/// Weights for combining the two retrieval sources.
#[derive(Debug, Clone)]
pub struct BlendConfig {
    /// Weight for normalized semantic similarity.
    pub semantic_weight: f32,
    /// Weight for normalized lexical rank score.
    pub lexical_weight: f32,
}

impl Default for BlendConfig {
    fn default() -> Self {
        Self {
            semantic_weight: defaults::SEARCH_SEMANTIC_WEIGHT,
            lexical_weight: defaults::SEARCH_LEXICAL_WEIGHT,
        }
    }
}

struct Candidate {
    semantic: f32,
    lexical: f32,
    snippet: Option<String>,
    title: Option<String>,
    updated_at: DateTime<Utc>,
}

/// Blend two ranked lists into a single result list of at most `top_k`.
pub fn blend(
    semantic: Vec<SearchHit>,
    lexical: Vec<SearchHit>,
    config: &BlendConfig,
    top_k: usize,
) -> Vec<RankedNote> {
    let semantic_count = semantic.len();
    let lexical_count = lexical.len();

    let mut candidates: HashMap<Uuid, Candidate> = HashMap::new();

    for (hit, normalized) in normalize(semantic) {
        candidates
            .entry(hit.note_id)
            .or_insert_with(|| Candidate {
                semantic: 0.0,
                lexical: 0.0,
                snippet: hit.snippet.clone(),
                title: hit.title.clone(),
                updated_at: hit.updated_at,
            })
            .semantic = normalized;
    }

    for (hit, normalized) in normalize(lexical) {
        let candidate = candidates.entry(hit.note_id).or_insert_with(|| Candidate {
            semantic: 0.0,
            lexical: 0.0,
            snippet: hit.snippet.clone(),
            title: hit.title.clone(),
            updated_at: hit.updated_at,
        });
        candidate.lexical = normalized;
        if candidate.snippet.is_none() {
            candidate.snippet = hit.snippet;
        }
    }

    let mut ranked: Vec<(RankedNote, DateTime<Utc>)> = candidates
        .into_iter()
        .map(|(note_id, c)| {
            let score =
                config.semantic_weight * c.semantic + config.lexical_weight * c.lexical;
            (
                RankedNote {
                    note_id,
                    score,
                    snippet: c.snippet,
                    title: c.title,
                },
                c.updated_at,
            )
        })
        .collect();

    // Highest score first; on ties the most recently updated note wins.
    ranked.sort_by(|(a, a_updated), (b, b_updated)| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b_updated.cmp(a_updated))
    });
    ranked.truncate(top_k);

    debug!(
        subsystem = "search",
        component = "blend",
        semantic_hits = semantic_count,
        lexical_hits = lexical_count,
        result_count = ranked.len(),
        "Blend complete"
    );

    ranked.into_iter().map(|(note, _)| note).collect()
}

/// Max-normalize a hit list's scores to 0.0–1.0, preserving order.
fn normalize(hits: Vec<SearchHit>) -> Vec<(SearchHit, f32)> {
    let max = hits
        .iter()
        .map(|h| h.score)
        .fold(0.0_f32, f32::max);
    hits.into_iter()
        .map(|hit| {
            let normalized = if max > 0.0 {
                (hit.score / max).clamp(0.0, 1.0)
            } else {
                0.0
            };
            (hit, normalized)
        })
        .collect()
}
