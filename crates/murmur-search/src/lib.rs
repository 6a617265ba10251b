//! # murmur-search
//!
//! Retrieval over processed notes: a nearest-neighbor query against the
//! embedding index and a lexical full-text query run concurrently, and
//! their scores are blended into one ranking with recency tie-breaks.
//!
//! Only notes in the `DONE` state are searchable — both underlying
//! queries filter on it, since earlier states have absent or stale
//! embeddings.

pub mod blend;
pub mod retrieval;

pub use blend::{blend, BlendConfig};
pub use retrieval::{RetrievalConfig, RetrievalService};
