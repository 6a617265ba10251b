//! # murmur-core
//!
//! Core types, traits, and abstractions for the murmur voice-note pipeline.
//!
//! This crate provides the foundational data structures and trait definitions
//! that the other murmur crates depend on: the note/job/ledger domain models,
//! the processing-state machine, the error taxonomy, the capability traits
//! for stores and external-service adapters, and the metering cost model.

pub mod costs;
pub mod defaults;
pub mod error;
pub mod idempotency;
pub mod logging;
pub mod models;
pub mod traits;

// Re-export commonly used types at crate root
pub use costs::CostModel;
pub use error::{Error, Result};
pub use idempotency::{idempotency_key, input_checksum};
pub use models::*;
pub use traits::*;
