//! # murmur-pipeline
//!
//! The core of murmur: the note-processing orchestrator and its state
//! machine, the worker pool that drives it, and the streaming
//! transcription session that feeds it.
//!
//! This crate provides:
//! - [`Orchestrator`] — submit/advance/cancel/retry/status for processing
//!   jobs, with ledger discipline and idempotent retry semantics
//! - [`JobWorker`] — a pool of concurrent stage executors with claim-based
//!   scheduling and crash recovery
//! - [`StreamingSession`] — a duplex transcription channel that reconciles
//!   into the same state machine
//! - [`memory`] — in-memory store implementations for tests and local
//!   development
//!
//! ## Example
//!
//! ```ignore
//! use murmur_pipeline::{JobWorker, WorkerConfig, Orchestrator};
//!
//! let orchestrator = Orchestrator::new(deps, CostModel::from_env(), Default::default());
//! let worker = JobWorker::new(orchestrator.into(), jobs, WorkerConfig::from_env());
//! let handle = worker.start();
//!
//! let mut events = handle.events();
//! while let Ok(event) = events.recv().await {
//!     println!("Event: {:?}", event);
//! }
//! handle.shutdown().await?;
//! ```

pub mod memory;
pub mod orchestrator;
pub mod stream;
pub mod worker;

// Re-export core types
pub use murmur_core::*;

pub use memory::MemoryBackend;
pub use orchestrator::{AdvanceOutcome, Orchestrator, OrchestratorConfig, OrchestratorDeps};
pub use stream::{StreamOpenRequest, StreamingSession, StreamingSessionConfig};
pub use worker::{JobWorker, WorkerConfig, WorkerEvent, WorkerHandle};
