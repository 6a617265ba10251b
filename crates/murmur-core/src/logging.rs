//! Structured logging field name constants for murmur.
//!
//! All crates use these constants for consistent structured logging fields,
//! so log aggregation tools can query by standardized names across every
//! subsystem.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue, automatic fallback applied |
//! | INFO  | Lifecycle events (startup, shutdown), operation completions |
//! | DEBUG | Decision points, intermediate values, config choices |
//! | TRACE | Per-item iteration, high-volume data (search hits, chunks) |

/// Subsystem originating the log event.
/// Values: "pipeline", "ledger", "search", "db", "inference", "stream"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "orchestrator", "worker", "pool", "whisper", "blend"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "submit", "advance", "reserve", "commit", "search"
pub const OPERATION: &str = "op";

/// Note UUID being operated on.
pub const NOTE_ID: &str = "note_id";

/// Job UUID being processed.
pub const JOB_ID: &str = "job_id";

/// Pipeline stage being executed.
pub const STAGE: &str = "stage";

/// User UUID owning the affected balance or note.
pub const USER_ID: &str = "user_id";

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Number of results returned by a search or query.
pub const RESULT_COUNT: &str = "result_count";

/// Attempt number for the current stage.
pub const ATTEMPT: &str = "attempt";

/// Reservation UUID in ledger operations.
pub const RESERVATION_ID: &str = "reservation_id";

/// Credits amount in ledger operations.
pub const AMOUNT: &str = "amount";

/// Model name used for inference.
pub const MODEL: &str = "model";

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";
