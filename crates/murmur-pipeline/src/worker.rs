//! Worker pool driving the orchestrator.
//!
//! Workers claim runnable jobs (best-effort exclusive claim; the
//! orchestrator's version check is the hard serializer) and execute one
//! stage per claim. Claims older than the staleness threshold belong to
//! crashed workers and are re-claimed automatically.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc};
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use murmur_core::{defaults, FailureCode, JobStore, ProcessingState, Result, Stage};

use crate::orchestrator::{AdvanceOutcome, Orchestrator};

/// Configuration for the job worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identifier recorded on claims (crash recovery attribution).
    pub worker_id: String,
    /// Polling interval in milliseconds when the queue is empty.
    pub poll_interval_ms: u64,
    /// Maximum number of concurrent stage executions.
    pub max_concurrent: usize,
    /// Claims older than this many seconds are considered abandoned.
    pub claim_stale_after_secs: i64,
    /// Whether to enable job processing.
    pub enabled: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            poll_interval_ms: defaults::WORKER_POLL_INTERVAL_MS,
            max_concurrent: defaults::WORKER_MAX_CONCURRENT,
            claim_stale_after_secs: defaults::CLAIM_STALE_AFTER_SECS,
            enabled: true,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `WORKER_ENABLED` | `true` | Enable/disable job processing |
    /// | `WORKER_MAX_CONCURRENT` | `4` | Max concurrent stage executions |
    /// | `WORKER_POLL_INTERVAL_MS` | `500` | Polling interval when queue is empty |
    /// | `WORKER_CLAIM_STALE_SECS` | `300` | Claim staleness threshold |
    pub fn from_env() -> Self {
        let enabled = std::env::var("WORKER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let max_concurrent = std::env::var("WORKER_MAX_CONCURRENT")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults::WORKER_MAX_CONCURRENT)
            .max(1);

        let poll_interval_ms = std::env::var("WORKER_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::WORKER_POLL_INTERVAL_MS);

        let claim_stale_after_secs = std::env::var("WORKER_CLAIM_STALE_SECS")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(defaults::CLAIM_STALE_AFTER_SECS);

        Self {
            poll_interval_ms,
            max_concurrent,
            claim_stale_after_secs,
            enabled,
            ..Default::default()
        }
    }

    /// Create a new config with custom poll interval.
    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Set maximum concurrent stage executions.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    /// Enable or disable job processing.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Event emitted by the job worker.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// A stage execution was started for a job.
    StageStarted { job_id: Uuid, state: ProcessingState },
    /// A stage completed and the job advanced to this state.
    StageCompleted { job_id: Uuid, state: ProcessingState },
    /// A stage failed transiently and a retry was scheduled.
    RetryScheduled {
        job_id: Uuid,
        stage: Stage,
        attempt: i32,
    },
    /// A job reached `FAILED`.
    JobFailed { job_id: Uuid, code: FailureCode },
    /// A job reached `DONE`.
    JobCompleted { job_id: Uuid },
    /// Worker started.
    WorkerStarted,
    /// Worker stopped.
    WorkerStopped,
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<WorkerEvent>,
}

impl WorkerHandle {
    /// Signal the worker to shut down gracefully.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| murmur_core::Error::Internal("Failed to send shutdown signal".into()))?;
        Ok(())
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_rx.resubscribe()
    }
}

/// Job worker that pulls stage-advance work from the job store.
pub struct JobWorker {
    orchestrator: Arc<Orchestrator>,
    jobs: Arc<dyn JobStore>,
    config: WorkerConfig,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl JobWorker {
    /// Create a new job worker.
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        jobs: Arc<dyn JobStore>,
        config: WorkerConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(defaults::EVENT_BUS_CAPACITY);
        Self {
            orchestrator,
            jobs,
            config,
            event_tx,
        }
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    /// Start the worker and return a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let event_rx = self.event_tx.subscribe();

        tokio::spawn(async move {
            self.run(&mut shutdown_rx).await;
        });

        WorkerHandle {
            shutdown_tx,
            event_rx,
        }
    }

    /// Run the worker loop with concurrent stage execution.
    ///
    /// Claims up to `max_concurrent` jobs at a time; only sleeps when the
    /// queue is empty.
    #[instrument(skip(self, shutdown_rx), fields(subsystem = "pipeline", component = "worker", worker_id = %self.config.worker_id))]
    async fn run(&self, shutdown_rx: &mut mpsc::Receiver<()>) {
        if !self.config.enabled {
            info!("Job worker is disabled, not starting");
            return;
        }

        info!(
            poll_interval_ms = self.config.poll_interval_ms,
            max_concurrent = self.config.max_concurrent,
            "Job worker started"
        );
        let _ = self.event_tx.send(WorkerEvent::WorkerStarted);

        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);

        loop {
            if shutdown_rx.try_recv().is_ok() {
                info!("Job worker received shutdown signal");
                break;
            }

            let mut claimed = 0;
            let mut tasks = tokio::task::JoinSet::new();

            for _ in 0..self.config.max_concurrent {
                match self
                    .jobs
                    .claim_next(&self.config.worker_id, self.config.claim_stale_after_secs)
                    .await
                {
                    Ok(Some(job)) => {
                        claimed += 1;
                        let orchestrator = self.orchestrator.clone();
                        let jobs = self.jobs.clone();
                        let event_tx = self.event_tx.clone();
                        let job_id = job.id;
                        let state = job.state;
                        tasks.spawn(async move {
                            execute_claimed(orchestrator, jobs, event_tx, job_id, state).await;
                        });
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!(error = %e, "Failed to claim job");
                        break;
                    }
                }
            }

            if claimed == 0 {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Job worker received shutdown signal");
                        break;
                    }
                    _ = sleep(poll_interval) => {}
                }
            } else {
                debug!(claimed, "Processing concurrent stage batch");
                while let Some(result) = tasks.join_next().await {
                    if let Err(e) = result {
                        error!(error = ?e, "Stage task panicked");
                    }
                }
            }
        }

        let _ = self.event_tx.send(WorkerEvent::WorkerStopped);
        info!("Job worker stopped");
    }
}

/// Execute one claimed stage and translate the outcome into events.
async fn execute_claimed(
    orchestrator: Arc<Orchestrator>,
    jobs: Arc<dyn JobStore>,
    event_tx: broadcast::Sender<WorkerEvent>,
    job_id: Uuid,
    state: ProcessingState,
) {
    let start = Instant::now();
    let _ = event_tx.send(WorkerEvent::StageStarted { job_id, state });

    match orchestrator.advance(job_id).await {
        Ok(AdvanceOutcome::Progressed(next)) => {
            info!(
                job_id = %job_id,
                state = %next,
                duration_ms = start.elapsed().as_millis() as u64,
                "Stage completed"
            );
            if next == ProcessingState::Done {
                let _ = event_tx.send(WorkerEvent::JobCompleted { job_id });
            } else {
                let _ = event_tx.send(WorkerEvent::StageCompleted {
                    job_id,
                    state: next,
                });
            }
        }
        Ok(AdvanceOutcome::RetryScheduled {
            stage, attempt, ..
        }) => {
            let _ = event_tx.send(WorkerEvent::RetryScheduled {
                job_id,
                stage,
                attempt,
            });
        }
        Ok(AdvanceOutcome::Failed(code)) => {
            let _ = event_tx.send(WorkerEvent::JobFailed { job_id, code });
        }
        Ok(AdvanceOutcome::Discarded) => {
            debug!(job_id = %job_id, "Stage execution discarded by concurrent writer");
        }
        Ok(AdvanceOutcome::NotDue { .. }) | Ok(AdvanceOutcome::AlreadyTerminal) => {
            // Claimed a job that is no longer runnable; drop the claim.
            if let Err(e) = jobs.release_claim(job_id).await {
                warn!(job_id = %job_id, error = %e, "Failed to release claim");
            }
        }
        Err(e) => {
            error!(job_id = %job_id, error = %e, "Stage execution errored");
            if let Err(e) = jobs.release_claim(job_id).await {
                warn!(job_id = %job_id, error = %e, "Failed to release claim");
            }
        }
    }
}
