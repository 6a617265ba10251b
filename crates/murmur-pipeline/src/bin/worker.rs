//! murmur-worker: runs the note-processing worker pool against Postgres.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use murmur_core::{AudioStore, CostModel, Error, Result as MurmurResult};
use murmur_db::Database;
use murmur_inference::InferenceConfig;
use murmur_pipeline::{
    JobWorker, Orchestrator, OrchestratorConfig, OrchestratorDeps, WorkerConfig,
};

/// Filesystem-backed audio store for the worker process.
///
/// The production object store sits behind the same trait; this is the
/// local binding for single-node deployments.
struct FsAudioStore {
    root: PathBuf,
}

impl FsAudioStore {
    fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, audio_ref: &str) -> MurmurResult<PathBuf> {
        if audio_ref.contains("..") {
            return Err(Error::InvalidInput(format!(
                "audio ref must not traverse directories: {audio_ref}"
            )));
        }
        Ok(self.root.join(audio_ref))
    }
}

#[async_trait::async_trait]
impl AudioStore for FsAudioStore {
    async fn fetch_audio(&self, audio_ref: &str) -> MurmurResult<Vec<u8>> {
        let path = self.path_for(audio_ref)?;
        Ok(tokio::fs::read(&path).await?)
    }

    async fn store_audio(&self, audio_ref: &str, data: &[u8]) -> MurmurResult<()> {
        let path = self.path_for(audio_ref)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(tokio::fs::write(&path, data).await?)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let audio_root = std::env::var("AUDIO_STORE_PATH").unwrap_or_else(|_| "./audio".into());

    let db = Database::connect(&database_url)
        .await
        .context("connecting to database")?;
    let inference = InferenceConfig::from_env().context("configuring inference backends")?;

    let orchestrator = Arc::new(Orchestrator::new(
        OrchestratorDeps {
            notes: Arc::new(db.notes.clone()),
            jobs: Arc::new(db.jobs.clone()),
            ledger: Arc::new(db.ledger.clone()),
            index: Arc::new(db.embeddings.clone()),
            audio: Arc::new(FsAudioStore::new(audio_root)),
            transcription: inference.transcription,
            extraction: inference.extraction,
            embedding: inference.embedding,
        },
        CostModel::from_env(),
        OrchestratorConfig::default(),
    ));

    let worker = JobWorker::new(
        orchestrator,
        Arc::new(db.jobs.clone()),
        WorkerConfig::from_env(),
    );
    let handle = worker.start();

    info!("murmur-worker running; press ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;

    handle.shutdown().await.ok();
    info!("murmur-worker stopped");
    Ok(())
}
