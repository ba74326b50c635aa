//! Application state wiring the job store and executor together.
//!
//! Services are generic over the repository trait; AppState pins them to
//! the filesystem implementation.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use reelflow_core::event::bus::EventBus;
use reelflow_core::service::job::JobStore;
use reelflow_core::workflow::executor::WorkflowExecutor;
use reelflow_infra::config::{executor_options, jobs_dir, load_global_config, workflows_dir};
use reelflow_infra::filesystem::resolve_data_dir;
use reelflow_infra::step::build_registry;
use reelflow_infra::store::fs_job::FsJobRepository;
use reelflow_types::config::GlobalConfig;

pub type ConcreteJobStore = JobStore<FsJobRepository>;
pub type ConcreteExecutor = WorkflowExecutor<FsJobRepository>;

/// Shared state for every command.
#[derive(Clone)]
pub struct AppState {
    pub data_dir: PathBuf,
    pub workflows_dir: PathBuf,
    pub config: GlobalConfig,
    pub job_store: Arc<ConcreteJobStore>,
    pub executor: Arc<ConcreteExecutor>,
}

impl AppState {
    /// Load configuration and wire services.
    ///
    /// `data_dir` comes from `--data-dir` (or its environment variable);
    /// without it the platform default is used.
    pub async fn init(data_dir: Option<PathBuf>) -> anyhow::Result<Self> {
        let data_dir = data_dir.unwrap_or_else(resolve_data_dir);
        // Command steps run with the job dir as cwd, so every derived path
        // must be absolute.
        let data_dir = std::path::absolute(&data_dir)
            .with_context(|| format!("Failed to resolve data directory {}", data_dir.display()))?;
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

        let config = load_global_config(&data_dir).await?;
        let registry = build_registry(&config, &data_dir).context("Failed to register steps")?;

        let job_store = Arc::new(JobStore::new(FsJobRepository::new(jobs_dir(
            &data_dir, &config,
        ))));
        let executor = WorkflowExecutor::new(
            Arc::clone(&job_store),
            Arc::new(registry),
            EventBus::default(),
        )
        .with_options(executor_options(&config));

        tracing::debug!(data_dir = %data_dir.display(), "initialized app state");

        Ok(Self {
            workflows_dir: workflows_dir(&data_dir, &config),
            data_dir,
            config,
            job_store,
            executor: Arc::new(executor),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn relative_data_dir_is_made_absolute() {
        let cwd = std::env::current_dir().unwrap();
        let tmp = tempfile::tempdir_in(&cwd).unwrap();
        let relative = tmp.path().strip_prefix(&cwd).unwrap().to_path_buf();

        let state = AppState::init(Some(relative)).await.unwrap();
        assert!(state.data_dir.is_absolute());
        assert_eq!(state.data_dir, tmp.path());
        assert!(state.workflows_dir.is_absolute());
        assert!(state.job_store.job_dir("j").unwrap().is_absolute());
    }
}
