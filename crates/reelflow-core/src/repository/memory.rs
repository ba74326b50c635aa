//! In-memory job repository.
//!
//! Keeps documents in a map and records every write in order, which lets
//! tests observe the document exactly as it was persisted after each state
//! transition.

use std::collections::BTreeMap;
use std::path::PathBuf;

use reelflow_types::error::StoreError;
use reelflow_types::job::{JobDocument, JobSummary};
use tokio::sync::Mutex;

use super::job::JobRepository;

#[derive(Debug, Default)]
pub struct InMemoryJobRepository {
    jobs: Mutex<BTreeMap<String, JobDocument>>,
    history: Mutex<Vec<JobDocument>>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every document written so far (inserts and saves), oldest first.
    pub async fn history(&self) -> Vec<JobDocument> {
        self.history.lock().await.clone()
    }

    /// Replace a stored document without going through validation.
    ///
    /// Simulates an operator editing the document between runs.
    pub async fn overwrite(&self, job: JobDocument) {
        self.jobs.lock().await.insert(job.job_id.clone(), job);
    }
}

impl JobRepository for InMemoryJobRepository {
    async fn insert(&self, job: &JobDocument) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&job.job_id) {
            return Err(StoreError::AlreadyExists(job.job_id.clone()));
        }
        jobs.insert(job.job_id.clone(), job.clone());
        self.history.lock().await.push(job.clone());
        Ok(())
    }

    async fn load(&self, job_id: &str) -> Result<JobDocument, StoreError> {
        let job = self
            .jobs
            .lock()
            .await
            .get(job_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;
        job.validate().map_err(|source| StoreError::Invalid {
            job_id: job_id.to_string(),
            source,
        })?;
        Ok(job)
    }

    async fn save(&self, job: &JobDocument) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().await;
        if !jobs.contains_key(&job.job_id) {
            return Err(StoreError::NotFound(job.job_id.clone()));
        }
        jobs.insert(job.job_id.clone(), job.clone());
        self.history.lock().await.push(job.clone());
        Ok(())
    }

    async fn exists(&self, job_id: &str) -> Result<bool, StoreError> {
        Ok(self.jobs.lock().await.contains_key(job_id))
    }

    async fn list_summaries(&self) -> Result<Vec<JobSummary>, StoreError> {
        Ok(self.jobs.lock().await.values().map(JobDocument::summary).collect())
    }

    fn job_dir(&self, _job_id: &str) -> Option<PathBuf> {
        None
    }

    async fn prepare_workspace(&self, _job_id: &str, _dirs: &[String]) -> Result<(), StoreError> {
        Ok(())
    }
}
