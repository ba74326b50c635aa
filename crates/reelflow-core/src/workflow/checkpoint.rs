//! Durable checkpoints for step transitions.
//!
//! Wraps the job store to record each transition (pending -> running ->
//! completed/failed/skipped) on the in-memory document and persist it
//! before the executor moves on. A crash at any point leaves the document
//! describing exactly what had happened up to that moment.

use std::sync::Arc;

use chrono::Utc;
use reelflow_types::ValueMap;
use reelflow_types::error::StoreError;
use reelflow_types::job::{FailureKind, JobDocument, StepFailure};

use crate::repository::job::JobRepository;
use crate::service::job::JobStore;

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Records step transitions on a job document and persists them.
pub struct CheckpointManager<R: JobRepository> {
    store: Arc<JobStore<R>>,
}

impl<R: JobRepository> CheckpointManager<R> {
    pub fn new(store: Arc<JobStore<R>>) -> Self {
        Self { store }
    }

    /// Access the underlying job store.
    pub fn store(&self) -> &Arc<JobStore<R>> {
        &self.store
    }

    /// Checkpoint a step as starting (-> running). Returns the attempt number.
    pub async fn checkpoint_step_start(
        &self,
        job: &mut JobDocument,
        step_id: &str,
        params: ValueMap,
        owner: &str,
    ) -> Result<u32, CheckpointError> {
        let record = record_mut(job, step_id)?;
        record.mark_running(params, owner, Utc::now());
        let attempt = record.attempts;

        self.store.save(job).await?;
        tracing::debug!(job_id = %job.job_id, step_id, attempt, "checkpointed step start");
        Ok(attempt)
    }

    /// Checkpoint a step as completed with its recorded output.
    pub async fn checkpoint_step_complete(
        &self,
        job: &mut JobDocument,
        step_id: &str,
        output: ValueMap,
    ) -> Result<(), CheckpointError> {
        record_mut(job, step_id)?.mark_completed(output, Utc::now());
        self.store.save(job).await?;
        tracing::debug!(job_id = %job.job_id, step_id, "checkpointed step complete");
        Ok(())
    }

    /// Checkpoint a step as failed.
    pub async fn checkpoint_step_failed(
        &self,
        job: &mut JobDocument,
        step_id: &str,
        kind: FailureKind,
        error: &str,
    ) -> Result<(), CheckpointError> {
        let now = Utc::now();
        let record = record_mut(job, step_id)?;
        let failure = StepFailure {
            kind,
            step_name: record.step.clone(),
            message: error.to_string(),
            at: now,
        };
        record.mark_failed(failure, now);

        self.store.save(job).await?;
        tracing::debug!(job_id = %job.job_id, step_id, ?kind, error, "checkpointed step failed");
        Ok(())
    }

    /// Checkpoint a step as skipped (`skip_if` held).
    pub async fn checkpoint_step_skipped(
        &self,
        job: &mut JobDocument,
        step_id: &str,
    ) -> Result<(), CheckpointError> {
        record_mut(job, step_id)?.mark_skipped(Utc::now());
        self.store.save(job).await?;
        tracing::debug!(job_id = %job.job_id, step_id, "checkpointed step skipped");
        Ok(())
    }

    /// Fail `running` records that started before `cutoff` as interrupted.
    ///
    /// Persists only when something changed.
    pub async fn checkpoint_interrupted(
        &self,
        job: &mut JobDocument,
        cutoff: chrono::DateTime<Utc>,
    ) -> Result<Vec<String>, CheckpointError> {
        let interrupted = job.interrupt_running(Some(cutoff), Utc::now());
        if !interrupted.is_empty() {
            self.store.save(job).await?;
            tracing::debug!(job_id = %job.job_id, steps = ?interrupted, "checkpointed interrupted steps");
        }
        Ok(interrupted)
    }
}

fn record_mut<'a>(
    job: &'a mut JobDocument,
    step_id: &str,
) -> Result<&'a mut reelflow_types::job::StepRecord, CheckpointError> {
    job.step_mut(step_id)
        .ok_or_else(|| CheckpointError::UnknownStep(step_id.to_string()))
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Persisting the document failed.
    #[error("checkpoint store error: {0}")]
    Store(#[from] StoreError),

    #[error("step '{0}' is not part of the job")]
    UnknownStep(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
