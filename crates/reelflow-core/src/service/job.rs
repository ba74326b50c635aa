//! Job store service: lifecycle management for job documents.
//!
//! `JobStore` is generic over `JobRepository` so the same creation, listing
//! and note-taking rules apply to the filesystem store and the in-memory
//! one. The storage root is always injected through the repository; the
//! store never reads ambient configuration.

use std::collections::HashSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use reelflow_types::ValueMap;
use reelflow_types::error::StoreError;
use reelflow_types::job::{JobDocument, JobDocumentError, JobStatus, JobSummary};
use reelflow_types::workflow::{StepInvocation, WorkflowDefinition};
use serde_json::Value;
use thiserror::Error;

use crate::repository::job::JobRepository;
use crate::workflow::definition::{WorkflowError, validate_definition, validate_invocation};
use crate::workflow::plan::{PlanningError, plan_job};

/// Maximum length of the semantic part of a job id.
const MAX_KEY_LEN: usize = 48;

/// Maximum `_N` suffix tried when two jobs share a key and timestamp.
const MAX_ID_SUFFIX: u32 = 1000;

/// Errors from job store operations beyond plain persistence.
#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("planning error: {0}")]
    Planning(#[from] PlanningError),

    #[error("invalid job document: {0}")]
    Document(#[from] JobDocumentError),

    #[error("missing key input '{0}'")]
    MissingKeyInput(String),
}

/// Lifecycle manager for job documents.
pub struct JobStore<R: JobRepository> {
    repo: R,
}

impl<R: JobRepository> JobStore<R> {
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    /// Access the underlying repository.
    pub fn repo(&self) -> &R {
        &self.repo
    }

    /// Create a job from a workflow template and literal inputs.
    ///
    /// Assigns a fresh id, freezes the workflow into the document with every
    /// step pending, prepares the workspace directories and persists.
    pub async fn create(
        &self,
        workflow: &WorkflowDefinition,
        inputs: ValueMap,
    ) -> Result<JobDocument, JobStoreError> {
        self.create_at(workflow, inputs, Utc::now()).await
    }

    /// [`Self::create`] with an explicit creation time.
    pub async fn create_at(
        &self,
        workflow: &WorkflowDefinition,
        inputs: ValueMap,
        now: DateTime<Utc>,
    ) -> Result<JobDocument, JobStoreError> {
        validate_definition(workflow)?;

        let base = base_job_id(workflow, &inputs, now)?;
        let job_id = self.unique_id(&base).await?;
        let job = JobDocument::new(job_id, workflow, inputs, now);

        // A template that can never run is rejected before anything is written.
        plan_job(&job)?;

        self.repo.insert(&job).await?;
        self.repo
            .prepare_workspace(&job.job_id, &workflow.workspace_dirs)
            .await?;

        tracing::info!(
            job_id = %job.job_id,
            workflow = %workflow.name,
            steps = job.steps.len(),
            "created job"
        );
        Ok(job)
    }

    async fn unique_id(&self, base: &str) -> Result<String, StoreError> {
        if !self.repo.exists(base).await? {
            return Ok(base.to_string());
        }
        for n in 2..=MAX_ID_SUFFIX {
            let candidate = format!("{base}_{n}");
            if !self.repo.exists(&candidate).await? {
                return Ok(candidate);
            }
        }
        Err(StoreError::AlreadyExists(base.to_string()))
    }

    /// Load and validate a job document.
    pub async fn load(&self, job_id: &str) -> Result<JobDocument, StoreError> {
        self.repo.load(job_id).await
    }

    /// Persist a document, recomputing its derived status first.
    pub async fn save(&self, job: &mut JobDocument) -> Result<(), StoreError> {
        job.refresh(Utc::now());
        self.repo.save(job).await
    }

    /// List job summaries, newest first, optionally filtered by status.
    pub async fn list(&self, status: Option<JobStatus>) -> Result<Vec<JobSummary>, StoreError> {
        let mut summaries = self.repo.list_summaries().await?;
        if let Some(status) = status {
            summaries.retain(|s| s.status == status);
        }
        summaries.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.job_id.cmp(&a.job_id))
        });
        Ok(summaries)
    }

    /// Append a new pending step to an existing job.
    pub async fn append_step(
        &self,
        job_id: &str,
        invocation: &StepInvocation,
    ) -> Result<JobDocument, JobStoreError> {
        let mut job = self.load(job_id).await?;

        let mut known: HashSet<&str> = job.steps.iter().map(|s| s.id.as_str()).collect();
        known.insert(invocation.id.as_str());
        validate_invocation(invocation, &known)?;

        job.append_step(invocation)?;
        plan_job(&job)?;
        self.save(&mut job).await?;

        tracing::info!(job_id, step_id = %invocation.id, step = %invocation.step, "appended step");
        Ok(job)
    }

    /// Append a timestamped line to a job's operator notes.
    pub async fn add_note(&self, job_id: &str, text: &str) -> Result<JobDocument, StoreError> {
        let mut job = self.load(job_id).await?;
        job.add_note(text, Utc::now());
        self.save(&mut job).await?;
        Ok(job)
    }

    /// Mark every `running` record of a job as interrupted.
    ///
    /// For use after the executing process was killed. Returns the ids of
    /// the steps that were changed.
    pub async fn recover(&self, job_id: &str) -> Result<Vec<String>, StoreError> {
        let mut job = self.load(job_id).await?;
        let interrupted = job.interrupt_running(None, Utc::now());
        if !interrupted.is_empty() {
            self.save(&mut job).await?;
            tracing::warn!(job_id, steps = ?interrupted, "recovered interrupted steps");
        }
        Ok(interrupted)
    }

    /// Workspace directory of a job, if the repository has one.
    pub fn job_dir(&self, job_id: &str) -> Option<PathBuf> {
        self.repo.job_dir(job_id)
    }
}

// ---------------------------------------------------------------------------
// Job identity
// ---------------------------------------------------------------------------

/// `<key parts>_<YYYYmmdd_HHMMSS>`, without collision handling.
///
/// Key parts are the values of the workflow's `key_inputs`, in order; a
/// workflow without key inputs uses its own name.
pub fn base_job_id(
    workflow: &WorkflowDefinition,
    inputs: &ValueMap,
    now: DateTime<Utc>,
) -> Result<String, JobStoreError> {
    let mut parts = Vec::with_capacity(workflow.key_inputs.len());
    for key in &workflow.key_inputs {
        let value = inputs
            .get(key)
            .ok_or_else(|| JobStoreError::MissingKeyInput(key.clone()))?;
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let part = sanitize(&text);
        if !part.is_empty() {
            parts.push(part);
        }
    }

    let mut key = parts.join("_");
    if key.is_empty() {
        key = sanitize(&workflow.name);
    }
    if key.len() > MAX_KEY_LEN {
        key.truncate(MAX_KEY_LEN);
        key = key.trim_end_matches('_').to_string();
    }
    if key.is_empty() {
        key = "job".to_string();
    }

    Ok(format!("{key}_{}", now.format("%Y%m%d_%H%M%S")))
}

/// Keep `[A-Za-z0-9_]`, collapse everything else into single underscores.
fn sanitize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}
