//! Job document types.
//!
//! The `JobDocument` is the persisted single source of truth for one job
//! run: identity, inputs, one `StepRecord` per step instance, and a free
//! text operator log. Execution state lives nowhere else.
//!
//! All state transitions go through the `StepRecord::mark_*` methods so the
//! `output` present iff `completed` invariant holds after every change.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use crate::ValueMap;
use crate::workflow::{StepInvocation, WorkflowDefinition, default_required, is_true};

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Derived status of a whole job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("invalid job status: '{other}'")),
        }
    }
}

/// Execution status of a single step instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// The step's `skip_if` condition held; it produced no output.
    Skipped,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::Running => write!(f, "running"),
            StepStatus::Completed => write!(f, "completed"),
            StepStatus::Failed => write!(f, "failed"),
            StepStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Category of a recorded step failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The step itself returned an error.
    Execution,
    /// The step was left `running` by a process that no longer owns it.
    Interrupted,
    /// A step it references was skipped or failed, so it never ran.
    Dependency,
}

/// Structured failure detail stored on a failed `StepRecord`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailure {
    pub kind: FailureKind,
    pub step_name: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Validation errors
// ---------------------------------------------------------------------------

/// A job document that violates a structural invariant (usually after a
/// manual edit).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobDocumentError {
    #[error("job id must not be empty")]
    EmptyJobId,

    #[error("duplicate step instance id '{0}'")]
    DuplicateStep(String),

    #[error("step '{0}' has an output but is not completed")]
    OutputWithoutCompletion(String),

    #[error("step '{0}' is completed but has no output")]
    MissingOutput(String),
}

// ---------------------------------------------------------------------------
// Step Execution Record
// ---------------------------------------------------------------------------

/// Per-step execution state inside a job document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Step instance id, unique within the job.
    pub id: String,
    /// Registered step name.
    pub step: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Parameters as declared, references unresolved.
    #[serde(default)]
    pub declared_params: ValueMap,
    /// Resolved parameters of the most recent attempt.
    #[serde(default)]
    pub params: ValueMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_if: Option<String>,
    #[serde(default = "default_required", skip_serializing_if = "is_true")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<std::collections::BTreeMap<String, String>>,
    pub status: StepStatus,
    #[serde(default)]
    pub output: Option<ValueMap>,
    #[serde(default)]
    pub error: Option<StepFailure>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attempts: u32,
    /// `host:pid` of the process executing this step while `running`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

impl StepRecord {
    /// A fresh pending record for a workflow invocation.
    pub fn from_invocation(inv: &StepInvocation) -> Self {
        Self {
            id: inv.id.clone(),
            step: inv.step.clone(),
            description: inv.description.clone(),
            declared_params: inv.params.clone(),
            params: ValueMap::new(),
            skip_if: inv.skip_if.clone(),
            required: inv.required,
            outputs: inv.outputs.clone(),
            status: StepStatus::Pending,
            output: None,
            error: None,
            started_at: None,
            finished_at: None,
            attempts: 0,
            owner: None,
        }
    }

    pub fn mark_running(&mut self, params: ValueMap, owner: &str, now: DateTime<Utc>) {
        self.status = StepStatus::Running;
        self.params = params;
        self.output = None;
        self.error = None;
        self.started_at = Some(now);
        self.finished_at = None;
        self.attempts += 1;
        self.owner = Some(owner.to_string());
    }

    pub fn mark_completed(&mut self, output: ValueMap, now: DateTime<Utc>) {
        self.status = StepStatus::Completed;
        self.output = Some(output);
        self.error = None;
        self.finished_at = Some(now);
        self.owner = None;
    }

    pub fn mark_failed(&mut self, failure: StepFailure, now: DateTime<Utc>) {
        self.status = StepStatus::Failed;
        self.output = None;
        self.error = Some(failure);
        self.finished_at = Some(now);
        self.owner = None;
    }

    pub fn mark_skipped(&mut self, now: DateTime<Utc>) {
        self.status = StepStatus::Skipped;
        self.output = None;
        self.error = None;
        self.started_at = Some(now);
        self.finished_at = Some(now);
        self.owner = None;
    }

    /// Return the record to `pending` ahead of a rerun.
    ///
    /// The attempt counter and the last resolved params survive.
    pub fn reset(&mut self) {
        self.status = StepStatus::Pending;
        self.output = None;
        self.error = None;
        self.started_at = None;
        self.finished_at = None;
        self.owner = None;
    }

    /// Whether this step no longer blocks the job from completing.
    pub fn is_settled(&self) -> bool {
        match self.status {
            StepStatus::Completed | StepStatus::Skipped => true,
            StepStatus::Failed => !self.required,
            StepStatus::Pending | StepStatus::Running => false,
        }
    }

    fn validate(&self) -> Result<(), JobDocumentError> {
        match (self.status, self.output.is_some()) {
            (StepStatus::Completed, false) => Err(JobDocumentError::MissingOutput(self.id.clone())),
            (StepStatus::Completed, true) | (_, false) => Ok(()),
            (_, true) => Err(JobDocumentError::OutputWithoutCompletion(self.id.clone())),
        }
    }
}

// ---------------------------------------------------------------------------
// Job Document
// ---------------------------------------------------------------------------

/// The persisted state of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDocument {
    pub job_id: String,
    /// Name of the workflow template this job was created from.
    pub workflow: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Derived from the step records; recomputed on every save.
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_inputs: Vec<String>,
    #[serde(default)]
    pub inputs: ValueMap,
    pub steps: Vec<StepRecord>,
    /// Free-text operator log. Never interpreted by the engine.
    #[serde(default)]
    pub notes: String,
}

impl JobDocument {
    /// Freeze a workflow definition into a new job with every step pending.
    pub fn new(
        job_id: impl Into<String>,
        workflow: &WorkflowDefinition,
        inputs: ValueMap,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            workflow: workflow.name.clone(),
            created_at: now,
            updated_at: now,
            status: JobStatus::Pending,
            key_inputs: workflow.key_inputs.clone(),
            inputs,
            steps: workflow.steps.iter().map(StepRecord::from_invocation).collect(),
            notes: String::new(),
        }
    }

    pub fn step(&self, id: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_mut(&mut self, id: &str) -> Option<&mut StepRecord> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    /// Definition-order index of a step instance.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == id)
    }

    /// Compute the job status from its step records.
    ///
    /// - `failed` if a required step failed and has not been rerun since
    /// - `running` if a step is running
    /// - `completed` if every step is completed, skipped, or an optional failure
    /// - `pending` otherwise
    pub fn derive_status(&self) -> JobStatus {
        if self
            .steps
            .iter()
            .any(|s| s.status == StepStatus::Failed && s.required)
        {
            JobStatus::Failed
        } else if self.steps.iter().any(|s| s.status == StepStatus::Running) {
            JobStatus::Running
        } else if self.steps.iter().all(StepRecord::is_settled) {
            JobStatus::Completed
        } else {
            JobStatus::Pending
        }
    }

    /// Recompute the derived status and bump `updated_at`.
    pub fn refresh(&mut self, now: DateTime<Utc>) {
        self.status = self.derive_status();
        self.updated_at = now;
    }

    /// Check structural invariants. Run on every load.
    pub fn validate(&self) -> Result<(), JobDocumentError> {
        if self.job_id.trim().is_empty() {
            return Err(JobDocumentError::EmptyJobId);
        }
        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                return Err(JobDocumentError::DuplicateStep(step.id.clone()));
            }
            step.validate()?;
        }
        Ok(())
    }

    /// Append a new pending step record.
    pub fn append_step(&mut self, inv: &StepInvocation) -> Result<(), JobDocumentError> {
        if self.step(&inv.id).is_some() {
            return Err(JobDocumentError::DuplicateStep(inv.id.clone()));
        }
        self.steps.push(StepRecord::from_invocation(inv));
        Ok(())
    }

    /// Append a timestamped line to the operator notes.
    pub fn add_note(&mut self, text: &str, now: DateTime<Utc>) {
        if !self.notes.is_empty() && !self.notes.ends_with('\n') {
            self.notes.push('\n');
        }
        self.notes
            .push_str(&format!("[{}] {}\n", now.format("%Y-%m-%d %H:%M:%S"), text.trim()));
    }

    /// Mark `running` records as interrupted failures.
    ///
    /// With `started_before = Some(cutoff)` only records whose attempt began
    /// before the cutoff are touched; `None` touches all of them. Returns the
    /// affected step ids.
    pub fn interrupt_running(
        &mut self,
        started_before: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Vec<String> {
        let mut interrupted = Vec::new();
        for step in &mut self.steps {
            if step.status != StepStatus::Running {
                continue;
            }
            let stale = match (started_before, step.started_at) {
                (None, _) | (Some(_), None) => true,
                (Some(cutoff), Some(started)) => started < cutoff,
            };
            if !stale {
                continue;
            }
            let owner = step.owner.clone().unwrap_or_else(|| "unknown".to_string());
            step.mark_failed(
                StepFailure {
                    kind: FailureKind::Interrupted,
                    step_name: step.step.clone(),
                    message: format!("interrupted while running (owner {owner})"),
                    at: now,
                },
                now,
            );
            interrupted.push(step.id.clone());
        }
        interrupted
    }

    /// First failed required step, if any.
    pub fn failed_step(&self) -> Option<&StepRecord> {
        self.steps
            .iter()
            .find(|s| s.status == StepStatus::Failed && s.required)
    }

    /// Job metadata exposed to `${job.*}` references and `skip_if` conditions.
    pub fn metadata(&self) -> Value {
        json!({
            "job_id": self.job_id,
            "workflow": self.workflow,
            "created_at": self.created_at.to_rfc3339(),
            "notes": self.notes,
        })
    }

    /// Lightweight summary for listings.
    pub fn summary(&self) -> JobSummary {
        let mut counts = StepCounts {
            total: self.steps.len(),
            ..StepCounts::default()
        };
        for step in &self.steps {
            match step.status {
                StepStatus::Pending => counts.pending += 1,
                StepStatus::Running => counts.running += 1,
                StepStatus::Completed => counts.completed += 1,
                StepStatus::Failed => counts.failed += 1,
                StepStatus::Skipped => counts.skipped += 1,
            }
        }

        let key_inputs = self
            .key_inputs
            .iter()
            .filter_map(|k| self.inputs.get(k).map(|v| (k.clone(), v.clone())))
            .collect();

        JobSummary {
            job_id: self.job_id.clone(),
            workflow: self.workflow.clone(),
            status: self.derive_status(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            key_inputs,
            steps: counts,
            failed_step: self.failed_step().map(|s| s.id.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

/// Per-status step counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCounts {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// What `list` shows without loading full documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: String,
    pub workflow: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub key_inputs: ValueMap,
    pub steps: StepCounts,
    #[serde(default)]
    pub failed_step: Option<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
