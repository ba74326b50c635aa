//! Workflow executor: sequential, checkpointed execution of a job's steps.
//!
//! Every operation reloads the job document, so hand edits between runs
//! are picked up. A run goes through these phases:
//!
//! 1. Claim the job id in the in-process in-flight map.
//! 2. Load the document and check every step name against the registry.
//! 3. Plan (reference graph, cycles, forward references). Nothing has been
//!    written up to this point.
//! 4. Settle leftover `running` records: fail stale ones as interrupted,
//!    refuse with `JobBusy` if a fresh one exists.
//! 5. For each scheduled step: evaluate `skip_if` -> resolve params ->
//!    checkpoint start -> execute -> checkpoint result.
//! 6. A failed required step halts the run. The failure is in the document.
//!    A step referencing a skipped or failed step fails without running.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use reelflow_types::ValueMap;
use reelflow_types::error::{StepError, StoreError};
use reelflow_types::event::JobEvent;
use reelflow_types::job::{FailureKind, JobDocument, JobStatus, StepStatus};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::event::bus::EventBus;
use crate::repository::job::JobRepository;
use crate::service::job::JobStore;
use crate::step::StepContext;
use crate::step::registry::{RegistryError, StepRegistry};

use super::checkpoint::{CheckpointError, CheckpointManager};
use super::condition::{ConditionEvaluator, ExpressionError};
use super::plan::{JobPlan, PlanningError, plan_job};
use super::resolver::{UnresolvedReferenceError, resolve_params};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// A `running` record older than this is considered abandoned (6 hours).
pub const DEFAULT_STALE_RUNNING_AFTER_SECS: u64 = 21_600;

// ---------------------------------------------------------------------------
// Options and modes
// ---------------------------------------------------------------------------

/// Tunables for a [`WorkflowExecutor`].
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Age after which a `running` record is failed as interrupted.
    pub stale_running_after: chrono::Duration,
    /// `host:pid` recorded on records this process marks `running`.
    pub owner: String,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            stale_running_after: chrono::Duration::seconds(DEFAULT_STALE_RUNNING_AFTER_SECS as i64),
            owner: process_owner(),
        }
    }
}

/// `host:pid` of the current process.
pub fn process_owner() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{host}:{}", std::process::id())
}

/// Which steps an executor invocation covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RunMode {
    /// Every pending or failed step, in dependency order.
    All,
    /// One step instance. Without `force`, a completed step is returned from cache.
    Step { step_id: String, force: bool },
    /// The given step and every step defined after it, regardless of status.
    From { step_id: String },
}

impl RunMode {
    fn target(&self) -> Option<&str> {
        match self {
            RunMode::All => None,
            RunMode::Step { step_id, .. } | RunMode::From { step_id } => Some(step_id),
        }
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// What happened to one step during a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepOutcome {
    pub step_id: String,
    pub step_name: String,
    pub result: StepResult,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum StepResult {
    Completed { output: ValueMap, duration_ms: u64 },
    /// Already completed; the step was not invoked.
    Cached { output: ValueMap },
    Skipped { condition: String },
    Failed { message: String, required: bool },
}

/// The required step that halted a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunFailure {
    pub step_id: String,
    pub step_name: String,
    pub message: String,
}

/// Result of one executor invocation.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub job_id: String,
    pub mode: RunMode,
    /// Job status after the run.
    pub status: JobStatus,
    pub outcomes: Vec<StepOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// Completed steps that depend on a force-rerun step and still hold
    /// output derived from its previous result.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stale_dependents: Vec<String>,
    /// Steps found abandoned in `running` and failed before this run.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub interrupted: Vec<String>,
}

impl RunReport {
    fn new(run_id: Uuid, job_id: &str, mode: RunMode) -> Self {
        Self {
            run_id,
            job_id: job_id.to_string(),
            mode,
            status: JobStatus::Pending,
            outcomes: Vec::new(),
            failure: None,
            warnings: Vec::new(),
            stale_dependents: Vec::new(),
            interrupted: Vec::new(),
        }
    }

    /// No required step failed during this run.
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }

    /// Output produced (or returned from cache) for a step in this run.
    pub fn output(&self, step_id: &str) -> Option<&ValueMap> {
        self.outcomes
            .iter()
            .filter(|o| o.step_id == step_id)
            .find_map(|o| match &o.result {
                StepResult::Completed { output, .. } | StepResult::Cached { output } => Some(output),
                _ => None,
            })
    }

    fn warn(&mut self, message: String) {
        tracing::warn!(job_id = %self.job_id, "{message}");
        self.warnings.push(message);
    }
}

/// Result of one job within [`WorkflowExecutor::run_batch`].
#[derive(Debug)]
pub struct BatchOutcome {
    pub job_id: String,
    pub result: Result<RunReport, ExecutorError>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A step's own failure, wrapped with the instance that produced it.
#[derive(Debug, thiserror::Error)]
#[error("step '{instance_id}' ({step_name}) failed: {source}")]
pub struct StepExecutionError {
    pub instance_id: String,
    pub step_name: String,
    #[source]
    pub source: StepError,
}

/// Errors that abort an executor invocation.
///
/// Step failures are not in here: they are recorded in the document and
/// surface through [`RunReport::failure`].
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("planning error: {0}")]
    Planning(#[from] PlanningError),

    #[error(transparent)]
    Unresolved(#[from] UnresolvedReferenceError),

    #[error("job '{job_id}' has no step '{step_id}'")]
    UnknownInstance { job_id: String, step_id: String },

    /// Another invocation in this process is working on the job.
    #[error("job '{0}' is already running in this process")]
    AlreadyRunning(String),

    /// A recent `running` record suggests another process owns the job.
    #[error("job '{job_id}' is busy: step '{step_id}' running on {owner} since {since}")]
    JobBusy {
        job_id: String,
        step_id: String,
        owner: String,
        since: DateTime<Utc>,
    },

    #[error("task error: {0}")]
    Task(String),
}

// ---------------------------------------------------------------------------
// WorkflowExecutor
// ---------------------------------------------------------------------------

/// Sequential step executor with per-transition checkpointing.
///
/// Generic over `R: JobRepository` for storage flexibility.
pub struct WorkflowExecutor<R: JobRepository> {
    checkpoint: CheckpointManager<R>,
    registry: Arc<StepRegistry>,
    event_bus: EventBus,
    options: ExecutorOptions,
    /// Run ids of in-flight invocations keyed by job id.
    in_flight: DashMap<String, Uuid>,
}

impl<R: JobRepository> WorkflowExecutor<R> {
    pub fn new(store: Arc<JobStore<R>>, registry: Arc<StepRegistry>, event_bus: EventBus) -> Self {
        Self {
            checkpoint: CheckpointManager::new(store),
            registry,
            event_bus,
            options: ExecutorOptions::default(),
            in_flight: DashMap::new(),
        }
    }

    pub fn with_options(mut self, options: ExecutorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn store(&self) -> &Arc<JobStore<R>> {
        self.checkpoint.store()
    }

    pub fn registry(&self) -> &Arc<StepRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn options(&self) -> &ExecutorOptions {
        &self.options
    }

    /// Run every pending (or previously failed) step in dependency order.
    pub async fn run_all(&self, job_id: &str) -> Result<RunReport, ExecutorError> {
        self.run(job_id, RunMode::All).await
    }

    /// Run a single step instance.
    ///
    /// A completed step is returned from cache unless `force` is set. A
    /// forced rerun bypasses `skip_if` and never touches dependents; they
    /// are listed in [`RunReport::stale_dependents`] instead.
    pub async fn run_step(
        &self,
        job_id: &str,
        step_id: &str,
        force: bool,
    ) -> Result<RunReport, ExecutorError> {
        self.run(
            job_id,
            RunMode::Step {
                step_id: step_id.to_string(),
                force,
            },
        )
        .await
    }

    /// Run `step_id` and every step defined after it.
    pub async fn run_from(&self, job_id: &str, step_id: &str) -> Result<RunReport, ExecutorError> {
        self.run(
            job_id,
            RunMode::From {
                step_id: step_id.to_string(),
            },
        )
        .await
    }

    pub async fn run(&self, job_id: &str, mode: RunMode) -> Result<RunReport, ExecutorError> {
        let run_id = Uuid::now_v7();
        let _guard = self.claim(job_id, run_id)?;

        let mut job = self.store().load(job_id).await?;
        for record in &job.steps {
            self.registry.get(&record.step)?;
        }
        let plan = plan_job(&job)?;

        if let Some(target) = mode.target() {
            if job.step(target).is_none() {
                return Err(ExecutorError::UnknownInstance {
                    job_id: job_id.to_string(),
                    step_id: target.to_string(),
                });
            }
        }

        let mut report = RunReport::new(run_id, job_id, mode.clone());

        if let RunMode::Step {
            step_id,
            force: false,
        } = &mode
        {
            if let Some(output) = cached_output(&job, step_id) {
                tracing::info!(job_id, step_id = %step_id, "step already completed, returning cached output");
                self.event_bus.publish(JobEvent::StepCached {
                    job_id: job_id.to_string(),
                    step_id: step_id.clone(),
                });
                report.outcomes.push(StepOutcome {
                    step_id: step_id.clone(),
                    step_name: step_name_of(&job, step_id),
                    result: StepResult::Cached { output },
                });
                report.status = job.derive_status();
                return Ok(report);
            }
        }

        report.interrupted = self.settle_running(&mut job).await?;

        let forced = matches!(mode, RunMode::Step { force: true, .. });
        if let RunMode::Step {
            step_id,
            force: true,
        } = &mode
        {
            report.stale_dependents = plan
                .dependents(step_id)
                .into_iter()
                .filter(|id| job.step(id).is_some_and(|s| s.status == StepStatus::Completed))
                .map(str::to_string)
                .collect();
        }

        let scheduled = schedule(&job, &plan, &mode);
        tracing::info!(
            run_id = %run_id,
            job_id,
            mode = ?mode,
            scheduled = scheduled.len(),
            "starting run"
        );
        self.event_bus.publish(JobEvent::RunStarted {
            job_id: job_id.to_string(),
            run_id,
            scheduled: scheduled.clone(),
        });

        for step_id in &scheduled {
            let halt = self.execute_step(&mut job, step_id, forced, &mut report).await?;
            if halt {
                break;
            }
        }

        report.status = job.derive_status();
        self.event_bus.publish(JobEvent::RunFinished {
            job_id: job_id.to_string(),
            run_id,
            status: report.status,
        });
        tracing::info!(
            run_id = %run_id,
            job_id,
            status = %report.status,
            steps = report.outcomes.len(),
            "run finished"
        );

        Ok(report)
    }

    /// Execute one scheduled step. Returns `true` if the run must halt.
    async fn execute_step(
        &self,
        job: &mut JobDocument,
        step_id: &str,
        forced: bool,
        report: &mut RunReport,
    ) -> Result<bool, ExecutorError> {
        let record = job
            .step(step_id)
            .ok_or_else(|| ExecutorError::UnknownInstance {
                job_id: job.job_id.clone(),
                step_id: step_id.to_string(),
            })?;
        let step_name = record.step.clone();
        let required = record.required;
        let was_completed = record.status == StepStatus::Completed;
        let declared = record.declared_params.clone();
        let skip_if = record.skip_if.clone();
        let outputs = record.outputs.clone();

        // Evaluate skip condition
        if let Some(condition) = skip_if.filter(|_| !forced) {
            match should_skip(&condition, job) {
                Ok(true) => {
                    self.checkpoint.checkpoint_step_skipped(job, step_id).await?;
                    self.event_bus.publish(JobEvent::StepSkipped {
                        job_id: job.job_id.clone(),
                        step_id: step_id.to_string(),
                        condition: condition.clone(),
                    });
                    tracing::info!(job_id = %job.job_id, step_id, condition = %condition, "step skipped");
                    report.outcomes.push(StepOutcome {
                        step_id: step_id.to_string(),
                        step_name,
                        result: StepResult::Skipped { condition },
                    });
                    return Ok(false);
                }
                Ok(false) => {}
                Err(e) => report.warn(format!(
                    "step '{step_id}': skip_if '{condition}' could not be evaluated ({e}), running the step"
                )),
            }
        }

        let params = match resolve_params(step_id, &declared, job) {
            Ok(params) => params,
            // A skipped or failed dependency is this step's failure. Anything
            // else (a pending target after a hand edit) aborts before writing.
            Err(e) if e.is_dependency_failure() => {
                let message = e.to_string();
                let failure = Failure {
                    step_name,
                    required,
                    kind: FailureKind::Dependency,
                    detail: message.clone(),
                    message,
                };
                return self.record_failure(job, step_id, failure, report).await;
            }
            Err(e) => return Err(e.into()),
        };
        let step = self.registry.get(&step_name)?;

        if was_completed && !step.idempotent() {
            report.warn(format!(
                "step '{step_id}' ({step_name}) is not idempotent and already completed, executing it again"
            ));
        }

        let attempt = self
            .checkpoint
            .checkpoint_step_start(job, step_id, params.clone(), &self.options.owner)
            .await?;
        self.event_bus.publish(JobEvent::StepStarted {
            job_id: job.job_id.clone(),
            step_id: step_id.to_string(),
            step_name: step_name.clone(),
            attempt,
        });
        tracing::info!(job_id = %job.job_id, step_id, step_name = %step_name, attempt, "step started");

        let ctx = StepContext {
            job_id: job.job_id.clone(),
            step_id: step_id.to_string(),
            job_dir: self.store().job_dir(&job.job_id),
            attempt,
        };
        let start = Instant::now();
        let result = step.execute(&ctx, params).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(raw) => {
                let output = project_outputs(step_id, raw, outputs.as_ref(), report);
                self.checkpoint
                    .checkpoint_step_complete(job, step_id, output.clone())
                    .await?;
                self.event_bus.publish(JobEvent::StepCompleted {
                    job_id: job.job_id.clone(),
                    step_id: step_id.to_string(),
                    duration_ms,
                });
                tracing::info!(job_id = %job.job_id, step_id, duration_ms, "step completed");
                report.outcomes.push(StepOutcome {
                    step_id: step_id.to_string(),
                    step_name,
                    result: StepResult::Completed {
                        output,
                        duration_ms,
                    },
                });
                Ok(false)
            }
            Err(source) => {
                let err = StepExecutionError {
                    instance_id: step_id.to_string(),
                    step_name: step_name.clone(),
                    source,
                };
                let failure = Failure {
                    step_name,
                    required,
                    kind: FailureKind::Execution,
                    message: err.source.to_string(),
                    detail: err.to_string(),
                };
                self.record_failure(job, step_id, failure, report).await
            }
        }
    }

    /// Persist a step failure and add it to the report. Returns `true` if
    /// the run must halt.
    async fn record_failure(
        &self,
        job: &mut JobDocument,
        step_id: &str,
        failure: Failure,
        report: &mut RunReport,
    ) -> Result<bool, ExecutorError> {
        let Failure {
            step_name,
            required,
            kind,
            message,
            detail,
        } = failure;

        self.checkpoint
            .checkpoint_step_failed(job, step_id, kind, &message)
            .await?;
        self.event_bus.publish(JobEvent::StepFailed {
            job_id: job.job_id.clone(),
            step_id: step_id.to_string(),
            error: detail.clone(),
            required,
        });
        tracing::warn!(job_id = %job.job_id, step_id, error = %detail, ?kind, required, "step failed");
        report.outcomes.push(StepOutcome {
            step_id: step_id.to_string(),
            step_name: step_name.clone(),
            result: StepResult::Failed {
                message: message.clone(),
                required,
            },
        });
        if required {
            report.failure = Some(RunFailure {
                step_id: step_id.to_string(),
                step_name,
                message,
            });
        }
        Ok(required)
    }

    /// Deal with `running` records left behind by an earlier process.
    async fn settle_running(&self, job: &mut JobDocument) -> Result<Vec<String>, ExecutorError> {
        let cutoff = Utc::now()
            .checked_sub_signed(self.options.stale_running_after)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let busy = job.steps.iter().find_map(|s| match s.started_at {
            Some(since) if s.status == StepStatus::Running && since >= cutoff => Some((s, since)),
            _ => None,
        });
        if let Some((record, since)) = busy {
            return Err(ExecutorError::JobBusy {
                job_id: job.job_id.clone(),
                step_id: record.id.clone(),
                owner: record.owner.clone().unwrap_or_else(|| "unknown".to_string()),
                since,
            });
        }

        let interrupted = self.checkpoint.checkpoint_interrupted(job, cutoff).await?;
        if !interrupted.is_empty() {
            tracing::warn!(job_id = %job.job_id, steps = ?interrupted, "failed stale running steps as interrupted");
        }
        Ok(interrupted)
    }

    fn claim(&self, job_id: &str, run_id: Uuid) -> Result<InFlightGuard<'_>, ExecutorError> {
        match self.in_flight.entry(job_id.to_string()) {
            Entry::Occupied(_) => Err(ExecutorError::AlreadyRunning(job_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(run_id);
                Ok(InFlightGuard {
                    map: &self.in_flight,
                    job_id: job_id.to_string(),
                })
            }
        }
    }
}

impl<R: JobRepository + 'static> WorkflowExecutor<R> {
    /// Run `run_all` for many jobs, at most `concurrency` at a time.
    ///
    /// Outcomes are returned in the order of `job_ids`.
    pub async fn run_batch(self: &Arc<Self>, job_ids: Vec<String>, concurrency: usize) -> Vec<BatchOutcome> {
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut join_set = JoinSet::new();

        for (idx, job_id) in job_ids.iter().cloned().enumerate() {
            let executor = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            join_set.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => executor.run_all(&job_id).await,
                    Err(e) => Err(ExecutorError::Task(e.to_string())),
                };
                (idx, result)
            });
        }

        let mut results: Vec<Option<Result<RunReport, ExecutorError>>> =
            job_ids.iter().map(|_| None).collect();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((idx, result)) => results[idx] = Some(result),
                Err(e) => tracing::error!(error = %e, "batch task join error"),
            }
        }

        job_ids
            .into_iter()
            .zip(results)
            .map(|(job_id, result)| BatchOutcome {
                job_id,
                result: result.unwrap_or_else(|| Err(ExecutorError::Task("task did not finish".to_string()))),
            })
            .collect()
    }
}

/// A step failure about to be recorded.
struct Failure {
    step_name: String,
    required: bool,
    kind: FailureKind,
    /// Stored on the record and in the report.
    message: String,
    /// Published on the bus and logged.
    detail: String,
}

/// Releases the in-flight claim on drop.
struct InFlightGuard<'a> {
    map: &'a DashMap<String, Uuid>,
    job_id: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.job_id);
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Step ids a run covers, in execution order.
fn schedule(job: &JobDocument, plan: &JobPlan, mode: &RunMode) -> Vec<String> {
    match mode {
        RunMode::All => plan
            .order()
            .filter(|id| {
                job.step(id)
                    .is_some_and(|s| matches!(s.status, StepStatus::Pending | StepStatus::Failed))
            })
            .map(str::to_string)
            .collect(),
        RunMode::Step { step_id, .. } => vec![step_id.clone()],
        RunMode::From { step_id } => {
            let start = job.position(step_id).unwrap_or(job.steps.len());
            plan.order()
                .filter(|id| job.position(id).is_some_and(|p| p >= start))
                .map(str::to_string)
                .collect()
        }
    }
}

fn cached_output(job: &JobDocument, step_id: &str) -> Option<ValueMap> {
    job.step(step_id)
        .filter(|s| s.status == StepStatus::Completed)
        .and_then(|s| s.output.clone())
}

fn step_name_of(job: &JobDocument, step_id: &str) -> String {
    job.step(step_id).map(|s| s.step.clone()).unwrap_or_default()
}

/// The jexl evaluator is not `Send`, so it never lives across an await.
fn should_skip(condition: &str, job: &JobDocument) -> Result<bool, ExpressionError> {
    ConditionEvaluator::new().evaluate_for_job(condition, job)
}

/// Apply a step's `outputs` projection (`alias -> result key`).
fn project_outputs(
    step_id: &str,
    raw: ValueMap,
    outputs: Option<&std::collections::BTreeMap<String, String>>,
    report: &mut RunReport,
) -> ValueMap {
    let Some(outputs) = outputs else {
        return raw;
    };
    let mut projected = ValueMap::new();
    for (alias, key) in outputs {
        match raw.get(key) {
            Some(value) => {
                projected.insert(alias.clone(), value.clone());
            }
            None => report.warn(format!(
                "step '{step_id}': output key '{key}' (alias '{alias}') missing from result"
            )),
        }
    }
    projected
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::InMemoryJobRepository;
    use crate::step::Step;
    use crate::step::box_step::BoxStep;
    use reelflow_types::workflow::{StepInvocation, WorkflowDefinition};
    use serde_json::{Value, json};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;

    type Log = Arc<Mutex<Vec<(String, ValueMap)>>>;
    type Script = Arc<dyn Fn(&ValueMap) -> Result<ValueMap, StepError> + Send + Sync>;

    fn map(v: Value) -> ValueMap {
        serde_json::from_value(v).unwrap()
    }

    fn script(f: impl Fn(&ValueMap) -> Result<ValueMap, StepError> + Send + Sync + 'static) -> Script {
        Arc::new(f)
    }

    /// Logs every invocation and answers from a script.
    struct ScriptedStep {
        name: String,
        idempotent: bool,
        script: Script,
        log: Log,
    }

    impl Step for ScriptedStep {
        fn idempotent(&self) -> bool {
            self.idempotent
        }

        async fn execute(&self, _ctx: &StepContext, params: ValueMap) -> Result<ValueMap, StepError> {
            self.log.lock().unwrap().push((self.name.clone(), params.clone()));
            (self.script)(&params)
        }
    }

    struct Harness {
        executor: Arc<WorkflowExecutor<InMemoryJobRepository>>,
        log: Log,
    }

    impl Harness {
        fn new(steps: Vec<(&str, bool, Script)>) -> Self {
            Self::with_options(steps, ExecutorOptions::default())
        }

        fn with_options(steps: Vec<(&str, bool, Script)>, options: ExecutorOptions) -> Self {
            let log: Log = Arc::default();
            let entries = steps.into_iter().map(|(name, idempotent, script)| {
                let step = ScriptedStep {
                    name: name.to_string(),
                    idempotent,
                    script,
                    log: Arc::clone(&log),
                };
                (name.to_string(), BoxStep::new(step))
            });
            let registry = StepRegistry::from_entries(entries).unwrap();
            let store = Arc::new(JobStore::new(InMemoryJobRepository::new()));
            let executor =
                WorkflowExecutor::new(store, Arc::new(registry), EventBus::default()).with_options(options);
            Self {
                executor: Arc::new(executor),
                log,
            }
        }

        fn store(&self) -> &Arc<JobStore<InMemoryJobRepository>> {
            self.executor.store()
        }

        fn calls(&self, name: &str) -> Vec<ValueMap> {
            self.log
                .lock()
                .unwrap()
                .iter()
                .filter(|(n, _)| n == name)
                .map(|(_, p)| p.clone())
                .collect()
        }

        fn call_order(&self) -> Vec<String> {
            self.log.lock().unwrap().iter().map(|(n, _)| n.clone()).collect()
        }

        async fn create(&self, def: &WorkflowDefinition, inputs: Value) -> String {
            self.store().create(def, map(inputs)).await.unwrap().job_id
        }

        async fn job(&self, job_id: &str) -> JobDocument {
            self.store().load(job_id).await.unwrap()
        }
    }

    fn pipeline_steps(transcribe_broken: Arc<AtomicBool>) -> Vec<(&'static str, bool, Script)> {
        vec![
            (
                "download",
                true,
                script(|p| Ok(map(json!({"file": "a.mp4", "source": p["url"].clone()})))),
            ),
            (
                "transcribe",
                true,
                script(move |p| {
                    if transcribe_broken.load(Ordering::SeqCst) {
                        return Err(StepError::failed("whisper crashed"));
                    }
                    let file = p["file"].as_str().unwrap_or_default();
                    Ok(map(json!({"text": format!("words from {file}")})))
                }),
            ),
            ("insights", true, script(|_| Ok(map(json!({"clips": 3}))))),
        ]
    }

    fn pipeline() -> WorkflowDefinition {
        WorkflowDefinition {
            name: "clips".into(),
            description: None,
            key_inputs: vec![],
            workspace_dirs: vec![],
            steps: vec![
                StepInvocation::new("download", "download", map(json!({"url": "${input.source}"}))),
                StepInvocation::new("transcribe", "transcribe", map(json!({"file": "${download.file}"}))),
                StepInvocation::new("insights", "insights", map(json!({"transcript": "${transcribe.text}"}))),
            ],
        }
    }

    fn pipeline_harness() -> (Harness, Arc<AtomicBool>) {
        let broken = Arc::new(AtomicBool::new(false));
        (Harness::new(pipeline_steps(Arc::clone(&broken))), broken)
    }

    #[tokio::test]
    async fn scenario_download_transcribe_insights() {
        let (h, _) = pipeline_harness();
        let job_id = h.create(&pipeline(), json!({"source": "X"})).await;

        let report = h.executor.run_all(&job_id).await.unwrap();
        assert!(report.succeeded());
        assert_eq!(report.status, JobStatus::Completed);

        let job = h.job(&job_id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.step("download").unwrap().params["url"], "X");
        let text = job.step("transcribe").unwrap().output.as_ref().unwrap()["text"].clone();
        assert_eq!(text, json!("words from a.mp4"));
        assert_eq!(job.step("insights").unwrap().params["transcript"], text);
        assert_eq!(report.output("insights"), Some(&map(json!({"clips": 3}))));
    }

    #[tokio::test]
    async fn dependency_ordering() {
        let (h, _) = pipeline_harness();
        let job_id = h.create(&pipeline(), json!({"source": "X"})).await;
        h.executor.run_all(&job_id).await.unwrap();
        assert_eq!(h.call_order(), vec!["download", "transcribe", "insights"]);
    }

    #[tokio::test]
    async fn run_step_with_unmet_dependency_writes_nothing() {
        let (h, _) = pipeline_harness();
        let job_id = h.create(&pipeline(), json!({"source": "X"})).await;

        let err = h.executor.run_step(&job_id, "transcribe", false).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Unresolved(ref e) if e.step == "transcribe"));
        assert!(h.call_order().is_empty());
        assert_eq!(h.store().repo().history().await.len(), 1);
    }

    #[tokio::test]
    async fn idempotent_skip_returns_cached_output() {
        let (h, _) = pipeline_harness();
        let job_id = h.create(&pipeline(), json!({"source": "X"})).await;
        h.executor.run_all(&job_id).await.unwrap();
        let writes = h.store().repo().history().await.len();

        let first = h.executor.run_step(&job_id, "download", false).await.unwrap();
        let second = h.executor.run_step(&job_id, "download", false).await.unwrap();

        assert_eq!(first.output("download"), second.output("download"));
        assert!(matches!(first.outcomes[0].result, StepResult::Cached { .. }));
        assert_eq!(h.calls("download").len(), 1);
        assert_eq!(h.store().repo().history().await.len(), writes);
    }

    #[tokio::test]
    async fn cycle_rejected_before_any_step_runs() {
        let (h, _) = pipeline_harness();
        let def = WorkflowDefinition {
            name: "loop".into(),
            description: None,
            key_inputs: vec![],
            workspace_dirs: vec![],
            steps: vec![
                StepInvocation::new("download", "download", map(json!({"x": "${transcribe.text}"}))),
                StepInvocation::new("transcribe", "transcribe", map(json!({"file": "${download.file}"}))),
            ],
        };
        // Hand-edited document; creation would have refused it.
        let job = JobDocument::new("loop_job", &def, ValueMap::new(), Utc::now());
        h.store().repo().overwrite(job.clone()).await;

        let err = h.executor.run_all("loop_job").await.unwrap_err();
        assert!(matches!(err, ExecutorError::Planning(PlanningError::CycleDetected(_))));
        assert!(h.call_order().is_empty());
        assert!(h.store().repo().history().await.is_empty());
        assert_eq!(h.job("loop_job").await, job);
    }

    #[tokio::test]
    async fn persisted_after_every_step() {
        let (h, _) = pipeline_harness();
        let job_id = h.create(&pipeline(), json!({"source": "X"})).await;
        h.executor.run_all(&job_id).await.unwrap();

        let history = h.store().repo().history().await;
        let statuses: Vec<Vec<StepStatus>> = history
            .iter()
            .map(|doc| doc.steps.iter().map(|s| s.status).collect())
            .collect();

        use StepStatus::*;
        assert_eq!(
            statuses,
            vec![
                vec![Pending, Pending, Pending],
                vec![Running, Pending, Pending],
                vec![Completed, Pending, Pending],
                vec![Completed, Running, Pending],
                vec![Completed, Completed, Pending],
                vec![Completed, Completed, Running],
                vec![Completed, Completed, Completed],
            ]
        );
    }

    #[tokio::test]
    async fn resume_from_failed_step() {
        let (h, broken) = pipeline_harness();
        let job_id = h.create(&pipeline(), json!({"source": "X"})).await;

        broken.store(true, Ordering::SeqCst);
        let report = h.executor.run_all(&job_id).await.unwrap();
        let failure = report.failure.clone().unwrap();
        assert_eq!(failure.step_id, "transcribe");
        assert_eq!(failure.message, "whisper crashed");
        assert_eq!(report.status, JobStatus::Failed);

        let failed = h.job(&job_id).await;
        assert_eq!(failed.step("insights").unwrap().status, StepStatus::Pending);
        let download_output = failed.step("download").unwrap().output.clone();

        broken.store(false, Ordering::SeqCst);
        let report = h.executor.run_from(&job_id, "transcribe").await.unwrap();
        assert!(report.succeeded());

        let job = h.job(&job_id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.step("download").unwrap().output, download_output);
        assert_eq!(job.step("transcribe").unwrap().attempts, 2);
        assert_eq!(h.calls("download").len(), 1);
    }

    #[tokio::test]
    async fn run_all_retries_failed_steps() {
        let (h, broken) = pipeline_harness();
        let job_id = h.create(&pipeline(), json!({"source": "X"})).await;

        broken.store(true, Ordering::SeqCst);
        h.executor.run_all(&job_id).await.unwrap();
        broken.store(false, Ordering::SeqCst);
        let report = h.executor.run_all(&job_id).await.unwrap();

        assert!(report.succeeded());
        assert_eq!(h.call_order(), vec!["download", "transcribe", "transcribe", "insights"]);
    }

    #[tokio::test]
    async fn forced_rerun_does_not_cascade() {
        let (h, _) = pipeline_harness();
        let job_id = h.create(&pipeline(), json!({"source": "X"})).await;
        h.executor.run_all(&job_id).await.unwrap();
        let before = h.job(&job_id).await;

        let mut edited = before.clone();
        edited.inputs.insert("source".into(), json!("Y"));
        h.store().save(&mut edited).await.unwrap();

        let report = h.executor.run_step(&job_id, "download", true).await.unwrap();
        assert_eq!(report.stale_dependents, vec!["transcribe", "insights"]);

        let after = h.job(&job_id).await;
        assert_eq!(after.step("download").unwrap().output.as_ref().unwrap()["source"], "Y");
        assert_eq!(after.step("download").unwrap().attempts, 2);
        for id in ["transcribe", "insights"] {
            assert_eq!(after.step(id).unwrap().status, StepStatus::Completed);
            assert_eq!(after.step(id).unwrap().output, before.step(id).unwrap().output);
        }
        assert_eq!(h.calls("transcribe").len(), 1);
    }

    #[tokio::test]
    async fn non_idempotent_rerun_warns() {
        let h = Harness::new(vec![(
            "upload",
            false,
            script(|_| Ok(map(json!({"url": "https://cdn/x"})))),
        )]);
        let def = WorkflowDefinition {
            name: "publish".into(),
            description: None,
            key_inputs: vec![],
            workspace_dirs: vec![],
            steps: vec![StepInvocation::new("upload", "upload", ValueMap::new())],
        };
        let job_id = h.create(&def, json!({})).await;

        let first = h.executor.run_all(&job_id).await.unwrap();
        assert!(first.warnings.is_empty());
        let rerun = h.executor.run_from(&job_id, "upload").await.unwrap();
        assert_eq!(rerun.warnings.len(), 1);
        assert!(rerun.warnings[0].contains("not idempotent"));
        assert_eq!(h.calls("upload").len(), 2);
    }

    #[tokio::test]
    async fn skip_if_marks_step_skipped() {
        let (h, _) = pipeline_harness();
        let mut def = pipeline();
        def.steps[2].skip_if = Some("inputs.quick == true".into());
        let job_id = h.create(&def, json!({"source": "X", "quick": true})).await;

        let report = h.executor.run_all(&job_id).await.unwrap();
        assert!(matches!(report.outcomes[2].result, StepResult::Skipped { .. }));
        assert!(h.calls("insights").is_empty());

        let job = h.job(&job_id).await;
        assert_eq!(job.step("insights").unwrap().status, StepStatus::Skipped);
        assert_eq!(job.status, JobStatus::Completed);

        // A forced rerun ignores the condition.
        h.executor.run_step(&job_id, "insights", true).await.unwrap();
        assert_eq!(h.calls("insights").len(), 1);
    }

    #[tokio::test]
    async fn broken_skip_if_warns_and_runs() {
        let (h, _) = pipeline_harness();
        let mut def = pipeline();
        def.steps[0].skip_if = Some("((".into());
        let job_id = h.create(&def, json!({"source": "X"})).await;

        let report = h.executor.run_all(&job_id).await.unwrap();
        assert!(report.succeeded());
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(h.calls("download").len(), 1);
    }

    #[tokio::test]
    async fn optional_failure_does_not_halt() {
        let mut steps = pipeline_steps(Arc::new(AtomicBool::new(false)));
        steps.push(("thumbnail", true, script(|_| Err(StepError::failed("no frames")))));
        let h = Harness::new(steps);

        let mut def = pipeline();
        let mut thumbnail = StepInvocation::new("thumbnail", "thumbnail", ValueMap::new());
        thumbnail.required = false;
        def.steps.insert(1, thumbnail);
        let job_id = h.create(&def, json!({"source": "X"})).await;

        let report = h.executor.run_all(&job_id).await.unwrap();
        assert!(report.succeeded());
        assert!(matches!(
            report.outcomes[1].result,
            StepResult::Failed { required: false, .. }
        ));

        let job = h.job(&job_id).await;
        assert_eq!(job.step("thumbnail").unwrap().status, StepStatus::Failed);
        assert_eq!(job.step("insights").unwrap().status, StepStatus::Completed);
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn reference_to_skipped_step_fails_the_dependent() {
        let (h, _) = pipeline_harness();
        let mut def = pipeline();
        def.steps[1].skip_if = Some("inputs.quick == true".into());
        let job_id = h.create(&def, json!({"source": "X", "quick": true})).await;

        let report = h.executor.run_all(&job_id).await.unwrap();
        assert!(!report.succeeded());
        assert_eq!(report.status, JobStatus::Failed);
        let failure = report.failure.as_ref().unwrap();
        assert_eq!(failure.step_id, "insights");
        assert!(failure.message.contains("transcribe"));
        let outcome = report.outcomes.iter().find(|o| o.step_id == "insights").unwrap();
        assert!(matches!(outcome.result, StepResult::Failed { required: true, .. }));
        assert!(h.calls("insights").is_empty());

        let job = h.job(&job_id).await;
        assert_eq!(job.status, JobStatus::Failed);
        let insights = job.step("insights").unwrap();
        assert_eq!(insights.status, StepStatus::Failed);
        assert_eq!(insights.error.as_ref().unwrap().kind, FailureKind::Dependency);
    }

    #[tokio::test]
    async fn reference_to_optional_failed_step_fails_the_dependent() {
        let mut steps = pipeline_steps(Arc::new(AtomicBool::new(false)));
        steps.push(("thumbnail", true, script(|_| Err(StepError::failed("no frames")))));
        steps.push(("publish", true, script(|_| Ok(map(json!({"ok": true}))))));
        let h = Harness::new(steps);

        let mut def = pipeline();
        let mut thumbnail = StepInvocation::new("thumbnail", "thumbnail", ValueMap::new());
        thumbnail.required = false;
        let mut publish = StepInvocation::new("publish", "publish", map(json!({"cover": "${thumbnail.path}"})));
        publish.required = false;
        def.steps.insert(1, thumbnail);
        def.steps.insert(2, publish);
        let job_id = h.create(&def, json!({"source": "X"})).await;

        // An optional dependent records the failure and the run carries on.
        let report = h.executor.run_all(&job_id).await.unwrap();
        assert!(report.succeeded());
        let outcome = report.outcomes.iter().find(|o| o.step_id == "publish").unwrap();
        assert!(matches!(outcome.result, StepResult::Failed { required: false, .. }));
        assert!(h.calls("publish").is_empty());

        let job = h.job(&job_id).await;
        let publish = job.step("publish").unwrap();
        assert_eq!(publish.status, StepStatus::Failed);
        assert_eq!(publish.error.as_ref().unwrap().kind, FailureKind::Dependency);
        assert_eq!(job.step("insights").unwrap().status, StepStatus::Completed);
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn outputs_projection() {
        let (h, _) = pipeline_harness();
        let mut def = pipeline();
        def.steps[0].outputs = Some(
            [("file".to_string(), "file".to_string()), ("origin".to_string(), "nope".to_string())]
                .into_iter()
                .collect(),
        );
        let job_id = h.create(&def, json!({"source": "X"})).await;

        let report = h.executor.run_all(&job_id).await.unwrap();
        assert_eq!(report.warnings.len(), 1);
        let job = h.job(&job_id).await;
        assert_eq!(job.step("download").unwrap().output, Some(map(json!({"file": "a.mp4"}))));
        assert_eq!(job.status, JobStatus::Completed);
    }

    async fn leave_running(h: &Harness, job_id: &str, started: DateTime<Utc>) {
        let mut job = h.job(job_id).await;
        job.steps[0].mark_running(ValueMap::new(), "render-box:7", started);
        h.store().save(&mut job).await.unwrap();
    }

    #[tokio::test]
    async fn fresh_running_record_means_busy() {
        let (h, _) = pipeline_harness();
        let job_id = h.create(&pipeline(), json!({"source": "X"})).await;
        leave_running(&h, &job_id, Utc::now() - chrono::Duration::seconds(5)).await;

        let err = h.executor.run_all(&job_id).await.unwrap_err();
        match err {
            ExecutorError::JobBusy { step_id, owner, .. } => {
                assert_eq!(step_id, "download");
                assert_eq!(owner, "render-box:7");
            }
            other => panic!("expected JobBusy, got {other:?}"),
        }
        assert!(h.call_order().is_empty());
    }

    #[tokio::test]
    async fn stale_running_record_is_interrupted_and_rerun() {
        let broken = Arc::new(AtomicBool::new(false));
        let h = Harness::with_options(
            pipeline_steps(broken),
            ExecutorOptions {
                stale_running_after: chrono::Duration::zero(),
                owner: "test:1".into(),
            },
        );
        let job_id = h.create(&pipeline(), json!({"source": "X"})).await;
        leave_running(&h, &job_id, Utc::now() - chrono::Duration::seconds(5)).await;

        let report = h.executor.run_all(&job_id).await.unwrap();
        assert_eq!(report.interrupted, vec!["download"]);
        assert!(report.succeeded());

        let job = h.job(&job_id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.step("download").unwrap().attempts, 2);
    }

    #[tokio::test]
    async fn unknown_step_name_and_instance() {
        let (h, _) = pipeline_harness();
        let mut def = pipeline();
        def.steps[2].step = "summarize".into();
        let job_id = h.create(&def, json!({"source": "X"})).await;

        let err = h.executor.run_all(&job_id).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Registry(RegistryError::UnknownStep(ref n)) if n == "summarize"));
        assert!(h.call_order().is_empty());

        let job_id = h.create(&pipeline(), json!({"source": "X"})).await;
        let err = h.executor.run_step(&job_id, "ghost", false).await.unwrap_err();
        assert!(matches!(err, ExecutorError::UnknownInstance { .. }));
    }

    #[tokio::test]
    async fn events_follow_the_run() {
        let (h, _) = pipeline_harness();
        let job_id = h.create(&pipeline(), json!({"source": "X"})).await;
        let mut events = h.executor.events().subscribe_job(&job_id);

        h.executor.run_all(&job_id).await.unwrap();

        let mut kinds = Vec::new();
        while let Some(event) = events.try_next() {
            assert_eq!(event.job_id(), job_id);
            let value = serde_json::to_value(&event).unwrap();
            kinds.push(value["type"].as_str().unwrap().to_string());
        }
        assert_eq!(
            kinds,
            vec![
                "run_started",
                "step_started",
                "step_completed",
                "step_started",
                "step_completed",
                "step_started",
                "step_completed",
                "run_finished",
            ]
        );
    }

    struct GateStep {
        entered: Arc<Notify>,
        release: Arc<Notify>,
    }

    impl Step for GateStep {
        async fn execute(&self, _ctx: &StepContext, params: ValueMap) -> Result<ValueMap, StepError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(params)
        }
    }

    #[tokio::test]
    async fn concurrent_run_on_same_job_is_refused() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let gate = GateStep {
            entered: Arc::clone(&entered),
            release: Arc::clone(&release),
        };
        let registry = StepRegistry::from_entries([("gate".to_string(), BoxStep::new(gate))]).unwrap();
        let store = Arc::new(JobStore::new(InMemoryJobRepository::new()));
        let executor = Arc::new(WorkflowExecutor::new(store, Arc::new(registry), EventBus::default()));

        let def = WorkflowDefinition {
            name: "gated".into(),
            description: None,
            key_inputs: vec![],
            workspace_dirs: vec![],
            steps: vec![StepInvocation::new("wait", "gate", ValueMap::new())],
        };
        let job_id = executor.store().create(&def, ValueMap::new()).await.unwrap().job_id;

        let background = {
            let executor = Arc::clone(&executor);
            let job_id = job_id.clone();
            tokio::spawn(async move { executor.run_all(&job_id).await })
        };
        entered.notified().await;

        let err = executor.run_all(&job_id).await.unwrap_err();
        assert!(matches!(err, ExecutorError::AlreadyRunning(_)));

        release.notify_one();
        let report = background.await.unwrap().unwrap();
        assert!(report.succeeded());

        // The claim is released once the run finishes.
        let again = executor.run_step(&job_id, "wait", false).await.unwrap();
        assert!(matches!(again.outcomes[0].result, StepResult::Cached { .. }));
    }

    #[tokio::test]
    async fn batch_reports_each_job_in_order() {
        let (h, broken) = pipeline_harness();
        let first = h.create(&pipeline(), json!({"source": "A"})).await;
        let second = h.create(&pipeline(), json!({"source": "B"})).await;
        broken.store(false, Ordering::SeqCst);

        let outcomes = h
            .executor
            .run_batch(vec![first.clone(), "missing".to_string(), second.clone()], 2)
            .await;

        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].job_id, first);
        assert!(outcomes[0].result.as_ref().unwrap().succeeded());
        assert!(matches!(
            outcomes[1].result,
            Err(ExecutorError::Store(StoreError::NotFound(_)))
        ));
        assert_eq!(outcomes[2].job_id, second);
        assert_eq!(h.job(&second).await.status, JobStatus::Completed);
    }
}
