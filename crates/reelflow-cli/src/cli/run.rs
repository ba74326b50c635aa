//! Execution commands: run one job, or a batch of jobs.
//!
//! Progress comes from the executor's event bus; the printed summary comes
//! from the returned [`RunReport`].

use std::time::Duration;

use anyhow::{Context, Result};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use reelflow_core::event::bus::EventBus;
use reelflow_core::workflow::executor::{ExecutorError, RunMode, RunReport, StepResult};
use reelflow_types::event::JobEvent;
use reelflow_types::job::JobStatus;
use tokio::task::JoinHandle;

use super::{job_status_cell, styled_job_status, truncate};
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Spinner fed by executor events until dropped.
struct Progress {
    spinner: ProgressBar,
    task: JoinHandle<()>,
}

impl Progress {
    /// `None` for JSON or quiet output. Without a job id, events of every
    /// job are shown, prefixed with their job.
    fn start(events: &EventBus, job_id: Option<&str>, enabled: bool) -> Result<Option<Self>> {
        if !enabled {
            return Ok(None);
        }
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}")?);
        spinner.set_message("Starting...");
        spinner.enable_steady_tick(Duration::from_millis(80));

        let show_job = job_id.is_none();
        let mut subscription = match job_id {
            Some(job_id) => events.subscribe_job(job_id),
            None => events.subscribe(),
        };
        let bar = spinner.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = subscription.next().await {
                render_event(&bar, &event, show_job);
            }
        });
        Ok(Some(Self { spinner, task }))
    }

    fn finish(self) {
        self.task.abort();
        self.spinner.finish_and_clear();
    }
}

fn render_event(bar: &ProgressBar, event: &JobEvent, show_job: bool) {
    let prefix = if show_job {
        format!("{} ", style(event.job_id()).dim())
    } else {
        String::new()
    };
    match event {
        JobEvent::StepStarted {
            step_id,
            step_name,
            attempt,
            ..
        } => {
            let retry = if *attempt > 1 {
                format!(" (attempt {attempt})")
            } else {
                String::new()
            };
            bar.set_message(format!("{prefix}Running {step_id} [{step_name}]{retry}..."));
        }
        JobEvent::StepCompleted {
            step_id,
            duration_ms,
            ..
        } => bar.println(format!(
            "  {} {prefix}{step_id} {}",
            style("✓").green(),
            style(format_duration(*duration_ms)).dim()
        )),
        JobEvent::StepCached { step_id, .. } => bar.println(format!(
            "  {} {prefix}{step_id} {}",
            style("✓").green(),
            style("(cached)").dim()
        )),
        JobEvent::StepSkipped { step_id, .. } => bar.println(format!(
            "  {} {prefix}{step_id} {}",
            style("◌").yellow(),
            style("(skipped)").dim()
        )),
        JobEvent::StepFailed {
            step_id, required, ..
        } => bar.println(format!(
            "  {} {prefix}{step_id}{}",
            style("✗").red(),
            if *required { "" } else { " (optional)" }
        )),
        JobEvent::RunStarted { .. } | JobEvent::RunFinished { .. } => {}
    }
}

fn format_duration(ms: u64) -> String {
    if ms < 1_000 {
        format!("{ms}ms")
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1_000.0)
    } else {
        format!("{}m{:02}s", ms / 60_000, (ms % 60_000) / 1_000)
    }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// Returns whether the run finished without a required step failing.
pub async fn run_job(
    state: &AppState,
    job_id: &str,
    step: Option<String>,
    force: bool,
    from: Option<String>,
    json: bool,
    quiet: bool,
) -> Result<bool> {
    let mode = match (step, from) {
        (Some(step_id), _) => RunMode::Step { step_id, force },
        (None, Some(step_id)) => RunMode::From { step_id },
        (None, None) => RunMode::All,
    };

    let progress = Progress::start(state.executor.events(), Some(job_id), !json && !quiet)?;
    let result = state.executor.run(job_id, mode).await;
    if let Some(progress) = progress {
        progress.finish();
    }

    let report = result.map_err(|e| explain(job_id, e))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if !quiet || !report.succeeded() {
        print_report(&report);
    }
    Ok(report.succeeded())
}

/// Attach operator hints to errors that have an obvious next step.
fn explain(job_id: &str, err: ExecutorError) -> anyhow::Error {
    let hint = match &err {
        ExecutorError::JobBusy { .. } => Some(format!(
            "If no other process is working on it, run `reelflow recover {job_id}` first"
        )),
        ExecutorError::UnknownInstance { .. } => Some(format!(
            "See the job's steps with `reelflow status {job_id}`"
        )),
        ExecutorError::Registry(_) => {
            Some("See registered steps with `reelflow steps`".to_string())
        }
        _ => None,
    };
    let err = anyhow::Error::new(err);
    match hint {
        Some(hint) => err.context(hint),
        None => err.context(format!("Failed to run job {job_id}")),
    }
}

fn print_report(report: &RunReport) {
    println!();
    if report.outcomes.is_empty() {
        println!(
            "  Nothing to run for {}: status {}",
            style(&report.job_id).cyan(),
            styled_job_status(report.status)
        );
    } else {
        let mut table = Table::new();
        table.load_preset(presets::UTF8_FULL_CONDENSED);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec![
            Cell::new("Step").fg(Color::White),
            Cell::new("Runs").fg(Color::White),
            Cell::new("Result").fg(Color::White),
            Cell::new("Detail").fg(Color::White),
        ]);
        for outcome in &report.outcomes {
            let (result, detail) = match &outcome.result {
                StepResult::Completed { duration_ms, .. } => (
                    Cell::new("● completed").fg(Color::Green),
                    Cell::new(format_duration(*duration_ms)),
                ),
                StepResult::Cached { .. } => (
                    Cell::new("● cached").fg(Color::Green),
                    Cell::new("already completed"),
                ),
                StepResult::Skipped { condition } => (
                    Cell::new("◌ skipped").fg(Color::Yellow),
                    Cell::new(condition).fg(Color::DarkGrey),
                ),
                StepResult::Failed { message, required } => (
                    Cell::new(if *required { "✗ failed" } else { "✗ failed (optional)" })
                        .fg(Color::Red),
                    Cell::new(truncate(message, 80)).fg(Color::Red),
                ),
            };
            table.add_row(vec![
                Cell::new(&outcome.step_id),
                Cell::new(&outcome.step_name),
                result,
                detail,
            ]);
        }
        println!("{table}");
        println!(
            "  Job {} is {}",
            style(&report.job_id).cyan(),
            styled_job_status(report.status)
        );
    }

    if !report.interrupted.is_empty() {
        println!(
            "  {} Marked interrupted from an earlier run: {}",
            style("!").yellow().bold(),
            report.interrupted.join(", ")
        );
    }

    for warning in &report.warnings {
        println!("  {} {warning}", style("!").yellow().bold());
    }

    // Dependents come in definition order, so the first one starts the tail.
    if let Some(first) = report.stale_dependents.first() {
        println!(
            "  {} These completed steps used the previous result and were not rerun: {}",
            style("!").yellow().bold(),
            report.stale_dependents.join(", ")
        );
        println!(
            "  Redo them:    {}",
            style(format!("reelflow run {} --from {first}", report.job_id)).yellow()
        );
    }

    if let Some(failure) = &report.failure {
        println!();
        println!(
            "  {} Step '{}' ({}) failed:",
            style("✗").red().bold(),
            style(&failure.step_id).bold(),
            failure.step_name
        );
        for line in failure.message.lines() {
            println!("      {}", style(line).red());
        }
        println!();
        println!(
            "  Resume:       {}",
            style(format!("reelflow run {}", report.job_id)).yellow()
        );
        println!(
            "  Retry step:   {}",
            style(format!(
                "reelflow run {} --step {}",
                report.job_id, failure.step_id
            ))
            .yellow()
        );
        println!(
            "  Rerun onward: {}",
            style(format!(
                "reelflow run {} --from {}",
                report.job_id, failure.step_id
            ))
            .yellow()
        );
    }
    println!();
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

/// Returns whether every job finished without error or required failure.
pub async fn run_batch(
    state: &AppState,
    job_ids: Vec<String>,
    status: Option<JobStatus>,
    concurrency: Option<usize>,
    json: bool,
    quiet: bool,
) -> Result<bool> {
    let job_ids = if job_ids.is_empty() {
        let status = status.unwrap_or(JobStatus::Pending);
        state
            .job_store
            .list(Some(status))
            .await
            .context("Failed to list jobs")?
            .into_iter()
            .map(|s| s.job_id)
            .collect()
    } else {
        job_ids
    };

    if job_ids.is_empty() {
        if json {
            println!("[]");
        } else if !quiet {
            println!("  No jobs to run.");
        }
        return Ok(true);
    }

    let concurrency = concurrency.unwrap_or(state.config.batch_concurrency).max(1);
    tracing::info!(jobs = job_ids.len(), concurrency, "starting batch");

    let progress = Progress::start(state.executor.events(), None, !json && !quiet)?;
    let outcomes = state.executor.run_batch(job_ids, concurrency).await;
    if let Some(progress) = progress {
        progress.finish();
    }

    let all_ok = outcomes
        .iter()
        .all(|o| o.result.as_ref().is_ok_and(RunReport::succeeded));

    if json {
        let out: Vec<serde_json::Value> = outcomes
            .iter()
            .map(|o| match &o.result {
                Ok(report) => serde_json::json!({ "job_id": o.job_id, "report": report }),
                Err(e) => serde_json::json!({ "job_id": o.job_id, "error": e.to_string() }),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(all_ok);
    }

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Job").fg(Color::White),
        Cell::new("Status").fg(Color::White),
        Cell::new("Steps Run").fg(Color::White),
        Cell::new("Problem").fg(Color::White),
    ]);
    for outcome in &outcomes {
        match &outcome.result {
            Ok(report) => {
                let problem = report
                    .failure
                    .as_ref()
                    .map(|f| format!("{}: {}", f.step_id, truncate(&f.message, 60)))
                    .unwrap_or_else(|| "-".to_string());
                table.add_row(vec![
                    Cell::new(&outcome.job_id),
                    job_status_cell(report.status),
                    Cell::new(report.outcomes.len()),
                    Cell::new(problem),
                ]);
            }
            Err(e) => {
                table.add_row(vec![
                    Cell::new(&outcome.job_id),
                    Cell::new("✗ error").fg(Color::Red),
                    Cell::new("-"),
                    Cell::new(truncate(&e.to_string(), 80)).fg(Color::Red),
                ]);
            }
        }
    }

    println!();
    println!("{table}");
    let failed = outcomes.iter().filter(|o| !o.result.as_ref().is_ok_and(RunReport::succeeded)).count();
    if failed > 0 {
        println!(
            "  {} {failed} of {} jobs need attention. Inspect with {}",
            style("✗").red().bold(),
            outcomes.len(),
            style("reelflow status <job>").yellow()
        );
    } else {
        println!(
            "  {} {} jobs finished",
            style("✓").green().bold(),
            outcomes.len()
        );
    }
    println!();
    Ok(all_ok)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_are_compact() {
        assert_eq!(format_duration(250), "250ms");
        assert_eq!(format_duration(1_500), "1.5s");
        assert_eq!(format_duration(125_000), "2m05s");
    }
}
