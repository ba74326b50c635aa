//! Job lifecycle commands: create, status, list, recover, note, append.

use std::path::Path;

use anyhow::{Context, Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use reelflow_core::workflow::definition::resolve_workflow;
use reelflow_types::ValueMap;
use reelflow_types::job::{JobStatus, StepStatus};
use reelflow_types::workflow::StepInvocation;
use serde_json::Value;

use super::{
    format_relative_time, job_status_cell, parse_assignments, step_status_cell,
    styled_job_status, truncate,
};
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Create
// ---------------------------------------------------------------------------

pub async fn create_job(
    state: &AppState,
    workflow: &str,
    inputs: &[String],
    inputs_file: Option<&Path>,
    json: bool,
) -> Result<()> {
    let (path, def) = resolve_workflow(&state.workflows_dir, workflow)
        .with_context(|| format!("Failed to load workflow '{workflow}'"))?;

    let mut all_inputs = match inputs_file {
        Some(file) => read_inputs_file(file).await?,
        None => ValueMap::new(),
    };
    all_inputs.extend(parse_assignments(inputs)?);

    let job = state
        .job_store
        .create(&def, all_inputs)
        .await
        .with_context(|| format!("Failed to create job from '{}'", path.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&job)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Created job {}",
        style("✓").green().bold(),
        style(&job.job_id).cyan().bold()
    );
    println!("  {}  {}", style("Workflow:").bold(), job.workflow);
    println!("  {}  {}", style("Steps:").bold(), job.steps.len());
    if let Some(dir) = state.job_store.job_dir(&job.job_id) {
        println!("  {}  {}", style("Directory:").bold(), style(dir.display()).dim());
    }
    println!();
    println!(
        "  Run it: {}",
        style(format!("reelflow run {}", job.job_id)).yellow()
    );
    println!();
    Ok(())
}

async fn read_inputs_file(path: &Path) -> Result<ValueMap> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    match serde_json::from_str::<Value>(&raw)
        .with_context(|| format!("{} is not valid JSON", path.display()))?
    {
        Value::Object(map) => Ok(map),
        _ => bail!("{} must contain a JSON object", path.display()),
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

pub async fn show_status(state: &AppState, job_id: &str, json: bool) -> Result<()> {
    let job = state.job_store.load(job_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&job)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {}  {}",
        style("Job").bold(),
        style(&job.job_id).cyan().bold(),
        styled_job_status(job.status)
    );
    println!("  {}  {}", style("Workflow:").bold(), job.workflow);
    println!(
        "  {}  {} ({})",
        style("Created:").bold(),
        job.created_at.format("%Y-%m-%d %H:%M:%S"),
        format_relative_time(&job.created_at)
    );
    println!(
        "  {}  {}",
        style("Updated:").bold(),
        format_relative_time(&job.updated_at)
    );
    if !job.inputs.is_empty() {
        println!("  {}", style("Inputs:").bold());
        for (key, value) in &job.inputs {
            println!("    {key} = {}", truncate(&value.to_string(), 80));
        }
    }
    println!();

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("#").fg(Color::White),
        Cell::new("Step").fg(Color::White),
        Cell::new("Runs").fg(Color::White),
        Cell::new("Status").fg(Color::White),
        Cell::new("Attempts").fg(Color::White),
        Cell::new("Finished").fg(Color::White),
        Cell::new("Detail").fg(Color::White),
    ]);

    for (idx, step) in job.steps.iter().enumerate() {
        let id = if step.required {
            step.id.clone()
        } else {
            format!("{} (optional)", step.id)
        };
        let finished = step
            .finished_at
            .as_ref()
            .map(format_relative_time)
            .unwrap_or_else(|| "-".to_string());
        let detail = match (step.status, &step.error) {
            (StepStatus::Failed, Some(failure)) => {
                Cell::new(truncate(&failure.message, 60)).fg(Color::Red)
            }
            (StepStatus::Running, _) => Cell::new(format!(
                "on {}",
                step.owner.as_deref().unwrap_or("unknown")
            )),
            (StepStatus::Skipped, _) => {
                Cell::new(step.skip_if.as_deref().unwrap_or_default()).fg(Color::DarkGrey)
            }
            _ => Cell::new(step.description.as_deref().unwrap_or_default()),
        };
        table.add_row(vec![
            Cell::new(idx + 1),
            Cell::new(id),
            Cell::new(&step.step),
            step_status_cell(step.status),
            Cell::new(step.attempts),
            Cell::new(finished),
            detail,
        ]);
    }
    println!("{table}");

    if !job.notes.trim().is_empty() {
        println!();
        println!("  {}", style("Notes:").bold());
        for line in job.notes.lines() {
            println!("    {line}");
        }
    }

    if let Some(failed) = job.failed_step() {
        println!();
        println!(
            "  Resume: {}   Retry step: {}",
            style(format!("reelflow run {}", job.job_id)).yellow(),
            style(format!("reelflow run {} --step {}", job.job_id, failed.id)).yellow()
        );
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

pub async fn list_jobs(state: &AppState, status: Option<JobStatus>, json: bool) -> Result<()> {
    let jobs = state.job_store.list(status).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        return Ok(());
    }

    if jobs.is_empty() {
        println!();
        match status {
            Some(s) => println!("  No {s} jobs."),
            None => println!(
                "  No jobs yet. Create one with {}",
                style("reelflow create <workflow> -i key=value").yellow()
            ),
        }
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Job").fg(Color::White),
        Cell::new("Workflow").fg(Color::White),
        Cell::new("Status").fg(Color::White),
        Cell::new("Progress").fg(Color::White),
        Cell::new("Failed Step").fg(Color::White),
        Cell::new("Updated").fg(Color::White),
    ]);

    for job in &jobs {
        let done = job.steps.completed + job.steps.skipped;
        table.add_row(vec![
            Cell::new(&job.job_id),
            Cell::new(&job.workflow),
            job_status_cell(job.status),
            Cell::new(format!("{done}/{}", job.steps.total)),
            Cell::new(job.failed_step.as_deref().unwrap_or("-")),
            Cell::new(format_relative_time(&job.updated_at)),
        ]);
    }

    println!("{table}");
    println!(
        "  {} job{}",
        jobs.len(),
        if jobs.len() == 1 { "" } else { "s" }
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Recover
// ---------------------------------------------------------------------------

pub async fn recover_job(state: &AppState, job_id: &str, json: bool) -> Result<()> {
    let interrupted = state.job_store.recover(job_id).await?;

    if json {
        let out = serde_json::json!({ "job_id": job_id, "interrupted": interrupted });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    if interrupted.is_empty() {
        println!("  Nothing to recover: no step of {job_id} is running.");
    } else {
        println!(
            "  {} Marked as interrupted: {}",
            style("✓").green().bold(),
            interrupted.join(", ")
        );
        println!(
            "  Resume: {}",
            style(format!("reelflow run {job_id}")).yellow()
        );
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Note
// ---------------------------------------------------------------------------

pub async fn add_note(state: &AppState, job_id: &str, text: &str, json: bool) -> Result<()> {
    if text.trim().is_empty() {
        bail!("Note text is empty");
    }
    let job = state.job_store.add_note(job_id, text).await?;

    if json {
        let out = serde_json::json!({ "job_id": job.job_id, "notes": job.notes });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("  {} Note added to {}", style("✓").green().bold(), job.job_id);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Append
// ---------------------------------------------------------------------------

pub struct AppendArgs<'a> {
    pub id: &'a str,
    pub step: &'a str,
    pub params: &'a [String],
    pub skip_if: Option<&'a str>,
    pub optional: bool,
    pub description: Option<&'a str>,
}

pub async fn append_step(
    state: &AppState,
    job_id: &str,
    args: AppendArgs<'_>,
    json: bool,
) -> Result<()> {
    if !state.executor.registry().contains(args.step) {
        bail!(
            "Unknown step '{}'. See registered steps with `reelflow steps`",
            args.step
        );
    }

    let mut invocation = StepInvocation::new(args.id, args.step, parse_assignments(args.params)?);
    invocation.skip_if = args.skip_if.map(str::to_string);
    invocation.required = !args.optional;
    invocation.description = args.description.map(str::to_string);

    let job = state
        .job_store
        .append_step(job_id, &invocation)
        .await
        .with_context(|| format!("Failed to append '{}' to {job_id}", args.id))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&job)?);
        return Ok(());
    }

    println!(
        "  {} Appended step '{}' ({}) to {}",
        style("✓").green().bold(),
        style(args.id).cyan(),
        args.step,
        job.job_id
    );
    println!(
        "  Run it: {}",
        style(format!("reelflow run {} --step {}", job.job_id, args.id)).yellow()
    );
    Ok(())
}
