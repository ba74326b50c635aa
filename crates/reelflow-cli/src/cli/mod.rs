//! CLI command definitions for the `reelflow` binary.
//!
//! Uses clap derive macros for argument parsing. Commands are flat verbs
//! that act on a job id (e.g. `reelflow run <job>`, `reelflow note <job>`).

pub mod job;
pub mod run;
pub mod step;
pub mod workflow;

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use comfy_table::{Cell, Color};
use console::style;
use reelflow_types::ValueMap;
use reelflow_types::job::{JobStatus, StepStatus};
use serde_json::Value;

/// Run multi-step media jobs with checkpoints and resume.
#[derive(Parser)]
#[command(name = "reelflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, short, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Data directory (default: ~/.reelflow).
    #[arg(long, global = true, env = "REELFLOW_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a job from a workflow template.
    Create {
        /// Template name (from the workflows directory) or path to a YAML file.
        workflow: String,

        /// Job input as key=value (value parsed as JSON, else kept as text).
        #[arg(short = 'i', long = "input", value_name = "KEY=VALUE")]
        inputs: Vec<String>,

        /// JSON object file with job inputs; `--input` entries override it.
        #[arg(long)]
        inputs_file: Option<PathBuf>,
    },

    /// Run a job's steps.
    ///
    /// Without flags, every pending or failed step runs in dependency order.
    Run {
        /// Job id.
        job_id: String,

        /// Run only this step instance.
        #[arg(long, conflicts_with = "from")]
        step: Option<String>,

        /// Re-execute the step even if it already completed.
        #[arg(long, requires = "step")]
        force: bool,

        /// Run this step and every step defined after it.
        #[arg(long)]
        from: Option<String>,
    },

    /// Run several jobs concurrently.
    Batch {
        /// Job ids. Without ids, jobs are selected by `--status`.
        job_ids: Vec<String>,

        /// Select jobs with this status (default: pending).
        #[arg(long, conflicts_with = "job_ids")]
        status: Option<JobStatus>,

        /// Maximum jobs running at once (default from config).
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Show a job's steps and their state.
    Status {
        /// Job id.
        job_id: String,
    },

    /// List jobs, newest first.
    #[command(alias = "ls")]
    List {
        /// Only jobs with this status.
        #[arg(long)]
        status: Option<JobStatus>,
    },

    /// Mark steps left `running` by a killed process as interrupted.
    Recover {
        /// Job id.
        job_id: String,
    },

    /// Append a line to a job's notes.
    Note {
        /// Job id.
        job_id: String,

        /// Note text.
        text: String,
    },

    /// Append a new pending step to an existing job.
    Append {
        /// Job id.
        job_id: String,

        /// Instance id of the new step.
        #[arg(long)]
        id: String,

        /// Registered step name.
        #[arg(long)]
        step: String,

        /// Step parameter as key=value (value parsed as JSON, else kept as text).
        #[arg(short = 'p', long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,

        /// Skip the step when this expression is truthy.
        #[arg(long)]
        skip_if: Option<String>,

        /// A failure of this step does not halt the run.
        #[arg(long)]
        optional: bool,

        /// Free-form description.
        #[arg(long)]
        description: Option<String>,
    },

    /// List registered steps.
    Steps,

    /// List workflow templates.
    Workflows,

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Parse `key=value` pairs into a map.
///
/// Values are parsed as JSON when possible, so `-i episode=12` stores a
/// number and `-i tags='["a","b"]'` an array; anything else is kept as text.
pub fn parse_assignments(pairs: &[String]) -> Result<ValueMap> {
    let mut map = ValueMap::new();
    for pair in pairs {
        let Some((key, raw)) = pair.split_once('=') else {
            bail!("Expected KEY=VALUE, got '{pair}'");
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("Empty key in '{pair}'");
        }
        let value = serde_json::from_str::<Value>(raw)
            .unwrap_or_else(|_| Value::String(raw.to_string()));
        map.insert(key.to_string(), value);
    }
    Ok(map)
}

pub fn job_status_cell(status: JobStatus) -> Cell {
    match status {
        JobStatus::Pending => Cell::new("○ pending").fg(Color::DarkGrey),
        JobStatus::Running => Cell::new("◐ running").fg(Color::Cyan),
        JobStatus::Completed => Cell::new("● completed").fg(Color::Green),
        JobStatus::Failed => Cell::new("✗ failed").fg(Color::Red),
    }
}

pub fn step_status_cell(status: StepStatus) -> Cell {
    match status {
        StepStatus::Pending => Cell::new("○ pending").fg(Color::DarkGrey),
        StepStatus::Running => Cell::new("◐ running").fg(Color::Cyan),
        StepStatus::Completed => Cell::new("● completed").fg(Color::Green),
        StepStatus::Failed => Cell::new("✗ failed").fg(Color::Red),
        StepStatus::Skipped => Cell::new("◌ skipped").fg(Color::Yellow),
    }
}

pub fn styled_job_status(status: JobStatus) -> String {
    match status {
        JobStatus::Pending => style("pending").dim().to_string(),
        JobStatus::Running => style("running").cyan().to_string(),
        JobStatus::Completed => style("completed").green().to_string(),
        JobStatus::Failed => style("failed").red().to_string(),
    }
}

pub fn format_relative_time(dt: &chrono::DateTime<chrono::Utc>) -> String {
    let diff = chrono::Utc::now() - *dt;

    if diff.num_minutes() < 1 {
        "just now".to_string()
    } else if diff.num_hours() < 1 {
        format!("{}m ago", diff.num_minutes())
    } else if diff.num_days() < 1 {
        format!("{}h ago", diff.num_hours())
    } else if diff.num_days() < 30 {
        format!("{}d ago", diff.num_days())
    } else {
        dt.format("%Y-%m-%d").to_string()
    }
}

/// Shorten `text` to `max` characters, marking the cut.
pub fn truncate(text: &str, max: usize) -> String {
    let first_line = text.lines().next().unwrap_or_default();
    if first_line.chars().count() <= max && first_line.len() == text.len() {
        return text.to_string();
    }
    let cut: String = first_line.chars().take(max.saturating_sub(1)).collect();
    format!("{cut}…")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn assignments_parse_json_or_text() {
        let map = parse_assignments(&[
            "episode=12".to_string(),
            "url=https://example.com/a?b=c".to_string(),
            "tags=[\"a\",\"b\"]".to_string(),
            "title=".to_string(),
        ])
        .unwrap();

        assert_eq!(map["episode"], json!(12));
        assert_eq!(map["url"], json!("https://example.com/a?b=c"));
        assert_eq!(map["tags"], json!(["a", "b"]));
        assert_eq!(map["title"], json!(""));
    }

    #[test]
    fn assignments_require_key_and_equals() {
        assert!(parse_assignments(&["novalue".to_string()]).is_err());
        assert!(parse_assignments(&["=x".to_string()]).is_err());
    }

    #[test]
    fn later_assignments_win() {
        let map = parse_assignments(&["a=1".to_string(), "a=2".to_string()]).unwrap();
        assert_eq!(map["a"], json!(2));
    }

    #[test]
    fn truncate_cuts_long_and_multiline_text() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghij", 5), "abcd…");
        assert_eq!(truncate("first\nsecond", 20), "first…");
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn force_requires_step() {
        assert!(Cli::try_parse_from(["reelflow", "run", "job1", "--force"]).is_err());
        assert!(
            Cli::try_parse_from(["reelflow", "run", "job1", "--step", "a", "--from", "b"]).is_err()
        );
        let cli = Cli::try_parse_from(["reelflow", "run", "job1", "--step", "a", "--force"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Run { step: Some(ref s), force: true, from: None, .. } if s == "a"
        ));
    }

    #[test]
    fn status_flag_parses_job_status() {
        let cli = Cli::try_parse_from(["reelflow", "list", "--status", "failed"]).unwrap();
        assert!(matches!(cli.command, Commands::List { status: Some(JobStatus::Failed) }));
    }
}
