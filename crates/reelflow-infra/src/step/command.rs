//! Steps implemented by external programs.
//!
//! Protocol:
//! - the process runs in the job's workspace directory
//! - a relative `program` path such as `bin/cut.sh` is resolved against the
//!   data dir; a bare name is looked up on `PATH`
//! - resolved params are written to stdin as one JSON object
//! - `REELFLOW_JOB_ID`, `REELFLOW_JOB_DIR`, `REELFLOW_STEP_ID` and
//!   `REELFLOW_ATTEMPT` are set
//! - the last non-empty stdout line must be a JSON object; it is the output
//! - a non-zero exit is a failure carrying the tail of stderr
//!
//! There is no timeout. A killed process leaves its record `running`.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use reelflow_core::step::{Step, StepContext};
use reelflow_types::ValueMap;
use reelflow_types::config::CommandStepConfig;
use reelflow_types::error::StepError;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

pub const ENV_JOB_ID: &str = "REELFLOW_JOB_ID";
pub const ENV_JOB_DIR: &str = "REELFLOW_JOB_DIR";
pub const ENV_STEP_ID: &str = "REELFLOW_STEP_ID";
pub const ENV_ATTEMPT: &str = "REELFLOW_ATTEMPT";

/// Lines of stderr kept in a failure message.
const STDERR_TAIL_LINES: usize = 20;

/// A configured external program exposed as a step.
#[derive(Debug, Clone)]
pub struct CommandStep {
    config: CommandStepConfig,
    program: PathBuf,
}

impl CommandStep {
    pub fn new(config: CommandStepConfig) -> Self {
        let program = PathBuf::from(&config.program);
        Self { config, program }
    }

    /// Resolve a relative program path against `base`.
    pub fn relative_to(mut self, base: &Path) -> Self {
        self.program = resolve_program(base, &self.config.program);
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    fn command(&self, ctx: &StepContext) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.config.args)
            .envs(&self.config.env)
            .env(ENV_JOB_ID, &ctx.job_id)
            .env(ENV_STEP_ID, &ctx.step_id)
            .env(ENV_ATTEMPT, ctx.attempt.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &ctx.job_dir {
            // The child's cwd is the job dir, so it must see an absolute path.
            let dir = std::path::absolute(dir).unwrap_or_else(|_| dir.clone());
            cmd.current_dir(&dir).env(ENV_JOB_DIR, dir);
        }
        cmd
    }
}

impl Step for CommandStep {
    fn idempotent(&self) -> bool {
        self.config.idempotent
    }

    async fn execute(&self, ctx: &StepContext, params: ValueMap) -> Result<ValueMap, StepError> {
        let input =
            serde_json::to_vec(&params).map_err(|e| StepError::InvalidParams(e.to_string()))?;

        tracing::debug!(
            job_id = %ctx.job_id,
            step_id = %ctx.step_id,
            program = %self.program.display(),
            "spawning command step"
        );
        let mut child = self.command(ctx).spawn().map_err(|e| {
            StepError::failed(format!("failed to spawn '{}': {e}", self.config.program))
        })?;

        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(&input).await?;
                stdin.shutdown().await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output?;

        // Programs that ignore stdin may close it before we finish writing.
        if let Err(e) = fed {
            if e.kind() != std::io::ErrorKind::BrokenPipe {
                return Err(e.into());
            }
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            tracing::debug!(step_id = %ctx.step_id, stderr = %stderr.trim_end(), "command step stderr");
        }

        if !output.status.success() {
            return Err(StepError::failed(format!(
                "'{}' exited with {}: {}",
                self.config.program,
                output.status,
                stderr_tail(&stderr)
            )));
        }

        parse_output(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Paths with more than one component are joined onto `base`; bare names
/// and absolute paths are returned as given.
fn resolve_program(base: &Path, program: &str) -> PathBuf {
    let path = Path::new(program);
    if path.is_relative() && path.components().count() > 1 {
        base.join(path)
    } else {
        path.to_path_buf()
    }
}

/// Parse the last non-empty stdout line as a JSON object.
fn parse_output(stdout: &str) -> Result<ValueMap, StepError> {
    let line = stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| StepError::InvalidOutput("no output on stdout".to_string()))?;

    match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(StepError::InvalidOutput(format!(
            "expected a JSON object, got {other}"
        ))),
        Err(e) => Err(StepError::InvalidOutput(format!("'{line}' is not JSON: {e}"))),
    }
}

fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.is_empty() {
        return "no stderr output".to_string();
    }
    lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..].join("\n")
}
