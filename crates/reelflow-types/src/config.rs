//! Global configuration types for reelflow.
//!
//! `GlobalConfig` represents the top-level `config.toml` in the data
//! directory: storage locations, the staleness policy for `running` steps,
//! batch concurrency, and the command steps to register at start-up.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration, loaded from `<data_dir>/config.toml`.
///
/// All fields have defaults; an empty file is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Job storage root. Defaults to `<data_dir>/jobs`.
    #[serde(default)]
    pub jobs_dir: Option<PathBuf>,

    /// Workflow template directory. Defaults to `<data_dir>/workflows`.
    #[serde(default)]
    pub workflows_dir: Option<PathBuf>,

    /// A `running` record older than this is treated as interrupted.
    #[serde(default = "default_stale_running_after_secs")]
    pub stale_running_after_secs: u64,

    /// Maximum number of jobs a batch runs at once.
    #[serde(default = "default_batch_concurrency")]
    pub batch_concurrency: usize,

    /// External programs registered as steps.
    #[serde(default)]
    pub steps: Vec<CommandStepConfig>,
}

fn default_stale_running_after_secs() -> u64 {
    6 * 60 * 60
}

fn default_batch_concurrency() -> usize {
    4
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            jobs_dir: None,
            workflows_dir: None,
            stale_running_after_secs: default_stale_running_after_secs(),
            batch_concurrency: default_batch_concurrency(),
            steps: Vec::new(),
        }
    }
}

/// A step implemented by an external program.
///
/// The program receives resolved params as JSON on stdin and must print a
/// JSON object on stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandStepConfig {
    /// Registry name (e.g. `transcribe`).
    pub name: String,
    /// Executable to spawn. A relative path with a directory part resolves
    /// against the data dir; a bare name is looked up on `PATH`.
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Whether re-running after success is harmless.
    #[serde(default = "default_idempotent")]
    pub idempotent: bool,
    /// Extra environment variables for the process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_idempotent() -> bool {
    true
}
