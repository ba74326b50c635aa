//! Global configuration loader for reelflow.
//!
//! Reads `config.toml` from the data directory (`~/.reelflow/` in
//! production) and deserializes it into [`GlobalConfig`]. A missing file
//! means defaults. A file that exists but does not parse is an error: it
//! usually carries command step declarations, and running without them
//! would fail later in a less obvious way.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use reelflow_core::workflow::executor::{ExecutorOptions, process_owner};
use reelflow_types::config::GlobalConfig;

/// File name of the configuration inside the data directory.
pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Load global configuration from `{data_dir}/config.toml`.
///
/// - If the file does not exist, returns [`GlobalConfig::default()`].
/// - If the file exists but fails to read, parse or validate, returns an error.
pub async fn load_global_config(data_dir: &Path) -> Result<GlobalConfig, ConfigError> {
    let config_path = data_dir.join(CONFIG_FILE);

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return Ok(GlobalConfig::default());
        }
        Err(source) => {
            return Err(ConfigError::Read {
                path: config_path,
                source,
            });
        }
    };

    let config: GlobalConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: config_path.clone(),
        source,
    })?;
    validate_config(&config)?;

    tracing::debug!(
        path = %config_path.display(),
        command_steps = config.steps.len(),
        "loaded config"
    );
    Ok(config)
}

fn validate_config(config: &GlobalConfig) -> Result<(), ConfigError> {
    if config.batch_concurrency == 0 {
        return Err(ConfigError::Invalid(
            "batch_concurrency must be at least 1".to_string(),
        ));
    }

    let mut names = HashSet::new();
    for step in &config.steps {
        if step.name.trim().is_empty() {
            return Err(ConfigError::Invalid("command step with empty name".to_string()));
        }
        if step.program.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "command step '{}' has no program",
                step.name
            )));
        }
        if !names.insert(step.name.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "command step '{}' declared twice",
                step.name
            )));
        }
    }
    Ok(())
}

/// Job storage root. Relative paths are taken from the data directory.
pub fn jobs_dir(data_dir: &Path, config: &GlobalConfig) -> PathBuf {
    under(data_dir, config.jobs_dir.as_deref(), "jobs")
}

/// Workflow template directory. Relative paths are taken from the data directory.
pub fn workflows_dir(data_dir: &Path, config: &GlobalConfig) -> PathBuf {
    under(data_dir, config.workflows_dir.as_deref(), "workflows")
}

fn under(data_dir: &Path, configured: Option<&Path>, default: &str) -> PathBuf {
    match configured {
        Some(path) if path.is_absolute() => path.to_path_buf(),
        Some(path) => data_dir.join(path),
        None => data_dir.join(default),
    }
}

/// Executor tunables derived from the configuration.
pub fn executor_options(config: &GlobalConfig) -> ExecutorOptions {
    let secs = i64::try_from(config.stale_running_after_secs).unwrap_or(i64::MAX);
    ExecutorOptions {
        stale_running_after: chrono::Duration::try_seconds(secs).unwrap_or(chrono::Duration::MAX),
        owner: process_owner(),
    }
}
