//! Workflow definition parsing, validation, and filesystem operations.
//!
//! Converts between YAML files and `WorkflowDefinition`, validates
//! structural constraints (name format, unique instance ids, well-formed
//! references to known steps), and discovers templates on disk.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use reelflow_types::reference::{INPUT_SOURCE, JOB_SOURCE, collect_references};
use reelflow_types::workflow::{StepInvocation, WorkflowDefinition};
use serde_json::Value;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while loading or validating workflow templates.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// No template with this name or path.
    #[error("workflow '{0}' not found")]
    NotFound(String),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDefinition`.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Serialize a `WorkflowDefinition` to a YAML string.
pub fn serialize_workflow_yaml(def: &WorkflowDefinition) -> Result<String, WorkflowError> {
    serde_yaml_ng::to_string(def).map_err(|e| WorkflowError::ParseError(e.to_string()))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - Name is non-empty and contains only alphanumerics, `_` and `-`
/// - At least one step exists
/// - Every step passes [`validate_invocation`]
/// - Step ids are unique
/// - Every step reference points to a step id of this workflow
/// - `key_inputs` are non-empty and unique
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if def.name.is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow name must not be empty".to_string(),
        ));
    }
    if !is_identifier(&def.name) {
        return Err(WorkflowError::ValidationError(format!(
            "workflow name '{}' contains invalid characters (only alphanumerics, '_' and '-' allowed)",
            def.name
        )));
    }

    if def.steps.is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow must have at least one step".to_string(),
        ));
    }

    let mut seen_ids = HashSet::new();
    for step in &def.steps {
        if !seen_ids.insert(step.id.as_str()) {
            return Err(WorkflowError::ValidationError(format!(
                "duplicate step ID: '{}'",
                step.id
            )));
        }
    }

    for step in &def.steps {
        validate_invocation(step, &seen_ids)?;
    }

    let mut seen_keys = HashSet::new();
    for key in &def.key_inputs {
        if key.trim().is_empty() || !seen_keys.insert(key.as_str()) {
            return Err(WorkflowError::ValidationError(format!(
                "invalid or duplicate key input '{key}'"
            )));
        }
    }

    Ok(())
}

/// Validate a single invocation against the set of known step ids.
///
/// Used both for whole templates and for steps appended to existing jobs.
pub fn validate_invocation(
    step: &StepInvocation,
    known_ids: &HashSet<&str>,
) -> Result<(), WorkflowError> {
    if !is_identifier(&step.id) {
        return Err(WorkflowError::ValidationError(format!(
            "step id '{}' contains invalid characters (only alphanumerics, '_' and '-' allowed)",
            step.id
        )));
    }
    if step.id == INPUT_SOURCE || step.id == JOB_SOURCE {
        return Err(WorkflowError::ValidationError(format!(
            "step id '{}' is reserved",
            step.id
        )));
    }
    if step.step.trim().is_empty() {
        return Err(WorkflowError::ValidationError(format!(
            "step '{}' must name a registered step",
            step.id
        )));
    }
    if step.skip_if.as_deref().is_some_and(|s| s.trim().is_empty()) {
        return Err(WorkflowError::ValidationError(format!(
            "step '{}' has an empty skip_if expression",
            step.id
        )));
    }
    if let Some(outputs) = &step.outputs {
        if outputs.iter().any(|(alias, key)| alias.is_empty() || key.is_empty()) {
            return Err(WorkflowError::ValidationError(format!(
                "step '{}' has an empty outputs mapping entry",
                step.id
            )));
        }
    }

    let refs = collect_references(&Value::Object(step.params.clone())).map_err(|e| {
        WorkflowError::ValidationError(format!("step '{}': {e}", step.id))
    })?;
    for r in refs {
        if let Some(target) = r.step_id() {
            if !known_ids.contains(target) {
                return Err(WorkflowError::ValidationError(format!(
                    "step '{}' references unknown step '{}'",
                    step.id, target
                )));
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load a workflow definition from a YAML file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow_yaml(&content)
}

/// Save a workflow definition to a YAML file.
///
/// Creates parent directories if they don't exist.
pub fn save_workflow_file(path: &Path, def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let yaml = serialize_workflow_yaml(def)?;
    std::fs::write(path, yaml)?;
    Ok(())
}

/// Resolve a template by name (`<workflows_dir>/<name>.yaml|.yml`) or by path.
pub fn resolve_workflow(
    workflows_dir: &Path,
    name_or_path: &str,
) -> Result<(PathBuf, WorkflowDefinition), WorkflowError> {
    let as_path = PathBuf::from(name_or_path);
    if as_path.is_file() {
        let def = load_workflow_file(&as_path)?;
        return Ok((as_path, def));
    }

    for ext in ["yaml", "yml"] {
        let candidate = workflows_dir.join(format!("{name_or_path}.{ext}"));
        if candidate.is_file() {
            let def = load_workflow_file(&candidate)?;
            return Ok((candidate, def));
        }
    }

    Err(WorkflowError::NotFound(name_or_path.to_string()))
}

/// Discover all workflow YAML files under `base_dir`, sorted by name.
///
/// Files that fail to parse or validate are skipped with a warning.
pub fn discover_workflows(
    base_dir: &Path,
) -> Result<Vec<(PathBuf, WorkflowDefinition)>, WorkflowError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    results.sort_by(|a, b| a.1.name.cmp(&b.1.name));
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, WorkflowDefinition)>,
) -> Result<(), WorkflowError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
        } else if path
            .extension()
            .is_some_and(|ext| ext == "yaml" || ext == "yml")
        {
            match load_workflow_file(&path) {
                Ok(def) => results.push((path, def)),
                Err(e) => {
                    tracing::warn!(?path, error = %e, "skipping invalid workflow file");
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
