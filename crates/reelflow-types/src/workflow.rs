//! Workflow definition types.
//!
//! A workflow is a declarative, ordered list of step invocations. It is
//! frozen into the job document when a job is created, so later edits to a
//! template never change jobs that already exist.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ValueMap;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A workflow template, usually loaded from `<workflows_dir>/<name>.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Template name (alphanumeric, `_` and `-`).
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Input names whose values make up the semantic part of a job id.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_inputs: Vec<String>,
    /// Subdirectories created in the job workspace on creation
    /// (e.g. `input`, `transcripts`, `renders`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workspace_dirs: Vec<String>,
    /// Ordered step invocations.
    pub steps: Vec<StepInvocation>,
}

// ---------------------------------------------------------------------------
// Step Invocation
// ---------------------------------------------------------------------------

/// One step of a workflow: which registered step runs, under which
/// instance id, with which parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepInvocation {
    /// Instance id, unique within the workflow (e.g. `download`).
    pub id: String,
    /// Registered step name to execute.
    pub step: String,
    /// Raw parameters; string values may contain reference expressions.
    #[serde(default)]
    pub params: ValueMap,
    /// JEXL expression; when truthy the step is skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_if: Option<String>,
    /// A failed optional step is recorded but does not halt the run.
    #[serde(default = "default_required", skip_serializing_if = "is_true")]
    pub required: bool,
    /// Optional `alias -> result_key` projection of the step's result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl StepInvocation {
    /// Minimal invocation: a required step with the given params.
    pub fn new(id: impl Into<String>, step: impl Into<String>, params: ValueMap) -> Self {
        Self {
            id: id.into(),
            step: step.into(),
            params,
            skip_if: None,
            required: true,
            outputs: None,
            description: None,
        }
    }
}

pub(crate) fn default_required() -> bool {
    true
}

pub(crate) fn is_true(value: &bool) -> bool {
    *value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_minimal_workflow_applies_defaults() {
        let yaml = r#"
name: podcast-clips
steps:
  - id: download
    step: download
    params:
      url: "${input.source}"
  - id: transcribe
    step: transcribe
    params:
      file: "${download.file}"
    required: false
"#;
        let def: WorkflowDefinition = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(def.name, "podcast-clips");
        assert!(def.key_inputs.is_empty());
        assert_eq!(def.steps.len(), 2);
        assert!(def.steps[0].required);
        assert!(!def.steps[1].required);
        assert!(def.steps[0].skip_if.is_none());
        assert_eq!(def.steps[1].params["file"], "${download.file}");
    }

    #[test]
    fn serialize_omits_defaults() {
        let step = StepInvocation::new("a", "echo", ValueMap::new());
        let yaml = serde_yaml_ng::to_string(&step).unwrap();
        assert!(!yaml.contains("required"));
        assert!(!yaml.contains("skip_if"));
    }
}
