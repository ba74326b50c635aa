//! Steps that ship with the engine.

use reelflow_types::ValueMap;
use reelflow_types::error::StepError;

use super::box_step::BoxStep;
use super::{Step, StepContext};

/// Registry name of [`EchoStep`].
pub const ECHO_STEP: &str = "echo";

/// Returns its resolved params as output.
///
/// Handy for pinning values into a job (`title: "${input.title}"`) or as a
/// checkpoint that later steps can reference.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoStep;

impl Step for EchoStep {
    async fn execute(&self, ctx: &StepContext, params: ValueMap) -> Result<ValueMap, StepError> {
        tracing::debug!(job_id = %ctx.job_id, step_id = %ctx.step_id, "echo step");
        Ok(params)
    }
}

/// The `(name, implementation)` pairs registered before any configured steps.
pub fn builtin_steps() -> Vec<(String, BoxStep)> {
    vec![(ECHO_STEP.to_string(), BoxStep::new(EchoStep))]
}
