//! The step contract.
//!
//! A step is a named unit of work: it receives resolved params and returns
//! an output mapping, or fails with a [`StepError`]. Whatever side effects it
//! has are invisible to the executor except through the returned mapping.

pub mod box_step;
pub mod builtin;
pub mod registry;

use std::path::PathBuf;

use reelflow_types::ValueMap;
use reelflow_types::error::StepError;

/// Where and for whom a step is executing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepContext {
    pub job_id: String,
    /// Step instance id within the job.
    pub step_id: String,
    /// Workspace directory of the job, when the store has one.
    pub job_dir: Option<PathBuf>,
    /// 1-based attempt number of this execution.
    pub attempt: u32,
}

/// Trait for step implementations (download, transcribe, render, ...).
///
/// Uses native async fn in traits (RPITIT, Rust 2024 edition). Use
/// [`box_step::BoxStep`] to store heterogeneous steps in the registry.
pub trait Step: Send + Sync {
    /// Whether re-executing after a success is harmless.
    ///
    /// The executor warns before re-running a completed non-idempotent step.
    fn idempotent(&self) -> bool {
        true
    }

    /// Execute the step with fully resolved params.
    fn execute(
        &self,
        ctx: &StepContext,
        params: ValueMap,
    ) -> impl std::future::Future<Output = Result<ValueMap, StepError>> + Send;
}
