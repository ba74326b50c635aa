//! Execution events published while a job runs.
//!
//! Events are fire-and-forget: the executor publishes them on a broadcast
//! bus and a run without subscribers behaves identically.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::JobStatus;

/// Progress event for one executor invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    RunStarted {
        job_id: String,
        run_id: Uuid,
        scheduled: Vec<String>,
    },
    StepStarted {
        job_id: String,
        step_id: String,
        step_name: String,
        attempt: u32,
    },
    StepCompleted {
        job_id: String,
        step_id: String,
        duration_ms: u64,
    },
    /// `run_step` without `force` on a completed step.
    StepCached {
        job_id: String,
        step_id: String,
    },
    StepSkipped {
        job_id: String,
        step_id: String,
        condition: String,
    },
    StepFailed {
        job_id: String,
        step_id: String,
        error: String,
        required: bool,
    },
    RunFinished {
        job_id: String,
        run_id: Uuid,
        status: JobStatus,
    },
}

impl JobEvent {
    /// The job this event belongs to.
    pub fn job_id(&self) -> &str {
        match self {
            JobEvent::RunStarted { job_id, .. }
            | JobEvent::StepStarted { job_id, .. }
            | JobEvent::StepCompleted { job_id, .. }
            | JobEvent::StepCached { job_id, .. }
            | JobEvent::StepSkipped { job_id, .. }
            | JobEvent::StepFailed { job_id, .. }
            | JobEvent::RunFinished { job_id, .. } => job_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_tag() {
        let event = JobEvent::StepCached {
            job_id: "j".into(),
            step_id: "download".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "step_cached");
        assert_eq!(event.job_id(), "j");
    }
}
