//! Progress computation for the read path.

use serde::Serialize;

use crate::definition::StepSpec;
use crate::run::{RunStatus, WorkflowRun};

/// Progress report for one run, computed from the definition's static step
/// list against the run's timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunProgress {
    pub run_id: String,
    pub status: RunStatus,
    /// 100 exactly when the run is COMPLETED; otherwise proportional to
    /// completed steps, capped at 99 until the completing dispatch lands.
    pub completion_percentage: u8,
    pub total_steps: usize,
    pub completed_steps: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step_id: Option<String>,
}

/// Compute progress from the static step list and the persisted timeline.
pub fn compute(steps: &[StepSpec], run: &WorkflowRun) -> RunProgress {
    let total_steps = steps.len();
    let completed_steps = steps
        .iter()
        .filter(|step| run.timeline.output(&step.id).is_some())
        .count();

    let completion_percentage = if run.status == RunStatus::Completed {
        100
    } else if total_steps == 0 {
        0
    } else {
        (((completed_steps * 100) / total_steps) as u8).min(99)
    };

    RunProgress {
        run_id: run.id.clone(),
        status: run.status,
        completion_percentage,
        total_steps,
        completed_steps,
        current_step_id: run.current_step_id.clone(),
    }
}
