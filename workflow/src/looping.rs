//! Drive a run from its current checkpoint until it finishes or suspends.

use serde::Serialize;
use tracing::{debug, info};

use crate::core::transitions::{TransitionSummary, begin};
use crate::core::types::{RunStatus, StageTag};
use crate::error::PipelineError;
use crate::state::RunState;
use crate::step::{StepContext, StepOutcome, checkpoint, run_step};

/// Where a drive of the pipeline stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: RunStatus,
    pub current_stage: StageTag,
    /// Human-readable failure reason when `status` is `Failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    /// Transitions applied during this drive.
    pub stages_executed: u32,
}

impl RunOutcome {
    pub fn from_state(state: &RunState, stages_executed: u32) -> Self {
        Self {
            run_id: state.run_id.clone(),
            status: state.status,
            current_stage: state.current_stage,
            failure: state.failure_reason.as_ref().map(ToString::to_string),
            stages_executed,
        }
    }

    /// The run stopped at the approval gate.
    pub fn is_suspended(&self) -> bool {
        self.status == RunStatus::AwaitingApproval
    }
}

/// Step `state` until it reaches `Done`/`Failed` or suspends at the approval gate.
///
/// `on_step` observes every applied transition after it is checkpointed.
pub fn run_loop<F: FnMut(&TransitionSummary, &RunState)>(
    ctx: &StepContext<'_>,
    mut state: RunState,
    mut on_step: F,
) -> Result<RunOutcome, PipelineError> {
    let mut stages_executed = 0u32;

    if state.status == RunStatus::Created {
        let summary = begin(&mut state).map_err(|message| PipelineError::IllegalTransition {
            run_id: state.run_id.clone(),
            message,
        })?;
        checkpoint(ctx, &state)?;
        debug!(run_id = %state.run_id, "run began");
        on_step(&summary, &state);
    }

    while !state.status.is_terminal() {
        match run_step(ctx, &mut state)? {
            StepOutcome::Advanced(summary) => {
                stages_executed += 1;
                on_step(&summary, &state);
            }
            StepOutcome::Suspended => break,
        }
    }

    info!(
        run_id = %state.run_id,
        status = %state.status,
        stage = %state.current_stage,
        stages_executed,
        "run stopped"
    );
    Ok(RunOutcome::from_state(&state, stages_executed))
}
