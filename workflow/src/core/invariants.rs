//! Snapshot invariants checked whenever a checkpoint is loaded.

use crate::core::ids::validate_run_id;
use crate::core::types::{RunStatus, StageTag};
use crate::state::{RunState, SCHEMA_VERSION};

/// Check semantic invariants of a run state snapshot:
/// - Known schema version and a valid run id
/// - `current_stage` consistent with `status`
/// - `failure_reason` present iff the run failed
/// - A recorded decision only while awaiting approval
/// - Stage outputs keyed by work stages only
/// - The artifact the next stage consumes is present
pub fn validate_invariants(state: &RunState) -> Vec<String> {
    let mut errors = Vec::new();

    if state.schema_version != SCHEMA_VERSION {
        errors.push(format!(
            "schema_version {} is not supported (expected {SCHEMA_VERSION})",
            state.schema_version
        ));
    }
    if let Err(err) = validate_run_id(&state.run_id) {
        errors.push(err);
    }
    if state.task_description.trim().is_empty() {
        errors.push("task_description must not be empty".to_string());
    }

    validate_stage_status(state, &mut errors);

    match (&state.failure_reason, state.status) {
        (None, RunStatus::Failed) => {
            errors.push("failed run is missing failure_reason".to_string());
        }
        (Some(_), status) if status != RunStatus::Failed => {
            errors.push(format!("failure_reason present while status is {status}"));
        }
        (Some(reason), _) if reason.to_string().trim().is_empty() => {
            errors.push("failure_reason must not be empty".to_string());
        }
        _ => {}
    }

    if state.approval.is_some() && state.status != RunStatus::AwaitingApproval {
        errors.push(format!(
            "recorded decision present while status is {}",
            state.status
        ));
    }

    for stage in state.stage_outputs.keys() {
        if !stage.is_work() {
            errors.push(format!("stage_outputs has non-work stage '{stage}'"));
        }
    }

    if state.current_stage == StageTag::AwaitingApproval
        && state.output(StageTag::Planning).is_none()
    {
        errors.push("awaiting approval without a plan".to_string());
    }
    if state.current_stage == StageTag::Building && state.build_input().is_none() {
        errors.push(format!(
            "building is missing its {:?} input",
            state.build_guidance
        ));
    }

    if state.updated_at < state.created_at {
        errors.push("updated_at precedes created_at".to_string());
    }

    errors
}

fn validate_stage_status(state: &RunState, errors: &mut Vec<String>) {
    let consistent = match state.status {
        RunStatus::Created => state.current_stage == StageTag::Planning,
        RunStatus::AwaitingApproval => state.current_stage == StageTag::AwaitingApproval,
        RunStatus::Running => state.current_stage.is_work(),
        RunStatus::Failed => state.current_stage == StageTag::Failed,
        RunStatus::Done => state.current_stage == StageTag::Done,
    };
    if !consistent {
        errors.push(format!(
            "current_stage {} is inconsistent with status {}",
            state.current_stage, state.status
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Decision, FailureReason};
    use chrono::Utc;
    use std::path::PathBuf;

    fn state() -> RunState {
        RunState::new(
            "run-1".to_string(),
            "task".to_string(),
            PathBuf::from("/repo"),
            Utc::now(),
        )
    }

    #[test]
    fn fresh_state_is_valid() {
        assert!(validate_invariants(&state()).is_empty());
    }

    #[test]
    fn reports_stage_status_mismatch() {
        let mut state = state();
        state.status = RunStatus::Done;
        let errors = validate_invariants(&state);
        assert!(errors.iter().any(|err| err.contains("inconsistent")));
    }

    #[test]
    fn reports_failure_reason_mismatch() {
        let mut state = state();
        state.status = RunStatus::Failed;
        state.current_stage = StageTag::Failed;
        let errors = validate_invariants(&state);
        assert!(errors.iter().any(|err| err.contains("missing failure_reason")));

        let mut state = self::state();
        state.failure_reason = Some(FailureReason::PlanRejected { note: None });
        let errors = validate_invariants(&state);
        assert!(errors.iter().any(|err| err.contains("failure_reason present")));
    }

    #[test]
    fn reports_decision_outside_gate_and_missing_inputs() {
        let mut state = state();
        state.approval = Some(Decision::Approved);
        state.status = RunStatus::Running;
        state.current_stage = StageTag::Building;
        let errors = validate_invariants(&state);
        assert!(errors.iter().any(|err| err.contains("recorded decision")));
        assert!(errors.iter().any(|err| err.contains("building is missing")));
    }

    #[test]
    fn reports_unknown_schema_version() {
        let mut state = state();
        state.schema_version = SCHEMA_VERSION + 1;
        let errors = validate_invariants(&state);
        assert!(errors.iter().any(|err| err.contains("schema_version")));
    }
}
