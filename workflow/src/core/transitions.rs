//! Controller-owned state transitions.
//!
//! Every edge of the pipeline state machine lives here. Functions mutate the
//! run state in memory only; persisting the result is the caller's job.

use crate::core::types::{
    BuildGuidance, Decision, FailureReason, PipelineConfig, RunStatus, StageReport, StageTag,
};
use crate::state::RunState;

/// Edge taken by a single transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionSummary {
    pub from: StageTag,
    pub to: StageTag,
    pub status: RunStatus,
}

/// Move a freshly created run into `Running`.
pub fn begin(state: &mut RunState) -> Result<TransitionSummary, String> {
    if state.status != RunStatus::Created {
        return Err(format!("cannot begin run in status {}", state.status));
    }
    state.status = RunStatus::Running;
    Ok(summary(state, state.current_stage))
}

/// Apply the report of the work stage at `state.current_stage`.
///
/// Business failures are only meaningful for reviewing and testing; any other
/// stage reporting a failure is treated as a stage that could not do its job.
pub fn apply_report(
    state: &mut RunState,
    report: &StageReport,
    config: &PipelineConfig,
) -> Result<TransitionSummary, String> {
    let from = ensure_running_work_stage(state)?;
    let artifact = report.artifact().to_string();

    match (from, report.is_success()) {
        (StageTag::Planning, true) => {
            state.stage_outputs.insert(StageTag::Planning, artifact);
            state.current_stage = StageTag::AwaitingApproval;
            state.status = RunStatus::AwaitingApproval;
        }
        (StageTag::Building, true) => {
            state.stage_outputs.insert(StageTag::Building, artifact);
            state.current_stage = StageTag::Reviewing;
        }
        (StageTag::Reviewing, true) => {
            state.stage_outputs.insert(StageTag::Reviewing, artifact);
            state.current_stage = StageTag::Testing;
        }
        (StageTag::Reviewing, false) => {
            state.stage_outputs.insert(StageTag::Reviewing, artifact);
            state.review_retry_count += 1;
            let retries = state.review_retry_count;
            if retries > config.max_review_retries {
                fail(
                    state,
                    FailureReason::ReviewRetriesExhausted {
                        retries,
                        max: config.max_review_retries,
                    },
                );
            } else {
                state.build_guidance = BuildGuidance::ReviewFindings;
                state.current_stage = StageTag::Building;
            }
        }
        (StageTag::Testing, true) => {
            state.stage_outputs.insert(StageTag::Testing, artifact);
            state.current_stage = StageTag::Finalizing;
        }
        (StageTag::Testing, false) => {
            state.stage_outputs.insert(StageTag::Testing, artifact);
            state.debug_retry_count += 1;
            let retries = state.debug_retry_count;
            if retries > config.max_debug_retries {
                fail(
                    state,
                    FailureReason::DebugRetriesExhausted {
                        retries,
                        max: config.max_debug_retries,
                    },
                );
            } else {
                state.current_stage = StageTag::Diagnosing;
            }
        }
        (StageTag::Diagnosing, true) => {
            state.stage_outputs.insert(StageTag::Diagnosing, artifact);
            state.build_guidance = BuildGuidance::Diagnosis;
            state.current_stage = StageTag::Building;
        }
        (StageTag::Finalizing, true) => {
            state.stage_outputs.insert(StageTag::Finalizing, artifact);
            state.current_stage = StageTag::Done;
            state.status = RunStatus::Done;
        }
        (stage, _) => {
            let message = if artifact.trim().is_empty() {
                format!("{stage} stage reported a failure")
            } else {
                format!("{stage} stage reported a failure: {}", artifact.trim())
            };
            fail(state, FailureReason::StageExecutionError { stage, message });
        }
    }

    Ok(summary(state, from))
}

/// Fail the run because the current work stage could not run at all.
pub fn apply_stage_error(state: &mut RunState, message: &str) -> Result<TransitionSummary, String> {
    let from = ensure_running_work_stage(state)?;
    let message = match message.trim() {
        "" => "stage returned an error without a message".to_string(),
        text => text.to_string(),
    };
    fail(
        state,
        FailureReason::StageExecutionError {
            stage: from,
            message,
        },
    );
    Ok(summary(state, from))
}

/// Apply an external approval decision to a run waiting at the gate.
pub fn apply_decision(
    state: &mut RunState,
    decision: &Decision,
) -> Result<TransitionSummary, String> {
    if state.status != RunStatus::AwaitingApproval
        || state.current_stage != StageTag::AwaitingApproval
    {
        return Err(format!(
            "cannot apply decision at stage {} (status {})",
            state.current_stage, state.status
        ));
    }
    state.approval = None;
    match decision {
        Decision::Approved => {
            state.status = RunStatus::Running;
            state.build_guidance = BuildGuidance::Plan;
            state.current_stage = StageTag::Building;
        }
        Decision::Rejected { note } => {
            fail(state, FailureReason::PlanRejected { note: note.clone() });
        }
    }
    Ok(summary(state, StageTag::AwaitingApproval))
}

fn ensure_running_work_stage(state: &RunState) -> Result<StageTag, String> {
    if state.status != RunStatus::Running {
        return Err(format!(
            "cannot run stage {} while status is {}",
            state.current_stage, state.status
        ));
    }
    if !state.current_stage.is_work() {
        return Err(format!("{} is not a work stage", state.current_stage));
    }
    Ok(state.current_stage)
}

fn fail(state: &mut RunState, reason: FailureReason) {
    state.approval = None;
    state.failure_reason = Some(reason);
    state.current_stage = StageTag::Failed;
    state.status = RunStatus::Failed;
}

fn summary(state: &RunState, from: StageTag) -> TransitionSummary {
    TransitionSummary {
        from,
        to: state.current_stage,
        status: state.status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::path::PathBuf;

    fn running_at(stage: StageTag) -> RunState {
        let mut state = RunState::new(
            "run-1".to_string(),
            "task".to_string(),
            PathBuf::from("/repo"),
            Utc::now(),
        );
        state.status = RunStatus::Running;
        state.current_stage = stage;
        state
    }

    fn ok(text: &str) -> StageReport {
        StageReport::Success(text.to_string())
    }

    fn failed(text: &str) -> StageReport {
        StageReport::Failure(text.to_string())
    }

    #[test]
    fn planning_success_suspends_at_gate() {
        let mut state = running_at(StageTag::Planning);
        let edge = apply_report(&mut state, &ok("plan"), &PipelineConfig::default())
            .expect("apply");
        assert_eq!(edge.from, StageTag::Planning);
        assert_eq!(edge.to, StageTag::AwaitingApproval);
        assert_eq!(state.status, RunStatus::AwaitingApproval);
        assert_eq!(state.output(StageTag::Planning), Some("plan"));
    }

    #[test]
    fn review_failure_loops_back_until_max_then_fails() {
        let cfg = PipelineConfig {
            max_review_retries: 1,
            max_debug_retries: 3,
        };
        let mut state = running_at(StageTag::Reviewing);

        apply_report(&mut state, &failed("missing tests"), &cfg).expect("first failure");
        assert_eq!(state.review_retry_count, 1);
        assert_eq!(state.current_stage, StageTag::Building);
        assert_eq!(state.build_guidance, BuildGuidance::ReviewFindings);
        assert_eq!(state.build_input(), Some("missing tests"));

        state.current_stage = StageTag::Reviewing;
        apply_report(&mut state, &failed("still missing tests"), &cfg).expect("second failure");
        assert_eq!(state.review_retry_count, 2);
        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(state.current_stage, StageTag::Failed);
        assert_eq!(
            state.failure_reason,
            Some(FailureReason::ReviewRetriesExhausted { retries: 2, max: 1 })
        );
    }

    #[test]
    fn review_failure_at_exact_max_still_retries() {
        let cfg = PipelineConfig {
            max_review_retries: 2,
            max_debug_retries: 3,
        };
        let mut state = running_at(StageTag::Reviewing);
        state.review_retry_count = 1;
        apply_report(&mut state, &failed("nit"), &cfg).expect("apply");
        assert_eq!(state.review_retry_count, 2);
        assert_eq!(state.status, RunStatus::Running);
        assert_eq!(state.current_stage, StageTag::Building);
    }

    #[test]
    fn test_failure_goes_through_diagnosis() {
        let cfg = PipelineConfig::default();
        let mut state = running_at(StageTag::Testing);
        apply_report(&mut state, &failed("1 failed"), &cfg).expect("apply");
        assert_eq!(state.debug_retry_count, 1);
        assert_eq!(state.current_stage, StageTag::Diagnosing);

        apply_report(&mut state, &ok("fix off-by-one"), &cfg).expect("diagnose");
        assert_eq!(state.current_stage, StageTag::Building);
        assert_eq!(state.build_guidance, BuildGuidance::Diagnosis);
        assert_eq!(state.build_input(), Some("fix off-by-one"));
    }

    #[test]
    fn debug_retries_exhaust_one_past_max() {
        let cfg = PipelineConfig {
            max_review_retries: 1,
            max_debug_retries: 3,
        };
        let mut state = running_at(StageTag::Testing);
        state.debug_retry_count = 3;
        apply_report(&mut state, &failed("still red"), &cfg).expect("apply");
        assert_eq!(state.debug_retry_count, 4);
        assert_eq!(
            state.failure_reason,
            Some(FailureReason::DebugRetriesExhausted { retries: 4, max: 3 })
        );
        assert_eq!(state.output(StageTag::Testing), Some("still red"));
    }

    #[test]
    fn finalizing_success_completes_run() {
        let mut state = running_at(StageTag::Finalizing);
        apply_report(&mut state, &ok("docs"), &PipelineConfig::default()).expect("apply");
        assert_eq!(state.status, RunStatus::Done);
        assert_eq!(state.current_stage, StageTag::Done);
        assert!(state.failure_reason.is_none());
    }

    #[test]
    fn failure_from_stage_without_failure_edge_is_execution_error() {
        let mut state = running_at(StageTag::Building);
        apply_report(&mut state, &failed("compiler crashed"), &PipelineConfig::default())
            .expect("apply");
        match state.failure_reason {
            Some(FailureReason::StageExecutionError { stage, message }) => {
                assert_eq!(stage, StageTag::Building);
                assert!(message.contains("compiler crashed"));
            }
            other => panic!("unexpected failure reason: {other:?}"),
        }
    }

    #[test]
    fn stage_error_message_is_never_empty() {
        let mut state = running_at(StageTag::Testing);
        apply_stage_error(&mut state, "  ").expect("apply");
        match state.failure_reason {
            Some(FailureReason::StageExecutionError { message, .. }) => {
                assert!(!message.is_empty());
            }
            other => panic!("unexpected failure reason: {other:?}"),
        }
    }

    #[test]
    fn reports_are_rejected_outside_running_work_stages() {
        let cfg = PipelineConfig::default();
        let mut state = running_at(StageTag::AwaitingApproval);
        assert!(apply_report(&mut state, &ok("x"), &cfg).is_err());

        let mut state = running_at(StageTag::Building);
        state.status = RunStatus::Created;
        assert!(apply_report(&mut state, &ok("x"), &cfg).is_err());
    }

    #[test]
    fn decisions_apply_only_at_gate() {
        let mut state = running_at(StageTag::Planning);
        assert!(apply_decision(&mut state, &Decision::Approved).is_err());

        state.current_stage = StageTag::AwaitingApproval;
        state.status = RunStatus::AwaitingApproval;
        state.approval = Some(Decision::Approved);
        let edge = apply_decision(&mut state, &Decision::Approved).expect("approve");
        assert_eq!(edge.to, StageTag::Building);
        assert_eq!(state.status, RunStatus::Running);
        assert!(state.approval.is_none());
    }

    #[test]
    fn rejection_fails_with_plan_rejected() {
        let mut state = running_at(StageTag::AwaitingApproval);
        state.status = RunStatus::AwaitingApproval;
        let decision = Decision::Rejected {
            note: Some("wrong module".to_string()),
        };
        apply_decision(&mut state, &decision).expect("reject");
        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(
            state.failure_reason,
            Some(FailureReason::PlanRejected {
                note: Some("wrong module".to_string())
            })
        );
    }

    #[test]
    fn begin_only_from_created() {
        let mut state = running_at(StageTag::Planning);
        assert!(begin(&mut state).is_err());
        state.status = RunStatus::Created;
        let edge = begin(&mut state).expect("begin");
        assert_eq!(edge.status, RunStatus::Running);
        assert_eq!(edge.to, StageTag::Planning);
    }
}
