//! Orchestration for a single pipeline transition.
//!
//! One step runs the collaborator for the current stage (or consults the
//! approval gate), applies the pure transition, appends to the audit trail and
//! checkpoints before returning.

use std::time::Instant;

use tracing::{debug, info, warn};

use crate::approval::{ApprovalGate, resolve_decision};
use crate::core::invariants::validate_invariants;
use crate::core::transitions::{TransitionSummary, apply_decision, apply_report, apply_stage_error};
use crate::core::types::{Decision, PipelineConfig, RunStatus, StageTag};
use crate::error::PipelineError;
use crate::io::checkpoint::CheckpointStore;
use crate::stage::{StageInput, Stages, StaticRules};
use crate::state::{RecordKind, RunState};

/// Collaborators shared by every step of a run.
pub struct StepContext<'a> {
    pub store: &'a dyn CheckpointStore,
    pub stages: &'a Stages,
    pub rules: &'a StaticRules,
    pub gate: &'a dyn ApprovalGate,
    pub config: &'a PipelineConfig,
}

/// Result of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// A transition was applied and checkpointed.
    Advanced(TransitionSummary),
    /// The run waits at the approval gate with no decision available.
    Suspended,
}

/// Execute the stage at `state.current_stage` and checkpoint the result.
///
/// Business failures and stage execution errors are recorded on the run and
/// returned as an advanced step; only controller faults are errors.
pub fn run_step(ctx: &StepContext<'_>, state: &mut RunState) -> Result<StepOutcome, PipelineError> {
    match (state.status, state.current_stage) {
        (RunStatus::AwaitingApproval, StageTag::AwaitingApproval) => gate_step(ctx, state),
        (RunStatus::Running, stage) if stage.is_work() => work_step(ctx, state),
        (status, stage) => Err(PipelineError::IllegalTransition {
            run_id: state.run_id.clone(),
            message: format!("no step from stage {stage} in status {status}"),
        }),
    }
}

fn work_step(ctx: &StepContext<'_>, state: &mut RunState) -> Result<StepOutcome, PipelineError> {
    let stage = state.current_stage;
    let collaborator = ctx
        .stages
        .get(stage)
        .ok_or_else(|| illegal(state, format!("no collaborator for stage {stage}")))?;

    debug!(run_id = %state.run_id, stage = %stage, "invoking stage");
    let started = Instant::now();
    let result = collaborator.execute(&StageInput::for_current(state), ctx.rules);
    let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    let (summary, kind, note) = match result {
        Ok(report) => {
            let kind = if report.is_success() {
                RecordKind::Success
            } else {
                RecordKind::BusinessFailure
            };
            let summary = apply_report(state, &report, ctx.config)
                .map_err(|message| illegal(state, message))?;
            (summary, kind, report.artifact().to_string())
        }
        Err(err) => {
            let message = format!("{err:#}");
            warn!(run_id = %state.run_id, stage = %stage, err = %message, "stage could not run");
            let summary =
                apply_stage_error(state, &message).map_err(|message| illegal(state, message))?;
            (summary, RecordKind::Fatal, message)
        }
    };
    state.record(stage, kind, duration_ms, &note);
    checkpoint(ctx, state)?;

    info!(
        run_id = %state.run_id,
        from = %summary.from,
        to = %summary.to,
        status = %summary.status,
        review_retries = state.review_retry_count,
        debug_retries = state.debug_retry_count,
        duration_ms,
        "stage transition"
    );
    Ok(StepOutcome::Advanced(summary))
}

fn gate_step(ctx: &StepContext<'_>, state: &mut RunState) -> Result<StepOutcome, PipelineError> {
    let decision =
        resolve_decision(ctx.gate, state).map_err(|source| PipelineError::ApprovalGate {
            run_id: state.run_id.clone(),
            source,
        })?;
    let Some(decision) = decision else {
        debug!(run_id = %state.run_id, "no approval decision yet, suspending");
        return Ok(StepOutcome::Suspended);
    };

    let summary = apply_decision(state, &decision).map_err(|message| illegal(state, message))?;
    let (kind, note) = match &decision {
        Decision::Approved => (RecordKind::Approved, String::new()),
        Decision::Rejected { note } => (RecordKind::Rejected, note.clone().unwrap_or_default()),
    };
    state.record(StageTag::AwaitingApproval, kind, 0, &note);
    checkpoint(ctx, state)?;

    info!(run_id = %state.run_id, decision = %decision, to = %summary.to, "approval applied");
    Ok(StepOutcome::Advanced(summary))
}

/// Check invariants, then persist.
pub(crate) fn checkpoint(ctx: &StepContext<'_>, state: &RunState) -> Result<(), PipelineError> {
    let errors = validate_invariants(state);
    if !errors.is_empty() {
        return Err(illegal(state, errors.join("; ")));
    }
    ctx.store.save(state)?;
    Ok(())
}

fn illegal(state: &RunState, message: String) -> PipelineError {
    PipelineError::IllegalTransition {
        run_id: state.run_id.clone(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::DeferredGate;
    use crate::core::types::{BuildGuidance, FailureReason};
    use crate::io::checkpoint::MemoryCheckpointStore;
    use crate::test_support::{ScriptedOutcome, scripted_stages};
    use chrono::Utc;
    use std::path::PathBuf;

    fn running_at(stage: StageTag) -> RunState {
        let mut state = RunState::new(
            "run-step".to_string(),
            "add login".to_string(),
            PathBuf::from("/repo"),
            Utc::now(),
        );
        state.status = RunStatus::Running;
        state.current_stage = stage;
        state
            .stage_outputs
            .insert(StageTag::Planning, "plan".to_string());
        state
    }

    #[test]
    fn work_step_checkpoints_before_returning() {
        let store = MemoryCheckpointStore::new();
        let mut scripted = scripted_stages();
        scripted.script(
            StageTag::Building,
            vec![ScriptedOutcome::Success("src/login.rs".to_string())],
        );
        let stages = scripted.build();
        let ctx = StepContext {
            store: &store,
            stages: &stages,
            rules: &StaticRules::default(),
            gate: &DeferredGate,
            config: &PipelineConfig::default(),
        };
        let mut state = running_at(StageTag::Building);

        let outcome = run_step(&ctx, &mut state).expect("step");
        assert_eq!(
            outcome,
            StepOutcome::Advanced(TransitionSummary {
                from: StageTag::Building,
                to: StageTag::Reviewing,
                status: RunStatus::Running,
            })
        );
        let saved = store.load("run-step").expect("load");
        assert_eq!(saved, state);
        assert_eq!(saved.output(StageTag::Building), Some("src/login.rs"));
        assert_eq!(saved.history.len(), 1);
        assert_eq!(saved.history[0].kind, RecordKind::Success);
    }

    #[test]
    fn stage_error_fails_with_full_chain() {
        let store = MemoryCheckpointStore::new();
        let mut scripted = scripted_stages();
        scripted.script(
            StageTag::Testing,
            vec![ScriptedOutcome::Fatal("connection refused".to_string())],
        );
        let stages = scripted.build();
        let ctx = StepContext {
            store: &store,
            stages: &stages,
            rules: &StaticRules::default(),
            gate: &DeferredGate,
            config: &PipelineConfig::default(),
        };
        let mut state = running_at(StageTag::Testing);
        state
            .stage_outputs
            .insert(StageTag::Building, "manifest".to_string());

        run_step(&ctx, &mut state).expect("step");
        let saved = store.load("run-step").expect("load");
        assert_eq!(saved.status, RunStatus::Failed);
        match saved.failure_reason {
            Some(FailureReason::StageExecutionError { stage, message }) => {
                assert_eq!(stage, StageTag::Testing);
                assert_eq!(message, "testing stage: connection refused");
            }
            other => panic!("expected StageExecutionError, got {other:?}"),
        }
        assert_eq!(saved.history[0].kind, RecordKind::Fatal);
    }

    #[test]
    fn gate_without_decision_suspends_without_saving() {
        let store = MemoryCheckpointStore::new();
        let stages = scripted_stages().build();
        let ctx = StepContext {
            store: &store,
            stages: &stages,
            rules: &StaticRules::default(),
            gate: &DeferredGate,
            config: &PipelineConfig::default(),
        };
        let mut state = running_at(StageTag::AwaitingApproval);
        state.status = RunStatus::AwaitingApproval;

        assert_eq!(run_step(&ctx, &mut state).expect("step"), StepOutcome::Suspended);
        assert!(store.list_keys().expect("keys").is_empty());
    }

    #[test]
    fn recorded_approval_moves_to_building() {
        let store = MemoryCheckpointStore::new();
        let stages = scripted_stages().build();
        let ctx = StepContext {
            store: &store,
            stages: &stages,
            rules: &StaticRules::default(),
            gate: &DeferredGate,
            config: &PipelineConfig::default(),
        };
        let mut state = running_at(StageTag::AwaitingApproval);
        state.status = RunStatus::AwaitingApproval;
        state.approval = Some(Decision::Approved);

        run_step(&ctx, &mut state).expect("step");
        assert_eq!(state.current_stage, StageTag::Building);
        assert_eq!(state.build_guidance, BuildGuidance::Plan);
        assert!(state.approval.is_none());
        assert_eq!(state.history[0].kind, RecordKind::Approved);
    }

    #[test]
    fn terminal_run_has_no_step() {
        let store = MemoryCheckpointStore::new();
        let stages = scripted_stages().build();
        let ctx = StepContext {
            store: &store,
            stages: &stages,
            rules: &StaticRules::default(),
            gate: &DeferredGate,
            config: &PipelineConfig::default(),
        };
        let mut state = running_at(StageTag::Done);
        state.status = RunStatus::Done;
        match run_step(&ctx, &mut state) {
            Err(PipelineError::IllegalTransition { .. }) => {}
            other => panic!("expected IllegalTransition, got {other:?}"),
        }
    }
}
