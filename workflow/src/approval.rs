//! Approval gate between planning and building.
//!
//! The controller never advances past `AwaitingApproval` without an explicit
//! decision. Decisions arrive either through `Controller::decide` (recorded in
//! the checkpoint) or from an [`ApprovalGate`] consulted when the run reaches
//! or resumes at the gate. A gate answering `None` suspends the run.

use anyhow::Result;

use crate::core::types::Decision;
use crate::state::RunState;

/// Source of external approval decisions.
pub trait ApprovalGate: Send + Sync {
    /// Return a decision for the run, or `None` to suspend until the next resume.
    ///
    /// Must never invent a decision (no default or timeout approval).
    fn await_approval(&self, state: &RunState) -> Result<Option<Decision>>;
}

/// Gate that never decides on its own: decisions come only from `decide`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeferredGate;

impl ApprovalGate for DeferredGate {
    fn await_approval(&self, _state: &RunState) -> Result<Option<Decision>> {
        Ok(None)
    }
}

/// Resolve the decision for a run waiting at the gate.
///
/// A decision recorded in the checkpoint always wins over the gate.
pub fn resolve_decision<G: ApprovalGate + ?Sized>(
    gate: &G,
    state: &RunState,
) -> Result<Option<Decision>> {
    if let Some(recorded) = &state.approval {
        return Ok(Some(recorded.clone()));
    }
    gate.await_approval(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::path::PathBuf;

    struct AlwaysReject;

    impl ApprovalGate for AlwaysReject {
        fn await_approval(&self, _state: &RunState) -> Result<Option<Decision>> {
            Ok(Some(Decision::Rejected { note: None }))
        }
    }

    fn state() -> RunState {
        RunState::new(
            "run-1".to_string(),
            "task".to_string(),
            PathBuf::from("/repo"),
            Utc::now(),
        )
    }

    #[test]
    fn deferred_gate_never_decides() {
        let decision = resolve_decision(&DeferredGate, &state()).expect("resolve");
        assert_eq!(decision, None);
    }

    #[test]
    fn recorded_decision_takes_precedence() {
        let mut state = state();
        state.approval = Some(Decision::Approved);
        let decision = resolve_decision(&AlwaysReject, &state).expect("resolve");
        assert_eq!(decision, Some(Decision::Approved));
    }
}
