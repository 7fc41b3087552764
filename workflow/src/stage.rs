//! Stage contract: the one interface every pipeline collaborator implements.
//!
//! The controller hands each stage a read-only view of the run plus the
//! static rules, and receives a [`StageReport`]. A stage that cannot run at
//! all returns an error instead; the controller never retries those.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;

use crate::core::types::{StageReport, StageTag};
use crate::state::RunState;

/// Coding-standard text injected unchanged into every stage invocation.
///
/// The controller never inspects the content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct StaticRules(Arc<str>);

impl StaticRules {
    pub fn new(text: impl Into<String>) -> Self {
        Self(Arc::from(text.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Read-only view of a run handed to the stage about to execute.
#[derive(Debug, Clone, Copy)]
pub struct StageInput<'a> {
    pub run_id: &'a str,
    pub stage: StageTag,
    pub task_description: &'a str,
    pub project_root: &'a Path,
    /// Primary artifact this stage works from (plan, fix instructions, manifest, test output).
    pub guidance: Option<&'a str>,
    /// Every artifact produced so far.
    pub stage_outputs: &'a BTreeMap<StageTag, String>,
    pub review_retry_count: u32,
    pub debug_retry_count: u32,
    /// 1-based count of invocations of this stage within the run, including this one.
    pub invocation: u32,
}

impl<'a> StageInput<'a> {
    /// View of `state` for the stage at `state.current_stage`.
    pub fn for_current(state: &'a RunState) -> Self {
        let stage = state.current_stage;
        let guidance = match stage {
            StageTag::Building => state.build_input(),
            StageTag::Reviewing | StageTag::Testing | StageTag::Finalizing => {
                state.output(StageTag::Building)
            }
            StageTag::Diagnosing => state.output(StageTag::Testing),
            _ => None,
        };
        Self {
            run_id: &state.run_id,
            stage,
            task_description: &state.task_description,
            project_root: &state.project_root,
            guidance,
            stage_outputs: &state.stage_outputs,
            review_retry_count: state.review_retry_count,
            debug_retry_count: state.debug_retry_count,
            invocation: state.invocations(stage).saturating_add(1),
        }
    }
}

/// Abstraction over stage collaborators (planning, building, reviewing, ...).
pub trait Stage: Send + Sync {
    /// Run the stage. `Err` means the stage could not run at all.
    fn execute(&self, input: &StageInput<'_>, rules: &StaticRules) -> Result<StageReport>;
}

impl<S: Stage + ?Sized> Stage for Arc<S> {
    fn execute(&self, input: &StageInput<'_>, rules: &StaticRules) -> Result<StageReport> {
        (**self).execute(input, rules)
    }
}

impl<S: Stage + ?Sized> Stage for Box<S> {
    fn execute(&self, input: &StageInput<'_>, rules: &StaticRules) -> Result<StageReport> {
        (**self).execute(input, rules)
    }
}

/// The six collaborators of a pipeline, one per work stage.
pub struct Stages {
    planning: Box<dyn Stage>,
    building: Box<dyn Stage>,
    reviewing: Box<dyn Stage>,
    testing: Box<dyn Stage>,
    diagnosing: Box<dyn Stage>,
    finalizing: Box<dyn Stage>,
}

impl Stages {
    pub fn new(
        planning: impl Stage + 'static,
        building: impl Stage + 'static,
        reviewing: impl Stage + 'static,
        testing: impl Stage + 'static,
        diagnosing: impl Stage + 'static,
        finalizing: impl Stage + 'static,
    ) -> Self {
        Self {
            planning: Box::new(planning),
            building: Box::new(building),
            reviewing: Box::new(reviewing),
            testing: Box::new(testing),
            diagnosing: Box::new(diagnosing),
            finalizing: Box::new(finalizing),
        }
    }

    /// Collaborator for a work stage; `None` for the gate and terminal stages.
    pub fn get(&self, tag: StageTag) -> Option<&dyn Stage> {
        let stage = match tag {
            StageTag::Planning => &self.planning,
            StageTag::Building => &self.building,
            StageTag::Reviewing => &self.reviewing,
            StageTag::Testing => &self.testing,
            StageTag::Diagnosing => &self.diagnosing,
            StageTag::Finalizing => &self.finalizing,
            StageTag::AwaitingApproval | StageTag::Done | StageTag::Failed => return None,
        };
        Some(stage.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::BuildGuidance;
    use chrono::Utc;
    use std::path::PathBuf;

    struct Echo;

    impl Stage for Echo {
        fn execute(&self, input: &StageInput<'_>, rules: &StaticRules) -> Result<StageReport> {
            Ok(StageReport::Success(format!(
                "{}:{}",
                input.stage,
                rules.as_str()
            )))
        }
    }

    fn state_at(stage: StageTag) -> RunState {
        let mut state = RunState::new(
            "run-1".to_string(),
            "task".to_string(),
            PathBuf::from("/repo"),
            Utc::now(),
        );
        state.current_stage = stage;
        state
            .stage_outputs
            .insert(StageTag::Planning, "plan".to_string());
        state
            .stage_outputs
            .insert(StageTag::Building, "manifest".to_string());
        state
            .stage_outputs
            .insert(StageTag::Testing, "1 failed".to_string());
        state
    }

    #[test]
    fn rules_serialize_as_plain_text() {
        let rules = StaticRules::new("- no unwrap");
        let json = serde_json::to_string(&rules).expect("encode");
        assert_eq!(json, "\"- no unwrap\"");

        let state = state_at(StageTag::Planning);
        let report = Echo
            .execute(&StageInput::for_current(&state), &rules)
            .expect("execute");
        assert_eq!(report.artifact(), "planning:- no unwrap");
    }

    #[test]
    fn input_guidance_depends_on_stage() {
        let state = state_at(StageTag::Building);
        assert_eq!(StageInput::for_current(&state).guidance, Some("plan"));

        let state = state_at(StageTag::Reviewing);
        assert_eq!(StageInput::for_current(&state).guidance, Some("manifest"));

        let state = state_at(StageTag::Diagnosing);
        assert_eq!(StageInput::for_current(&state).guidance, Some("1 failed"));

        let state = state_at(StageTag::Planning);
        assert_eq!(StageInput::for_current(&state).guidance, None);
        assert_eq!(StageInput::for_current(&state).invocation, 1);
    }

    #[test]
    fn building_on_retry_sees_findings_instead_of_plan() {
        let mut state = state_at(StageTag::Building);
        state
            .stage_outputs
            .insert(StageTag::Reviewing, "rename handler".to_string());
        state.build_guidance = BuildGuidance::ReviewFindings;
        assert_eq!(
            StageInput::for_current(&state).guidance,
            Some("rename handler")
        );
    }

    #[test]
    fn stages_resolve_work_tags_only() {
        let stages = Stages::new(Echo, Echo, Echo, Echo, Echo, Echo);
        let rules = StaticRules::new("no unwrap");
        let state = state_at(StageTag::Testing);
        let input = StageInput::for_current(&state);

        for tag in StageTag::WORK {
            assert!(stages.get(tag).is_some());
        }
        assert!(stages.get(StageTag::AwaitingApproval).is_none());
        assert!(stages.get(StageTag::Done).is_none());

        let report = stages
            .get(StageTag::Testing)
            .expect("testing stage")
            .execute(&input, &rules)
            .expect("execute");
        assert_eq!(report, StageReport::Success("testing:no unwrap".to_string()));
    }
}
