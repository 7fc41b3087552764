//! Pipeline controller: the public entry points for starting, resuming,
//! approving and inspecting runs.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::approval::{ApprovalGate, DeferredGate};
use crate::core::ids::validate_run_id;
use crate::core::transitions::TransitionSummary;
use crate::core::types::{Decision, PipelineConfig, RunStatus};
use crate::error::PipelineError;
use crate::io::checkpoint::{CheckpointStore, RunLock, StoreError};
use crate::looping::{RunOutcome, run_loop};
use crate::stage::{Stages, StaticRules};
use crate::start::{allocate_run_id, validate_start};
use crate::state::{RunState, RunSummary};
use crate::step::StepContext;

/// Orchestrates runs over a checkpoint store and a set of stages.
///
/// Distinct runs may be driven concurrently from several threads; a second
/// concurrent caller on the same run gets `RunBusy`, including a caller in
/// another controller or process sharing the store.
pub struct Controller<S> {
    store: S,
    stages: Stages,
    rules: StaticRules,
    gate: Box<dyn ApprovalGate>,
    active: Mutex<HashSet<String>>,
}

/// Exclusive claim on a run id, released on drop.
///
/// `active` guards threads of this controller; `lock` guards other
/// controllers and processes sharing the store.
struct RunLease<'a> {
    active: &'a Mutex<HashSet<String>>,
    run_id: String,
    lock: Option<RunLock>,
}

impl Drop for RunLease<'_> {
    fn drop(&mut self) {
        drop(self.lock.take());
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.run_id);
    }
}

impl<S: CheckpointStore> Controller<S> {
    /// Controller whose approval decisions come only from [`Controller::decide`].
    pub fn new(store: S, stages: Stages, rules: StaticRules) -> Self {
        Self {
            store,
            stages,
            rules,
            gate: Box::new(DeferredGate),
            active: Mutex::new(HashSet::new()),
        }
    }

    /// Consult `gate` whenever a run waits at the approval gate.
    pub fn with_gate(mut self, gate: impl ApprovalGate + 'static) -> Self {
        self.gate = Box::new(gate);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Create a run for `task_description` and drive it until it finishes or
    /// suspends at the approval gate.
    pub fn start(
        &self,
        task_description: &str,
        project_root: &Path,
        config: &PipelineConfig,
    ) -> Result<RunOutcome, PipelineError> {
        self.start_with(task_description, project_root, config, |_, _| {})
    }

    /// [`Controller::start`] with a callback per checkpointed transition.
    #[instrument(skip_all)]
    pub fn start_with<F: FnMut(&TransitionSummary, &RunState)>(
        &self,
        task_description: &str,
        project_root: &Path,
        config: &PipelineConfig,
        on_step: F,
    ) -> Result<RunOutcome, PipelineError> {
        let root = validate_start(task_description, project_root, config)?;
        let now = Utc::now();

        let run_id = {
            let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
            let run_id = allocate_run_id(&self.store, &active, now, &mut rand::thread_rng())?;
            active.insert(run_id.clone());
            run_id
        };
        let lease = self.hold(run_id)?;

        let state = RunState::new(
            lease.run_id.clone(),
            task_description.trim().to_string(),
            root,
            now,
        );
        self.store.save(&state)?;
        info!(run_id = %state.run_id, root = %state.project_root.display(), "run created");

        self.drive(state, config, on_step)
    }

    /// Continue a run from its latest checkpoint.
    ///
    /// A finished run is a no-op; a failed run is `AlreadyTerminal`.
    pub fn resume(&self, run_id: &str, config: &PipelineConfig) -> Result<RunOutcome, PipelineError> {
        self.resume_with(run_id, config, |_, _| {})
    }

    /// [`Controller::resume`] with a callback per checkpointed transition.
    #[instrument(skip_all, fields(run_id = %run_id))]
    pub fn resume_with<F: FnMut(&TransitionSummary, &RunState)>(
        &self,
        run_id: &str,
        config: &PipelineConfig,
        on_step: F,
    ) -> Result<RunOutcome, PipelineError> {
        config.validate().map_err(PipelineError::InvalidConfig)?;
        validate_run_id(run_id).map_err(PipelineError::InvalidInput)?;
        let _lease = self.claim(run_id)?;

        let state = self.store.load(run_id)?;
        match state.status {
            RunStatus::Done => {
                info!("run already done, nothing to resume");
                return Ok(RunOutcome::from_state(&state, 0));
            }
            RunStatus::Failed => {
                return Err(PipelineError::AlreadyTerminal {
                    run_id: state.run_id,
                    status: state.status,
                    reason: state.failure_reason,
                });
            }
            _ => {}
        }
        info!(stage = %state.current_stage, status = %state.status, "resuming run");
        self.drive(state, config, on_step)
    }

    /// Record an approval decision for a run waiting at the gate.
    ///
    /// Repeating the recorded decision is a no-op; a different one conflicts.
    /// The run does not advance until it is resumed.
    #[instrument(skip_all, fields(run_id = %run_id, decision = %decision))]
    pub fn decide(&self, run_id: &str, decision: Decision) -> Result<(), PipelineError> {
        validate_run_id(run_id).map_err(PipelineError::InvalidInput)?;
        let _lease = self.claim(run_id)?;

        let mut state = self.store.load(run_id)?;
        if state.status != RunStatus::AwaitingApproval {
            return Err(PipelineError::NotAwaitingApproval {
                run_id: state.run_id,
                status: state.status,
            });
        }
        match &state.approval {
            Some(recorded) if *recorded == decision => {
                info!("decision already recorded");
                return Ok(());
            }
            Some(recorded) => {
                return Err(PipelineError::DecisionConflict {
                    run_id: state.run_id.clone(),
                    recorded: recorded.clone(),
                });
            }
            None => {}
        }

        state.approval = Some(decision);
        state.updated_at = Utc::now();
        self.store.save(&state)?;
        info!("decision recorded");
        Ok(())
    }

    /// Summaries of every readable run, sorted by run id.
    ///
    /// Unreadable checkpoints are skipped with a warning.
    pub fn list_runs(&self) -> Result<Vec<RunSummary>, PipelineError> {
        summarize_runs(&self.store)
    }

    /// Latest snapshot of a run.
    pub fn load(&self, run_id: &str) -> Result<RunState, PipelineError> {
        validate_run_id(run_id).map_err(PipelineError::InvalidInput)?;
        Ok(self.store.load(run_id)?)
    }

    fn claim(&self, run_id: &str) -> Result<RunLease<'_>, PipelineError> {
        let inserted = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(run_id.to_string());
        if !inserted {
            return Err(PipelineError::RunBusy {
                run_id: run_id.to_string(),
            });
        }
        self.hold(run_id.to_string())
    }

    /// Take the store lock for a run already registered in `active`.
    fn hold(&self, run_id: String) -> Result<RunLease<'_>, PipelineError> {
        let mut lease = RunLease {
            active: &self.active,
            run_id,
            lock: None,
        };
        match self.store.try_lock(&lease.run_id)? {
            Some(lock) => {
                lease.lock = Some(lock);
                Ok(lease)
            }
            None => {
                debug!(run_id = %lease.run_id, "run is driven by another controller");
                Err(PipelineError::RunBusy {
                    run_id: lease.run_id.clone(),
                })
            }
        }
    }

    fn drive<F: FnMut(&TransitionSummary, &RunState)>(
        &self,
        state: RunState,
        config: &PipelineConfig,
        on_step: F,
    ) -> Result<RunOutcome, PipelineError> {
        let ctx = StepContext {
            store: &self.store,
            stages: &self.stages,
            rules: &self.rules,
            gate: self.gate.as_ref(),
            config,
        };
        run_loop(&ctx, state, on_step)
    }
}

/// Summaries of every readable run in `store`, sorted by run id.
///
/// Never mutates the store; unreadable checkpoints are skipped with a warning.
pub fn summarize_runs<S: CheckpointStore + ?Sized>(
    store: &S,
) -> Result<Vec<RunSummary>, PipelineError> {
    let mut summaries = Vec::new();
    for run_id in store.list_keys()? {
        match store.load(&run_id) {
            Ok(state) => summaries.push(state.summary()),
            Err(err @ (StoreError::Corrupt { .. } | StoreError::NotFound { .. })) => {
                warn!(run_id = %run_id, err = %err, "skipping unreadable checkpoint");
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(summaries)
}
