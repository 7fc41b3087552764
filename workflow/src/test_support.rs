//! Test doubles for driving the controller without spawning processes.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Result, anyhow};
use tempfile::TempDir;

use crate::approval::ApprovalGate;
use crate::core::types::{Decision, StageReport, StageTag};
use crate::io::checkpoint::{CheckpointStore, FileCheckpointStore, RunLock, StoreError};
use crate::stage::{Stage, StageInput, Stages, StaticRules};
use crate::state::RunState;

/// Scripted result of one stage invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedOutcome {
    Success(String),
    Failure(String),
    /// The stage could not run; surfaces as an error with this message.
    Fatal(String),
}

/// What a scripted stage saw when it was invoked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedCall {
    pub run_id: String,
    pub stage: StageTag,
    pub invocation: u32,
    pub guidance: Option<String>,
    pub rules: String,
}

type CallLog = Arc<Mutex<Vec<ScriptedCall>>>;

/// Stage that replays queued outcomes, then succeeds with `"<stage> output <n>"`.
#[derive(Debug, Clone)]
pub struct ScriptedStage {
    stage: StageTag,
    queue: Arc<Mutex<VecDeque<ScriptedOutcome>>>,
    log: CallLog,
}

impl ScriptedStage {
    fn new(stage: StageTag, log: CallLog) -> Self {
        Self {
            stage,
            queue: Arc::new(Mutex::new(VecDeque::new())),
            log,
        }
    }
}

impl Stage for ScriptedStage {
    fn execute(&self, input: &StageInput<'_>, rules: &StaticRules) -> Result<StageReport> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ScriptedCall {
                run_id: input.run_id.to_string(),
                stage: input.stage,
                invocation: input.invocation,
                guidance: input.guidance.map(str::to_string),
                rules: rules.as_str().to_string(),
            });
        let next = self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match next {
            Some(ScriptedOutcome::Success(artifact)) => Ok(StageReport::Success(artifact)),
            Some(ScriptedOutcome::Failure(findings)) => Ok(StageReport::Failure(findings)),
            Some(ScriptedOutcome::Fatal(message)) => {
                Err(anyhow!(message).context(format!("{} stage", self.stage)))
            }
            None => Ok(StageReport::Success(format!(
                "{} output {}",
                self.stage, input.invocation
            ))),
        }
    }
}

/// One scripted stage per work stage sharing a single call log.
#[derive(Debug, Clone)]
pub struct ScriptedStages {
    log: CallLog,
    stages: BTreeMap<StageTag, ScriptedStage>,
}

/// Scripted stages where every stage succeeds until scripted otherwise.
pub fn scripted_stages() -> ScriptedStages {
    let log: CallLog = Arc::new(Mutex::new(Vec::new()));
    let stages = StageTag::WORK
        .into_iter()
        .map(|tag| (tag, ScriptedStage::new(tag, Arc::clone(&log))))
        .collect();
    ScriptedStages { log, stages }
}

impl ScriptedStages {
    /// Queue outcomes for the next invocations of `stage`.
    pub fn script(&mut self, stage: StageTag, outcomes: Vec<ScriptedOutcome>) -> &mut Self {
        if let Some(scripted) = self.stages.get(&stage) {
            scripted
                .queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend(outcomes);
        }
        self
    }

    /// Stages handle for a controller; scripts and the call log stay shared.
    pub fn build(&self) -> Stages {
        let get = |tag: StageTag| self.stages[&tag].clone();
        Stages::new(
            get(StageTag::Planning),
            get(StageTag::Building),
            get(StageTag::Reviewing),
            get(StageTag::Testing),
            get(StageTag::Diagnosing),
            get(StageTag::Finalizing),
        )
    }

    pub fn calls(&self) -> Vec<ScriptedCall> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stages invoked so far, in order.
    pub fn sequence(&self) -> Vec<StageTag> {
        self.calls().into_iter().map(|call| call.stage).collect()
    }
}

/// Gate that hands out queued decisions, then defers.
#[derive(Debug, Default)]
pub struct ScriptedGate {
    decisions: Mutex<VecDeque<Decision>>,
    consulted: Mutex<u32>,
}

impl ScriptedGate {
    pub fn new(decisions: Vec<Decision>) -> Self {
        Self {
            decisions: Mutex::new(decisions.into()),
            consulted: Mutex::new(0),
        }
    }

    pub fn consulted(&self) -> u32 {
        *self.consulted.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ApprovalGate for ScriptedGate {
    fn await_approval(&self, _state: &RunState) -> Result<Option<Decision>> {
        *self.consulted.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        Ok(self
            .decisions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front())
    }
}

/// Store wrapper that fails every save after the first `allowed` ones.
///
/// Simulates a crash between checkpoints: the inner store keeps the last
/// successful snapshot.
#[derive(Debug)]
pub struct CrashingStore<S> {
    inner: S,
    remaining: Mutex<usize>,
}

impl<S: CheckpointStore> CrashingStore<S> {
    pub fn new(inner: S, allowed: usize) -> Self {
        Self {
            inner,
            remaining: Mutex::new(allowed),
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: CheckpointStore> CheckpointStore for CrashingStore<S> {
    fn save(&self, state: &RunState) -> Result<(), StoreError> {
        let mut remaining = self.remaining.lock().unwrap_or_else(PoisonError::into_inner);
        if *remaining == 0 {
            return Err(StoreError::Io {
                path: PathBuf::from(format!("{}.json", state.run_id)),
                source: std::io::Error::other("simulated crash"),
            });
        }
        *remaining -= 1;
        self.inner.save(state)
    }

    fn load(&self, run_id: &str) -> Result<RunState, StoreError> {
        self.inner.load(run_id)
    }

    fn list_keys(&self) -> Result<std::collections::BTreeSet<String>, StoreError> {
        self.inner.list_keys()
    }

    fn contains(&self, run_id: &str) -> Result<bool, StoreError> {
        self.inner.contains(run_id)
    }

    fn try_lock(&self, run_id: &str) -> Result<Option<RunLock>, StoreError> {
        self.inner.try_lock(run_id)
    }
}

/// Temporary project root with a checkpoint directory.
pub struct TestWorkspace {
    dir: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        std::fs::create_dir_all(dir.path().join("project"))?;
        Ok(Self { dir })
    }

    /// Directory passed as `project_root`.
    pub fn project_root(&self) -> PathBuf {
        self.dir.path().join("project")
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.dir.path().join("runs")
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Fresh file store over the checkpoint directory (empty cache).
    pub fn store(&self) -> FileCheckpointStore {
        FileCheckpointStore::new(self.checkpoint_dir())
    }
}
