//! Typed errors surfaced by the pipeline controller.
//!
//! Business failures (review/debug exhaustion, rejected plans) and stage
//! execution errors are not errors here: they are recorded on the run and
//! reported through a normal outcome.

use thiserror::Error;

use crate::core::types::{Decision, FailureReason, RunStatus};
use crate::io::checkpoint::StoreError;

/// Errors from controller entry points.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("run {run_id} not found")]
    RunNotFound { run_id: String },

    #[error("run {run_id} is already {status}{}", reason_suffix(.reason))]
    AlreadyTerminal {
        run_id: String,
        status: RunStatus,
        reason: Option<FailureReason>,
    },

    #[error("run {run_id} is busy (another caller is driving it)")]
    RunBusy { run_id: String },

    #[error("run {run_id} is not awaiting approval (status {status})")]
    NotAwaitingApproval { run_id: String, status: RunStatus },

    #[error("run {run_id} already has a recorded decision: {recorded}")]
    DecisionConflict { run_id: String, recorded: Decision },

    #[error("approval gate failed for run {run_id}")]
    ApprovalGate {
        run_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("illegal transition for run {run_id}: {message}")]
    IllegalTransition { run_id: String, message: String },

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { run_id } => PipelineError::RunNotFound { run_id },
            StoreError::InvalidKey { run_id, reason } => {
                PipelineError::InvalidInput(format!("invalid run id {run_id:?}: {reason}"))
            }
            other => PipelineError::Store(other),
        }
    }
}

fn reason_suffix(reason: &Option<FailureReason>) -> String {
    match reason {
        Some(reason) => format!(": {reason}"),
        None => String::new(),
    }
}
