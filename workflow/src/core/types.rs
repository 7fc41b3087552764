//! Shared deterministic types for the pipeline core.
//!
//! These types define stable contracts between the controller, the checkpoint
//! format and stage collaborators. Serialized names are part of the checkpoint
//! format and must not change without bumping the schema version.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Position of a run in the pipeline state machine.
///
/// Work stages invoke a stage collaborator; `AwaitingApproval` is a pure
/// synchronization point; `Done` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageTag {
    Planning,
    AwaitingApproval,
    Building,
    Reviewing,
    Testing,
    Diagnosing,
    Finalizing,
    Done,
    Failed,
}

impl StageTag {
    /// Stages that invoke a stage collaborator, in pipeline order.
    pub const WORK: [StageTag; 6] = [
        StageTag::Planning,
        StageTag::Building,
        StageTag::Reviewing,
        StageTag::Testing,
        StageTag::Diagnosing,
        StageTag::Finalizing,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StageTag::Planning => "planning",
            StageTag::AwaitingApproval => "awaiting_approval",
            StageTag::Building => "building",
            StageTag::Reviewing => "reviewing",
            StageTag::Testing => "testing",
            StageTag::Diagnosing => "diagnosing",
            StageTag::Finalizing => "finalizing",
            StageTag::Done => "done",
            StageTag::Failed => "failed",
        }
    }

    /// True if reaching this stage invokes a stage collaborator.
    pub fn is_work(self) -> bool {
        Self::WORK.contains(&self)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, StageTag::Done | StageTag::Failed)
    }
}

impl fmt::Display for StageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    AwaitingApproval,
    Running,
    Failed,
    Done,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Created => "created",
            RunStatus::AwaitingApproval => "awaiting_approval",
            RunStatus::Running => "running",
            RunStatus::Failed => "failed",
            RunStatus::Done => "done",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Done | RunStatus::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Artifact the next building stage consumes.
///
/// The plan on the first pass; review findings or a diagnosis on a retry edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildGuidance {
    Plan,
    ReviewFindings,
    Diagnosis,
}

impl BuildGuidance {
    /// Stage whose stored output carries this guidance.
    pub fn source_stage(self) -> StageTag {
        match self {
            BuildGuidance::Plan => StageTag::Planning,
            BuildGuidance::ReviewFindings => StageTag::Reviewing,
            BuildGuidance::Diagnosis => StageTag::Diagnosing,
        }
    }
}

/// Externally supplied decision at the approval gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Rejected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Approved => f.write_str("approved"),
            Decision::Rejected { note: None } => f.write_str("rejected"),
            Decision::Rejected { note: Some(note) } => write!(f, "rejected ({note})"),
        }
    }
}

/// Report returned by a stage collaborator that managed to run.
///
/// Infrastructure faults are not reports; stages surface them as errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageReport {
    /// The stage produced its artifact.
    Success(String),
    /// The stage ran and reported a business failure (review rejected, tests failed).
    Failure(String),
}

impl StageReport {
    pub fn artifact(&self) -> &str {
        match self {
            StageReport::Success(artifact) | StageReport::Failure(artifact) => artifact,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StageReport::Success(_))
    }
}

/// Terminating cause recorded on a failed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    PlanRejected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    ReviewRetriesExhausted {
        retries: u32,
        max: u32,
    },
    DebugRetriesExhausted {
        retries: u32,
        max: u32,
    },
    StageExecutionError {
        stage: StageTag,
        message: String,
    },
}

impl FailureReason {
    /// Stable machine-readable name of the failure kind.
    pub fn code(&self) -> &'static str {
        match self {
            FailureReason::PlanRejected { .. } => "PlanRejected",
            FailureReason::ReviewRetriesExhausted { .. } => "ReviewRetriesExhausted",
            FailureReason::DebugRetriesExhausted { .. } => "DebugRetriesExhausted",
            FailureReason::StageExecutionError { .. } => "StageExecutionError",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::PlanRejected { note: None } => f.write_str("plan rejected"),
            FailureReason::PlanRejected { note: Some(note) } => {
                write!(f, "plan rejected: {note}")
            }
            FailureReason::ReviewRetriesExhausted { retries, max } => {
                write!(f, "review retries exhausted ({retries} failures, max {max} retries)")
            }
            FailureReason::DebugRetriesExhausted { retries, max } => {
                write!(f, "debug retries exhausted ({retries} failures, max {max} retries)")
            }
            FailureReason::StageExecutionError { stage, message } => {
                write!(f, "{stage} stage could not run: {message}")
            }
        }
    }
}

/// Retry policy consumed by the controller.
///
/// Passed explicitly into `start`/`resume`; never read from ambient state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Review failures tolerated before the run fails (each one loops back to building).
    pub max_review_retries: u32,
    /// Test failures tolerated before the run fails (each one goes through diagnosis).
    pub max_debug_retries: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_review_retries: 1,
            max_debug_retries: 3,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_review_retries == 0 {
            return Err("max_review_retries must be > 0".to_string());
        }
        if self.max_debug_retries == 0 {
            return Err("max_debug_retries must be > 0".to_string());
        }
        Ok(())
    }
}
