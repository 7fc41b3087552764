//! Run state: the single mutable record threaded through a pipeline run.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::{BuildGuidance, Decision, FailureReason, RunStatus, StageTag};

/// Checkpoint format version written into every snapshot.
pub const SCHEMA_VERSION: u32 = 1;

const SUMMARY_TASK_CHARS: usize = 80;
const RECORD_NOTE_CHARS: usize = 120;

/// Full snapshot of one run, persisted after every transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunState {
    pub schema_version: u32,
    /// Stable identifier, primary key for checkpoints.
    pub run_id: String,
    pub task_description: String,
    pub project_root: PathBuf,
    /// Stage about to run, or the terminal stage the run ended in.
    pub current_stage: StageTag,
    pub status: RunStatus,
    /// Last artifact produced by each work stage.
    pub stage_outputs: BTreeMap<StageTag, String>,
    /// Which artifact the next building stage consumes.
    pub build_guidance: BuildGuidance,
    pub review_retry_count: u32,
    pub debug_retry_count: u32,
    /// Decision recorded while awaiting approval, not yet applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<Decision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    /// Append-only audit trail of stage invocations and decisions.
    #[serde(default)]
    pub history: Vec<StageRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// How a recorded step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Success,
    BusinessFailure,
    Fatal,
    Approved,
    Rejected,
}

/// One audit trail entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageRecord {
    pub stage: StageTag,
    pub kind: RecordKind,
    pub duration_ms: u64,
    pub recorded_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub note: String,
}

/// Human-readable menu entry for a past run.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    pub current_stage: StageTag,
    pub task: String,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl RunState {
    /// Fresh run in `Created` status, positioned at planning.
    pub fn new(
        run_id: String,
        task_description: String,
        project_root: PathBuf,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            run_id,
            task_description,
            project_root,
            current_stage: StageTag::Planning,
            status: RunStatus::Created,
            stage_outputs: BTreeMap::new(),
            build_guidance: BuildGuidance::Plan,
            review_retry_count: 0,
            debug_retry_count: 0,
            approval: None,
            failure_reason: None,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn output(&self, stage: StageTag) -> Option<&str> {
        self.stage_outputs.get(&stage).map(String::as_str)
    }

    /// Artifact the next building stage consumes.
    pub fn build_input(&self) -> Option<&str> {
        self.output(self.build_guidance.source_stage())
    }

    /// Number of recorded collaborator invocations of `stage`.
    pub fn invocations(&self, stage: StageTag) -> u32 {
        let count = self
            .history
            .iter()
            .filter(|record| record.stage == stage)
            .filter(|record| {
                matches!(
                    record.kind,
                    RecordKind::Success | RecordKind::BusinessFailure | RecordKind::Fatal
                )
            })
            .count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    /// Append an audit entry and bump `updated_at`.
    pub fn record(&mut self, stage: StageTag, kind: RecordKind, duration_ms: u64, note: &str) {
        let now = Utc::now();
        self.history.push(StageRecord {
            stage,
            kind,
            duration_ms,
            recorded_at: now,
            note: truncate_chars(note.trim(), RECORD_NOTE_CHARS),
        });
        self.updated_at = now;
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.run_id.clone(),
            status: self.status,
            current_stage: self.current_stage,
            task: truncate_chars(self.task_description.trim(), SUMMARY_TASK_CHARS),
            updated_at: self.updated_at,
            failure: self.failure_reason.as_ref().map(ToString::to_string),
        }
    }
}

fn truncate_chars(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
