//! Stage adapter that runs an external command per invocation.
//!
//! Protocol: the command runs in the project root, reads a JSON
//! [`StageRequest`] on stdin and writes a JSON report to the path in
//! `WORKFLOW_REPORT_PATH`. Anything other than exit 0 plus a valid report is
//! an execution error.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use jsonschema::{Validator, validator_for};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::config::WorkflowConfig;
use super::process::{CommandOutput, run_command_with_timeout};
use crate::core::types::{StageReport, StageTag};
use crate::stage::{Stage, StageInput, Stages, StaticRules};

const REPORT_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/stage_report.schema.json"
));

pub const ENV_RUN_ID: &str = "WORKFLOW_RUN_ID";
pub const ENV_STAGE: &str = "WORKFLOW_STAGE";
pub const ENV_REPORT_PATH: &str = "WORKFLOW_REPORT_PATH";

/// JSON document written to the command's stdin.
#[derive(Debug, Serialize)]
pub struct StageRequest<'a> {
    pub run_id: &'a str,
    pub stage: StageTag,
    pub invocation: u32,
    pub task_description: &'a str,
    pub project_root: &'a Path,
    pub guidance: Option<&'a str>,
    pub stage_outputs: &'a BTreeMap<StageTag, String>,
    pub review_retry_count: u32,
    pub debug_retry_count: u32,
    pub rules: &'a StaticRules,
}

impl<'a> StageRequest<'a> {
    pub fn new(input: &StageInput<'a>, rules: &'a StaticRules) -> Self {
        Self {
            run_id: input.run_id,
            stage: input.stage,
            invocation: input.invocation,
            task_description: input.task_description,
            project_root: input.project_root,
            guidance: input.guidance,
            stage_outputs: input.stage_outputs,
            review_retry_count: input.review_retry_count,
            debug_retry_count: input.debug_retry_count,
            rules,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ReportOutcome {
    Success,
    Failure,
}

#[derive(Debug, Deserialize)]
struct ReportFile {
    outcome: ReportOutcome,
    artifact: String,
}

/// Compile the embedded stage report schema.
pub fn report_validator() -> Result<Arc<Validator>> {
    let schema: Value =
        serde_json::from_str(REPORT_SCHEMA).context("parse embedded stage report schema")?;
    let compiled = validator_for(&schema).map_err(|err| anyhow!("invalid schema: {}", err))?;
    Ok(Arc::new(compiled))
}

/// Parse and validate a report document.
pub fn parse_report(validator: &Validator, contents: &str) -> Result<StageReport> {
    let value: Value = serde_json::from_str(contents).context("parse stage report json")?;
    if !validator.is_valid(&value) {
        let messages = validator
            .iter_errors(&value)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "stage report schema validation failed: {}",
            messages.join("; ")
        ));
    }
    let report: ReportFile = serde_json::from_value(value).context("decode stage report")?;
    Ok(match report.outcome {
        ReportOutcome::Success => StageReport::Success(report.artifact),
        ReportOutcome::Failure => StageReport::Failure(report.artifact),
    })
}

/// Stage backed by an external command.
pub struct CommandStage {
    pub stage: StageTag,
    pub command: Vec<String>,
    pub log_dir: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    validator: Arc<Validator>,
}

impl CommandStage {
    pub fn new(
        stage: StageTag,
        command: Vec<String>,
        log_dir: PathBuf,
        timeout: Duration,
        output_limit_bytes: usize,
        validator: Arc<Validator>,
    ) -> Result<Self> {
        if command.first().is_none_or(|program| program.trim().is_empty()) {
            return Err(anyhow!("stage {stage} has no command configured"));
        }
        Ok(Self {
            stage,
            command,
            log_dir,
            timeout,
            output_limit_bytes,
            validator,
        })
    }

    /// `<log_dir>/<run_id>/<invocation>-<stage>` without extension.
    fn artifact_base(&self, input: &StageInput<'_>) -> PathBuf {
        self.log_dir
            .join(input.run_id)
            .join(format!("{:02}-{}", input.invocation, input.stage))
    }
}

impl Stage for CommandStage {
    #[instrument(skip_all, fields(run_id = input.run_id, stage = %input.stage, invocation = input.invocation))]
    fn execute(&self, input: &StageInput<'_>, rules: &StaticRules) -> Result<StageReport> {
        let base = self.artifact_base(input);
        let report_path = base.with_extension("report.json");
        let log_path = base.with_extension("log");
        if let Some(parent) = report_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create stage log dir {}", parent.display()))?;
        }
        remove_stale(&report_path)?;

        let request = serde_json::to_vec_pretty(&StageRequest::new(input, rules))
            .context("serialize stage request")?;

        let program = &self.command[0];
        info!(program = %program, "starting stage command");
        let mut cmd = Command::new(program);
        cmd.args(&self.command[1..])
            .current_dir(input.project_root)
            .env(ENV_RUN_ID, input.run_id)
            .env(ENV_STAGE, input.stage.as_str())
            .env(ENV_REPORT_PATH, &report_path);

        let output = run_command_with_timeout(
            cmd,
            Some(request),
            self.timeout,
            self.output_limit_bytes,
        )
        .with_context(|| format!("run {} stage command {program}", input.stage))?;

        write_stage_log(&log_path, &output, input.stage)?;

        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "stage command timed out");
            return Err(anyhow!(
                "{} stage command timed out after {:?}",
                input.stage,
                self.timeout
            ));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "stage command failed");
            let detail = output
                .stderr_tail()
                .map(|line| format!(": {line}"))
                .unwrap_or_default();
            return Err(anyhow!(
                "{} stage command exited with status {:?}{detail} (log {})",
                input.stage,
                output.status.code(),
                log_path.display()
            ));
        }

        let contents = match fs::read_to_string(&report_path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(anyhow!(
                    "{} stage command did not write a report to {}",
                    input.stage,
                    report_path.display()
                ));
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("read stage report {}", report_path.display()));
            }
        };
        let report = parse_report(&self.validator, &contents)
            .with_context(|| format!("invalid stage report {}", report_path.display()))?;
        debug!(success = report.is_success(), "stage report accepted");
        Ok(report)
    }
}

fn remove_stale(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove stale report {}", path.display())),
    }
}

fn write_stage_log(path: &Path, output: &CommandOutput, stage: StageTag) -> Result<()> {
    fs::write(path, output.render_log(stage.as_str()))
        .with_context(|| format!("write stage log {}", path.display()))
}

/// Build command-backed stages for every work stage from config.
///
/// Fails naming every stage without a command.
pub fn command_stages(cfg: &WorkflowConfig, root: &Path) -> Result<Stages> {
    let missing = cfg.stages.missing();
    if !missing.is_empty() {
        let names = missing
            .iter()
            .map(|stage| stage.as_str())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "no command configured for stages: {} (set [stages] in .workflow/config.toml)",
            names.join(", ")
        ));
    }

    let validator = report_validator()?;
    let log_dir = cfg.log_dir_in(root);
    let build = |stage: StageTag| {
        CommandStage::new(
            stage,
            cfg.stages.get(stage).to_vec(),
            log_dir.clone(),
            cfg.stage_timeout(),
            cfg.stage_output_limit_bytes,
            Arc::clone(&validator),
        )
    };
    Ok(Stages::new(
        build(StageTag::Planning)?,
        build(StageTag::Building)?,
        build(StageTag::Reviewing)?,
        build(StageTag::Testing)?,
        build(StageTag::Diagnosing)?,
        build(StageTag::Finalizing)?,
    ))
}
