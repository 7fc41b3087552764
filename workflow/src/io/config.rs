//! Workflow configuration stored under `.workflow/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::types::{PipelineConfig, StageTag};

/// Workflow configuration (TOML).
///
/// Edited by humans; missing fields take the defaults below. Relative paths
/// resolve against the project root.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Review rejections tolerated before the run fails.
    pub max_review_retries: u32,

    /// Test failures tolerated before the run fails.
    pub max_debug_retries: u32,

    /// Directory holding one checkpoint file per run.
    pub checkpoint_dir: PathBuf,

    /// Directory receiving per-run stage command logs.
    pub log_dir: PathBuf,

    /// Coding rules injected into every stage. Missing file means no rules.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rules_file: Option<PathBuf>,

    /// Wall-clock limit for a single stage command.
    pub stage_timeout_secs: u64,

    /// Truncate stage stdout/stderr logs beyond this many bytes.
    pub stage_output_limit_bytes: usize,

    pub stages: StageCommands,
}

/// Command vector per work stage (`["./agents/plan.sh", "--fast"]`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StageCommands {
    pub planning: Vec<String>,
    pub building: Vec<String>,
    pub reviewing: Vec<String>,
    pub testing: Vec<String>,
    pub diagnosing: Vec<String>,
    pub finalizing: Vec<String>,
}

impl StageCommands {
    /// Command configured for a work stage; empty when unset.
    pub fn get(&self, stage: StageTag) -> &[String] {
        match stage {
            StageTag::Planning => &self.planning,
            StageTag::Building => &self.building,
            StageTag::Reviewing => &self.reviewing,
            StageTag::Testing => &self.testing,
            StageTag::Diagnosing => &self.diagnosing,
            StageTag::Finalizing => &self.finalizing,
            StageTag::AwaitingApproval | StageTag::Done | StageTag::Failed => &[],
        }
    }

    /// Work stages without a usable command.
    pub fn missing(&self) -> Vec<StageTag> {
        StageTag::WORK
            .into_iter()
            .filter(|stage| {
                self.get(*stage)
                    .first()
                    .is_none_or(|program| program.trim().is_empty())
            })
            .collect()
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        let pipeline = PipelineConfig::default();
        Self {
            max_review_retries: pipeline.max_review_retries,
            max_debug_retries: pipeline.max_debug_retries,
            checkpoint_dir: PathBuf::from(".workflow/runs"),
            log_dir: PathBuf::from(".workflow/logs"),
            rules_file: None,
            stage_timeout_secs: 30 * 60,
            stage_output_limit_bytes: 100_000,
            stages: StageCommands::default(),
        }
    }
}

impl WorkflowConfig {
    /// Check everything except stage commands, which are only needed to drive runs.
    pub fn validate(&self) -> Result<()> {
        self.pipeline().validate().map_err(|err| anyhow!(err))?;
        if self.stage_timeout_secs == 0 {
            return Err(anyhow!("stage_timeout_secs must be > 0"));
        }
        if self.stage_output_limit_bytes == 0 {
            return Err(anyhow!("stage_output_limit_bytes must be > 0"));
        }
        if self.checkpoint_dir.as_os_str().is_empty() {
            return Err(anyhow!("checkpoint_dir must not be empty"));
        }
        if self.log_dir.as_os_str().is_empty() {
            return Err(anyhow!("log_dir must not be empty"));
        }
        for stage in StageTag::WORK {
            let command = self.stages.get(stage);
            if !command.is_empty() && command[0].trim().is_empty() {
                return Err(anyhow!("stages.{stage} must start with a program"));
            }
        }
        Ok(())
    }

    /// Retry policy handed to the controller.
    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            max_review_retries: self.max_review_retries,
            max_debug_retries: self.max_debug_retries,
        }
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    pub fn checkpoint_dir_in(&self, root: &Path) -> PathBuf {
        root.join(&self.checkpoint_dir)
    }

    pub fn log_dir_in(&self, root: &Path) -> PathBuf {
        root.join(&self.log_dir)
    }

    pub fn rules_file_in(&self, root: &Path) -> Option<PathBuf> {
        self.rules_file.as_ref().map(|path| root.join(path))
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `WorkflowConfig::default()`.
pub fn load_config(path: &Path) -> Result<WorkflowConfig> {
    if !path.exists() {
        let cfg = WorkflowConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: WorkflowConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &WorkflowConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, WorkflowConfig::default());
        assert_eq!(cfg.pipeline(), PipelineConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(".workflow").join("config.toml");
        let mut cfg = WorkflowConfig::default();
        cfg.rules_file = Some(PathBuf::from("rules/RULES.md"));
        cfg.stages.planning = vec!["./agents/plan.sh".to_string()];
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "max_review_retries = 2\n\n[stages]\ntesting = [\"cargo\", \"test\"]\n",
        )
        .expect("write");

        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_review_retries, 2);
        assert_eq!(cfg.max_debug_retries, 3);
        assert_eq!(cfg.stages.get(StageTag::Testing), ["cargo", "test"]);
        assert_eq!(
            cfg.stages.missing(),
            vec![
                StageTag::Planning,
                StageTag::Building,
                StageTag::Reviewing,
                StageTag::Diagnosing,
                StageTag::Finalizing,
            ]
        );
    }

    #[test]
    fn zero_retry_maximum_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "max_debug_retries = 0\n").expect("write");
        let err = load_config(&path).expect_err("zero max");
        assert!(format!("{err:#}").contains("max_debug_retries"));
    }

    #[test]
    fn blank_program_is_rejected() {
        let mut cfg = WorkflowConfig::default();
        cfg.stages.building = vec![" ".to_string()];
        let err = cfg.validate().expect_err("blank program");
        assert!(err.to_string().contains("stages.building"));
    }
}
