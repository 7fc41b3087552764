//! Initialization helpers for `.workflow/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{WorkflowConfig, write_config};

/// Canonical paths within `.workflow/` for a project root.
#[derive(Debug, Clone)]
pub struct WorkflowPaths {
    pub root: PathBuf,
    pub workflow_dir: PathBuf,
    pub config_path: PathBuf,
    pub gitignore_path: PathBuf,
}

impl WorkflowPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let workflow_dir = root.join(".workflow");
        Self {
            root,
            config_path: workflow_dir.join("config.toml"),
            gitignore_path: workflow_dir.join(".gitignore"),
            workflow_dir,
        }
    }
}

/// Options for `init_workflow`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite existing workflow-owned files.
    pub force: bool,
}

/// Create `.workflow/` scaffolding in `root` with a default config.
///
/// Fails if `.workflow/` already exists unless `options.force` is set.
pub fn init_workflow(root: &Path, options: &InitOptions) -> Result<WorkflowPaths> {
    let paths = WorkflowPaths::new(root);
    if paths.workflow_dir.exists() && !paths.workflow_dir.is_dir() {
        return Err(anyhow!(
            "workflow init: .workflow exists but is not a directory"
        ));
    }
    if paths.workflow_dir.exists() && !options.force {
        return Err(anyhow!(
            "workflow init: .workflow already exists (use --force to overwrite)"
        ));
    }

    let cfg = WorkflowConfig::default();
    create_dir(&paths.workflow_dir)?;
    create_dir(&cfg.checkpoint_dir_in(root))?;
    create_dir(&cfg.log_dir_in(root))?;
    write_file(&paths.gitignore_path, WORKFLOW_GITIGNORE)?;
    write_config(&paths.config_path, &cfg)?;

    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}

const WORKFLOW_GITIGNORE: &str = "runs/\nlogs/\n";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::load_config;

    #[test]
    fn init_creates_expected_layout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();

        let paths = init_workflow(root, &InitOptions { force: false }).expect("init");

        assert!(paths.workflow_dir.is_dir());
        assert!(root.join(".workflow/runs").is_dir());
        assert!(root.join(".workflow/logs").is_dir());
        let gitignore = fs::read_to_string(&paths.gitignore_path).expect("read gitignore");
        assert_eq!(gitignore, WORKFLOW_GITIGNORE);
        let cfg = load_config(&paths.config_path).expect("load config");
        assert_eq!(cfg, WorkflowConfig::default());
    }

    #[test]
    fn init_without_force_refuses_existing_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_workflow(temp.path(), &InitOptions { force: false }).expect("init");
        let err = init_workflow(temp.path(), &InitOptions { force: false }).expect_err("second");
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn init_with_force_restores_default_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_workflow(temp.path(), &InitOptions { force: false }).expect("init");
        fs::write(&paths.config_path, "max_review_retries = 5\n").expect("customize");

        init_workflow(temp.path(), &InitOptions { force: true }).expect("re-init");
        let cfg = load_config(&paths.config_path).expect("load config");
        assert_eq!(cfg.max_review_retries, 1);
    }
}
