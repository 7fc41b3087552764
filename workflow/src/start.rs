//! Input validation and run id allocation for new runs.
//!
//! Nothing here persists anything: a rejected start leaves no checkpoint.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rand::Rng;
use tracing::debug;

use crate::core::ids::format_run_id;
use crate::core::types::PipelineConfig;
use crate::error::PipelineError;
use crate::io::checkpoint::CheckpointStore;

const MAX_ID_ATTEMPTS: u32 = 64;

/// Validate `start` arguments, returning the canonical project root.
pub fn validate_start(
    task_description: &str,
    project_root: &Path,
    config: &PipelineConfig,
) -> Result<PathBuf, PipelineError> {
    config.validate().map_err(PipelineError::InvalidConfig)?;
    if task_description.trim().is_empty() {
        return Err(PipelineError::InvalidInput(
            "task description must not be empty".to_string(),
        ));
    }
    let metadata = fs::metadata(project_root).map_err(|err| {
        PipelineError::InvalidInput(format!(
            "project root {} is not accessible: {err}",
            project_root.display()
        ))
    })?;
    if !metadata.is_dir() {
        return Err(PipelineError::InvalidInput(format!(
            "project root {} is not a directory",
            project_root.display()
        )));
    }
    fs::canonicalize(project_root).map_err(|err| {
        PipelineError::InvalidInput(format!(
            "resolve project root {}: {err}",
            project_root.display()
        ))
    })
}

/// Pick a run id unused by both the store and in-flight runs.
///
/// Caller holds the lock guarding `active` so allocation and claim are atomic.
pub fn allocate_run_id<S: CheckpointStore + ?Sized, R: Rng>(
    store: &S,
    active: &HashSet<String>,
    now: DateTime<Utc>,
    rng: &mut R,
) -> Result<String, PipelineError> {
    for _ in 0..MAX_ID_ATTEMPTS {
        let candidate = format_run_id(now, rng.r#gen::<u32>());
        if active.contains(&candidate) || store.contains(&candidate)? {
            debug!(run_id = %candidate, "run id collision, regenerating");
            continue;
        }
        return Ok(candidate);
    }
    Err(PipelineError::IllegalTransition {
        run_id: String::new(),
        message: format!("could not allocate a unique run id after {MAX_ID_ATTEMPTS} attempts"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::checkpoint::MemoryCheckpointStore;
    use crate::state::RunState;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn blank_task_is_invalid_input() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = validate_start("   \n", temp.path(), &PipelineConfig::default())
            .expect_err("blank task");
        assert!(matches!(err, PipelineError::InvalidInput(_)));
    }

    #[test]
    fn missing_or_file_root_is_invalid_input() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = validate_start("task", &temp.path().join("absent"), &PipelineConfig::default())
            .expect_err("missing root");
        assert!(matches!(err, PipelineError::InvalidInput(_)));

        let file = temp.path().join("file.txt");
        fs::write(&file, "x").expect("write");
        let err = validate_start("task", &file, &PipelineConfig::default()).expect_err("file root");
        assert!(err.to_string().contains("not a directory"));
    }

    #[test]
    fn zero_maximum_is_invalid_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = PipelineConfig {
            max_review_retries: 0,
            max_debug_retries: 3,
        };
        let err = validate_start("task", temp.path(), &config).expect_err("zero max");
        assert!(matches!(err, PipelineError::InvalidConfig(_)));
    }

    #[test]
    fn allocation_skips_taken_ids() {
        let now = Utc::now();
        let store = MemoryCheckpointStore::new();

        let mut probe = StdRng::seed_from_u64(7);
        let first = format_run_id(now, probe.r#gen::<u32>());
        let second = format_run_id(now, probe.r#gen::<u32>());
        let third = format_run_id(now, probe.r#gen::<u32>());

        store
            .save(&RunState::new(
                first.clone(),
                "task".to_string(),
                PathBuf::from("/repo"),
                now,
            ))
            .expect("save");
        let active = HashSet::from([second.clone()]);

        let mut rng = StdRng::seed_from_u64(7);
        let id = allocate_run_id(&store, &active, now, &mut rng).expect("allocate");
        assert_eq!(id, third);
    }
}
