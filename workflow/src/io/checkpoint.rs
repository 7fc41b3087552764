//! Durable checkpoint storage for run state.
//!
//! One snapshot per run, overwritten after every transition. The file store
//! writes `<dir>/<run_id>.json` through a temp file and rename so a crash
//! between saves leaves the previous snapshot intact. Stores also hand out
//! per-run locks so only one caller drives a run at a time.

use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use fs2::FileExt;
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::ids::validate_run_id;
use crate::core::invariants::validate_invariants;
use crate::state::{RunState, SCHEMA_VERSION};

const SNAPSHOT_EXT: &str = "json";
const TEMP_SUFFIX: &str = ".json.tmp";
const LOCK_EXT: &str = "lock";

/// Errors raised by checkpoint stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no checkpoint for run {run_id}")]
    NotFound { run_id: String },

    #[error("invalid run id {run_id:?}: {reason}")]
    InvalidKey { run_id: String, reason: String },

    #[error("checkpoint io failed at {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("checkpoint for run {run_id} is corrupt: {detail}")]
    Corrupt { run_id: String, detail: String },

    #[error("encode checkpoint for run {run_id}")]
    Encode {
        run_id: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Durable last-write-wins storage of run snapshots keyed by run id.
pub trait CheckpointStore: Send + Sync {
    /// Overwrite the snapshot for `state.run_id`. Durable when this returns.
    fn save(&self, state: &RunState) -> Result<(), StoreError>;

    /// Latest snapshot for `run_id`.
    fn load(&self, run_id: &str) -> Result<RunState, StoreError>;

    /// Every run id with a snapshot.
    fn list_keys(&self) -> Result<BTreeSet<String>, StoreError>;

    fn contains(&self, run_id: &str) -> Result<bool, StoreError> {
        Ok(self.list_keys()?.contains(run_id))
    }

    /// Claim `run_id` for exclusive driving; `None` when someone else holds it.
    ///
    /// The default claim covers nothing beyond this process.
    fn try_lock(&self, run_id: &str) -> Result<Option<RunLock>, StoreError> {
        check_key(run_id)?;
        Ok(Some(RunLock::in_process()))
    }
}

/// Held claim on a run, released on drop.
#[derive(Debug)]
pub struct RunLock {
    _file: Option<File>,
}

impl RunLock {
    /// Claim with no backing file, for stores private to one process.
    pub fn in_process() -> Self {
        Self { _file: None }
    }
}

impl<S: CheckpointStore + ?Sized> CheckpointStore for Arc<S> {
    fn save(&self, state: &RunState) -> Result<(), StoreError> {
        (**self).save(state)
    }

    fn load(&self, run_id: &str) -> Result<RunState, StoreError> {
        (**self).load(run_id)
    }

    fn list_keys(&self) -> Result<BTreeSet<String>, StoreError> {
        (**self).list_keys()
    }

    fn contains(&self, run_id: &str) -> Result<bool, StoreError> {
        (**self).contains(run_id)
    }

    fn try_lock(&self, run_id: &str) -> Result<Option<RunLock>, StoreError> {
        (**self).try_lock(run_id)
    }
}

/// Reject snapshots that must never load: wrong version, wrong key, broken invariants.
fn check_snapshot(run_id: &str, state: &RunState) -> Result<(), StoreError> {
    let corrupt = |detail: String| StoreError::Corrupt {
        run_id: run_id.to_string(),
        detail,
    };
    if state.schema_version != SCHEMA_VERSION {
        return Err(corrupt(format!(
            "unsupported schema_version {} (expected {SCHEMA_VERSION})",
            state.schema_version
        )));
    }
    if state.run_id != run_id {
        return Err(corrupt(format!(
            "snapshot belongs to run {}",
            state.run_id
        )));
    }
    let errors = validate_invariants(state);
    if !errors.is_empty() {
        return Err(corrupt(errors.join("; ")));
    }
    Ok(())
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn check_key(run_id: &str) -> Result<(), StoreError> {
    validate_run_id(run_id).map_err(|reason| StoreError::InvalidKey {
        run_id: run_id.to_string(),
        reason,
    })
}

/// File-backed store: `<dir>/<run_id>.json`, one file per run.
///
/// Loads always read the file, so several stores (or processes) may share a
/// directory. [`CheckpointStore::try_lock`] takes an advisory lock on
/// `<dir>/<run_id>.lock` that the OS releases when the holder exits.
#[derive(Debug)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    /// Store rooted at `dir`. The directory is created on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn snapshot_path(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{run_id}.{SNAPSHOT_EXT}"))
    }

    fn lock_path(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{run_id}.{LOCK_EXT}"))
    }

    /// Write through a uniquely named temp file, fsync, rename, fsync the dir.
    fn write_atomic(&self, run_id: &str, contents: &str) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir).map_err(io_err(&self.dir))?;

        let mut tmp = tempfile::Builder::new()
            .prefix(&format!("{run_id}."))
            .suffix(TEMP_SUFFIX)
            .tempfile_in(&self.dir)
            .map_err(io_err(&self.dir))?;
        let tmp_path = tmp.path().to_path_buf();
        tmp.write_all(contents.as_bytes())
            .map_err(io_err(&tmp_path))?;
        tmp.as_file().sync_all().map_err(io_err(&tmp_path))?;

        let path = self.snapshot_path(run_id);
        tmp.persist(&path).map_err(|err| StoreError::Io {
            path: path.clone(),
            source: err.error,
        })?;
        sync_dir(&self.dir)
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<(), StoreError> {
    File::open(dir)
        .and_then(|handle| handle.sync_all())
        .map_err(io_err(dir))
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<(), StoreError> {
    Ok(())
}

impl CheckpointStore for FileCheckpointStore {
    fn save(&self, state: &RunState) -> Result<(), StoreError> {
        check_key(&state.run_id)?;
        debug!(
            run_id = %state.run_id,
            stage = %state.current_stage,
            status = %state.status,
            "writing checkpoint"
        );
        let mut buf = serde_json::to_string_pretty(state).map_err(|source| StoreError::Encode {
            run_id: state.run_id.clone(),
            source,
        })?;
        buf.push('\n');
        self.write_atomic(&state.run_id, &buf)
    }

    fn load(&self, run_id: &str) -> Result<RunState, StoreError> {
        check_key(run_id)?;
        let path = self.snapshot_path(run_id);
        debug!(path = %path.display(), "loading checkpoint");
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound {
                    run_id: run_id.to_string(),
                });
            }
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        let state: RunState =
            serde_json::from_str(&contents).map_err(|err| StoreError::Corrupt {
                run_id: run_id.to_string(),
                detail: format!("parse {}: {err}", path.display()),
            })?;
        check_snapshot(run_id, &state)?;
        Ok(state)
    }

    fn list_keys(&self) -> Result<BTreeSet<String>, StoreError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.dir.clone(),
                    source,
                });
            }
        };

        let mut keys = BTreeSet::new();
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::Io {
                path: self.dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(SNAPSHOT_EXT) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            if validate_run_id(stem).is_err() {
                warn!(path = %path.display(), "ignoring checkpoint with invalid run id");
                continue;
            }
            keys.insert(stem.to_string());
        }
        Ok(keys)
    }

    fn contains(&self, run_id: &str) -> Result<bool, StoreError> {
        check_key(run_id)?;
        Ok(self.snapshot_path(run_id).is_file())
    }

    fn try_lock(&self, run_id: &str) -> Result<Option<RunLock>, StoreError> {
        check_key(run_id)?;
        fs::create_dir_all(&self.dir).map_err(io_err(&self.dir))?;
        let path = self.lock_path(run_id);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(io_err(&path))?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(RunLock { _file: Some(file) })),
            Err(err) if err.kind() == fs2::lock_contended_error().kind() => {
                debug!(path = %path.display(), "run lock held elsewhere");
                Ok(None)
            }
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }
}

/// In-memory store for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    runs: Mutex<HashMap<String, RunState>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&self, state: &RunState) -> Result<(), StoreError> {
        check_key(&state.run_id)?;
        self.runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(state.run_id.clone(), state.clone());
        Ok(())
    }

    fn load(&self, run_id: &str) -> Result<RunState, StoreError> {
        let state = self
            .runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(run_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                run_id: run_id.to_string(),
            })?;
        check_snapshot(run_id, &state)?;
        Ok(state)
    }

    fn list_keys(&self) -> Result<BTreeSet<String>, StoreError> {
        Ok(self
            .runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect())
    }

    fn contains(&self, run_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(run_id))
    }
}
