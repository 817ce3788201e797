//! Resumable state for batch consumers of the processed output
//!
//! Four files, each behind a process-wide lock keyed by its path:
//! - checkpoint: arbitrary key/value snapshot, overwritten atomically
//! - progress: `{"last_processed_index": n}`, `-1` when nothing is done yet
//! - processed hashes: JSON array of envelope content hashes
//! - failed batches: append-only JSONL dead-letter log
//!
//! Reads never fail: a missing or corrupt file is empty state. Writes log
//! their own failures and return them, so callers may carry on.
//! Share one manager between worker threads with `Arc<StateManager>`;
//! managers built separately over the same paths still serialize per file.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use tempfile::NamedTempFile;

use crate::record::format_timestamp;

pub type Checkpoint = Map<String, Value>;

#[derive(Debug)]
pub enum StateError {
    Io(std::io::Error),
    Serialization(serde_json::Error),
}

impl From<std::io::Error> for StateError {
    fn from(err: std::io::Error) -> Self {
        StateError::Io(err)
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err)
    }
}

impl std::fmt::Display for StateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateError::Io(e) => write!(f, "IO error: {}", e),
            StateError::Serialization(e) => write!(f, "Serialization error: {}", e),
        }
    }
}

impl std::error::Error for StateError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    pub checkpoint: PathBuf,
    pub progress: PathBuf,
    pub processed_hashes: PathBuf,
    pub failed_batches: PathBuf,
}

impl StatePaths {
    /// All four files inside one directory
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            checkpoint: dir.join("synthesis_checkpoint.json"),
            progress: dir.join("synthesis_progress.json"),
            processed_hashes: dir.join("processed_hashes.json"),
            failed_batches: dir.join("failed_batches.jsonl"),
        }
    }
}

/// One dead-letter entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedBatch {
    pub timestamp: String,
    pub error: String,
    #[serde(default)]
    pub response_text: Option<String>,
    pub batch: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct Progress {
    last_processed_index: i64,
}

type FileLock = Arc<Mutex<()>>;

static FILE_LOCKS: OnceLock<Mutex<HashMap<PathBuf, FileLock>>> = OnceLock::new();

/// The process-wide lock for `path`, created on first use
fn file_lock(path: &Path) -> FileLock {
    let key = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let registry = FILE_LOCKS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut locks = lock(registry);
    Arc::clone(locks.entry(key).or_default())
}

pub struct StateManager {
    paths: StatePaths,
    checkpoint_lock: FileLock,
    progress_lock: FileLock,
    hashes_lock: FileLock,
    failed_lock: FileLock,
}

impl StateManager {
    pub fn new(paths: StatePaths) -> Self {
        Self {
            checkpoint_lock: file_lock(&paths.checkpoint),
            progress_lock: file_lock(&paths.progress),
            hashes_lock: file_lock(&paths.processed_hashes),
            failed_lock: file_lock(&paths.failed_batches),
            paths,
        }
    }

    pub fn paths(&self) -> &StatePaths {
        &self.paths
    }

    pub fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StateError> {
        let _guard = lock(&self.checkpoint_lock);
        logged(
            "checkpoint",
            write_json_atomic(&self.paths.checkpoint, checkpoint),
        )
    }

    pub fn load_checkpoint(&self) -> Checkpoint {
        let _guard = lock(&self.checkpoint_lock);
        read_json(&self.paths.checkpoint, "checkpoint").unwrap_or_default()
    }

    pub fn clear_checkpoint(&self) -> Result<(), StateError> {
        let _guard = lock(&self.checkpoint_lock);
        match fs::remove_file(&self.paths.checkpoint) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => logged("checkpoint", Err(e.into())),
        }
    }

    pub fn save_progress(&self, last_processed_index: i64) -> Result<(), StateError> {
        let _guard = lock(&self.progress_lock);
        logged(
            "progress",
            write_json_atomic(&self.paths.progress, &Progress { last_processed_index }),
        )
    }

    /// Index of the last finished unit of work, `-1` if none
    pub fn load_progress(&self) -> i64 {
        let _guard = lock(&self.progress_lock);
        read_json::<Progress>(&self.paths.progress, "progress")
            .map(|p| p.last_processed_index)
            .unwrap_or(-1)
    }

    pub fn save_processed_hashes(&self, hashes: &HashSet<String>) -> Result<(), StateError> {
        let _guard = lock(&self.hashes_lock);
        let mut sorted: Vec<&String> = hashes.iter().collect();
        sorted.sort();
        logged(
            "processed hashes",
            write_json_atomic(&self.paths.processed_hashes, &sorted),
        )
    }

    pub fn load_processed_hashes(&self) -> HashSet<String> {
        let _guard = lock(&self.hashes_lock);
        read_json::<Vec<String>>(&self.paths.processed_hashes, "processed hashes")
            .map(|hashes| hashes.into_iter().collect())
            .unwrap_or_default()
    }

    /// Append a failed batch to the dead-letter log
    pub fn save_failed_batch<B: Serialize + ?Sized>(
        &self,
        batch: &B,
        error: &str,
        response_text: Option<&str>,
    ) -> Result<(), StateError> {
        let _guard = lock(&self.failed_lock);
        let result = self.append_failed_batch(batch, error, response_text);
        if result.is_ok() {
            log::warn!(
                "💀 Batch written to dead-letter log {}: {}",
                self.paths.failed_batches.display(),
                error
            );
        }
        logged("failed batch", result)
    }

    fn append_failed_batch<B: Serialize + ?Sized>(
        &self,
        batch: &B,
        error: &str,
        response_text: Option<&str>,
    ) -> Result<(), StateError> {
        let entry = FailedBatch {
            timestamp: format_timestamp(&Utc::now()),
            error: error.to_string(),
            response_text: response_text.map(str::to_string),
            batch: serde_json::to_value(batch)?,
        };
        let line = serde_json::to_string(&entry)?;

        if let Some(parent) = parent_dir(&self.paths.failed_batches) {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.paths.failed_batches)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    /// Every readable dead-letter entry, oldest first
    pub fn load_failed_batches(&self) -> Vec<FailedBatch> {
        let _guard = lock(&self.failed_lock);
        let file = match fs::File::open(&self.paths.failed_batches) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                log::warn!(
                    "⚠️  Cannot read dead-letter log {}: {}",
                    self.paths.failed_batches.display(),
                    e
                );
                return Vec::new();
            }
        };

        let mut batches = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    log::warn!("⚠️  Dead-letter log read stopped at line {}: {}", idx + 1, e);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(batch) => batches.push(batch),
                Err(e) => log::warn!("⚠️  Skipping corrupt dead-letter line {}: {}", idx + 1, e),
            }
        }
        batches
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn logged(what: &str, result: Result<(), StateError>) -> Result<(), StateError> {
    if let Err(e) = &result {
        log::error!("❌ Failed to save {}: {}", what, e);
    }
    result
}

fn parent_dir(path: &Path) -> Option<&Path> {
    path.parent().filter(|dir| !dir.as_os_str().is_empty())
}

fn read_json<T: DeserializeOwned>(path: &Path, what: &str) -> Option<T> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::debug!("No {} file at {}", what, path.display());
            return None;
        }
        Err(e) => {
            log::warn!("⚠️  Cannot read {} {}: {}", what, path.display(), e);
            return None;
        }
    };

    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            log::warn!("⚠️  Corrupt {} file {}, starting empty: {}", what, path.display(), e);
            None
        }
    }
}

/// Write `value` as pretty JSON through a temp file in the same directory
/// and rename it over `path`, so readers see the old or the new file.
pub(crate) fn write_json_atomic<T: Serialize + ?Sized>(
    path: &Path,
    value: &T,
) -> Result<(), StateError> {
    let dir = parent_dir(path).unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let mut temp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut temp, value)?;
    temp.write_all(b"\n")?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| StateError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn manager(dir: &Path) -> StateManager {
        StateManager::new(StatePaths::in_dir(dir))
    }

    #[test]
    fn test_checkpoint_roundtrip_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let state = manager(dir.path());
        assert!(state.load_checkpoint().is_empty());

        let mut checkpoint = Checkpoint::new();
        checkpoint.insert("stage".to_string(), json!("summaries"));
        checkpoint.insert("batch".to_string(), json!(12));
        state.save_checkpoint(&checkpoint).unwrap();
        assert_eq!(state.load_checkpoint(), checkpoint);

        state.clear_checkpoint().unwrap();
        assert!(state.load_checkpoint().is_empty());
        // clearing twice is fine
        state.clear_checkpoint().unwrap();
    }

    #[test]
    fn test_progress_defaults_and_file_format() {
        let dir = tempfile::tempdir().unwrap();
        let state = manager(dir.path());
        assert_eq!(state.load_progress(), -1);

        state.save_progress(42).unwrap();
        assert_eq!(state.load_progress(), 42);

        let raw: Value =
            serde_json::from_str(&fs::read_to_string(&state.paths().progress).unwrap()).unwrap();
        assert_eq!(raw, json!({"last_processed_index": 42}));
    }

    #[test]
    fn test_corrupt_files_read_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let state = manager(dir.path());
        fs::write(&state.paths().progress, "{not json").unwrap();
        fs::write(&state.paths().processed_hashes, "[1, 2").unwrap();
        fs::write(&state.paths().checkpoint, "null").unwrap();

        assert_eq!(state.load_progress(), -1);
        assert!(state.load_processed_hashes().is_empty());
        assert!(state.load_checkpoint().is_empty());
    }

    #[test]
    fn test_processed_hashes_sorted_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let state = manager(dir.path());
        let hashes: HashSet<String> = ["c", "a", "b"].iter().map(|s| s.to_string()).collect();

        state.save_processed_hashes(&hashes).unwrap();
        assert_eq!(state.load_processed_hashes(), hashes);

        let raw: Vec<String> =
            serde_json::from_str(&fs::read_to_string(&state.paths().processed_hashes).unwrap())
                .unwrap();
        assert_eq!(raw, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_failed_batches_append_and_skip_corrupt_lines() {
        let dir = tempfile::tempdir().unwrap();
        let state = manager(&dir.path().join("nested"));

        state
            .save_failed_batch(&json!([{"id": 1}]), "timeout", None)
            .unwrap();
        let mut file = OpenOptions::new()
            .append(true)
            .open(&state.paths().failed_batches)
            .unwrap();
        writeln!(file, "garbage").unwrap();
        state
            .save_failed_batch(&vec!["a", "b"], "bad response", Some("<html>"))
            .unwrap();

        let batches = state.load_failed_batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].error, "timeout");
        assert_eq!(batches[0].batch, json!([{"id": 1}]));
        assert_eq!(batches[1].response_text.as_deref(), Some("<html>"));
        assert_eq!(batches[1].batch, json!(["a", "b"]));
    }

    #[test]
    fn test_poisoned_lock_is_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(manager(dir.path()));

        let poisoner = Arc::clone(&state);
        let result = std::thread::spawn(move || {
            let _guard = poisoner.progress_lock.lock().unwrap();
            panic!("worker died holding the lock");
        })
        .join();
        assert!(result.is_err());
        assert!(state.progress_lock.is_poisoned());

        state.save_progress(7).unwrap();
        assert_eq!(state.load_progress(), 7);
    }

    #[test]
    fn test_managers_over_same_paths_share_locks() {
        let dir = tempfile::tempdir().unwrap();
        let first = manager(dir.path());
        let second = manager(dir.path());
        let elsewhere = manager(&dir.path().join("other"));

        assert!(Arc::ptr_eq(&first.progress_lock, &second.progress_lock));
        assert!(Arc::ptr_eq(&first.failed_lock, &second.failed_lock));
        assert!(!Arc::ptr_eq(&first.progress_lock, &elsewhere.progress_lock));
        assert!(!Arc::ptr_eq(&first.progress_lock, &first.hashes_lock));

        // held through one manager, the other waits for it
        let guard = lock(&first.hashes_lock);
        assert!(second.hashes_lock.try_lock().is_err());
        drop(guard);
        assert!(second.hashes_lock.try_lock().is_ok());
    }
}
