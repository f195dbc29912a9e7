//! Persisted run state and the compare-and-set store guarding it.

use crate::error::StateError;
use crate::utils::fs::write_atomic;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// A guard file older than this belongs to a crashed writer.
const GUARD_STALE_AFTER: Duration = Duration::from_secs(30);
const GUARD_RETRY_INTERVAL: Duration = Duration::from_millis(25);
const GUARD_MAX_ATTEMPTS: u32 = 200;

/// Holder of the single-flight lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockLease {
    pub holder_id: String,
    pub run_id: String,
    pub acquired_at: DateTime<Utc>,
}

impl LockLease {
    pub fn is_stale(&self, now: DateTime<Utc>, staleness: Duration) -> bool {
        let age = now.signed_duration_since(self.acquired_at);
        age.to_std().is_ok_and(|age| age >= staleness)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum RunStatus {
    /// Changes were proposed (or were already proposed).
    Succeeded,
    NoChanges,
    DryRun,
    Failed,
    TimedOut,
    Cancelled,
}

/// Audit entry for one finished run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    #[serde(default)]
    pub edits: usize,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub merge_request: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Cross-run state: the single-flight lock and de-duplication memory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    #[serde(default)]
    pub last_run_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_processed_commit: Option<String>,
    #[serde(default)]
    pub active_lock: Option<LockLease>,
    /// Plan content hash -> branch created by this engine.
    #[serde(default)]
    pub known_branches: BTreeMap<String, String>,
    #[serde(default)]
    pub history: VecDeque<RunRecord>,
}

impl RunState {
    pub fn is_locked(&self) -> bool {
        self.active_lock.is_some()
    }

    pub fn record(&mut self, record: RunRecord, limit: usize) {
        self.history.push_back(record);
        while self.history.len() > limit {
            self.history.pop_front();
        }
    }

    /// Release the lock if `holder_id` still owns it.
    pub fn release(&mut self, holder_id: &str) -> bool {
        if self
            .active_lock
            .as_ref()
            .is_some_and(|lease| lease.holder_id == holder_id)
        {
            self.active_lock = None;
            true
        } else {
            false
        }
    }
}

/// JSON file store with an exclusive guard file for read-modify-write.
///
/// Every mutation creates `<state>.guard` with `create_new`, so two processes
/// can never interleave their read and write of the state file.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
    guard_path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut guard = path.clone().into_os_string();
        guard.push(".guard");
        Self {
            path,
            guard_path: PathBuf::from(guard),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current state; a missing file is the initial state.
    pub fn load(&self) -> Result<RunState, StateError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(RunState::default()),
            Err(source) => {
                return Err(StateError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        serde_json::from_slice(&bytes).map_err(|e| StateError::Corrupt {
            path: self.path.clone(),
            message: e.to_string(),
        })
    }

    /// Atomically read, modify and persist the state. Nothing is written when
    /// `f` fails. Waiting for the guard yields to the runtime.
    pub async fn update<T, E>(&self, f: impl FnOnce(&mut RunState) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StateError>,
    {
        let _guard = self.acquire_guard().await?;
        let mut state = self.load()?;
        let value = f(&mut state)?;
        self.write(&state)?;
        Ok(value)
    }

    fn write(&self, state: &RunState) -> Result<(), StateError> {
        let json = serde_json::to_vec_pretty(state).map_err(|e| StateError::Corrupt {
            path: self.path.clone(),
            message: e.to_string(),
        })?;
        write_atomic(&self.path, &json).map_err(|source| StateError::Io {
            path: self.path.clone(),
            source,
        })
    }

    async fn acquire_guard(&self) -> Result<GuardFile, StateError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|source| StateError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        for _ in 0..GUARD_MAX_ATTEMPTS {
            if let Some(guard) = self.try_guard()? {
                return Ok(guard);
            }
            tokio::time::sleep(GUARD_RETRY_INTERVAL).await;
        }

        Err(StateError::GuardBusy {
            path: self.guard_path.clone(),
        })
    }

    /// One attempt at the guard; `None` while another writer holds it.
    fn try_guard(&self) -> Result<Option<GuardFile>, StateError> {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.guard_path)
        {
            Ok(mut file) => {
                let _ = writeln!(file, "{}", std::process::id());
                Ok(Some(GuardFile {
                    path: self.guard_path.clone(),
                }))
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                if self.guard_is_stale() {
                    tracing::warn!(
                        guard = %self.guard_path.display(),
                        "Removing abandoned state guard"
                    );
                    let _ = fs::remove_file(&self.guard_path);
                }
                Ok(None)
            }
            Err(source) => Err(StateError::Io {
                path: self.guard_path.clone(),
                source,
            }),
        }
    }

    fn guard_is_stale(&self) -> bool {
        fs::metadata(&self.guard_path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .is_some_and(|age| age >= GUARD_STALE_AFTER)
    }
}

/// Removes the guard file on drop.
struct GuardFile {
    path: PathBuf,
}

impl Drop for GuardFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
