//! Run admission: at most one in-flight run per run id.
//!
//! Within a process the registry tracks in-flight runs and their cancellation
//! tokens. Across processes an exclusive advisory lock on
//! `locks/{run_id}.lock` keeps two hosts from driving the same run.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use fs2::FileExt;
use tokio_util::sync::CancellationToken;

use super::RunId;
use crate::errors::{HistoryError, HostError};

#[derive(Debug, Default)]
pub struct AdmissionRegistry {
    in_flight: Mutex<HashMap<RunId, CancellationToken>>,
    lock_dir: Option<PathBuf>,
}

impl AdmissionRegistry {
    /// Registry without cross-process locking.
    pub fn in_process() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registry that also takes a lock file per run under `lock_dir`.
    pub fn with_lock_dir(lock_dir: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            in_flight: Mutex::new(HashMap::new()),
            lock_dir: Some(lock_dir.into()),
        })
    }

    fn runs(&self) -> MutexGuard<'_, HashMap<RunId, CancellationToken>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim `run_id`. The claim lasts until the returned guard is dropped.
    pub fn admit(
        self: &Arc<Self>,
        run_id: &RunId,
        cancel: CancellationToken,
    ) -> Result<AdmissionGuard, HostError> {
        let mut runs = self.runs();
        if runs.contains_key(run_id) {
            return Err(HostError::AlreadyRunning {
                run_id: run_id.clone(),
            });
        }

        let lock_file = match &self.lock_dir {
            Some(dir) => Some(acquire_lock_file(dir, run_id)?),
            None => None,
        };

        runs.insert(run_id.clone(), cancel);
        tracing::debug!(run_id = %run_id, "Admitted run");
        Ok(AdmissionGuard {
            registry: Arc::clone(self),
            run_id: run_id.clone(),
            _lock_file: lock_file,
        })
    }

    /// Signal cancellation to an in-flight run. Returns false if none is running.
    pub fn cancel(&self, run_id: &RunId) -> bool {
        match self.runs().get(run_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_in_flight(&self, run_id: &RunId) -> bool {
        self.runs().contains_key(run_id)
    }

    pub fn in_flight(&self) -> Vec<RunId> {
        let mut ids: Vec<RunId> = self.runs().keys().cloned().collect();
        ids.sort();
        ids
    }
}

fn acquire_lock_file(dir: &std::path::Path, run_id: &RunId) -> Result<File, HostError> {
    fs::create_dir_all(dir).map_err(|source| HistoryError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let path = dir.join(format!("{run_id}.lock"));
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)
        .map_err(|source| HistoryError::Io {
            path: path.clone(),
            source,
        })?;
    if file.try_lock_exclusive().is_err() {
        return Err(HostError::LockedElsewhere {
            run_id: run_id.clone(),
            path,
        });
    }
    Ok(file)
}

/// Releases the run's claim on drop.
#[derive(Debug)]
pub struct AdmissionGuard {
    registry: Arc<AdmissionRegistry>,
    run_id: RunId,
    _lock_file: Option<File>,
}

impl AdmissionGuard {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        self.registry.runs().remove(&self.run_id);
        // Closing the file releases the advisory lock.
        tracing::debug!(run_id = %self.run_id, "Released run");
    }
}
