//! Append-only run history.
//!
//! Every decision input a run observes is written here before the run acts on
//! it. Replaying a run feeds these records back instead of touching the
//! cluster again, so the log is the only source of truth for recovery.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::RunId;
use crate::activities::ActivityKind;
use crate::errors::{ActivityError, HistoryError};
use crate::identity::ReleaseIdentity;
use crate::orchestrator::TeardownOutcome;
use crate::request::TeardownRequest;

/// One fact in a run's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryEvent {
    RunStarted {
        execution_id: Uuid,
        request: TeardownRequest,
        release: ReleaseIdentity,
        namespace: String,
        request_digest: String,
        started_at: DateTime<Utc>,
    },
    ActivityScheduled {
        seq: u64,
        activity: ActivityKind,
        attempt: u32,
    },
    ActivityCompleted {
        seq: u64,
        activity: ActivityKind,
        attempt: u32,
        output: Value,
    },
    ActivityAttemptFailed {
        seq: u64,
        activity: ActivityKind,
        attempt: u32,
        error: ActivityError,
        retryable: bool,
    },
    ActivityExhausted {
        seq: u64,
        activity: ActivityKind,
        attempts: u32,
        error: ActivityError,
    },
    TimestampRecorded {
        seq: u64,
        at: DateTime<Utc>,
    },
    CancellationChecked {
        seq: u64,
        cancelled: bool,
    },
    CancelRequested {
        at: DateTime<Utc>,
    },
    RunCompleted {
        outcome: TeardownOutcome,
    },
}

impl HistoryEvent {
    /// Workflow step this event belongs to, if any.
    pub fn seq(&self) -> Option<u64> {
        match self {
            HistoryEvent::ActivityScheduled { seq, .. }
            | HistoryEvent::ActivityCompleted { seq, .. }
            | HistoryEvent::ActivityAttemptFailed { seq, .. }
            | HistoryEvent::ActivityExhausted { seq, .. }
            | HistoryEvent::TimestampRecorded { seq, .. }
            | HistoryEvent::CancellationChecked { seq, .. } => Some(*seq),
            _ => None,
        }
    }

    /// What kind of step produced this event, for divergence reports.
    pub fn step_label(&self) -> String {
        match self {
            HistoryEvent::ActivityScheduled { activity, .. }
            | HistoryEvent::ActivityCompleted { activity, .. }
            | HistoryEvent::ActivityAttemptFailed { activity, .. }
            | HistoryEvent::ActivityExhausted { activity, .. } => format!("{activity} activity"),
            HistoryEvent::TimestampRecorded { .. } => "timestamp".to_string(),
            HistoryEvent::CancellationChecked { .. } => "cancellation check".to_string(),
            HistoryEvent::RunStarted { .. } => "run start".to_string(),
            HistoryEvent::CancelRequested { .. } => "cancel request".to_string(),
            HistoryEvent::RunCompleted { .. } => "run completion".to_string(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            HistoryEvent::RunStarted { .. } => "run_started",
            HistoryEvent::ActivityScheduled { .. } => "activity_scheduled",
            HistoryEvent::ActivityCompleted { .. } => "activity_completed",
            HistoryEvent::ActivityAttemptFailed { .. } => "activity_attempt_failed",
            HistoryEvent::ActivityExhausted { .. } => "activity_exhausted",
            HistoryEvent::TimestampRecorded { .. } => "timestamp_recorded",
            HistoryEvent::CancellationChecked { .. } => "cancellation_checked",
            HistoryEvent::CancelRequested { .. } => "cancel_requested",
            HistoryEvent::RunCompleted { .. } => "run_completed",
        }
    }
}

/// A history event with its position in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub index: u64,
    pub recorded_at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: HistoryEvent,
}

/// Persistence for run histories.
pub trait HistoryStore: Send + Sync {
    /// Durably append one event and return the stored record.
    fn append(&self, run_id: &RunId, event: HistoryEvent) -> Result<HistoryRecord, HistoryError>;

    /// All records of a run, oldest first. Empty when the run is unknown.
    fn load(&self, run_id: &RunId) -> Result<Vec<HistoryRecord>, HistoryError>;

    /// Every run with a live (non-archived) history.
    fn list_runs(&self) -> Result<Vec<RunId>, HistoryError>;

    /// Move a run's history out of the way so the id can be reused.
    fn archive(&self, run_id: &RunId) -> Result<(), HistoryError>;
}

/// Whether a loaded history ends in a terminal outcome.
pub fn completed_outcome(records: &[HistoryRecord]) -> Option<&TeardownOutcome> {
    records.iter().rev().find_map(|r| match &r.event {
        HistoryEvent::RunCompleted { outcome } => Some(outcome),
        _ => None,
    })
}

/// Volatile store for tests and one-shot embedding.
#[derive(Debug, Default)]
pub struct InMemoryHistoryStore {
    runs: Mutex<HashMap<RunId, Vec<HistoryRecord>>>,
    archived: Mutex<Vec<(RunId, Vec<HistoryRecord>)>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of histories archived for `run_id`.
    pub fn archived_count(&self, run_id: &RunId) -> usize {
        self.archived
            .lock()
            .map(|a| a.iter().filter(|(id, _)| id == run_id).count())
            .unwrap_or(0)
    }

    /// Drop every record after the first `keep`, simulating a crash mid-run.
    pub fn truncate(&self, run_id: &RunId, keep: usize) {
        if let Ok(mut runs) = self.runs.lock() {
            if let Some(records) = runs.get_mut(run_id) {
                records.truncate(keep);
            }
        }
    }
}

impl HistoryStore for InMemoryHistoryStore {
    fn append(&self, run_id: &RunId, event: HistoryEvent) -> Result<HistoryRecord, HistoryError> {
        let mut runs = self.runs.lock().map_err(|_| HistoryError::LockPoisoned)?;
        let records = runs.entry(run_id.clone()).or_default();
        let record = HistoryRecord {
            index: records.len() as u64,
            recorded_at: Utc::now(),
            event,
        };
        records.push(record.clone());
        Ok(record)
    }

    fn load(&self, run_id: &RunId) -> Result<Vec<HistoryRecord>, HistoryError> {
        let runs = self.runs.lock().map_err(|_| HistoryError::LockPoisoned)?;
        Ok(runs.get(run_id).cloned().unwrap_or_default())
    }

    fn list_runs(&self) -> Result<Vec<RunId>, HistoryError> {
        let runs = self.runs.lock().map_err(|_| HistoryError::LockPoisoned)?;
        let mut ids: Vec<RunId> = runs.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    fn archive(&self, run_id: &RunId) -> Result<(), HistoryError> {
        let mut runs = self.runs.lock().map_err(|_| HistoryError::LockPoisoned)?;
        if let Some(records) = runs.remove(run_id) {
            self.archived
                .lock()
                .map_err(|_| HistoryError::LockPoisoned)?
                .push((run_id.clone(), records));
        }
        Ok(())
    }
}

/// JSON-lines history under a state directory.
///
/// Layout: `runs/{run_id}.jsonl` for live runs and
/// `archive/{run_id}-{timestamp}.jsonl` for archived ones.
#[derive(Debug)]
pub struct FileHistoryStore {
    root: PathBuf,
    next_index: Mutex<HashMap<RunId, u64>>,
}

impl FileHistoryStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, HistoryError> {
        let root = root.into();
        for dir in [root.join("runs"), root.join("archive")] {
            fs::create_dir_all(&dir).map_err(|source| HistoryError::Io { path: dir, source })?;
        }
        Ok(Self {
            root,
            next_index: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_path(&self, run_id: &RunId) -> PathBuf {
        self.root.join("runs").join(format!("{run_id}.jsonl"))
    }

    fn read_records(path: &Path) -> Result<(Vec<HistoryRecord>, Tail), HistoryError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok((Vec::new(), Tail::Clean));
            }
            Err(source) => {
                return Err(HistoryError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        let mut records = Vec::new();
        let mut tail = Tail::Clean;
        let mut offset = 0u64;
        for (i, line) in bytes.split_inclusive(|b| *b == b'\n').enumerate() {
            let start = offset;
            offset += line.len() as u64;
            let terminated = line.ends_with(b"\n");
            if line.trim_ascii().is_empty() {
                continue;
            }
            match serde_json::from_slice(line) {
                Ok(record) => {
                    records.push(record);
                    if !terminated {
                        tail = Tail::Unterminated;
                    }
                }
                // A crash mid-append leaves a partial last line; the event was
                // never acknowledged, so it is dropped.
                Err(source) if !terminated => {
                    tracing::warn!(
                        path = %path.display(),
                        line = i + 1,
                        error = %source,
                        "Ignoring torn record at end of history"
                    );
                    tail = Tail::Torn { valid_len: start };
                }
                Err(source) => {
                    return Err(HistoryError::Corrupt {
                        path: path.to_path_buf(),
                        line: i + 1,
                        source,
                    });
                }
            }
        }
        Ok((records, tail))
    }

    /// Make the file end on a record boundary before anything is appended.
    fn repair_tail(path: &Path, tail: Tail) -> Result<(), HistoryError> {
        let io_err = |source| HistoryError::Io {
            path: path.to_path_buf(),
            source,
        };
        match tail {
            Tail::Clean => Ok(()),
            Tail::Unterminated => {
                let mut file = OpenOptions::new().append(true).open(path).map_err(io_err)?;
                file.write_all(b"\n").map_err(io_err)?;
                file.sync_data().map_err(io_err)
            }
            Tail::Torn { valid_len } => {
                let file = OpenOptions::new().write(true).open(path).map_err(io_err)?;
                file.set_len(valid_len).map_err(io_err)?;
                file.sync_data().map_err(io_err)?;
                tracing::warn!(path = %path.display(), valid_len, "Truncated torn history record");
                Ok(())
            }
        }
    }
}

/// How a history file ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tail {
    Clean,
    /// Last record parsed but has no trailing newline.
    Unterminated,
    /// Last line is a partial write; bytes from `valid_len` on are garbage.
    Torn { valid_len: u64 },
}

impl HistoryStore for FileHistoryStore {
    fn append(&self, run_id: &RunId, event: HistoryEvent) -> Result<HistoryRecord, HistoryError> {
        let path = self.run_path(run_id);
        let mut next = self.next_index.lock().map_err(|_| HistoryError::LockPoisoned)?;
        let index = match next.get(run_id) {
            Some(index) => *index,
            None => {
                let (records, tail) = Self::read_records(&path)?;
                Self::repair_tail(&path, tail)?;
                records.len() as u64
            }
        };

        let record = HistoryRecord {
            index,
            recorded_at: Utc::now(),
            event,
        };
        let mut line = serde_json::to_string(&record).map_err(HistoryError::Encode)?;
        line.push('\n');

        let io_err = |source| HistoryError::Io {
            path: path.clone(),
            source,
        };
        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| {
                file.write_all(line.as_bytes())?;
                file.sync_data()
            });
        if let Err(source) = written {
            // The file may now end mid-record; rescan before the next append.
            next.remove(run_id);
            return Err(io_err(source));
        }

        next.insert(run_id.clone(), index + 1);
        Ok(record)
    }

    fn load(&self, run_id: &RunId) -> Result<Vec<HistoryRecord>, HistoryError> {
        Self::read_records(&self.run_path(run_id)).map(|(records, _)| records)
    }

    fn list_runs(&self) -> Result<Vec<RunId>, HistoryError> {
        let dir = self.root.join("runs");
        let entries = fs::read_dir(&dir).map_err(|source| HistoryError::Io {
            path: dir.clone(),
            source,
        })?;

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| HistoryError::Io {
                path: dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            match path.file_stem().and_then(|s| s.to_str()).map(RunId::new) {
                Some(Ok(id)) => ids.push(id),
                _ => tracing::warn!(path = %path.display(), "Ignoring unrecognized history file"),
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn archive(&self, run_id: &RunId) -> Result<(), HistoryError> {
        let from = self.run_path(run_id);
        if !from.exists() {
            return Ok(());
        }
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let to = self
            .root
            .join("archive")
            .join(format!("{run_id}-{stamp}.jsonl"));
        fs::rename(&from, &to).map_err(|source| HistoryError::Io { path: from, source })?;

        self.next_index
            .lock()
            .map_err(|_| HistoryError::LockPoisoned)?
            .remove(run_id);
        tracing::debug!(run_id = %run_id, archive = %to.display(), "Archived run history");
        Ok(())
    }
}
