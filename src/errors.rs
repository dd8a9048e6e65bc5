//! Typed error hierarchy for the teardown engine.
//!
//! One enum per subsystem:
//! - `InputError`: malformed or ambiguous requests, rejected before any activity runs
//! - `ActivityError`: a single activity attempt failed (classified for retry)
//! - `StoreError`: a cluster collaborator (helm, kubectl) call failed
//! - `HistoryError`: the durable run history could not be read or written
//! - `HostError`: admission, replay, and persistence failures in the execution host
//! - `TeardownError`: what a caller of `run_teardown` gets back

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::activities::ActivityKind;
use crate::host::RunId;
use crate::orchestrator::{TeardownOutcome, TeardownState};

/// Request validation failures. Never retried.
#[derive(Debug, Error)]
pub enum InputError {
    #[error("release name must not be empty")]
    EmptyReleaseName,

    #[error("{field} '{input}' is empty after sanitization")]
    EmptyComponent { field: &'static str, input: String },

    #[error("missing required identifier: {0}")]
    MissingIdentifier(&'static str),

    #[error("both an explicit release name and repository identifiers were supplied")]
    AmbiguousNaming,

    #[error("no release name or repository identifiers were supplied")]
    MissingNaming,

    #[error("release name '{name}' is {len} characters long; the limit is {max}")]
    NameTooLong { name: String, len: usize, max: usize },

    #[error("namespace must not be empty")]
    EmptyNamespace,

    #[error("invalid run id '{0}': use letters, digits, '.', '_' or '-'")]
    InvalidRunId(String),

    #[error("invalid duration '{value}': {message}")]
    InvalidDuration { value: String, message: String },

    #[error("malformed request document: {0}")]
    MalformedRequest(String),

    #[error("unsupported request version {found}; expected version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },
}

/// How the host should treat a failed activity attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityErrorKind {
    /// Collaborator unreachable or reported a transient failure.
    Retryable,
    /// Retrying cannot help (bad input, permanent refusal).
    NonRetryable,
    /// The attempt exceeded its start-to-close budget.
    TimedOut,
}

/// Failure of a single activity attempt, serializable so it can be replayed
/// from history verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub struct ActivityError {
    pub kind: ActivityErrorKind,
    pub message: String,
}

impl ActivityError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: ActivityErrorKind::Retryable,
            message: message.into(),
        }
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            kind: ActivityErrorKind::NonRetryable,
            message: message.into(),
        }
    }

    pub fn timed_out(budget: std::time::Duration) -> Self {
        Self {
            kind: ActivityErrorKind::TimedOut,
            message: format!(
                "activity timed out after {}",
                humantime::format_duration(budget)
            ),
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self.kind, ActivityErrorKind::NonRetryable)
    }
}

impl fmt::Display for ActivityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Failures talking to the release store or cluster inventory.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Unreachable, timed out, or an unclassified tool failure.
    #[error("cluster unavailable: {0}")]
    Unavailable(String),

    /// The cluster definitively refused the request.
    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("release {0} not found")]
    NotFound(String),

    #[error("unexpected tool output: {0}")]
    Malformed(String),
}

/// Failures reading or writing a run's history log.
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode history event: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("corrupt history at {path} line {line}: {source}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("history store lock poisoned")]
    LockPoisoned,
}

/// Failures inside the durable execution host.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("run {run_id} is already in flight")]
    AlreadyRunning { run_id: RunId },

    #[error("run {run_id} is held by another process (lock {path})")]
    LockedElsewhere { run_id: RunId, path: PathBuf },

    #[error("run {run_id} has unfinished history for a different request")]
    RequestMismatch { run_id: RunId },

    #[error("no history recorded for run {0}")]
    UnknownRun(RunId),

    #[error("history for run {0} does not start with a RunStarted event")]
    MissingStart(RunId),

    #[error("replay of run {run_id} diverged at step {seq}: expected {expected}, found {found}")]
    Nondeterminism {
        run_id: RunId,
        seq: u64,
        expected: String,
        found: String,
    },

    #[error("failed to (de)serialize activity payload: {0}")]
    Payload(#[source] serde_json::Error),

    #[error(transparent)]
    History(#[from] HistoryError),
}

/// Invalid input to the teardown state machine. Indicates a driver bug.
#[derive(Debug, Error)]
#[error("no transition from {state:?} on {observation}")]
pub struct TransitionError {
    pub state: TeardownState,
    pub observation: &'static str,
}

/// Run-level failure returned from `run_teardown`.
#[derive(Debug, Error)]
pub enum TeardownError {
    #[error(transparent)]
    Input(#[from] InputError),

    #[error(transparent)]
    Host(#[from] HostError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// An activity exhausted its retries. The terminal outcome is still
    /// recorded and returned alongside the originating error.
    #[error("{activity} activity failed: {source}")]
    ActivityFailed {
        activity: ActivityKind,
        outcome: Box<TeardownOutcome>,
        #[source]
        source: ActivityError,
    },
}

impl TeardownError {
    /// The terminal outcome, when the run got far enough to produce one.
    pub fn outcome(&self) -> Option<&TeardownOutcome> {
        match self {
            TeardownError::ActivityFailed { outcome, .. } => Some(&**outcome),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn activity_error_retryability_by_kind() {
        assert!(ActivityError::retryable("connection refused").is_retryable());
        assert!(ActivityError::timed_out(Duration::from_secs(5)).is_retryable());
        assert!(!ActivityError::non_retryable("forbidden").is_retryable());
    }

    #[test]
    fn activity_error_display_is_message_verbatim() {
        let err = ActivityError::retryable("uninstall: release foo failed: timed out waiting");
        assert_eq!(
            err.to_string(),
            "uninstall: release foo failed: timed out waiting"
        );
    }

    #[test]
    fn timed_out_message_names_budget() {
        let err = ActivityError::timed_out(Duration::from_secs(120));
        assert_eq!(err.kind, ActivityErrorKind::TimedOut);
        assert!(err.to_string().contains("2m"));
    }

    #[test]
    fn activity_error_round_trips_through_json() {
        let err = ActivityError::non_retryable("denied");
        let json = serde_json::to_string(&err).unwrap();
        let back: ActivityError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn input_error_name_too_long_carries_lengths() {
        let err = InputError::NameTooLong {
            name: "x".repeat(60),
            len: 60,
            max: 53,
        };
        let msg = err.to_string();
        assert!(msg.contains("60"));
        assert!(msg.contains("53"));
    }

    #[test]
    fn host_error_converts_from_history_error() {
        let inner = HistoryError::LockPoisoned;
        let err: HostError = inner.into();
        assert!(matches!(err, HostError::History(HistoryError::LockPoisoned)));
    }

    #[test]
    fn teardown_error_without_outcome() {
        let err: TeardownError = InputError::AmbiguousNaming.into();
        assert!(err.outcome().is_none());
        assert!(err.to_string().contains("both"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&InputError::EmptyNamespace);
        assert_std_error(&ActivityError::retryable("x"));
        assert_std_error(&HistoryError::LockPoisoned);
        assert_std_error(&HostError::UnknownRun(RunId::new("r1").unwrap()));
    }
}
