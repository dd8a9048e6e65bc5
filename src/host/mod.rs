//! Embedded durable execution host.
//!
//! The host admits runs, persists their history, and replays that history
//! after a crash so completed activities are never invoked twice. It plays the
//! part a workflow engine would in a larger deployment:
//!
//! - one in-flight run per run id ([`admission`])
//! - an append-only event log per run ([`history`])
//! - replay, retries and timeouts per activity ([`context`])

pub mod admission;
pub mod context;
pub mod history;

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::errors::{HostError, InputError, TeardownError};
use crate::identity::{ReleaseIdentity, sanitize};
use crate::orchestrator::{TeardownOutcome, TeardownWorkflow};
use crate::request::{ResolvedTeardown, TeardownRequest};

pub use admission::{AdmissionGuard, AdmissionRegistry};
pub use context::{RunContext, StepError};
pub use history::{
    FileHistoryStore, HistoryEvent, HistoryRecord, HistoryStore, InMemoryHistoryStore,
    completed_outcome,
};

/// Worker pool size when none is configured.
pub const DEFAULT_MAX_CONCURRENT_ACTIVITIES: usize = 10;

/// Identifier of one durable run; also its admission token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RunId(String);

impl RunId {
    /// Accepts letters, digits, `.`, `_` and `-`; no leading dot.
    pub fn new(id: &str) -> Result<Self, InputError> {
        let valid = !id.is_empty()
            && !id.starts_with('.')
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if valid {
            Ok(Self(id.to_string()))
        } else {
            Err(InputError::InvalidRunId(id.to_string()))
        }
    }

    /// The default run key: `undeploy-{namespace}-{release}`.
    pub fn for_release(namespace: &str, release: &ReleaseIdentity) -> Self {
        Self(format!(
            "undeploy-{}-{}",
            sanitize(namespace),
            sanitize(release.name())
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RunId {
    type Error = InputError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        RunId::new(&value)
    }
}

impl From<RunId> for String {
    fn from(id: RunId) -> Self {
        id.0
    }
}

/// Per-call options for [`DurableHost::run_teardown_with`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Overrides the derived run key.
    pub run_id: Option<RunId>,
    /// Cancels the run when triggered.
    pub cancel: Option<CancellationToken>,
}

/// Hex SHA-256 of a request's canonical JSON form.
pub fn request_digest(request: &TeardownRequest) -> Result<String, HostError> {
    let bytes = serde_json::to_vec(request).map_err(HostError::Payload)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

struct RunStart<'a> {
    request: &'a TeardownRequest,
    namespace: &'a str,
    digest: &'a str,
}

fn run_start<'a>(run_id: &RunId, history: &'a [HistoryRecord]) -> Result<RunStart<'a>, HostError> {
    match history.first().map(|r| &r.event) {
        Some(HistoryEvent::RunStarted {
            request,
            namespace,
            request_digest,
            ..
        }) => Ok(RunStart {
            request,
            namespace,
            digest: request_digest,
        }),
        _ => Err(HostError::MissingStart(run_id.clone())),
    }
}

pub struct DurableHost {
    store: Arc<dyn HistoryStore>,
    workflow: TeardownWorkflow,
    admission: Arc<AdmissionRegistry>,
    workers: Arc<Semaphore>,
    default_namespace: String,
}

impl DurableHost {
    pub fn new(
        store: Arc<dyn HistoryStore>,
        workflow: TeardownWorkflow,
        default_namespace: impl Into<String>,
    ) -> Self {
        Self {
            store,
            workflow,
            admission: AdmissionRegistry::in_process(),
            workers: Arc::new(Semaphore::new(DEFAULT_MAX_CONCURRENT_ACTIVITIES)),
            default_namespace: default_namespace.into(),
        }
    }

    /// Bound the number of activities running at once across all runs.
    pub fn with_max_concurrent_activities(mut self, max: usize) -> Self {
        self.workers = Arc::new(Semaphore::new(max.max(1)));
        self
    }

    pub fn with_admission(mut self, admission: Arc<AdmissionRegistry>) -> Self {
        self.admission = admission;
        self
    }

    pub fn admission(&self) -> &Arc<AdmissionRegistry> {
        &self.admission
    }

    pub fn default_namespace(&self) -> &str {
        &self.default_namespace
    }

    /// Run a teardown to its terminal outcome under the derived run key.
    pub async fn run_teardown(
        &self,
        request: &TeardownRequest,
    ) -> Result<TeardownOutcome, TeardownError> {
        self.run_teardown_with(request, RunOptions::default()).await
    }

    /// Run a teardown with an explicit run id and/or cancellation token.
    ///
    /// Unfinished history for the same request is resumed. Completed history
    /// is archived and a fresh run starts. A custom run id only names the
    /// history; admission is always held on the release's own key as well.
    pub async fn run_teardown_with(
        &self,
        request: &TeardownRequest,
        options: RunOptions,
    ) -> Result<TeardownOutcome, TeardownError> {
        let mut job = request.resolve(&self.default_namespace)?;
        let run_id = options
            .run_id
            .unwrap_or_else(|| RunId::for_release(&job.namespace, &job.release));
        let cancel = options.cancel.unwrap_or_default();
        let _guards = self.admit(&run_id, &job, &cancel)?;

        let digest = request_digest(request)?;
        let mut history = self.store.load(&run_id).map_err(HostError::from)?;

        if !history.is_empty() {
            if completed_outcome(&history).is_some() {
                self.store.archive(&run_id).map_err(HostError::from)?;
                history.clear();
            } else {
                let start = run_start(&run_id, &history)?;
                if start.digest != digest {
                    return Err(HostError::RequestMismatch { run_id }.into());
                }
                tracing::info!(run_id = %run_id, events = history.len(), "Resuming unfinished run");
                job = start.request.resolve(start.namespace)?;
            }
        }

        if history.is_empty() {
            let execution_id = Uuid::new_v4();
            tracing::info!(
                run_id = %run_id,
                %execution_id,
                release = %job.release,
                namespace = %job.namespace,
                dry_run = job.dry_run,
                wait = job.wait,
                "Starting teardown run"
            );
            let started = self
                .store
                .append(
                    &run_id,
                    HistoryEvent::RunStarted {
                        execution_id,
                        request: request.clone(),
                        release: job.release.clone(),
                        namespace: job.namespace.clone(),
                        request_digest: digest,
                        started_at: Utc::now(),
                    },
                )
                .map_err(HostError::from)?;
            history.push(started);
        }

        self.drive(&run_id, &job, &history, cancel).await
    }

    /// Continue an unfinished run from its history, or return the recorded
    /// outcome of a finished one.
    pub async fn resume(&self, run_id: &RunId) -> Result<TeardownOutcome, TeardownError> {
        let history = self.store.load(run_id).map_err(HostError::from)?;
        if history.is_empty() {
            return Err(HostError::UnknownRun(run_id.clone()).into());
        }
        if let Some(outcome) = completed_outcome(&history) {
            return Ok(outcome.clone());
        }

        let start = run_start(run_id, &history)?;
        let job = start.request.resolve(start.namespace)?;
        let cancel = CancellationToken::new();
        let _guards = self.admit(run_id, &job, &cancel)?;

        // Another holder may have advanced or finished the run before we got in.
        let history = self.store.load(run_id).map_err(HostError::from)?;
        if let Some(outcome) = completed_outcome(&history) {
            return Ok(outcome.clone());
        }
        tracing::info!(run_id = %run_id, release = %job.release, "Recovering run");
        self.drive(run_id, &job, &history, cancel).await
    }

    /// Resume every unfinished run in the store concurrently.
    ///
    /// A run whose history cannot be read is reported in the results and does
    /// not stop the others from recovering.
    pub async fn recover(
        &self,
    ) -> Result<Vec<(RunId, Result<TeardownOutcome, TeardownError>)>, HostError> {
        let mut pending = Vec::new();
        let mut unreadable: Vec<(RunId, Result<TeardownOutcome, TeardownError>)> = Vec::new();
        for run_id in self.store.list_runs()? {
            match self.store.load(&run_id) {
                Ok(history) => {
                    if completed_outcome(&history).is_none() && !self.admission.is_in_flight(&run_id)
                    {
                        pending.push(run_id);
                    }
                }
                Err(err) => {
                    tracing::warn!(run_id = %run_id, error = %err, "Skipping run with unreadable history");
                    unreadable.push((run_id, Err(HostError::from(err).into())));
                }
            }
        }

        tracing::info!(count = pending.len(), "Recovering unfinished runs");
        let results = futures::future::join_all(pending.iter().map(|id| self.resume(id))).await;
        let mut report: Vec<_> = pending.into_iter().zip(results).collect();
        report.extend(unreadable);
        Ok(report)
    }

    /// Hold admission for a run: its history id and the release key.
    fn admit(
        &self,
        run_id: &RunId,
        job: &ResolvedTeardown,
        cancel: &CancellationToken,
    ) -> Result<Vec<AdmissionGuard>, HostError> {
        let release_key = RunId::for_release(&job.namespace, &job.release);
        let mut guards = vec![self.admission.admit(&release_key, cancel.clone())?];
        if *run_id != release_key {
            guards.push(self.admission.admit(run_id, cancel.clone())?);
        }
        Ok(guards)
    }

    /// Request cancellation of an in-flight run.
    pub fn cancel(&self, run_id: &RunId) -> Result<bool, HostError> {
        if !self.admission.is_in_flight(run_id) {
            return Ok(false);
        }
        // The release key of a custom-named run has no history of its own.
        if !self.store.load(run_id)?.is_empty() {
            self.store
                .append(run_id, HistoryEvent::CancelRequested { at: Utc::now() })?;
        }
        Ok(self.admission.cancel(run_id))
    }

    pub fn history(&self, run_id: &RunId) -> Result<Vec<HistoryRecord>, HostError> {
        Ok(self.store.load(run_id)?)
    }

    async fn drive(
        &self,
        run_id: &RunId,
        job: &ResolvedTeardown,
        history: &[HistoryRecord],
        cancel: CancellationToken,
    ) -> Result<TeardownOutcome, TeardownError> {
        if history
            .iter()
            .any(|r| matches!(r.event, HistoryEvent::CancelRequested { .. }))
        {
            cancel.cancel();
        }

        let mut ctx = RunContext::new(
            run_id.clone(),
            Arc::clone(&self.store),
            history,
            Arc::clone(&self.workers),
            cancel,
        );
        let result = self.workflow.execute(&mut ctx, job).await;

        let outcome = match &result {
            Ok(outcome) => Some(outcome),
            Err(err) => err.outcome(),
        };
        if let Some(outcome) = outcome {
            self.store
                .append(
                    run_id,
                    HistoryEvent::RunCompleted {
                        outcome: outcome.clone(),
                    },
                )
                .map_err(HostError::from)?;
        }
        result
    }
}
