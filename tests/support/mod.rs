//! Shared fakes for integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use undeploy::activities::{
    ActivityKind, DestroyResult, TeardownActivities, ValidateResult, VerifyResult,
};
use undeploy::errors::ActivityError;
use undeploy::host::{DurableHost, HistoryStore, InMemoryHistoryStore};
use undeploy::identity::ReleaseIdentity;
use undeploy::orchestrator::TeardownWorkflow;
use undeploy::policy::PolicySet;

/// One recorded activity invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub kind: ActivityKind,
    pub release: String,
    pub namespace: String,
    pub wait: Option<bool>,
    pub timeout: Option<Duration>,
}

/// Activities that replay scripted results and log every invocation.
///
/// When a script runs dry the activity succeeds: the release exists, the
/// uninstall works and nothing is left behind.
#[derive(Default)]
pub struct ScriptedActivities {
    calls: Mutex<Vec<Call>>,
    validate: Mutex<VecDeque<Result<ValidateResult, ActivityError>>>,
    destroy: Mutex<VecDeque<Result<DestroyResult, ActivityError>>>,
    verify: Mutex<VecDeque<Result<VerifyResult, ActivityError>>>,
    destroy_delay: Option<Duration>,
    cancel_on_validate: Option<CancellationToken>,
    cancel_on_destroy: Option<CancellationToken>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

pub fn deployed() -> ValidateResult {
    ValidateResult {
        exists: true,
        status: "deployed".to_string(),
        revision: 3,
        last_updated: None,
    }
}

pub fn uninstalled(release: &str) -> DestroyResult {
    DestroyResult {
        succeeded: true,
        detail: format!("Release {release} uninstalled. Status: uninstalled"),
    }
}

impl ScriptedActivities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validate_returns(self, result: Result<ValidateResult, ActivityError>) -> Self {
        self.validate.lock().unwrap().push_back(result);
        self
    }

    pub fn destroy_returns(self, result: Result<DestroyResult, ActivityError>) -> Self {
        self.destroy.lock().unwrap().push_back(result);
        self
    }

    pub fn verify_returns(self, result: Result<VerifyResult, ActivityError>) -> Self {
        self.verify.lock().unwrap().push_back(result);
        self
    }

    pub fn destroy_takes(mut self, delay: Duration) -> Self {
        self.destroy_delay = Some(delay);
        self
    }

    /// Trip `token` while validate runs, as if a cancel arrived then.
    pub fn cancel_during_validate(mut self, token: CancellationToken) -> Self {
        self.cancel_on_validate = Some(token);
        self
    }

    /// Trip `token` while destroy runs.
    pub fn cancel_during_destroy(mut self, token: CancellationToken) -> Self {
        self.cancel_on_destroy = Some(token);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<ActivityKind> {
        self.calls().into_iter().map(|c| c.kind).collect()
    }

    pub fn count(&self, kind: ActivityKind) -> usize {
        self.kinds().into_iter().filter(|k| *k == kind).count()
    }

    /// Highest number of activities observed running at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn log(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn enter(&self) {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl TeardownActivities for ScriptedActivities {
    async fn validate(
        &self,
        release: &ReleaseIdentity,
        namespace: &str,
    ) -> Result<ValidateResult, ActivityError> {
        self.log(Call {
            kind: ActivityKind::Validate,
            release: release.name().to_string(),
            namespace: namespace.to_string(),
            wait: None,
            timeout: None,
        });
        if let Some(token) = &self.cancel_on_validate {
            token.cancel();
        }
        self.validate
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(deployed()))
    }

    async fn destroy(
        &self,
        release: &ReleaseIdentity,
        namespace: &str,
        wait: bool,
        timeout: Option<Duration>,
    ) -> Result<DestroyResult, ActivityError> {
        self.log(Call {
            kind: ActivityKind::Destroy,
            release: release.name().to_string(),
            namespace: namespace.to_string(),
            wait: Some(wait),
            timeout,
        });
        self.enter();
        if let Some(token) = &self.cancel_on_destroy {
            token.cancel();
        }
        if let Some(delay) = self.destroy_delay {
            tokio::time::sleep(delay).await;
        }
        self.leave();
        let scripted = self.destroy.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(uninstalled(release.name())))
    }

    async fn verify(
        &self,
        release: &ReleaseIdentity,
        namespace: &str,
    ) -> Result<VerifyResult, ActivityError> {
        self.log(Call {
            kind: ActivityKind::Verify,
            release: release.name().to_string(),
            namespace: namespace.to_string(),
            wait: None,
            timeout: None,
        });
        self.verify
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(VerifyResult::from_counts(0, 0)))
    }
}

/// Default policies with millisecond backoff so retry tests stay fast.
pub fn fast_policies() -> PolicySet {
    let mut policies = PolicySet::default();
    for options in [
        &mut policies.validate,
        &mut policies.destroy,
        &mut policies.verify,
    ] {
        options.backoff.initial = Duration::from_millis(1);
        options.backoff.max = Duration::from_millis(5);
    }
    policies
}

/// A host over `store` driving `activities` with fast policies.
pub fn host_with(
    store: Arc<dyn HistoryStore>,
    activities: Arc<ScriptedActivities>,
) -> DurableHost {
    let workflow = TeardownWorkflow::new(activities, fast_policies());
    DurableHost::new(store, workflow, "default")
}

/// A host with a fresh in-memory store.
pub fn host(activities: Arc<ScriptedActivities>) -> (DurableHost, Arc<InMemoryHistoryStore>) {
    let store = Arc::new(InMemoryHistoryStore::new());
    (host_with(store.clone(), activities), store)
}

pub fn transient(message: &str) -> ActivityError {
    ActivityError::retryable(message)
}
