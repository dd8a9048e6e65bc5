//! Teardown activities.
//!
//! Activities are the only code that touches the cluster. Each is stateless
//! and idempotent: re-delivering one after a crash must be harmless.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cluster::{ClusterInventory, ReleaseStore, instance_selector};
use crate::errors::{ActivityError, StoreError};
use crate::identity::ReleaseIdentity;

/// The three activities a teardown may schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Validate,
    Destroy,
    Verify,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::Validate => "validate",
            ActivityKind::Destroy => "destroy",
            ActivityKind::Verify => "verify",
        }
    }
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateResult {
    pub exists: bool,
    pub status: String,
    pub revision: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

impl ValidateResult {
    pub fn missing() -> Self {
        Self {
            exists: false,
            status: "not-found".to_string(),
            revision: 0,
            last_updated: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestroyResult {
    pub succeeded: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResult {
    pub all_clear: bool,
    pub remaining_workload_count: u32,
    pub remaining_service_count: u32,
}

impl VerifyResult {
    pub fn from_counts(workloads: u32, services: u32) -> Self {
        Self {
            all_clear: workloads == 0 && services == 0,
            remaining_workload_count: workloads,
            remaining_service_count: services,
        }
    }
}

/// Typed activity boundary the workflow schedules against.
#[async_trait]
pub trait TeardownActivities: Send + Sync {
    async fn validate(
        &self,
        release: &ReleaseIdentity,
        namespace: &str,
    ) -> Result<ValidateResult, ActivityError>;

    async fn destroy(
        &self,
        release: &ReleaseIdentity,
        namespace: &str,
        wait: bool,
        timeout: Option<Duration>,
    ) -> Result<DestroyResult, ActivityError>;

    async fn verify(
        &self,
        release: &ReleaseIdentity,
        namespace: &str,
    ) -> Result<VerifyResult, ActivityError>;
}

/// Activities backed by a release store and a cluster inventory.
pub struct ClusterActivities<S, I> {
    store: S,
    inventory: I,
}

impl<S: ReleaseStore, I: ClusterInventory> ClusterActivities<S, I> {
    pub fn new(store: S, inventory: I) -> Self {
        Self { store, inventory }
    }
}

/// Collaborator failures are retried; unavailability keeps the tool's own text.
fn transient(err: StoreError) -> ActivityError {
    match err {
        StoreError::Unavailable(detail) => ActivityError::retryable(detail),
        other => ActivityError::retryable(other.to_string()),
    }
}

#[async_trait]
impl<S: ReleaseStore, I: ClusterInventory> TeardownActivities for ClusterActivities<S, I> {
    async fn validate(
        &self,
        release: &ReleaseIdentity,
        namespace: &str,
    ) -> Result<ValidateResult, ActivityError> {
        let name = release.name();
        // A failed listing proves nothing about the release, so every
        // failure here is retried rather than read as "missing".
        let releases = self
            .store
            .list_deployed(namespace, name)
            .await
            .map_err(transient)?;

        let result = releases
            .into_iter()
            .find(|r| r.name == name)
            .map(|r| ValidateResult {
                exists: true,
                status: r.status,
                revision: r.revision,
                last_updated: r.updated,
            })
            .unwrap_or_else(ValidateResult::missing);

        tracing::info!(
            release = name,
            namespace,
            exists = result.exists,
            status = %result.status,
            revision = result.revision,
            "Validated release"
        );
        Ok(result)
    }

    async fn destroy(
        &self,
        release: &ReleaseIdentity,
        namespace: &str,
        wait: bool,
        timeout: Option<Duration>,
    ) -> Result<DestroyResult, ActivityError> {
        let name = release.name();
        match self.store.uninstall(name, namespace, wait, timeout).await {
            Ok(status) => Ok(DestroyResult {
                succeeded: true,
                detail: format!("Release {name} uninstalled. Status: {status}"),
            }),
            Err(StoreError::NotFound(_)) => {
                tracing::info!(release = name, namespace, "Release already removed");
                Ok(DestroyResult {
                    succeeded: true,
                    detail: format!("Release {name} was already removed"),
                })
            }
            Err(StoreError::Rejected(reason)) => {
                tracing::warn!(release = name, namespace, %reason, "Uninstall rejected");
                Ok(DestroyResult {
                    succeeded: false,
                    detail: format!("Failed to uninstall release: {reason}"),
                })
            }
            Err(e) => Err(transient(e)),
        }
    }

    async fn verify(
        &self,
        release: &ReleaseIdentity,
        namespace: &str,
    ) -> Result<VerifyResult, ActivityError> {
        let selector = instance_selector(release.name());
        let resources = self
            .inventory
            .list_labeled(namespace, &selector)
            .await
            .map_err(transient)?;

        let workloads = resources.iter().filter(|r| r.kind == "Deployment").count();
        let services = resources.iter().filter(|r| r.kind == "Service").count();
        let result = VerifyResult::from_counts(workloads as u32, services as u32);

        tracing::info!(
            release = release.name(),
            namespace,
            deployments = workloads,
            services,
            "Verified teardown"
        );
        Ok(result)
    }
}
