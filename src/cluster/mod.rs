//! Cluster collaborators.
//!
//! The teardown activities talk to the cluster through two narrow traits:
//! [`ReleaseStore`] for releases and [`ClusterInventory`] for labeled
//! resources. The default implementations shell out to `helm` and `kubectl`.

pub mod helm;
pub mod kubectl;
pub mod process;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::StoreError;

pub use helm::HelmReleaseStore;
pub use kubectl::KubectlInventory;

/// Label every chart built from the standard templates puts on its resources.
pub const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";

/// Label selector matching resources owned by a release.
pub fn instance_selector(release: &str) -> String {
    format!("{INSTANCE_LABEL}={release}")
}

/// A deployed release as reported by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseInfo {
    pub name: String,
    pub namespace: String,
    pub revision: i64,
    pub status: String,
    pub updated: Option<DateTime<Utc>>,
    pub chart: Option<String>,
}

/// A namespaced object found by label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: String,
    pub name: String,
}

/// Lists and uninstalls named releases in a namespace.
#[async_trait]
pub trait ReleaseStore: Send + Sync {
    /// Deployed releases in `namespace` whose name matches `name`.
    async fn list_deployed(&self, namespace: &str, name: &str) -> Result<Vec<ReleaseInfo>, StoreError>;

    /// Uninstall a release. Returns the store's status line on success.
    async fn uninstall(
        &self,
        name: &str,
        namespace: &str,
        wait: bool,
        timeout: Option<Duration>,
    ) -> Result<String, StoreError>;
}

/// Lists labeled workload resources in a namespace.
#[async_trait]
pub trait ClusterInventory: Send + Sync {
    async fn list_labeled(&self, namespace: &str, selector: &str) -> Result<Vec<ResourceRef>, StoreError>;
}
