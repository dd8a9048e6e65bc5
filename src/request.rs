//! Teardown requests.
//!
//! Two request shapes exist in the wild: one names the release directly, the
//! other names the repository it was built from. Both normalize into a single
//! versioned [`TeardownRequest`] whose naming mode is an explicit tag, and are
//! resolved once at entry into a [`ResolvedTeardown`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::InputError;
use crate::identity::{self, ReleaseIdentity, SourceIdentifiers};

/// Schema version written into new requests.
pub const REQUEST_VERSION: u32 = 2;

fn current_version() -> u32 {
    REQUEST_VERSION
}

fn default_wait() -> bool {
    true
}

/// How the release for a run is named.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Naming {
    /// Release name given verbatim.
    Explicit {
        #[serde(rename = "releaseName")]
        release_name: String,
    },
    /// Release name derived from source identifiers.
    Derived(SourceIdentifiers),
}

/// Immutable input to one teardown run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeardownRequest {
    #[serde(default = "current_version")]
    pub version: u32,
    pub naming: Naming,
    /// Falls back to the configured namespace when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Verify that workloads are gone after the uninstall.
    #[serde(default = "default_wait")]
    pub wait: bool,
    /// Ceiling handed to the uninstall itself.
    #[serde(
        default,
        with = "humantime_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub dry_run: bool,
}

impl TeardownRequest {
    /// Request teardown of a release by its exact name.
    pub fn for_release(name: impl Into<String>) -> Self {
        Self::new(Naming::Explicit {
            release_name: name.into(),
        })
    }

    /// Request teardown of the release built from a repository/branch/PR.
    pub fn for_source(ids: SourceIdentifiers) -> Self {
        Self::new(Naming::Derived(ids))
    }

    fn new(naming: Naming) -> Self {
        Self {
            version: REQUEST_VERSION,
            naming,
            namespace: None,
            wait: true,
            timeout: None,
            dry_run: false,
        }
    }

    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_wait(mut self, wait: bool) -> Self {
        self.wait = wait;
        self
    }

    /// Set the uninstall ceiling. A zero duration clears it.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Compute the release identity for this request.
    pub fn identity(&self) -> Result<ReleaseIdentity, InputError> {
        match &self.naming {
            Naming::Explicit { release_name } => ReleaseIdentity::explicit(release_name),
            Naming::Derived(ids) => identity::resolve(ids),
        }
    }

    /// Reject schema versions this build does not understand.
    pub fn check_version(&self) -> Result<(), InputError> {
        if self.version == REQUEST_VERSION {
            Ok(())
        } else {
            Err(InputError::UnsupportedVersion {
                found: self.version,
                supported: REQUEST_VERSION,
            })
        }
    }

    /// Resolve the identity and namespace. Fails before any activity runs.
    pub fn resolve(&self, default_namespace: &str) -> Result<ResolvedTeardown, InputError> {
        self.check_version()?;
        let release = self.identity()?;
        let namespace = self
            .namespace
            .as_deref()
            .map(str::trim)
            .filter(|ns| !ns.is_empty())
            .unwrap_or(default_namespace.trim());
        if namespace.is_empty() {
            return Err(InputError::EmptyNamespace);
        }
        let source = match &self.naming {
            Naming::Derived(ids) => Some(ids.clone()),
            Naming::Explicit { .. } => None,
        };
        Ok(ResolvedTeardown {
            release,
            namespace: namespace.to_string(),
            wait: self.wait,
            timeout: self.timeout,
            dry_run: self.dry_run,
            source,
        })
    }
}

/// A request after identity resolution and namespace defaulting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTeardown {
    pub release: ReleaseIdentity,
    pub namespace: String,
    pub wait: bool,
    pub timeout: Option<Duration>,
    pub dry_run: bool,
    pub source: Option<SourceIdentifiers>,
}

/// Timeout as given by callers: seconds or a duration string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TimeoutValue {
    Seconds(u64),
    Text(String),
}

/// Loose request fields, as found in legacy documents or on the command line.
///
/// Either `release_name` or the repository identifiers may be set, never both.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestFields {
    pub release_name: Option<String>,
    pub github_org: Option<String>,
    pub repo_name: Option<String>,
    pub branch_name: Option<String>,
    pub pr_number: Option<u64>,
    pub namespace: Option<String>,
    pub wait: Option<bool>,
    pub timeout: Option<TimeoutValue>,
    pub dry_run: Option<bool>,
}

impl TryFrom<RequestFields> for TeardownRequest {
    type Error = InputError;

    fn try_from(legacy: RequestFields) -> Result<Self, Self::Error> {
        let has_source = legacy.github_org.is_some()
            || legacy.repo_name.is_some()
            || legacy.branch_name.is_some()
            || legacy.pr_number.is_some();

        let mut request = match (legacy.release_name, has_source) {
            (Some(_), true) => return Err(InputError::AmbiguousNaming),
            (Some(name), false) => TeardownRequest::for_release(name),
            (None, true) => {
                let org = legacy
                    .github_org
                    .ok_or(InputError::MissingIdentifier("githubOrg"))?;
                let repo = legacy
                    .repo_name
                    .ok_or(InputError::MissingIdentifier("repoName"))?;
                let branch = legacy
                    .branch_name
                    .ok_or(InputError::MissingIdentifier("branchName"))?;
                let ids = SourceIdentifiers::new(org, repo, branch)
                    .with_pr_number(legacy.pr_number.unwrap_or(0));
                TeardownRequest::for_source(ids)
            }
            (None, false) => return Err(InputError::MissingNaming),
        };

        request.namespace = legacy.namespace;
        request.wait = legacy.wait.unwrap_or(true);
        request.dry_run = legacy.dry_run.unwrap_or(false);
        if let Some(timeout) = legacy.timeout {
            let timeout = match timeout {
                TimeoutValue::Seconds(secs) => Duration::from_secs(secs),
                TimeoutValue::Text(text) => parse_duration(&text)?,
            };
            request = request.with_timeout(timeout);
        }
        Ok(request)
    }
}

/// Parse a request document in either the versioned or a legacy shape.
pub fn parse_request_document(json: &str) -> Result<TeardownRequest, InputError> {
    let value: Value =
        serde_json::from_str(json).map_err(|e| InputError::MalformedRequest(e.to_string()))?;

    let is_versioned = value
        .as_object()
        .map(|obj| obj.contains_key("naming"))
        .ok_or_else(|| InputError::MalformedRequest("expected a JSON object".to_string()))?;

    if is_versioned {
        let request: TeardownRequest = serde_json::from_value(value)
            .map_err(|e| InputError::MalformedRequest(e.to_string()))?;
        request.check_version()?;
        Ok(request)
    } else {
        let legacy: RequestFields = serde_json::from_value(value)
            .map_err(|e| InputError::MalformedRequest(e.to_string()))?;
        legacy.try_into()
    }
}

/// Parse `90s`, `5m`, `1h 30m`, or a bare number of seconds.
pub fn parse_duration(value: &str) -> Result<Duration, InputError> {
    let trimmed = value.trim();
    if let Ok(secs) = trimmed.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(trimmed).map_err(|e| InputError::InvalidDuration {
        value: value.to_string(),
        message: e.to_string(),
    })
}
