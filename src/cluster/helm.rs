//! Release store backed by the `helm` CLI.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use super::process::{ToolCommand, classify_failure};
use super::{ReleaseInfo, ReleaseStore};
use crate::config::ClusterSettings;
use crate::errors::StoreError;

/// Shells out to `helm` for listing and uninstalling releases.
#[derive(Debug, Clone)]
pub struct HelmReleaseStore {
    bin: PathBuf,
    kubeconfig: Option<PathBuf>,
    kube_context: Option<String>,
    driver: Option<String>,
}

impl HelmReleaseStore {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self {
            bin: bin.into(),
            kubeconfig: None,
            kube_context: None,
            driver: None,
        }
    }

    pub fn from_settings(settings: &ClusterSettings) -> Self {
        Self {
            bin: settings.helm_bin.clone(),
            kubeconfig: settings.kubeconfig.clone(),
            kube_context: settings.kube_context.clone(),
            driver: settings.helm_driver.clone(),
        }
    }

    fn command(&self, namespace: &str) -> ToolCommand {
        let mut cmd = ToolCommand::new(&self.bin).args(["--namespace", namespace]);
        if let Some(path) = &self.kubeconfig {
            cmd = cmd.arg("--kubeconfig").arg(path.display().to_string());
        }
        if let Some(context) = &self.kube_context {
            cmd = cmd.args(["--kube-context", context.as_str()]);
        }
        if let Some(driver) = &self.driver {
            cmd = cmd.env("HELM_DRIVER", driver.as_str());
        }
        cmd
    }

    fn list_command(&self, namespace: &str, name: &str) -> ToolCommand {
        self.command(namespace).args([
            "list".to_string(),
            "--filter".to_string(),
            format!("^{}$", regex::escape(name)),
            "--deployed".to_string(),
            "--output".to_string(),
            "json".to_string(),
        ])
    }

    fn uninstall_command(
        &self,
        name: &str,
        namespace: &str,
        wait: bool,
        timeout: Option<Duration>,
    ) -> ToolCommand {
        let mut cmd = self.command(namespace).args(["uninstall", name]);
        if wait {
            cmd = cmd.arg("--wait");
        }
        if let Some(timeout) = timeout {
            cmd = cmd.args(["--timeout".to_string(), format!("{}s", timeout.as_secs().max(1))]);
        }
        cmd
    }
}

#[async_trait]
impl ReleaseStore for HelmReleaseStore {
    async fn list_deployed(&self, namespace: &str, name: &str) -> Result<Vec<ReleaseInfo>, StoreError> {
        let output = self.list_command(namespace, name).output().await?;
        if !output.success {
            return Err(classify_failure(&output));
        }
        parse_list_output(&output.stdout)
    }

    async fn uninstall(
        &self,
        name: &str,
        namespace: &str,
        wait: bool,
        timeout: Option<Duration>,
    ) -> Result<String, StoreError> {
        let cmd = self.uninstall_command(name, namespace, wait, timeout);
        tracing::info!(release = name, namespace, command = %cmd.display(), "Uninstalling release");
        let output = cmd.output().await?;
        if !output.success {
            return Err(classify_failure(&output));
        }
        let stdout = output.stdout.trim();
        Ok(if stdout.is_empty() {
            format!("release \"{name}\" uninstalled")
        } else {
            stdout.to_string()
        })
    }
}

/// One row of `helm list --output json`.
#[derive(Debug, Deserialize)]
struct HelmListEntry {
    name: String,
    namespace: String,
    #[serde(default)]
    revision: Value,
    #[serde(default)]
    updated: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    chart: Option<String>,
}

/// Parse the JSON array printed by `helm list --output json`.
pub fn parse_list_output(stdout: &str) -> Result<Vec<ReleaseInfo>, StoreError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let entries: Vec<HelmListEntry> =
        serde_json::from_str(trimmed).map_err(|e| StoreError::Malformed(e.to_string()))?;

    Ok(entries
        .into_iter()
        .map(|entry| ReleaseInfo {
            revision: parse_revision(&entry.revision),
            updated: parse_helm_timestamp(&entry.updated),
            name: entry.name,
            namespace: entry.namespace,
            status: entry.status,
            chart: entry.chart,
        })
        .collect())
}

/// Helm prints revisions as strings; older versions used numbers.
fn parse_revision(value: &Value) -> i64 {
    match value {
        Value::Number(n) => n.as_i64().unwrap_or(0),
        Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

/// Parse helm's `2024-05-01 10:00:00.123456 +0000 UTC` timestamps.
///
/// The trailing zone abbreviation is redundant with the offset and dropped.
pub fn parse_helm_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let mut parts = raw.split_whitespace();
    let date = parts.next()?;
    let time = parts.next()?;
    let offset = parts.next()?;
    DateTime::parse_from_str(&format!("{date} {time} {offset}"), "%Y-%m-%d %H:%M:%S%.f %z")
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
