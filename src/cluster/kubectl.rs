//! Cluster inventory backed by the `kubectl` CLI.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;

use super::process::{ToolCommand, classify_failure};
use super::{ClusterInventory, ResourceRef};
use crate::config::ClusterSettings;
use crate::errors::StoreError;

/// Kinds counted after a teardown.
const INVENTORY_KINDS: &str = "deployments,services";

#[derive(Debug, Clone)]
pub struct KubectlInventory {
    bin: PathBuf,
    kubeconfig: Option<PathBuf>,
    context: Option<String>,
}

impl KubectlInventory {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self {
            bin: bin.into(),
            kubeconfig: None,
            context: None,
        }
    }

    pub fn from_settings(settings: &ClusterSettings) -> Self {
        Self {
            bin: settings.kubectl_bin.clone(),
            kubeconfig: settings.kubeconfig.clone(),
            context: settings.kube_context.clone(),
        }
    }

    fn get_command(&self, namespace: &str, selector: &str) -> ToolCommand {
        let mut cmd = ToolCommand::new(&self.bin);
        if let Some(path) = &self.kubeconfig {
            cmd = cmd.arg("--kubeconfig").arg(path.display().to_string());
        }
        if let Some(context) = &self.context {
            cmd = cmd.args(["--context", context.as_str()]);
        }
        cmd.args([
            "get",
            INVENTORY_KINDS,
            "--namespace",
            namespace,
            "--selector",
            selector,
            "--output",
            "json",
        ])
    }
}

#[async_trait]
impl ClusterInventory for KubectlInventory {
    async fn list_labeled(&self, namespace: &str, selector: &str) -> Result<Vec<ResourceRef>, StoreError> {
        let output = self.get_command(namespace, selector).output().await?;
        if !output.success {
            return match classify_failure(&output) {
                // A missing namespace has nothing left in it.
                StoreError::NotFound(_) => Ok(Vec::new()),
                other => Err(other),
            };
        }
        parse_list_output(&output.stdout)
    }
}

#[derive(Debug, Deserialize)]
struct ObjectList {
    #[serde(default)]
    items: Vec<ObjectItem>,
}

#[derive(Debug, Deserialize)]
struct ObjectItem {
    kind: String,
    metadata: ObjectMeta,
}

#[derive(Debug, Deserialize)]
struct ObjectMeta {
    name: String,
}

/// Parse the `List` document printed by `kubectl get -o json`.
pub fn parse_list_output(stdout: &str) -> Result<Vec<ResourceRef>, StoreError> {
    let list: ObjectList =
        serde_json::from_str(stdout.trim()).map_err(|e| StoreError::Malformed(e.to_string()))?;
    Ok(list
        .items
        .into_iter()
        .map(|item| ResourceRef {
            kind: item.kind,
            name: item.metadata.name,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mixed_list() {
        let json = r#"{
            "apiVersion": "v1",
            "kind": "List",
            "items": [
                {"kind": "Deployment", "metadata": {"name": "web", "namespace": "apps"}},
                {"kind": "Service", "metadata": {"name": "web", "namespace": "apps"}},
                {"kind": "Service", "metadata": {"name": "web-headless", "namespace": "apps"}}
            ]
        }"#;
        let items = parse_list_output(json).unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items.iter().filter(|r| r.kind == "Service").count(), 2);
    }

    #[test]
    fn test_parse_empty_list() {
        let items = parse_list_output(r#"{"apiVersion":"v1","items":[],"kind":"List"}"#).unwrap();
        assert!(items.is_empty());
    }

    #[test]
    fn test_parse_rejects_non_json() {
        assert!(matches!(
            parse_list_output("No resources found"),
            Err(StoreError::Malformed(_))
        ));
    }

    #[test]
    fn test_get_command_uses_selector() {
        let inv = KubectlInventory::new("kubectl");
        let cmd = inv.get_command("apps", "app.kubernetes.io/instance=web");
        assert_eq!(
            cmd.display(),
            "kubectl get deployments,services --namespace apps --selector app.kubernetes.io/instance=web --output json"
        );
    }
}
