//! Layered configuration.
//!
//! Values are resolved in order, later layers winning:
//! built-in defaults, `undeploy.toml`, environment variables, CLI flags.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::host::DEFAULT_MAX_CONCURRENT_ACTIVITIES;
use crate::policy::PolicySet;

pub const CONFIG_FILE_NAME: &str = "undeploy.toml";

/// Namespace used when neither the request nor any config layer names one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// `[cluster]` section of undeploy.toml.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClusterSection {
    pub namespace: Option<String>,
    pub kubeconfig: Option<PathBuf>,
    pub kube_context: Option<String>,
    pub helm_bin: Option<PathBuf>,
    pub kubectl_bin: Option<PathBuf>,
    /// Helm storage driver (secret, configmap, sql)
    pub helm_driver: Option<String>,
}

/// `[host]` section of undeploy.toml.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HostSection {
    /// Where run histories and lock files live
    pub state_dir: Option<PathBuf>,
    pub max_concurrent_activities: Option<usize>,
}

/// The complete undeploy.toml structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UndeployToml {
    #[serde(default)]
    pub cluster: ClusterSection,
    #[serde(default)]
    pub host: HostSection,
    /// Per-activity timeout and retry overrides
    #[serde(default)]
    pub policy: PolicySet,
}

impl UndeployToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse undeploy.toml")
    }
}

/// How to reach the cluster.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterSettings {
    pub namespace: String,
    pub kubeconfig: Option<PathBuf>,
    pub kube_context: Option<String>,
    pub helm_bin: PathBuf,
    pub kubectl_bin: PathBuf,
    pub helm_driver: Option<String>,
}

/// Values supplied on the command line.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
}

/// Effective configuration after all layers are applied.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub config_file: Option<PathBuf>,
    pub cluster: ClusterSettings,
    pub state_dir: PathBuf,
    pub max_concurrent_activities: usize,
    pub policy: PolicySet,
}

impl Config {
    /// Load from the real environment.
    pub fn load(overrides: &CliOverrides) -> Result<Self> {
        Self::from_sources(overrides, |key| std::env::var(key).ok())
    }

    /// Load with an injectable environment lookup. Empty values count as unset.
    pub fn from_sources(
        overrides: &CliOverrides,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let env = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        let explicit = overrides
            .config_path
            .clone()
            .or_else(|| env("UNDEPLOY_CONFIG").map(PathBuf::from));
        let config_file = match explicit {
            Some(path) if !path.exists() => {
                bail!("Config file not found: {}", path.display());
            }
            Some(path) => Some(path),
            None => default_config_path().filter(|p| p.exists()),
        };
        let file = match &config_file {
            Some(path) => UndeployToml::load(path)?,
            None => UndeployToml::default(),
        };

        let kubeconfig = match env("KUBECONFIG_SECRET_PATH") {
            Some(secret) => Some(read_kubeconfig_secret(Path::new(&secret))?),
            None => env("KUBECONFIG").map(PathBuf::from),
        }
        .or(file.cluster.kubeconfig);

        let cluster = ClusterSettings {
            namespace: env("KUBERNETES_NAMESPACE")
                .or(file.cluster.namespace)
                .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            kubeconfig,
            kube_context: file.cluster.kube_context,
            helm_bin: env("HELM_BIN")
                .map(PathBuf::from)
                .or(file.cluster.helm_bin)
                .unwrap_or_else(|| PathBuf::from("helm")),
            kubectl_bin: env("KUBECTL_BIN")
                .map(PathBuf::from)
                .or(file.cluster.kubectl_bin)
                .unwrap_or_else(|| PathBuf::from("kubectl")),
            helm_driver: env("HELM_DRIVER").or(file.cluster.helm_driver),
        };

        let state_dir = overrides
            .state_dir
            .clone()
            .or_else(|| env("UNDEPLOY_STATE_DIR").map(PathBuf::from))
            .or(file.host.state_dir)
            .unwrap_or_else(default_state_dir);

        let max_concurrent_activities = match env("UNDEPLOY_MAX_CONCURRENT_ACTIVITIES") {
            Some(raw) => raw.trim().parse().with_context(|| {
                format!("UNDEPLOY_MAX_CONCURRENT_ACTIVITIES must be a number, got '{raw}'")
            })?,
            None => file
                .host
                .max_concurrent_activities
                .unwrap_or(DEFAULT_MAX_CONCURRENT_ACTIVITIES),
        };

        Ok(Self {
            config_file,
            cluster,
            state_dir,
            max_concurrent_activities,
            policy: file.policy,
        })
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.state_dir.join("locks")
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if let Some(path) = &self.cluster.kubeconfig
            && !path.exists()
        {
            warnings.push(format!("kubeconfig '{}' does not exist", path.display()));
        }

        if self.max_concurrent_activities == 0 {
            warnings.push("max_concurrent_activities is 0; using 1".to_string());
        }

        for (name, options) in [
            ("validate", &self.policy.validate),
            ("destroy", &self.policy.destroy),
            ("verify", &self.policy.verify),
        ] {
            if options.start_to_close.is_zero() {
                warnings.push(format!("policy.{name}.start_to_close is zero; every attempt will time out"));
            }
            if options.max_attempts == 0 {
                warnings.push(format!("policy.{name}.max_attempts is 0; the activity still runs once"));
            }
        }

        warnings
    }
}

/// The secret file holds the path of the kubeconfig to use.
fn read_kubeconfig_secret(path: &Path) -> Result<PathBuf> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read kubeconfig secret: {}", path.display()))?;
    let target = content.trim();
    if target.is_empty() {
        bail!("Kubeconfig secret {} is empty", path.display());
    }
    Ok(PathBuf::from(target))
}

/// `<config dir>/undeploy/undeploy.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("undeploy").join(CONFIG_FILE_NAME))
}

pub fn default_state_dir() -> PathBuf {
    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("undeploy")
}
