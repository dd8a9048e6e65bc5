//! CLI command implementations.
//!
//! | Module    | Commands handled           |
//! |-----------|----------------------------|
//! | `run`     | `Run`, `Resume`            |
//! | `history` | `History`                  |
//! | `name`    | `ReleaseName`              |
//! | `config`  | `Config`                   |

pub mod config;
pub mod history;
pub mod name;
pub mod run;

use anyhow::{Context, Result};
use console::style;
use std::sync::Arc;

use undeploy::activities::ClusterActivities;
use undeploy::cluster::{HelmReleaseStore, KubectlInventory};
use undeploy::config::{CliOverrides, Config};
use undeploy::host::{AdmissionRegistry, DurableHost, FileHistoryStore};
use undeploy::orchestrator::{TeardownOutcome, TeardownWorkflow};
use undeploy::request::RequestFields;

use super::{Cli, NamingArgs, OutputFormat};

pub use config::cmd_config;
pub use history::cmd_history;
pub use name::cmd_release_name;
pub use run::{cmd_resume, cmd_run};

pub(crate) fn load_config(cli: &Cli) -> Result<Config> {
    let overrides = CliOverrides {
        config_path: cli.config.clone(),
        state_dir: cli.state_dir.clone(),
    };
    let config = Config::load(&overrides)?;
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }
    Ok(config)
}

/// Wire the helm/kubectl adapters into a host backed by the state directory.
pub(crate) fn build_host(config: &Config) -> Result<Arc<DurableHost>> {
    let store = FileHistoryStore::open(&config.state_dir).with_context(|| {
        format!(
            "Failed to open state directory {}",
            config.state_dir.display()
        )
    })?;
    let activities = ClusterActivities::new(
        HelmReleaseStore::from_settings(&config.cluster),
        KubectlInventory::from_settings(&config.cluster),
    );
    let workflow = TeardownWorkflow::new(Arc::new(activities), config.policy);

    let host = DurableHost::new(Arc::new(store), workflow, config.cluster.namespace.clone())
        .with_max_concurrent_activities(config.max_concurrent_activities)
        .with_admission(AdmissionRegistry::with_lock_dir(config.lock_dir()));
    Ok(Arc::new(host))
}

impl NamingArgs {
    pub(crate) fn to_fields(&self) -> RequestFields {
        RequestFields {
            release_name: self.release_name.clone(),
            github_org: self.github_org.clone(),
            repo_name: self.repo_name.clone(),
            branch_name: self.branch_name.clone(),
            pr_number: self.pr_number,
            namespace: self.namespace.clone(),
            ..Default::default()
        }
    }
}

pub(crate) fn print_outcome(outcome: &TeardownOutcome, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(outcome)?);
        }
        OutputFormat::Table => {
            let status = if outcome.success {
                style("SUCCESS").green().bold()
            } else {
                style("FAILED").red().bold()
            };
            println!();
            println!("{} {}", status, outcome.message);
            println!("  release:   {}", style(&outcome.release).cyan());
            println!("  namespace: {}", outcome.namespace);
            println!("  completed: {}", outcome.completed_at.to_rfc3339());
            for warning in &outcome.warnings {
                println!("  {} {}", style("warning:").yellow(), warning);
            }
        }
    }
    Ok(())
}
