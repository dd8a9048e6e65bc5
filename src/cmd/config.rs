//! Configuration view and validation commands: `undeploy config`.

use anyhow::Result;
use console::style;

use undeploy::config::default_config_path;
use undeploy::policy::ActivityOptions;

use crate::{Cli, ConfigCommands};
use super::load_config;

fn describe_policy(name: &str, options: &ActivityOptions) {
    println!(
        "  {:<9} start_to_close = {}, max_attempts = {}, backoff = {} x{} (max {})",
        name,
        humantime::format_duration(options.start_to_close),
        options.max_attempts,
        humantime::format_duration(options.backoff.initial),
        options.backoff.coefficient,
        humantime::format_duration(options.backoff.max),
    );
}

pub fn cmd_config(cli: &Cli, command: Option<ConfigCommands>) -> Result<()> {
    let config = load_config(cli)?;

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Undeploy Configuration");
            println!("======================");
            println!();

            match &config.config_file {
                Some(path) => println!("Config file: {}", path.display()),
                None => match default_config_path() {
                    Some(path) => println!("No config file (looked for {})", path.display()),
                    None => println!("No config file"),
                },
            }
            println!();

            println!("[cluster]");
            println!("  namespace = \"{}\"", config.cluster.namespace);
            if let Some(path) = &config.cluster.kubeconfig {
                println!("  kubeconfig = \"{}\"", path.display());
            }
            if let Some(context) = &config.cluster.kube_context {
                println!("  kube_context = \"{}\"", context);
            }
            println!("  helm_bin = \"{}\"", config.cluster.helm_bin.display());
            println!("  kubectl_bin = \"{}\"", config.cluster.kubectl_bin.display());
            if let Some(driver) = &config.cluster.helm_driver {
                println!("  helm_driver = \"{}\"", driver);
            }
            println!();

            println!("[host]");
            println!("  state_dir = \"{}\"", config.state_dir.display());
            println!(
                "  max_concurrent_activities = {}",
                config.max_concurrent_activities
            );
            println!();

            println!("[policy]");
            describe_policy("validate", &config.policy.validate);
            describe_policy("destroy", &config.policy.destroy);
            describe_policy("verify", &config.policy.verify);
            println!();
        }
        Some(ConfigCommands::Validate) => {
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("{} Configuration is valid", style("✓").green());
            } else {
                println!("{} Configuration has warnings:", style("!").yellow());
                for warning in &warnings {
                    println!("  - {}", warning);
                }
            }
        }
    }

    Ok(())
}
