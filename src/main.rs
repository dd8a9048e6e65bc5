use anyhow::Result;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cmd;

#[derive(Parser)]
#[command(name = "undeploy")]
#[command(version, about = "Durable Helm release teardown")]
pub struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Path to undeploy.toml
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding run histories and lock files
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value = "text")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Tear down a release: validate, uninstall, verify
    Run(RunArgs),
    /// Recover every unfinished run in the state directory
    Resume {
        #[arg(long, value_enum, default_value = "table")]
        format: OutputFormat,
    },
    /// Print the recorded history of a run
    History {
        run_id: String,
        #[arg(long, value_enum, default_value = "table")]
        format: OutputFormat,
    },
    /// Print the release name and run key a request resolves to
    ReleaseName {
        #[command(flatten)]
        naming: NamingArgs,
        #[arg(long, value_enum, default_value = "table")]
        format: OutputFormat,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

/// How the release is named, plus its namespace.
#[derive(Args, Clone, Debug, Default)]
pub struct NamingArgs {
    /// Exact release name (no derivation)
    #[arg(long)]
    pub release_name: Option<String>,

    /// GitHub organization the release was built from
    #[arg(long)]
    pub github_org: Option<String>,

    #[arg(long)]
    pub repo_name: Option<String>,

    #[arg(long)]
    pub branch_name: Option<String>,

    /// Pull request number (0 for branch deployments)
    #[arg(long)]
    pub pr_number: Option<u64>,

    /// Namespace of the release (defaults to the configured namespace)
    #[arg(short, long)]
    pub namespace: Option<String>,
}

#[derive(Args, Clone, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub naming: NamingArgs,

    /// Verify workloads are gone after the uninstall (default)
    #[arg(long, overrides_with = "no_wait")]
    pub wait: bool,

    /// Skip post-uninstall verification
    #[arg(long, overrides_with = "wait")]
    pub no_wait: bool,

    /// Ceiling for the uninstall, e.g. "90s", "5m", "1h"
    #[arg(long, default_value = "5m")]
    pub timeout: String,

    /// Check the release without uninstalling it
    #[arg(long)]
    pub dry_run: bool,

    /// Run id to use instead of the derived run key
    #[arg(long)]
    pub run_id: Option<String>,

    /// Read the full request from a JSON document instead of flags
    #[arg(
        long,
        conflicts_with_all = [
            "release_name",
            "github_org",
            "repo_name",
            "branch_name",
            "pr_number",
            "namespace",
            "wait",
            "no_wait",
            "timeout",
            "dry_run",
        ]
    )]
    pub request: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "table")]
    pub format: OutputFormat,
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

fn init_tracing(verbose: u8, format: LogFormat) {
    let default_filter = match verbose {
        0 => "undeploy=info,warn",
        1 => "undeploy=debug,info",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());
    let registry = tracing_subscriber::registry().with(filter);

    // Logs go to stderr so command output on stdout stays machine-readable.
    match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    match &cli.command {
        Commands::Run(args) => cmd::cmd_run(&cli, args).await?,
        Commands::Resume { format } => cmd::cmd_resume(&cli, *format).await?,
        Commands::History { run_id, format } => cmd::cmd_history(&cli, run_id, *format)?,
        Commands::ReleaseName { naming, format } => {
            cmd::cmd_release_name(&cli, naming, *format)?
        }
        Commands::Config { command } => cmd::cmd_config(&cli, command.clone())?,
    }

    Ok(())
}
