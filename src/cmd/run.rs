//! Teardown execution commands: `undeploy run` and `undeploy resume`.

use anyhow::{Context, Result};
use console::style;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use undeploy::host::{DurableHost, RunId, RunOptions};
use undeploy::request::{TeardownRequest, TimeoutValue, parse_request_document};
use undeploy::{TeardownError, TeardownOutcome};

use super::{build_host, load_config, print_outcome};
use crate::{Cli, OutputFormat, RunArgs};

impl RunArgs {
    fn to_request(&self) -> Result<TeardownRequest> {
        if let Some(path) = &self.request {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read request file: {}", path.display()))?;
            return Ok(parse_request_document(&content)?);
        }

        let mut fields = self.naming.to_fields();
        fields.wait = Some(!self.no_wait);
        fields.timeout = Some(TimeoutValue::Text(self.timeout.clone()));
        fields.dry_run = Some(self.dry_run);
        Ok(TeardownRequest::try_from(fields)?)
    }
}

pub async fn cmd_run(cli: &Cli, args: &RunArgs) -> Result<()> {
    let config = load_config(cli)?;
    let request = args.to_request()?;
    let job = request.resolve(&config.cluster.namespace)?;
    let run_id = match &args.run_id {
        Some(id) => RunId::new(id)?,
        None => RunId::for_release(&job.namespace, &job.release),
    };
    let host = build_host(&config)?;

    let cancel = CancellationToken::new();
    let interrupt = tokio::spawn(cancel_on_interrupt(Arc::clone(&host), run_id.clone()));

    let options = RunOptions {
        run_id: Some(run_id.clone()),
        cancel: Some(cancel),
    };
    let result = host.run_teardown_with(&request, options).await;
    interrupt.abort();

    report(&run_id, result, args.format)
}

async fn cancel_on_interrupt(host: Arc<DurableHost>, run_id: RunId) {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::warn!(run_id = %run_id, "Interrupt received, cancelling run");
        if let Err(e) = host.cancel(&run_id) {
            tracing::error!(run_id = %run_id, error = %e, "Failed to record cancellation");
        }
    }
}

/// Print the outcome and exit non-zero if the teardown did not succeed.
fn report(
    run_id: &RunId,
    result: Result<TeardownOutcome, TeardownError>,
    format: OutputFormat,
) -> Result<()> {
    match result {
        Ok(outcome) => {
            print_outcome(&outcome, format)?;
            if !outcome.success {
                std::process::exit(1);
            }
            Ok(())
        }
        Err(err) => match err.outcome() {
            Some(outcome) => {
                print_outcome(outcome, format)?;
                eprintln!("{} {}", style("error:").red().bold(), err);
                std::process::exit(1);
            }
            None => Err(err).with_context(|| format!("Run {run_id} failed")),
        },
    }
}

pub async fn cmd_resume(cli: &Cli, format: OutputFormat) -> Result<()> {
    let config = load_config(cli)?;
    let host = build_host(&config)?;

    let results = host.recover().await?;
    if results.is_empty() {
        println!("No unfinished runs in {}", config.state_dir.display());
        return Ok(());
    }

    let mut failed = 0;
    for (run_id, result) in results {
        println!("{} {}", style("run").dim(), style(&run_id).bold());
        match result {
            Ok(outcome) => {
                if !outcome.success {
                    failed += 1;
                }
                print_outcome(&outcome, format)?;
            }
            Err(err) => {
                failed += 1;
                if let Some(outcome) = err.outcome() {
                    print_outcome(outcome, format)?;
                }
                eprintln!("{} {}", style("error:").red().bold(), err);
            }
        }
    }

    if failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}
