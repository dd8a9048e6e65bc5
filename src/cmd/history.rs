//! Run history inspection: `undeploy history <run-id>`.

use anyhow::{Context, Result, bail};
use console::style;

use undeploy::host::{FileHistoryStore, HistoryEvent, HistoryRecord, HistoryStore, RunId};

use super::load_config;
use crate::{Cli, OutputFormat};

pub fn cmd_history(cli: &Cli, run_id: &str, format: OutputFormat) -> Result<()> {
    let config = load_config(cli)?;
    let run_id = RunId::new(run_id)?;
    let store = FileHistoryStore::open(&config.state_dir)
        .with_context(|| format!("Failed to open state directory {}", config.state_dir.display()))?;

    let records = store.load(&run_id)?;
    if records.is_empty() {
        bail!("No history recorded for run {run_id}");
    }

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&records)?),
        OutputFormat::Table => {
            println!("History of {}", style(&run_id).bold());
            println!();
            for record in &records {
                println!(
                    "{:>4}  {}  {:<24} {}",
                    record.index,
                    record.recorded_at.format("%Y-%m-%d %H:%M:%S"),
                    record.event.name(),
                    summarize(record)
                );
            }
        }
    }
    Ok(())
}

fn summarize(record: &HistoryRecord) -> String {
    match &record.event {
        HistoryEvent::RunStarted {
            release,
            namespace,
            execution_id,
            ..
        } => format!("{release} in {namespace} (execution {execution_id})"),
        HistoryEvent::ActivityScheduled {
            activity, attempt, ..
        } => format!("{activity} attempt {attempt}"),
        HistoryEvent::ActivityCompleted {
            activity, output, ..
        } => format!("{activity} -> {output}"),
        HistoryEvent::ActivityAttemptFailed {
            activity,
            attempt,
            error,
            retryable,
            ..
        } => {
            let retry = if *retryable { "retryable" } else { "fatal" };
            format!("{activity} attempt {attempt} ({retry}): {error}")
        }
        HistoryEvent::ActivityExhausted {
            activity,
            attempts,
            error,
            ..
        } => format!("{activity} gave up after {attempts} attempt(s): {error}"),
        HistoryEvent::TimestampRecorded { at, .. } => at.to_rfc3339(),
        HistoryEvent::CancellationChecked { cancelled, .. } => format!("cancelled={cancelled}"),
        HistoryEvent::CancelRequested { at } => format!("at {}", at.to_rfc3339()),
        HistoryEvent::RunCompleted { outcome } => {
            let status = if outcome.success { "success" } else { "failure" };
            format!("{status}: {}", outcome.message)
        }
    }
}
