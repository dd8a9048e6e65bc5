//! Release name derivation: `undeploy release-name`.

use anyhow::Result;
use serde_json::json;

use undeploy::host::RunId;
use undeploy::request::TeardownRequest;

use super::load_config;
use crate::{Cli, NamingArgs, OutputFormat};

pub fn cmd_release_name(cli: &Cli, naming: &NamingArgs, format: OutputFormat) -> Result<()> {
    let config = load_config(cli)?;
    let request = TeardownRequest::try_from(naming.to_fields())?;
    let job = request.resolve(&config.cluster.namespace)?;
    let run_id = RunId::for_release(&job.namespace, &job.release);

    match format {
        OutputFormat::Json => {
            let value = json!({
                "release": job.release.name(),
                "namespace": job.namespace,
                "runKey": run_id.as_str(),
            });
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        OutputFormat::Table => {
            println!("release:   {}", job.release);
            println!("namespace: {}", job.namespace);
            println!("run key:   {}", run_id);
        }
    }
    Ok(())
}
