//! Subprocess plumbing shared by the helm and kubectl adapters.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;

use crate::errors::StoreError;

/// Captured result of one tool invocation.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    /// Best human-readable description of a failed invocation.
    pub fn failure_detail(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        format!("exited with code {}", self.code.unwrap_or(-1))
    }
}

/// A command line for an external cluster tool.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl ToolCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    /// Rendered for logs.
    pub fn display(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    /// Run to completion and capture its output.
    ///
    /// The child is killed if the returned future is dropped, so an outer
    /// timeout also stops the tool.
    pub async fn output(&self) -> Result<ToolOutput, StoreError> {
        tracing::debug!(command = %self.display(), "Running cluster tool");

        let output = Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                StoreError::Unavailable(format!(
                    "failed to run {}: {e}",
                    self.program.display()
                ))
            })?;

        let result = ToolOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        tracing::debug!(code = ?result.code, "Cluster tool exited");
        Ok(result)
    }
}

/// Connectivity failures. Checked first: their text can mention things that
/// are "not found" on the client side (an exec plugin binary, a context).
const UNREACHABLE_MARKERS: &[&str] = &["cluster unreachable", "unable to connect to the server"];

/// Messages helm and kubectl print when the named object itself is absent.
const NOT_FOUND_MARKERS: &[&str] = &[
    "release: not found",
    "release not loaded",
    "error from server (notfound)",
];

/// Map a failed tool invocation to a store error by its message.
pub fn classify_failure(output: &ToolOutput) -> StoreError {
    let detail = output.failure_detail();
    let lower = detail.to_lowercase();
    let mentions = |markers: &[&str]| markers.iter().any(|m| lower.contains(m));

    if mentions(UNREACHABLE_MARKERS) {
        StoreError::Unavailable(detail)
    } else if mentions(NOT_FOUND_MARKERS) {
        StoreError::NotFound(detail)
    } else if lower.contains("forbidden")
        || lower.contains("unauthorized")
        || lower.contains("permission denied")
        || lower.contains("is invalid")
    {
        StoreError::Rejected(detail)
    } else {
        StoreError::Unavailable(detail)
    }
}
