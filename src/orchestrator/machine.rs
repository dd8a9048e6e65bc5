//! Teardown decision logic as a pure state machine.
//!
//! The machine never performs I/O. The workflow driver feeds it observations
//! (activity results, failures, cancellation) and carries out the commands it
//! returns. Identical observations always yield identical commands, which is
//! what makes a replayed run reach the same outcome.

use serde::{Deserialize, Serialize};

use crate::activities::{ActivityKind, DestroyResult, ValidateResult, VerifyResult};
use crate::cluster::INSTANCE_LABEL;
use crate::errors::{ActivityError, TransitionError};
use crate::request::ResolvedTeardown;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TeardownState {
    Start,
    Validating,
    NotFound,
    DryRunSkip,
    Destroying,
    Verifying,
    Completed,
}

impl TeardownState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TeardownState::NotFound | TeardownState::DryRunSkip | TeardownState::Completed
        )
    }
}

/// Something the driver saw that the machine must react to.
#[derive(Debug, Clone)]
pub enum Observation {
    Begin,
    Validated(ValidateResult),
    ValidateFailed(ActivityError),
    Destroyed(DestroyResult),
    DestroyFailed(ActivityError),
    Verified(VerifyResult),
    VerifyFailed(ActivityError),
    Cancelled,
}

impl Observation {
    pub fn name(&self) -> &'static str {
        match self {
            Observation::Begin => "begin",
            Observation::Validated(_) => "validated",
            Observation::ValidateFailed(_) => "validate failed",
            Observation::Destroyed(_) => "destroyed",
            Observation::DestroyFailed(_) => "destroy failed",
            Observation::Verified(_) => "verified",
            Observation::VerifyFailed(_) => "verify failed",
            Observation::Cancelled => "cancelled",
        }
    }
}

/// What the driver should do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Validate,
    Destroy,
    Verify,
    Complete(Conclusion),
}

/// Terminal result of a run, before it is stamped.
#[derive(Debug, Clone, PartialEq)]
pub struct Conclusion {
    pub success: bool,
    pub message: String,
    pub warnings: Vec<String>,
    /// Set when an activity failure ended the run.
    pub failure: Option<(ActivityKind, ActivityError)>,
}

impl Conclusion {
    fn new(success: bool, message: impl Into<String>) -> Self {
        Self {
            success,
            message: message.into(),
            warnings: Vec::new(),
            failure: None,
        }
    }

    fn failed(activity: ActivityKind, error: ActivityError, message: String) -> Self {
        Self {
            success: false,
            message,
            warnings: Vec::new(),
            failure: Some((activity, error)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TeardownMachine {
    state: TeardownState,
    release: String,
    namespace: String,
    dry_run: bool,
    wait: bool,
    destroyed: Option<DestroyResult>,
}

impl TeardownMachine {
    pub fn new(job: &ResolvedTeardown) -> Self {
        Self {
            state: TeardownState::Start,
            release: job.release.name().to_string(),
            namespace: job.namespace.clone(),
            dry_run: job.dry_run,
            wait: job.wait,
            destroyed: None,
        }
    }

    pub fn state(&self) -> TeardownState {
        self.state
    }

    pub fn advance(&mut self, observation: Observation) -> Result<Command, TransitionError> {
        use TeardownState as S;

        let (next, command) = match (self.state, observation) {
            (S::Start, Observation::Begin) => (S::Validating, Command::Validate),

            (S::Start | S::Validating | S::Destroying, Observation::Cancelled) => (
                S::Completed,
                Command::Complete(Conclusion::new(
                    false,
                    "Cancelled before any destructive action",
                )),
            ),

            (S::Validating, Observation::Validated(found)) if !found.exists => {
                let message = if self.dry_run {
                    format!(
                        "Dry run: release {} not found in namespace {}; a real teardown would fail",
                        self.release, self.namespace
                    )
                } else {
                    format!(
                        "Release {} not found in namespace {}",
                        self.release, self.namespace
                    )
                };
                (S::NotFound, Command::Complete(Conclusion::new(false, message)))
            }

            (S::Validating, Observation::Validated(found)) if self.dry_run => {
                let message = format!(
                    "Dry run: release {} in namespace {} (status {}, revision {}) would be uninstalled; no destructive action taken",
                    self.release, self.namespace, found.status, found.revision
                );
                (S::DryRunSkip, Command::Complete(Conclusion::new(true, message)))
            }

            (S::Validating, Observation::Validated(_)) => (S::Destroying, Command::Destroy),

            (S::Validating, Observation::ValidateFailed(error)) => {
                let message = format!("Failed to validate release: {error}");
                (
                    S::Completed,
                    Command::Complete(Conclusion::failed(ActivityKind::Validate, error, message)),
                )
            }

            (S::Destroying, Observation::Destroyed(result)) => {
                if self.wait && result.succeeded {
                    self.destroyed = Some(result);
                    (S::Verifying, Command::Verify)
                } else {
                    (
                        S::Completed,
                        Command::Complete(Conclusion::new(result.succeeded, result.detail)),
                    )
                }
            }

            (S::Destroying, Observation::DestroyFailed(error)) => {
                let message = format!("Failed to undeploy release: {error}");
                (
                    S::Completed,
                    Command::Complete(Conclusion::failed(ActivityKind::Destroy, error, message)),
                )
            }

            (S::Verifying, observation @ (Observation::Verified(_)
            | Observation::VerifyFailed(_)
            | Observation::Cancelled)) => {
                let mut conclusion = self.destroy_conclusion();
                if let Some(warning) = self.verify_warning(&observation) {
                    conclusion.warnings.push(warning);
                }
                (S::Completed, Command::Complete(conclusion))
            }

            (state, observation) => {
                return Err(TransitionError {
                    state,
                    observation: observation.name(),
                });
            }
        };

        tracing::debug!(from = ?self.state, to = ?next, "Teardown transition");
        self.state = next;
        Ok(command)
    }

    fn destroy_conclusion(&self) -> Conclusion {
        match &self.destroyed {
            Some(result) => Conclusion::new(result.succeeded, result.detail.clone()),
            None => Conclusion::new(true, format!("Release {} uninstalled", self.release)),
        }
    }

    fn verify_warning(&self, observation: &Observation) -> Option<String> {
        match observation {
            Observation::Verified(v) if v.all_clear => None,
            Observation::Verified(v) => Some(format!(
                "{} deployment(s) and {} service(s) labeled {INSTANCE_LABEL}={} still present in namespace {}",
                v.remaining_workload_count, v.remaining_service_count, self.release, self.namespace
            )),
            Observation::VerifyFailed(error) => Some(format!("Failed to verify teardown: {error}")),
            Observation::Cancelled => Some("Verification skipped: run was cancelled".to_string()),
            _ => None,
        }
    }
}
