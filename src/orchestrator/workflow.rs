//! Drives a [`TeardownMachine`] through the host.

use std::sync::Arc;

use super::TeardownOutcome;
use super::machine::{Command, Observation, TeardownMachine};
use crate::activities::{ActivityKind, TeardownActivities};
use crate::errors::TeardownError;
use crate::host::{RunContext, StepError};
use crate::policy::PolicySet;
use crate::request::ResolvedTeardown;

/// The teardown workflow: validate, destroy, then optionally verify.
#[derive(Clone)]
pub struct TeardownWorkflow {
    activities: Arc<dyn TeardownActivities>,
    policies: PolicySet,
}

impl TeardownWorkflow {
    pub fn new(activities: Arc<dyn TeardownActivities>, policies: PolicySet) -> Self {
        Self {
            activities,
            policies,
        }
    }

    pub fn policies(&self) -> &PolicySet {
        &self.policies
    }

    /// Run (or replay) the workflow to its terminal outcome.
    pub async fn execute(
        &self,
        ctx: &mut RunContext,
        job: &ResolvedTeardown,
    ) -> Result<TeardownOutcome, TeardownError> {
        let mut machine = TeardownMachine::new(job);
        let mut command = machine.advance(Observation::Begin)?;

        loop {
            let observation = match command {
                Command::Validate => {
                    if ctx.cancellation_requested()? {
                        Observation::Cancelled
                    } else {
                        self.validate(ctx, job).await?
                    }
                }
                Command::Destroy => {
                    if ctx.cancellation_requested()? {
                        Observation::Cancelled
                    } else {
                        // Once scheduled, destroy runs to completion.
                        self.destroy(ctx, job).await?
                    }
                }
                Command::Verify => {
                    if ctx.cancellation_requested()? {
                        Observation::Cancelled
                    } else {
                        self.verify(ctx, job).await?
                    }
                }
                Command::Complete(conclusion) => {
                    let outcome = TeardownOutcome {
                        success: conclusion.success,
                        message: conclusion.message,
                        completed_at: ctx.now()?,
                        release: job.release.name().to_string(),
                        namespace: job.namespace.clone(),
                        warnings: conclusion.warnings,
                    };
                    tracing::info!(
                        run_id = %ctx.run_id(),
                        state = ?machine.state(),
                        success = outcome.success,
                        message = %outcome.message,
                        "Teardown workflow completed"
                    );
                    for warning in &outcome.warnings {
                        tracing::warn!(run_id = %ctx.run_id(), %warning, "Post-condition warning");
                    }

                    return match conclusion.failure {
                        Some((activity, source)) => Err(TeardownError::ActivityFailed {
                            activity,
                            outcome: Box::new(outcome),
                            source,
                        }),
                        None => Ok(outcome),
                    };
                }
            };
            command = machine.advance(observation)?;
        }
    }

    async fn validate(
        &self,
        ctx: &mut RunContext,
        job: &ResolvedTeardown,
    ) -> Result<Observation, TeardownError> {
        let activities = &self.activities;
        let result = ctx
            .execute_activity(ActivityKind::Validate, &self.policies.validate, || {
                activities.validate(&job.release, &job.namespace)
            })
            .await;
        match result {
            Ok(found) => Ok(Observation::Validated(found)),
            Err(StepError::Activity(e)) => Ok(Observation::ValidateFailed(e)),
            Err(StepError::Host(e)) => Err(e.into()),
        }
    }

    async fn destroy(
        &self,
        ctx: &mut RunContext,
        job: &ResolvedTeardown,
    ) -> Result<Observation, TeardownError> {
        let activities = &self.activities;
        let options = self.policies.destroy_for(job.timeout);
        let result = ctx
            .execute_activity(ActivityKind::Destroy, &options, || {
                activities.destroy(&job.release, &job.namespace, job.wait, job.timeout)
            })
            .await;
        match result {
            Ok(done) => Ok(Observation::Destroyed(done)),
            Err(StepError::Activity(e)) => Ok(Observation::DestroyFailed(e)),
            Err(StepError::Host(e)) => Err(e.into()),
        }
    }

    async fn verify(
        &self,
        ctx: &mut RunContext,
        job: &ResolvedTeardown,
    ) -> Result<Observation, TeardownError> {
        let activities = &self.activities;
        let result = ctx
            .execute_activity(ActivityKind::Verify, &self.policies.verify, || {
                activities.verify(&job.release, &job.namespace)
            })
            .await;
        match result {
            Ok(found) => Ok(Observation::Verified(found)),
            Err(StepError::Activity(e)) => Ok(Observation::VerifyFailed(e)),
            Err(StepError::Host(e)) => Err(e.into()),
        }
    }
}
