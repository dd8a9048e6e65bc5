//! Per-run execution context.
//!
//! The workflow reaches the outside world only through a [`RunContext`]. Each
//! call takes the next step number; on replay a step whose result is already in
//! the history returns that result instead of running again.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::RunId;
use super::history::{HistoryEvent, HistoryRecord, HistoryStore};
use crate::activities::ActivityKind;
use crate::errors::{ActivityError, HostError};
use crate::policy::ActivityOptions;

/// Why a step did not produce a value.
#[derive(Debug)]
pub enum StepError {
    /// The activity failed for good (non-retryable or out of attempts).
    Activity(ActivityError),
    /// The host could not record or replay the step.
    Host(HostError),
}

impl From<HostError> for StepError {
    fn from(err: HostError) -> Self {
        StepError::Host(err)
    }
}

pub struct RunContext {
    run_id: RunId,
    store: Arc<dyn HistoryStore>,
    replay: BTreeMap<u64, Vec<HistoryEvent>>,
    next_seq: u64,
    workers: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl RunContext {
    pub(crate) fn new(
        run_id: RunId,
        store: Arc<dyn HistoryStore>,
        history: &[HistoryRecord],
        workers: Arc<Semaphore>,
        cancel: CancellationToken,
    ) -> Self {
        let mut replay: BTreeMap<u64, Vec<HistoryEvent>> = BTreeMap::new();
        for record in history {
            if let Some(seq) = record.event.seq() {
                replay.entry(seq).or_default().push(record.event.clone());
            }
        }
        Self {
            run_id,
            store,
            replay,
            next_seq: 0,
            workers,
            cancel,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// True while recorded steps remain to be replayed.
    pub fn is_replaying(&self) -> bool {
        self.replay.range(self.next_seq..).next().is_some()
    }

    fn record(&self, event: HistoryEvent) -> Result<(), HostError> {
        self.store.append(&self.run_id, event)?;
        Ok(())
    }

    /// Take the next step number and any events recorded for it.
    ///
    /// Fails if the recorded step was of a different kind than `expected`.
    fn next_step(
        &mut self,
        expected: &str,
        matches: impl Fn(&HistoryEvent) -> bool,
    ) -> Result<(u64, Vec<HistoryEvent>), HostError> {
        let seq = self.next_seq;
        self.next_seq += 1;
        let recorded = self.replay.remove(&seq).unwrap_or_default();
        if let Some(found) = recorded.iter().find(|e| !matches(e)) {
            return Err(HostError::Nondeterminism {
                run_id: self.run_id.clone(),
                seq,
                expected: expected.to_string(),
                found: found.step_label(),
            });
        }
        Ok((seq, recorded))
    }

    /// Wall-clock time, recorded once and replayed afterwards.
    pub fn now(&mut self) -> Result<DateTime<Utc>, HostError> {
        let (seq, recorded) = self.next_step("timestamp", |e| {
            matches!(e, HistoryEvent::TimestampRecorded { .. })
        })?;
        if let Some(HistoryEvent::TimestampRecorded { at, .. }) = recorded.first() {
            return Ok(*at);
        }
        let at = Utc::now();
        self.record(HistoryEvent::TimestampRecorded { seq, at })?;
        Ok(at)
    }

    /// Whether cancellation has been requested, recorded so replays agree.
    pub fn cancellation_requested(&mut self) -> Result<bool, HostError> {
        let (seq, recorded) = self.next_step("cancellation check", |e| {
            matches!(e, HistoryEvent::CancellationChecked { .. })
        })?;
        if let Some(HistoryEvent::CancellationChecked { cancelled, .. }) = recorded.first() {
            return Ok(*cancelled);
        }
        let cancelled = self.cancel.is_cancelled();
        self.record(HistoryEvent::CancellationChecked { seq, cancelled })?;
        Ok(cancelled)
    }

    /// Run an activity under `options`, or replay its recorded result.
    ///
    /// Each attempt holds a worker permit and is bounded by the start-to-close
    /// budget. Retryable failures back off exponentially until attempts run
    /// out. A crash mid-attempt re-runs that attempt on recovery.
    pub async fn execute_activity<T, F, Fut>(
        &mut self,
        kind: ActivityKind,
        options: &ActivityOptions,
        mut invoke: F,
    ) -> Result<T, StepError>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ActivityError>>,
    {
        let expected = format!("{kind} activity");
        let (seq, recorded) = self.next_step(&expected, |e| match e {
            HistoryEvent::ActivityScheduled { activity, .. }
            | HistoryEvent::ActivityCompleted { activity, .. }
            | HistoryEvent::ActivityAttemptFailed { activity, .. }
            | HistoryEvent::ActivityExhausted { activity, .. } => *activity == kind,
            _ => false,
        })?;

        let mut failed_attempts = 0u32;
        let mut fatal = false;
        let mut last_error = None;
        for event in &recorded {
            match event {
                HistoryEvent::ActivityCompleted { output, .. } => {
                    tracing::debug!(run_id = %self.run_id, activity = %kind, seq, "Replaying recorded result");
                    return serde_json::from_value(output.clone())
                        .map_err(|e| StepError::Host(HostError::Payload(e)));
                }
                HistoryEvent::ActivityExhausted { error, .. } => {
                    return Err(StepError::Activity(error.clone()));
                }
                HistoryEvent::ActivityAttemptFailed {
                    error, retryable, ..
                } => {
                    failed_attempts += 1;
                    fatal |= !retryable;
                    last_error = Some(error.clone());
                }
                _ => {}
            }
        }

        let max_attempts = options.attempts();
        if let Some(error) = last_error
            .as_ref()
            .filter(|_| fatal || failed_attempts >= max_attempts)
        {
            self.record(HistoryEvent::ActivityExhausted {
                seq,
                activity: kind,
                attempts: failed_attempts,
                error: error.clone(),
            })?;
            return Err(StepError::Activity(error.clone()));
        }

        let mut attempt = failed_attempts + 1;
        loop {
            self.record(HistoryEvent::ActivityScheduled {
                seq,
                activity: kind,
                attempt,
            })?;

            let result = match self.workers.acquire().await {
                Ok(_permit) => match tokio::time::timeout(options.start_to_close, invoke()).await {
                    Ok(result) => result,
                    Err(_) => Err(ActivityError::timed_out(options.start_to_close)),
                },
                Err(_) => Err(ActivityError::retryable("worker pool closed")),
            };

            match result {
                Ok(value) => {
                    let output = serde_json::to_value(&value).map_err(HostError::Payload)?;
                    self.record(HistoryEvent::ActivityCompleted {
                        seq,
                        activity: kind,
                        attempt,
                        output,
                    })?;
                    tracing::info!(run_id = %self.run_id, activity = %kind, attempt, "Activity completed");
                    return Ok(value);
                }
                Err(error) => {
                    let retryable = error.is_retryable();
                    tracing::warn!(
                        run_id = %self.run_id,
                        activity = %kind,
                        attempt,
                        retryable,
                        error = %error,
                        "Activity attempt failed"
                    );
                    self.record(HistoryEvent::ActivityAttemptFailed {
                        seq,
                        activity: kind,
                        attempt,
                        error: error.clone(),
                        retryable,
                    })?;

                    if !retryable || attempt >= max_attempts {
                        self.record(HistoryEvent::ActivityExhausted {
                            seq,
                            activity: kind,
                            attempts: attempt,
                            error: error.clone(),
                        })?;
                        return Err(StepError::Activity(error));
                    }

                    let delay = options.backoff.delay_for_attempt(attempt);
                    tracing::debug!(run_id = %self.run_id, activity = %kind, ?delay, "Backing off");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
