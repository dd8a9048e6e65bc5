//! Per-activity timeout and retry policies.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff between attempts of one activity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Backoff {
    #[serde(with = "humantime_serde")]
    pub initial: Duration,
    /// Growth per attempt; values below 1 are treated as 1.
    pub coefficient: f64,
    #[serde(with = "humantime_serde")]
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            coefficient: 2.0,
            max: Duration::from_secs(60),
        }
    }
}

impl Backoff {
    /// Delay to sleep after failed attempt number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.coefficient.max(1.0).powi(exponent);
        // Out-of-range products (including infinity) land on the cap.
        Duration::try_from_secs_f64(self.initial.as_secs_f64() * factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

/// Timeout and retry budget for one activity kind.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ActivityOptions {
    /// Bound on a single attempt.
    #[serde(with = "humantime_serde")]
    pub start_to_close: Duration,
    /// Total attempts including the first. Never below 1.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl ActivityOptions {
    pub const fn new(start_to_close: Duration, max_attempts: u32) -> Self {
        Self {
            start_to_close,
            max_attempts,
            backoff: Backoff {
                initial: Duration::from_secs(1),
                coefficient: 2.0,
                max: Duration::from_secs(60),
            },
        }
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// A policy table as written in config; unset fields keep the activity's
/// own defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ActivityOverrides {
    #[serde(with = "humantime_serde")]
    start_to_close: Option<Duration>,
    max_attempts: Option<u32>,
    backoff: Option<Backoff>,
}

impl ActivityOverrides {
    fn apply_to(self, base: ActivityOptions) -> ActivityOptions {
        ActivityOptions {
            start_to_close: self.start_to_close.unwrap_or(base.start_to_close),
            max_attempts: self.max_attempts.unwrap_or(base.max_attempts),
            backoff: self.backoff.unwrap_or(base.backoff),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct PolicyOverrides {
    validate: ActivityOverrides,
    destroy: ActivityOverrides,
    verify: ActivityOverrides,
}

impl From<PolicyOverrides> for PolicySet {
    fn from(overrides: PolicyOverrides) -> Self {
        let defaults = PolicySet::default();
        Self {
            validate: overrides.validate.apply_to(defaults.validate),
            destroy: overrides.destroy.apply_to(defaults.destroy),
            verify: overrides.verify.apply_to(defaults.verify),
        }
    }
}

/// Policies for the three teardown activities.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "PolicyOverrides")]
pub struct PolicySet {
    pub validate: ActivityOptions,
    pub destroy: ActivityOptions,
    pub verify: ActivityOptions,
}

impl Default for PolicySet {
    fn default() -> Self {
        Self {
            validate: ActivityOptions::new(Duration::from_secs(2 * 60), 3),
            destroy: ActivityOptions::new(Duration::from_secs(10 * 60), 3),
            verify: ActivityOptions::new(Duration::from_secs(5 * 60), 2),
        }
    }
}

impl PolicySet {
    /// Destroy policy widened so a long uninstall ceiling fits inside one attempt.
    pub fn destroy_for(&self, timeout: Option<Duration>) -> ActivityOptions {
        let mut options = self.destroy;
        if let Some(timeout) = timeout {
            options.start_to_close = options.start_to_close.max(timeout);
        }
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_then_caps() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(backoff.delay_for_attempt(7), Duration::from_secs(60));
        assert_eq!(backoff.delay_for_attempt(64), Duration::from_secs(60));
    }

    #[test]
    fn test_fractional_coefficient() {
        let backoff = Backoff {
            initial: Duration::from_secs(1),
            coefficient: 1.5,
            max: Duration::from_secs(60),
        };
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(1500));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(2250));
        assert_eq!(backoff.delay_for_attempt(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_coefficient_below_one_holds_delay_steady() {
        let backoff = Backoff {
            coefficient: 0.5,
            ..Backoff::default()
        };
        assert_eq!(backoff.delay_for_attempt(5), Duration::from_secs(1));
    }

    #[test]
    fn test_default_policies() {
        let p = PolicySet::default();
        assert_eq!(p.validate.start_to_close, Duration::from_secs(120));
        assert_eq!(p.validate.max_attempts, 3);
        assert_eq!(p.destroy.start_to_close, Duration::from_secs(600));
        assert_eq!(p.destroy.max_attempts, 3);
        assert_eq!(p.verify.start_to_close, Duration::from_secs(300));
        assert_eq!(p.verify.max_attempts, 2);
    }

    #[test]
    fn test_destroy_budget_widens_for_long_timeout() {
        let p = PolicySet::default();
        assert_eq!(
            p.destroy_for(Some(Duration::from_secs(900))).start_to_close,
            Duration::from_secs(900)
        );
        assert_eq!(
            p.destroy_for(Some(Duration::from_secs(30))).start_to_close,
            Duration::from_secs(600)
        );
        assert_eq!(p.destroy_for(None), p.destroy);
    }

    #[test]
    fn test_zero_attempts_still_runs_once() {
        assert_eq!(ActivityOptions::new(Duration::from_secs(1), 0).attempts(), 1);
    }

    #[test]
    fn test_policy_overrides_from_toml() {
        let p: PolicySet = toml::from_str(
            r#"
            [verify]
            start_to_close = "30s"
            max_attempts = 5
            [verify.backoff]
            initial = "200ms"
            "#,
        )
        .unwrap();
        assert_eq!(p.verify.start_to_close, Duration::from_secs(30));
        assert_eq!(p.verify.max_attempts, 5);
        assert_eq!(p.verify.backoff.initial, Duration::from_millis(200));
        assert_eq!(p.verify.backoff.max, Duration::from_secs(60));
        assert_eq!(p.destroy, PolicySet::default().destroy);
    }

    #[test]
    fn test_partial_override_keeps_activity_defaults() {
        let p: PolicySet = toml::from_str(
            r#"
            [destroy]
            max_attempts = 5

            [validate.backoff]
            coefficient = 1.5
            "#,
        )
        .unwrap();
        let defaults = PolicySet::default();
        assert_eq!(p.destroy.max_attempts, 5);
        assert_eq!(p.destroy.start_to_close, Duration::from_secs(600));
        assert_eq!(p.destroy.backoff, defaults.destroy.backoff);
        assert_eq!(p.validate.start_to_close, defaults.validate.start_to_close);
        assert_eq!(p.validate.backoff.coefficient, 1.5);
        assert_eq!(p.validate.backoff.initial, Duration::from_secs(1));
        assert_eq!(p.verify, defaults.verify);
    }

    #[test]
    fn test_empty_policy_table_is_default() {
        let p: PolicySet = toml::from_str("").unwrap();
        assert_eq!(p, PolicySet::default());
    }
}
