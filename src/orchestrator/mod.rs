pub mod machine;
pub mod workflow;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use machine::{Command, Conclusion, Observation, TeardownMachine, TeardownState};
pub use workflow::TeardownWorkflow;

/// Terminal record of a teardown run. The only value handed back to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeardownOutcome {
    pub success: bool,
    pub message: String,
    pub completed_at: DateTime<Utc>,
    pub release: String,
    pub namespace: String,
    /// Post-condition warnings. Never affect `success`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}
