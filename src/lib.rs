pub mod activities;
pub mod cluster;
pub mod config;
pub mod errors;
pub mod host;
pub mod identity;
pub mod orchestrator;
pub mod policy;
pub mod request;

pub use errors::TeardownError;
pub use host::{DurableHost, RunId, RunOptions};
pub use orchestrator::TeardownOutcome;
pub use request::TeardownRequest;
