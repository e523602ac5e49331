//! Bulk campaign sending.
//!
//! A [`CampaignRunner`] walks a campaign's contact list in id order, sends one
//! personalized message per contact at the configured rate, and persists progress
//! so a paused or crashed campaign picks up where it left off. A process-wide
//! [`RunnerRegistry`] keeps at most one live runner per campaign and carries the
//! stop signal used by pause and cancel.

mod personalize;
mod registry;
mod runner;

pub use personalize::personalize;
pub use registry::{RunGuard, RunnerRegistry, StopSignal};
pub use runner::{CampaignRunner, RunOutcome};
