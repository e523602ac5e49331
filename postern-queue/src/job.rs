//! Job definition, tiers and retry bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Job unique identifier.
pub type JobId = Uuid;

/// Job data payload.
pub type JobData = serde_json::Value;

/// Delay before retry `n` (1-based). Retries past the end of the table use the last entry.
pub const RETRY_DELAYS: [Duration; 10] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
    Duration::from_secs(8),
    Duration::from_secs(16),
    Duration::from_secs(32),
    Duration::from_secs(60),
    Duration::from_secs(120),
    Duration::from_secs(300),
    Duration::from_secs(600),
];

/// Backoff before the given retry (1 = first retry), capped at ten minutes.
pub fn retry_delay(retry: u32) -> Duration {
    let index = (retry.max(1) - 1) as usize;
    RETRY_DELAYS[index.min(RETRY_DELAYS.len() - 1)]
}

/// Priority tier. Workers always drain a higher tier before looking at a lower one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum QueueTier {
    /// Background work
    Low = 0,
    /// Regular sends
    #[default]
    Default = 1,
    /// Bounce processing and anything else that must not wait
    Critical = 2,
}

impl QueueTier {
    /// Tiers in the order workers poll them.
    pub const BY_PRIORITY: [QueueTier; 3] = [QueueTier::Critical, QueueTier::Default, QueueTier::Low];

    /// Stable name used in storage keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueTier::Low => "low",
            QueueTier::Default => "default",
            QueueTier::Critical => "critical",
        }
    }
}

impl std::fmt::Display for QueueTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    /// Waiting in its tier, or waiting for `run_at`
    Pending,
    /// Currently held by a worker
    Processing,
    /// Finished successfully
    Completed,
    /// Failed and scheduled for another attempt
    Failed,
    /// Retry budget exhausted; parked for inspection
    Dead,
}

/// Job status information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    /// Current state
    pub state: JobState,

    /// Last error message
    pub error: Option<String>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl JobStatus {
    fn new(state: JobState, error: Option<String>) -> Self {
        Self {
            state,
            error,
            updated_at: Utc::now(),
        }
    }
}

/// Enqueue options: tier, retry budget, per-attempt timeout and optional start time.
#[derive(Debug, Clone)]
pub struct JobOptions {
    pub tier: QueueTier,
    pub max_attempts: u32,
    pub timeout: Duration,
    pub run_at: Option<DateTime<Utc>>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            tier: QueueTier::Default,
            max_attempts: 3,
            timeout: Duration::from_secs(300),
            run_at: None,
        }
    }
}

impl JobOptions {
    pub fn new(tier: QueueTier, max_attempts: u32, timeout: Duration) -> Self {
        Self {
            tier,
            max_attempts,
            timeout,
            run_at: None,
        }
    }

    /// Defer the first attempt until `run_at`.
    pub fn run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }
}

/// A unit of work. The payload is opaque to the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier
    pub id: JobId,

    /// Job type; selects the handler
    pub job_type: String,

    /// Job payload data
    pub data: JobData,

    /// Priority tier
    pub tier: QueueTier,

    /// Job status
    pub status: JobStatus,

    /// Attempts started so far
    pub attempts: u32,

    /// Total attempts allowed, including the first
    pub max_attempts: u32,

    /// Per-attempt timeout in seconds
    pub timeout_secs: u64,

    /// When the job was created
    pub created_at: DateTime<Utc>,

    /// Earliest time the next attempt may start
    pub run_at: Option<DateTime<Utc>>,

    /// When the current attempt started
    pub started_at: Option<DateTime<Utc>>,

    /// When the job completed or died
    pub finished_at: Option<DateTime<Utc>>,

    /// Free-form metadata
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Job {
    /// Create a new job with default options.
    pub fn new(job_type: impl Into<String>, data: JobData) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type: job_type.into(),
            data,
            tier: QueueTier::Default,
            status: JobStatus::new(JobState::Pending, None),
            attempts: 0,
            max_attempts: 3,
            timeout_secs: 300,
            created_at: Utc::now(),
            run_at: None,
            started_at: None,
            finished_at: None,
            metadata: HashMap::new(),
        }
    }

    /// Apply a full set of enqueue options.
    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.tier = options.tier;
        self.max_attempts = options.max_attempts.max(1);
        self.timeout_secs = options.timeout.as_secs().max(1);
        self.run_at = options.run_at;
        self
    }

    /// Set the tier.
    pub fn with_tier(mut self, tier: QueueTier) -> Self {
        self.tier = tier;
        self
    }

    /// Set the retry budget (at least one attempt).
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// Schedule the job for later.
    pub fn run_at(mut self, time: DateTime<Utc>) -> Self {
        self.run_at = Some(time);
        self
    }

    /// Schedule the job after a delay.
    pub fn run_after(mut self, delay: chrono::Duration) -> Self {
        self.run_at = Some(Utc::now() + delay);
        self
    }

    /// Add metadata.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Whether the job may start at `now`.
    pub fn is_ready_at(&self, now: DateTime<Utc>) -> bool {
        self.run_at.is_none_or(|run_at| now >= run_at)
    }

    /// Whether the job may start now.
    pub fn is_ready(&self) -> bool {
        self.is_ready_at(Utc::now())
    }

    /// Whether another attempt is allowed after the current one.
    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Mark the job as picked up by a worker.
    pub fn start_processing(&mut self) {
        self.status = JobStatus::new(JobState::Processing, self.status.error.take());
        self.started_at = Some(Utc::now());
        self.attempts += 1;
    }

    /// Mark job as completed.
    pub fn complete(&mut self) {
        self.status = JobStatus::new(JobState::Completed, None);
        self.finished_at = Some(Utc::now());
    }

    /// Record a failed attempt. Schedules the next attempt while budget remains,
    /// otherwise the job is dead. Returns the resulting state.
    pub fn fail(&mut self, error: impl Into<String>) -> JobState {
        let error = error.into();
        if self.can_retry() {
            self.run_at = Some(Utc::now() + chrono::Duration::from_std(self.backoff_delay()).unwrap_or_default());
            self.status = JobStatus::new(JobState::Failed, Some(error));
        } else {
            self.bury(error);
        }
        self.status.state
    }

    /// Move the job to the dead state regardless of remaining budget.
    pub fn bury(&mut self, error: impl Into<String>) {
        self.status = JobStatus::new(JobState::Dead, Some(error.into()));
        self.finished_at = Some(Utc::now());
    }

    /// Reset a dead job so it can be enqueued again from scratch.
    pub fn revive(&mut self) {
        self.attempts = 0;
        self.run_at = None;
        self.started_at = None;
        self.finished_at = None;
        self.status = JobStatus::new(JobState::Pending, None);
    }

    /// Delay before the next attempt, based on attempts so far.
    pub fn backoff_delay(&self) -> Duration {
        retry_delay(self.attempts)
    }
}
