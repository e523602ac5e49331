//! Queue introspection for health dashboards.

use crate::job::QueueTier;
use serde::{Deserialize, Serialize};

/// Point-in-time queue depth and lifetime counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Ready jobs in the critical tier.
    pub critical: u64,
    /// Ready jobs in the default tier.
    pub default: u64,
    /// Ready jobs in the low tier.
    pub low: u64,
    /// Jobs waiting for `run_at`: delayed sends and scheduled retries.
    pub delayed: u64,
    /// Jobs currently held by a worker.
    pub processing: u64,
    /// Jobs parked after exhausting their retries.
    pub dead: u64,
    /// Jobs completed successfully.
    pub processed: u64,
    /// Failed attempts, retried or not.
    pub failed: u64,
}

impl QueueStats {
    /// Ready depth for a single tier.
    pub fn depth(&self, tier: QueueTier) -> u64 {
        match tier {
            QueueTier::Critical => self.critical,
            QueueTier::Default => self.default,
            QueueTier::Low => self.low,
        }
    }

    pub(crate) fn depth_mut(&mut self, tier: QueueTier) -> &mut u64 {
        match tier {
            QueueTier::Critical => &mut self.critical,
            QueueTier::Default => &mut self.default,
            QueueTier::Low => &mut self.low,
        }
    }

    /// Ready jobs across all tiers.
    pub fn pending(&self) -> u64 {
        self.critical + self.default + self.low
    }

    /// Everything not yet finished: ready, delayed and in flight.
    pub fn outstanding(&self) -> u64 {
        self.pending() + self.delayed + self.processing
    }
}
