//! Process-wide registry of live campaign runners.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

use crate::model::CampaignId;

/// Cooperative stop signal shared between a runner and its controllers.
#[derive(Debug, Default)]
pub struct StopSignal {
    stopped: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Resolves once [`stop`](Self::stop) has been called.
    pub async fn stopped(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }
}

/// At most one runner per campaign id.
#[derive(Debug, Default)]
pub struct RunnerRegistry {
    runners: DashMap<CampaignId, Arc<StopSignal>>,
}

impl RunnerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim the runner slot for `id`. Returns `None` if a runner is already live.
    pub fn register(self: &Arc<Self>, id: CampaignId) -> Option<RunGuard> {
        let signal = match self.runners.entry(id) {
            Entry::Occupied(_) => return None,
            Entry::Vacant(slot) => slot.insert(Arc::new(StopSignal::default())).clone(),
        };
        Some(RunGuard {
            registry: Arc::clone(self),
            id,
            signal,
        })
    }

    /// Signal the live runner of `id`, if any.
    pub fn stop(&self, id: CampaignId) -> bool {
        match self.runners.get(&id) {
            Some(signal) => {
                signal.stop();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, id: CampaignId) -> bool {
        self.runners.contains_key(&id)
    }

    /// Ids of live runners.
    pub fn active(&self) -> Vec<CampaignId> {
        let mut ids: Vec<CampaignId> = self.runners.iter().map(|r| *r.key()).collect();
        ids.sort_unstable();
        ids
    }
}

/// Runner slot; released on drop.
#[derive(Debug)]
pub struct RunGuard {
    registry: Arc<RunnerRegistry>,
    id: CampaignId,
    signal: Arc<StopSignal>,
}

impl RunGuard {
    pub fn id(&self) -> CampaignId {
        self.id
    }

    pub fn is_stopped(&self) -> bool {
        self.signal.is_stopped()
    }

    pub async fn stopped(&self) {
        self.signal.stopped().await
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.registry
            .runners
            .remove_if(&self.id, |_, signal| Arc::ptr_eq(signal, &self.signal));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_single_runner_per_campaign() {
        let registry = RunnerRegistry::new();
        let guard = registry.register(7).unwrap();
        assert!(registry.register(7).is_none());
        assert!(registry.is_active(7));
        assert_eq!(registry.active(), vec![7]);

        drop(guard);
        assert!(!registry.is_active(7));
        assert!(registry.register(7).is_some());
    }

    #[tokio::test]
    async fn test_stop_wakes_runner() {
        let registry = RunnerRegistry::new();
        let guard = registry.register(1).unwrap();
        assert!(!registry.stop(2));

        let waiter = tokio::spawn(async move {
            guard.stopped().await;
            guard.is_stopped()
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(registry.stop(1));
        assert!(waiter.await.unwrap());
        assert!(!registry.is_active(1));
    }
}
