//! IP warmup: per-tenant daily send ceilings.

use chrono::Duration;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::alerts;
use crate::clock::Clock;
use crate::error::Result;
use crate::model::{DeliveryCounts, OrgId, Severity, WarmupProgress, WarmupStatus};
use crate::store::DeliveryStore;

/// Schedule used when a tenant names one that does not exist.
pub const DEFAULT_SCHEDULE: &str = "conservative";

const CONSERVATIVE: &[u32] = &[
    20, 50, 100, 200, 400, 600, 800, 1000, 1200, 1400, 1600, 1800, 2000, 2400, 2800, 3200, 4000,
    5000, 6000, 7000, 8000, 9000, 10000, 12000, 14000, 16000, 18000, 20000, 25000, 30000,
];

const MODERATE: &[u32] = &[
    50, 100, 300, 600, 1000, 1500, 2000, 3000, 4000, 5000, 6000, 8000, 10000, 12000, 15000, 18000,
    22000, 27000, 35000, 45000, 60000,
];

const AGGRESSIVE: &[u32] = &[
    100, 500, 1000, 2000, 4000, 7000, 10000, 15000, 20000, 30000, 45000, 60000, 80000, 100000,
];

/// Daily ceiling for `current_day` (1-based) of `schedule`. Zero means unlimited.
pub fn ceiling_for_day(schedule: &[u32], current_day: i32) -> u32 {
    if current_day <= 0 {
        return 0;
    }
    schedule.get(current_day as usize - 1).copied().unwrap_or(0)
}

/// Fewer emails than this in the window are not judged.
pub const BOUNCE_MIN_VOLUME: i64 = 100;
/// Bounce rate, in percent, above which an alert is raised.
pub const BOUNCE_ALERT_PERCENT: f64 = 3.0;
/// Bounce rate, in percent, above which warmup is paused.
pub const BOUNCE_PAUSE_PERCENT: f64 = 5.0;
/// Window the bounce rate is measured over.
pub const BOUNCE_WINDOW_HOURS: i64 = 24;

/// Result of a bounce-rate check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BounceCheck {
    /// Too few emails in the window to judge.
    LowVolume(DeliveryCounts),
    Healthy(DeliveryCounts),
    /// Alert raised.
    Warned(DeliveryCounts),
    /// Above the pause threshold: alert raised, active warmup paused.
    Paused(DeliveryCounts),
}

/// Named warmup schedules and ceiling lookup.
///
/// Days advance lazily: the first send decision on a new calendar day moves an
/// active tenant forward by exactly one day, however many idle days passed. The
/// store performs the advance atomically so concurrent runners cannot skip ahead.
pub struct WarmupController {
    store: Arc<dyn DeliveryStore>,
    clock: Arc<dyn Clock>,
    schedules: RwLock<HashMap<String, Arc<[u32]>>>,
}

impl WarmupController {
    pub fn new(store: Arc<dyn DeliveryStore>, clock: Arc<dyn Clock>) -> Self {
        let schedules = [
            ("conservative", CONSERVATIVE),
            ("moderate", MODERATE),
            ("aggressive", AGGRESSIVE),
        ]
        .into_iter()
        .map(|(name, days)| (name.to_string(), Arc::from(days)))
        .collect();

        Self {
            store,
            clock,
            schedules: RwLock::new(schedules),
        }
    }

    /// Add or replace a named schedule.
    pub fn register_schedule(&self, name: impl Into<String>, days: Vec<u32>) {
        self.schedules.write().insert(name.into(), Arc::from(days));
    }

    /// Look up a schedule, falling back to [`DEFAULT_SCHEDULE`].
    pub fn schedule(&self, name: &str) -> Arc<[u32]> {
        let schedules = self.schedules.read();
        schedules
            .get(name)
            .or_else(|| schedules.get(DEFAULT_SCHEDULE))
            .cloned()
            .unwrap_or_else(|| Arc::from(CONSERVATIVE))
    }

    /// Put a tenant on day one of `schedule_name`.
    pub async fn enroll(&self, org_id: OrgId, schedule_name: &str) -> Result<()> {
        info!(org_id, schedule = schedule_name, "Enrolling tenant in warmup");
        self.store
            .upsert_warmup(WarmupProgress::new(org_id, schedule_name))
            .await
    }

    /// Today's ceiling for a tenant without recording a send decision.
    pub async fn current_ceiling(&self, org_id: OrgId) -> Result<u32> {
        let progress = self.store.get_warmup(org_id).await?;
        self.evaluate(progress).await
    }

    /// Record a send decision for today and return the tenant's ceiling.
    ///
    /// Zero means unlimited: not enrolled, not active, or past the end of the
    /// schedule (which also marks the tenant `completed`).
    pub async fn ceiling(&self, org_id: OrgId) -> Result<u32> {
        let today = self.clock.today();
        let progress = self.store.touch_warmup(org_id, today).await?;
        self.evaluate(progress).await
    }

    /// Judge the tenant's bounce rate over the last [`BOUNCE_WINDOW_HOURS`].
    ///
    /// Above [`BOUNCE_ALERT_PERCENT`] an alert is filed; above
    /// [`BOUNCE_PAUSE_PERCENT`] an active warmup enrollment is also paused.
    pub async fn check_bounce_rate(&self, org_id: OrgId) -> Result<BounceCheck> {
        let since = self.clock.now() - Duration::hours(BOUNCE_WINDOW_HOURS);
        let counts = self.store.delivery_counts(org_id, since).await?;
        if counts.total < BOUNCE_MIN_VOLUME {
            return Ok(BounceCheck::LowVolume(counts));
        }

        let rate = counts.bounce_rate();
        if rate <= BOUNCE_ALERT_PERCENT {
            debug!(org_id, rate, "Bounce rate healthy");
            return Ok(BounceCheck::Healthy(counts));
        }

        let pause = rate > BOUNCE_PAUSE_PERCENT;
        if pause
            && let Some(progress) = self.store.get_warmup(org_id).await?
            && progress.status == WarmupStatus::Active
        {
            warn!(org_id, rate, "Pausing warmup for high bounce rate");
            self.store
                .set_warmup_status(org_id, WarmupStatus::Paused)
                .await?;
        }

        let severity = if pause {
            Severity::Critical
        } else {
            Severity::Warning
        };
        warn!(org_id, rate, total = counts.total, bounced = counts.bounced, "High bounce rate");
        alerts::bounce_rate_exceeded(self.store.as_ref(), org_id, counts, severity).await?;

        Ok(if pause {
            BounceCheck::Paused(counts)
        } else {
            BounceCheck::Warned(counts)
        })
    }

    async fn evaluate(&self, progress: Option<WarmupProgress>) -> Result<u32> {
        let Some(progress) = progress else {
            return Ok(0);
        };
        if progress.status != WarmupStatus::Active {
            return Ok(0);
        }

        let schedule = self.schedule(&progress.schedule_name);
        let finished = usize::try_from(progress.current_day).is_ok_and(|day| day > schedule.len());
        if finished {
            info!(
                org_id = progress.org_id,
                schedule = %progress.schedule_name,
                "Warmup schedule complete"
            );
            self.store
                .set_warmup_status(progress.org_id, WarmupStatus::Completed)
                .await?;
            return Ok(0);
        }

        let limit = ceiling_for_day(&schedule, progress.current_day);
        debug!(
            org_id = progress.org_id,
            day = progress.current_day,
            limit,
            "Warmup ceiling"
        );
        Ok(limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::{AlertKind, EmailStatus, NewEmail};
    use crate::store::MemoryStore;
    use chrono::{TimeZone, Utc};

    fn controller() -> (WarmupController, Arc<MemoryStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap()));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        (WarmupController::new(store.clone(), clock.clone()), store, clock)
    }

    #[test]
    fn test_ceiling_for_day() {
        assert_eq!(ceiling_for_day(&[20, 50, 100], 1), 20);
        assert_eq!(ceiling_for_day(&[20, 50, 100], 3), 100);
        assert_eq!(ceiling_for_day(&[20, 50, 100], 4), 0);
        assert_eq!(ceiling_for_day(&[20, 50, 100], 0), 0);
        assert_eq!(ceiling_for_day(&[20, 50, 100], -2), 0);
    }

    #[test]
    fn test_unknown_schedule_falls_back() {
        let (warmup, _, _) = controller();
        assert_eq!(warmup.schedule("turbo")[0], 20);
        assert_eq!(warmup.schedule("moderate")[0], 50);
        assert_eq!(warmup.schedule("aggressive").len(), 14);
    }

    #[tokio::test]
    async fn test_not_enrolled_is_unlimited() {
        let (warmup, _, _) = controller();
        assert_eq!(warmup.ceiling(42).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_lazy_day_advance_and_completion() {
        let (warmup, store, clock) = controller();
        warmup.register_schedule("short", vec![20, 50, 100]);
        warmup.enroll(1, "short").await.unwrap();

        assert_eq!(warmup.ceiling(1).await.unwrap(), 20);
        assert_eq!(warmup.ceiling(1).await.unwrap(), 20);

        clock.advance_days(3);
        assert_eq!(warmup.ceiling(1).await.unwrap(), 50);

        clock.advance_days(1);
        assert_eq!(warmup.ceiling(1).await.unwrap(), 100);

        clock.advance_days(1);
        assert_eq!(warmup.ceiling(1).await.unwrap(), 0);
        let progress = store.get_warmup(1).await.unwrap().unwrap();
        assert_eq!(progress.status, WarmupStatus::Completed);
    }

    #[tokio::test]
    async fn test_negative_day_keeps_enrollment() {
        let (warmup, store, _) = controller();
        let mut progress = WarmupProgress::new(1, "conservative");
        progress.current_day = -3;
        store.upsert_warmup(progress).await.unwrap();

        assert_eq!(warmup.current_ceiling(1).await.unwrap(), 0);
        let progress = store.get_warmup(1).await.unwrap().unwrap();
        assert_eq!(progress.status, WarmupStatus::Active);
    }

    async fn seed_emails(store: &MemoryStore, total: usize, bounced: usize) {
        for n in 0..total {
            let email = store
                .create_email(NewEmail::new(1, "news@acme.test", "Hi").to(format!("u{}@example.com", n)))
                .await
                .unwrap();
            if n < bounced {
                store.set_email_status(email.id, EmailStatus::Bounced).await.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_bounce_rate_above_pause_threshold() {
        let (warmup, store, _) = controller();
        warmup.enroll(1, "conservative").await.unwrap();
        seed_emails(&store, 100, 6).await;

        let check = warmup.check_bounce_rate(1).await.unwrap();
        assert!(matches!(check, BounceCheck::Paused(c) if c.bounced == 6 && c.total == 100));
        assert_eq!(
            store.get_warmup(1).await.unwrap().unwrap().status,
            WarmupStatus::Paused
        );

        let alerts = store.alerts(Some(1)).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::BounceRate);
        assert_eq!(alerts[0].severity, Severity::Critical);
        assert_eq!(alerts[0].data["bounced"], 6);
    }

    #[tokio::test]
    async fn test_bounce_rate_warning_keeps_warmup_active() {
        let (warmup, store, _) = controller();
        warmup.enroll(1, "conservative").await.unwrap();
        seed_emails(&store, 100, 4).await;

        let check = warmup.check_bounce_rate(1).await.unwrap();
        assert!(matches!(check, BounceCheck::Warned(_)));
        assert_eq!(
            store.get_warmup(1).await.unwrap().unwrap().status,
            WarmupStatus::Active
        );
        assert_eq!(store.alerts(Some(1)).await.unwrap()[0].severity, Severity::Warning);
    }

    #[tokio::test]
    async fn test_bounce_rate_needs_volume_and_window() {
        let (warmup, store, clock) = controller();
        seed_emails(&store, 99, 50).await;
        assert!(matches!(
            warmup.check_bounce_rate(1).await.unwrap(),
            BounceCheck::LowVolume(_)
        ));

        seed_emails(&store, 1, 0).await;
        assert!(matches!(
            warmup.check_bounce_rate(1).await.unwrap(),
            BounceCheck::Paused(_)
        ));

        // A day later the window is empty again.
        clock.advance(chrono::Duration::hours(25));
        assert!(matches!(
            warmup.check_bounce_rate(1).await.unwrap(),
            BounceCheck::LowVolume(c) if c.total == 0
        ));
    }

    #[tokio::test]
    async fn test_paused_tenant_is_unlimited() {
        let (warmup, store, _) = controller();
        warmup.enroll(1, "conservative").await.unwrap();
        store.set_warmup_status(1, WarmupStatus::Paused).await.unwrap();
        assert_eq!(warmup.ceiling(1).await.unwrap(), 0);
    }
}
