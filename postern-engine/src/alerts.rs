//! Operator alerts.

use async_trait::async_trait;
use postern_queue::{DeadLetterSink, Job};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, warn};

use crate::error::Result;
use crate::model::{Alert, AlertKind, DeliveryCounts, OrgId, Severity};
use crate::store::DeliveryStore;

pub const WARMUP_LIMIT_TITLE: &str = "Warmup Daily Limit Reached";
pub const WARMUP_LIMIT_MESSAGE: &str = "Your campaign has been paused because the daily warmup \
limit has been reached. It will resume tomorrow.";

/// Record that a campaign was paused at the tenant's warmup ceiling.
pub async fn warmup_limit_reached(
    store: &dyn DeliveryStore,
    org_id: OrgId,
    daily_limit: u32,
) -> Result<Alert> {
    let alert = Alert::new(
        Some(org_id),
        AlertKind::Warmup,
        Severity::Info,
        WARMUP_LIMIT_TITLE,
        WARMUP_LIMIT_MESSAGE,
    )
    .data(json!({ "dailyLimit": daily_limit }));
    store.insert_alert(alert).await
}

/// Record a tenant's bounce rate crossing the alert threshold.
pub async fn bounce_rate_exceeded(
    store: &dyn DeliveryStore,
    org_id: OrgId,
    counts: DeliveryCounts,
    severity: Severity,
) -> Result<Alert> {
    let rate = counts.bounce_rate();
    let alert = Alert::new(
        Some(org_id),
        AlertKind::BounceRate,
        severity,
        "High Bounce Rate Detected",
        format!(
            "Your bounce rate is {:.2}% ({} bounces out of {} sent). This may affect deliverability.",
            rate, counts.bounced, counts.total
        ),
    )
    .data(json!({
        "bounceRate": rate,
        "totalSent": counts.total,
        "bounced": counts.bounced,
    }));
    store.insert_alert(alert).await
}

/// [`DeadLetterSink`] that files an alert for every dead job.
pub struct DeadLetterAlerts {
    store: Arc<dyn DeliveryStore>,
}

impl DeadLetterAlerts {
    pub fn new(store: Arc<dyn DeliveryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl DeadLetterSink for DeadLetterAlerts {
    async fn on_dead_letter(&self, job: &Job) {
        let org_id = job.data.get("orgId").and_then(|v| v.as_i64());
        let reason = job.status.error.clone().unwrap_or_default();
        warn!(job_id = %job.id, job_type = %job.job_type, attempts = job.attempts, "Job dead-lettered");

        let alert = Alert::new(
            org_id,
            AlertKind::DeadLetter,
            Severity::Warning,
            "Background Job Failed",
            format!(
                "Job {} ({}) failed after {} attempt(s): {}",
                job.id, job.job_type, job.attempts, reason
            ),
        )
        .data(json!({
            "jobId": job.id.to_string(),
            "jobType": job.job_type,
            "attempts": job.attempts,
            "error": reason,
        }));

        if let Err(e) = self.store.insert_alert(alert).await {
            error!(job_id = %job.id, error = %e, "Failed to record dead-letter alert");
        }
    }
}
