//! Persistence boundary.
//!
//! The engine only talks to its relational store through [`DeliveryStore`]. The
//! trait covers exactly the queries the workers issue; [`MemoryStore`] implements it
//! for tests and single-process deployments.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use postern_queue::JobId;

use crate::error::Result;
use crate::model::*;

/// Queries issued by the delivery engine.
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    // Emails

    /// Insert an email with status `queued`.
    async fn create_email(&self, email: NewEmail) -> Result<Email>;

    async fn get_email(&self, id: EmailId) -> Result<Option<Email>>;

    async fn set_email_status(&self, id: EmailId, status: EmailStatus) -> Result<()>;

    /// Record a successful hand-off: status `sent`, provider id and send time.
    async fn mark_email_sent(
        &self,
        id: EmailId,
        provider_message_id: &str,
        provider: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<()>;

    async fn find_email_by_provider_id(&self, provider_message_id: &str) -> Result<Option<Email>>;

    /// Most recent email of `org_id` carrying `key`, created at or after `since`.
    async fn find_email_by_idempotency_key(
        &self,
        org_id: OrgId,
        key: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Email>>;

    /// Remember the job that sends an email.
    async fn set_email_job(&self, id: EmailId, job_id: JobId) -> Result<()>;

    /// Number of emails created for `org_id` on `day`.
    async fn daily_email_count(&self, org_id: OrgId, day: NaiveDate) -> Result<i64>;

    /// Emails created for `org_id` at or after `since`, with the bounced ones counted.
    async fn delivery_counts(&self, org_id: OrgId, since: DateTime<Utc>) -> Result<DeliveryCounts>;

    // Delivery events

    async fn append_event(&self, email_id: EmailId, kind: EventKind, detail: Option<&str>)
    -> Result<()>;

    /// Events of one email, oldest first.
    async fn events(&self, email_id: EmailId) -> Result<Vec<DeliveryEvent>>;

    // Campaigns

    async fn get_campaign(&self, id: CampaignId) -> Result<Option<Campaign>>;

    /// Ids of the tenant's campaigns currently in `status`.
    async fn campaigns_with_status(&self, org_id: OrgId, status: CampaignStatus)
    -> Result<Vec<CampaignId>>;

    /// Unconditional status write. `sent` also stamps `completed_at`.
    async fn set_campaign_status(&self, id: CampaignId, status: CampaignStatus) -> Result<()>;

    /// Move to `to` only if the current status is one of `from`. Returns whether the
    /// row changed.
    async fn transition_campaign(
        &self,
        id: CampaignId,
        from: &[CampaignStatus],
        to: CampaignStatus,
    ) -> Result<bool>;

    /// Add counter deltas and advance the cursor.
    async fn flush_campaign_progress(&self, id: CampaignId, progress: CampaignProgress)
    -> Result<()>;

    /// Next page of the send set: active members of the campaign's list that are
    /// not suppressed, id-ascending, with id greater than `after`.
    async fn campaign_contacts(
        &self,
        campaign: &Campaign,
        after: ContactId,
        limit: usize,
    ) -> Result<Vec<Contact>>;

    // Contacts

    /// Set the status of every contact of `org_id` with this address.
    async fn set_contact_status(&self, org_id: OrgId, email: &str, status: ContactStatus)
    -> Result<()>;

    // Suppression

    /// Insert unless `(org_id, email)` is already suppressed. Returns whether a row
    /// was written.
    async fn suppress(&self, entry: Suppression) -> Result<bool>;

    async fn is_suppressed(&self, org_id: OrgId, email: &str) -> Result<bool>;

    async fn suppressions(&self, org_id: OrgId) -> Result<Vec<Suppression>>;

    // Warmup

    async fn get_warmup(&self, org_id: OrgId) -> Result<Option<WarmupProgress>>;

    /// Enroll or replace a tenant's warmup row.
    async fn upsert_warmup(&self, progress: WarmupProgress) -> Result<()>;

    /// Record a send decision on `today`. In one atomic step: if the tenant is
    /// active and its last send day is before `today`, advance `current_day` by one;
    /// then set the last send day to `today`.
    async fn touch_warmup(&self, org_id: OrgId, today: NaiveDate) -> Result<Option<WarmupProgress>>;

    async fn set_warmup_status(&self, org_id: OrgId, status: WarmupStatus) -> Result<()>;

    // Webhooks

    async fn get_webhook(&self, id: WebhookId) -> Result<Option<Webhook>>;

    /// Active webhooks of `org_id` subscribed to `event`.
    async fn webhooks_for_event(&self, org_id: OrgId, event: &str) -> Result<Vec<Webhook>>;

    /// Bump the success or failure counter and `last_triggered_at`.
    async fn record_webhook_result(
        &self,
        id: WebhookId,
        success: bool,
        at: DateTime<Utc>,
    ) -> Result<()>;

    async fn log_webhook_call(&self, call: WebhookCall) -> Result<()>;

    async fn webhook_calls(&self, id: WebhookId) -> Result<Vec<WebhookCall>>;

    // Alerts

    async fn insert_alert(&self, alert: Alert) -> Result<Alert>;

    /// Alerts, newest first. `None` lists every tenant.
    async fn alerts(&self, org_id: Option<OrgId>) -> Result<Vec<Alert>>;
}
