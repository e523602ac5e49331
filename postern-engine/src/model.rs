//! Rows the engine reads and writes.

use chrono::{DateTime, NaiveDate, Utc};
use postern_queue::JobId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

pub type OrgId = i64;
pub type EmailId = i64;
pub type CampaignId = i64;
pub type ContactId = i64;
pub type ListId = i64;
pub type WebhookId = i64;
pub type AlertId = i64;

macro_rules! status_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

status_enum!(
    /// Delivery status of an email row.
    EmailStatus {
        Queued => "queued",
        Sending => "sending",
        Sent => "sent",
        Failed => "failed",
        Cancelled => "cancelled",
        Delivered => "delivered",
        Bounced => "bounced",
        Complained => "complained",
    }
);

impl EmailStatus {
    /// Whether the send pipeline is done with this email.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Queued | Self::Sending)
    }
}

status_enum!(
    /// Kind of a delivery event.
    EventKind {
        Queued => "queued",
        Sending => "sending",
        Retry => "retry",
        Sent => "sent",
        Failed => "failed",
        Delivered => "delivered",
        Bounced => "bounced",
        Complained => "complained",
        Deferred => "deferred",
        Rejected => "rejected",
        Opened => "opened",
        Clicked => "clicked",
    }
);

status_enum!(
    /// Campaign lifecycle status.
    CampaignStatus {
        Draft => "draft",
        Scheduled => "scheduled",
        Sending => "sending",
        Paused => "paused",
        Sent => "sent",
        Cancelled => "cancelled",
    }
);

status_enum!(
    ContactStatus {
        Active => "active",
        Unsubscribed => "unsubscribed",
        Bounced => "bounced",
        Complained => "complained",
    }
);

status_enum!(
    WarmupStatus {
        Active => "active",
        Completed => "completed",
        Paused => "paused",
    }
);

status_enum!(
    /// What put an address on the suppression list.
    SuppressionSource {
        Bounce => "bounce",
        Complaint => "complaint",
        Manual => "manual",
    }
);

status_enum!(
    AlertKind {
        Warmup => "warmup",
        DeadLetter => "dead_letter",
        BounceRate => "bounce_rate",
    }
);

status_enum!(
    Severity {
        Info => "info",
        Warning => "warning",
        Critical => "critical",
    }
);

/// An email as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Email {
    pub id: EmailId,
    pub org_id: OrgId,
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub reply_to: Option<String>,
    pub subject: String,
    pub html_body: Option<String>,
    pub text_body: Option<String>,
    pub message_id: Option<String>,
    pub status: EmailStatus,
    pub provider_message_id: Option<String>,
    pub provider: Option<String>,
    pub idempotency_key: Option<String>,
    pub campaign_id: Option<CampaignId>,
    pub contact_id: Option<ContactId>,
    /// Send job, once queued.
    #[serde(default)]
    pub job_id: Option<JobId>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl Email {
    /// Every envelope recipient: to, cc and bcc.
    pub fn recipients(&self) -> impl Iterator<Item = &str> {
        self.to
            .iter()
            .chain(&self.cc)
            .chain(&self.bcc)
            .map(String::as_str)
    }
}

/// An email about to be inserted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewEmail {
    pub org_id: OrgId,
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub reply_to: Option<String>,
    pub subject: String,
    pub html_body: Option<String>,
    pub text_body: Option<String>,
    pub message_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub campaign_id: Option<CampaignId>,
    pub contact_id: Option<ContactId>,
}

impl NewEmail {
    pub fn new(org_id: OrgId, from: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            org_id,
            from: from.into(),
            subject: subject.into(),
            ..Default::default()
        }
    }

    pub fn to(mut self, address: impl Into<String>) -> Self {
        self.to.push(address.into());
        self
    }

    pub fn cc(mut self, address: impl Into<String>) -> Self {
        self.cc.push(address.into());
        self
    }

    pub fn bcc(mut self, address: impl Into<String>) -> Self {
        self.bcc.push(address.into());
        self
    }

    pub fn reply_to(mut self, address: impl Into<String>) -> Self {
        self.reply_to = Some(address.into());
        self
    }

    pub fn html(mut self, html: impl Into<String>) -> Self {
        self.html_body = Some(html.into());
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text_body = Some(text.into());
        self
    }

    pub fn message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn campaign(mut self, campaign_id: CampaignId, contact_id: ContactId) -> Self {
        self.campaign_id = Some(campaign_id);
        self.contact_id = Some(contact_id);
        self
    }
}

/// Append-only delivery history entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryEvent {
    pub email_id: EmailId,
    pub kind: EventKind,
    pub detail: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub org_id: OrgId,
    pub list_id: ListId,
    pub subject: String,
    pub html_content: Option<String>,
    pub text_content: Option<String>,
    pub from_name: Option<String>,
    pub from_email: String,
    pub reply_to: Option<String>,
    pub status: CampaignStatus,
    pub sent_count: i64,
    pub failed_count: i64,
    /// Last processed contact id.
    pub cursor: ContactId,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Campaign {
    /// A scheduled campaign with no content beyond its subject.
    pub fn new(
        org_id: OrgId,
        list_id: ListId,
        subject: impl Into<String>,
        from_email: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            org_id,
            list_id,
            subject: subject.into(),
            html_content: None,
            text_content: None,
            from_name: None,
            from_email: from_email.into(),
            reply_to: None,
            status: CampaignStatus::Scheduled,
            sent_count: 0,
            failed_count: 0,
            cursor: 0,
            completed_at: None,
        }
    }

    pub fn html(mut self, html: impl Into<String>) -> Self {
        self.html_content = Some(html.into());
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text_content = Some(text.into());
        self
    }

    pub fn from_name(mut self, name: impl Into<String>) -> Self {
        self.from_name = Some(name.into());
        self
    }

    /// `From` header value.
    pub fn sender(&self) -> String {
        match &self.from_name {
            Some(name) if !name.is_empty() => format!("{} <{}>", name, self.from_email),
            _ => self.from_email.clone(),
        }
    }
}

/// Counters flushed from a running campaign. Counts are deltas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CampaignProgress {
    pub sent: i64,
    pub failed: i64,
    pub cursor: ContactId,
}

impl CampaignProgress {
    pub fn is_empty(&self) -> bool {
        self.sent == 0 && self.failed == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub id: ContactId,
    pub org_id: OrgId,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub attributes: serde_json::Map<String, serde_json::Value>,
    pub status: ContactStatus,
}

impl Contact {
    pub fn new(org_id: OrgId, email: impl Into<String>) -> Self {
        Self {
            id: 0,
            org_id,
            email: email.into(),
            first_name: None,
            last_name: None,
            attributes: serde_json::Map::new(),
            status: ContactStatus::Active,
        }
    }

    pub fn name(mut self, first: impl Into<String>, last: impl Into<String>) -> Self {
        self.first_name = Some(first.into());
        self.last_name = Some(last.into());
        self
    }

    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn status(mut self, status: ContactStatus) -> Self {
        self.status = status;
        self
    }
}

/// Per-tenant warmup state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarmupProgress {
    pub org_id: OrgId,
    pub schedule_name: String,
    /// 1-based.
    pub current_day: i32,
    pub status: WarmupStatus,
    pub last_send_on: Option<NaiveDate>,
}

impl WarmupProgress {
    /// Enrollment on day one.
    pub fn new(org_id: OrgId, schedule_name: impl Into<String>) -> Self {
        Self {
            org_id,
            schedule_name: schedule_name.into(),
            current_day: 1,
            status: WarmupStatus::Active,
            last_send_on: None,
        }
    }
}

/// Emails created by a tenant in a window, and how many of them bounced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryCounts {
    pub total: i64,
    pub bounced: i64,
}

impl DeliveryCounts {
    /// Bounced share of the total, in percent.
    pub fn bounce_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.bounced as f64 / self.total as f64 * 100.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suppression {
    pub org_id: OrgId,
    /// Lowercased address.
    pub email: String,
    pub reason: String,
    pub source: SuppressionSource,
    pub created_at: DateTime<Utc>,
}

impl Suppression {
    pub fn new(
        org_id: OrgId,
        email: &str,
        reason: impl Into<String>,
        source: SuppressionSource,
    ) -> Self {
        Self {
            org_id,
            email: email.trim().to_lowercase(),
            reason: reason.into(),
            source,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Webhook {
    pub id: WebhookId,
    pub org_id: OrgId,
    pub url: String,
    pub secret: Option<String>,
    pub events: BTreeSet<String>,
    pub active: bool,
    pub success_count: i64,
    pub failure_count: i64,
    pub last_triggered_at: Option<DateTime<Utc>>,
}

impl Webhook {
    pub fn new<I, S>(org_id: OrgId, url: impl Into<String>, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: 0,
            org_id,
            url: url.into(),
            secret: None,
            events: events.into_iter().map(Into::into).collect(),
            active: true,
            success_count: 0,
            failure_count: 0,
            last_triggered_at: None,
        }
    }

    pub fn secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn subscribes_to(&self, event: &str) -> bool {
        self.events.contains(event) || self.events.contains("*")
    }
}

/// One logged webhook delivery attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookCall {
    pub webhook_id: WebhookId,
    pub event: String,
    pub status: postern_webhooks::AttemptStatus,
    pub response_status: Option<u16>,
    pub duration_ms: u64,
    pub attempt: u32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Operator alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: AlertId,
    pub org_id: Option<OrgId>,
    pub kind: AlertKind,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub data: serde_json::Value,
    pub acknowledged: bool,
    pub created_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(
        org_id: Option<OrgId>,
        kind: AlertKind,
        severity: Severity,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            org_id,
            kind,
            severity,
            title: title.into(),
            message: message.into(),
            data: serde_json::Value::Null,
            acknowledged: false,
            created_at: Utc::now(),
        }
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}
