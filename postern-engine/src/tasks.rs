//! Job types the engine enqueues and handles.

use postern_queue::{Job, JobId, JobOptions, Queue, QueueError, QueueResult, QueueTier};
use postern_webhooks::WebhookPayload;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::model::{CampaignId, EmailId, OrgId, WebhookId};

/// Job type names.
pub mod job_types {
    pub const EMAIL_SEND: &str = "email:send";
    pub const CAMPAIGN_PROCESS: &str = "campaign:process";
    pub const WEBHOOK_DELIVER: &str = "webhook:deliver";
    pub const BOUNCE_PROCESS: &str = "bounce:process";
}

/// A typed job payload.
pub trait Task: Serialize + DeserializeOwned + Send {
    const JOB_TYPE: &'static str;

    /// Queue options used when enqueueing this task.
    fn options() -> JobOptions;

    /// Decode from a dequeued job. Undecodable payloads are not retried.
    fn from_job(job: &Job) -> QueueResult<Self> {
        serde_json::from_value(job.data.clone()).map_err(|e| {
            QueueError::SkipRetry(format!("invalid {} payload: {}", Self::JOB_TYPE, e))
        })
    }
}

/// Enqueue a task with its default options.
pub async fn enqueue<T: Task>(queue: &Queue, task: &T) -> QueueResult<JobId> {
    enqueue_with(queue, task, T::options()).await
}

/// Enqueue a task with explicit options.
pub async fn enqueue_with<T: Task>(
    queue: &Queue,
    task: &T,
    options: JobOptions,
) -> QueueResult<JobId> {
    let data = serde_json::to_value(task).map_err(|e| QueueError::Serialization(e.to_string()))?;
    queue.enqueue(T::JOB_TYPE, data, options).await
}

fn default_max_retries() -> u32 {
    3
}

/// Send one transactional email.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailSendTask {
    pub email_id: EmailId,
    pub org_id: OrgId,
    /// In-process retries for retryable transport errors.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl EmailSendTask {
    pub fn new(email_id: EmailId, org_id: OrgId) -> Self {
        Self {
            email_id,
            org_id,
            max_retries: default_max_retries(),
        }
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

impl Task for EmailSendTask {
    const JOB_TYPE: &'static str = job_types::EMAIL_SEND;

    fn options() -> JobOptions {
        JobOptions::new(QueueTier::Default, 3, Duration::from_secs(5 * 60))
    }
}

/// Run (or resume) a campaign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignTask {
    pub campaign_id: CampaignId,
    pub org_id: OrgId,
}

impl Task for CampaignTask {
    const JOB_TYPE: &'static str = job_types::CAMPAIGN_PROCESS;

    fn options() -> JobOptions {
        JobOptions::new(QueueTier::Default, 1, Duration::from_secs(24 * 60 * 60))
    }
}

/// POST one event to one webhook endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookTask {
    pub webhook_id: WebhookId,
    pub org_id: OrgId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_id: Option<EmailId>,
    /// Envelope fixed at enqueue time so every attempt posts the same body.
    pub payload: WebhookPayload,
}

impl Task for WebhookTask {
    const JOB_TYPE: &'static str = job_types::WEBHOOK_DELIVER;

    fn options() -> JobOptions {
        JobOptions::new(QueueTier::Default, 5, Duration::from_secs(30))
    }
}

/// Bounce classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BounceType {
    Hard,
    Soft,
}

/// Apply a bounce reported for one email.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BounceTask {
    pub email_id: EmailId,
    pub org_id: OrgId,
    pub bounce_type: BounceType,
    #[serde(default)]
    pub bounce_reason: String,
    pub recipient: String,
}

impl Task for BounceTask {
    const JOB_TYPE: &'static str = job_types::BOUNCE_PROCESS;

    fn options() -> JobOptions {
        JobOptions::new(QueueTier::Critical, 3, Duration::from_secs(60))
    }
}
