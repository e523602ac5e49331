//! Outgoing webhook fan-out and delivery jobs.

use postern_queue::{Job, Queue, QueueError, QueueResult};
use postern_webhooks::{AttemptStatus, WebhookAttempt, WebhookClient, WebhookPayload};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::Result;
use crate::model::{EmailId, OrgId, WebhookCall};
use crate::store::DeliveryStore;
use crate::tasks::{self, Task, WebhookTask};

/// Event names sent to subscribers.
pub mod events {
    pub const EMAIL_SENT: &str = "email.sent";
    pub const EMAIL_DELIVERED: &str = "email.delivered";
    pub const EMAIL_BOUNCED: &str = "email.bounced";
    pub const EMAIL_COMPLAINED: &str = "email.complained";
}

/// Enqueue one delivery job per active webhook of `org_id` subscribed to `event`.
/// Returns how many were enqueued.
pub async fn dispatch(
    store: &dyn DeliveryStore,
    queue: &Queue,
    org_id: OrgId,
    event: &str,
    email_id: Option<EmailId>,
    data: serde_json::Value,
) -> Result<usize> {
    let hooks = store.webhooks_for_event(org_id, event).await?;
    if hooks.is_empty() {
        return Ok(0);
    }

    let payload = WebhookPayload::new(event, data);
    for hook in &hooks {
        let task = WebhookTask {
            webhook_id: hook.id,
            org_id,
            email_id,
            payload: payload.clone(),
        };
        tasks::enqueue(queue, &task).await?;
    }

    debug!(org_id, event, count = hooks.len(), "Webhook deliveries enqueued");
    Ok(hooks.len())
}

/// Handles `webhook:deliver` jobs.
///
/// Every attempt updates the webhook's counters and logs a [`WebhookCall`]. A
/// failed attempt is handed back to the queue for retry until the job's budget is
/// spent; the final attempt always completes the job.
pub struct WebhookWorker {
    store: Arc<dyn DeliveryStore>,
    client: WebhookClient,
    clock: Arc<dyn Clock>,
}

impl WebhookWorker {
    pub fn new(store: Arc<dyn DeliveryStore>, client: WebhookClient, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            client,
            clock,
        }
    }

    pub async fn handle(&self, job: Job) -> QueueResult<()> {
        let task = WebhookTask::from_job(&job)?;

        let Some(hook) = self.store.get_webhook(task.webhook_id).await? else {
            debug!(webhook_id = task.webhook_id, "Webhook deleted, dropping delivery");
            return Ok(());
        };
        if !hook.active {
            debug!(webhook_id = hook.id, "Webhook disabled, dropping delivery");
            return Ok(());
        }

        let attempt = match self
            .client
            .deliver(&hook.url, hook.secret.as_deref(), &task.payload)
            .await
        {
            Ok(attempt) => attempt,
            // The request itself is unusable; retrying cannot help.
            Err(e) => {
                warn!(webhook_id = hook.id, error = %e, "Webhook request rejected");
                let attempt = WebhookAttempt {
                    status: AttemptStatus::Error,
                    status_code: None,
                    response_body: None,
                    error: Some(e.to_string()),
                    duration_ms: 0,
                };
                self.record(&task, &attempt, job.attempts).await?;
                return Ok(());
            }
        };

        self.record(&task, &attempt, job.attempts).await?;

        if attempt.is_success() {
            info!(
                webhook_id = hook.id,
                event = %task.payload.event,
                duration_ms = attempt.duration_ms,
                "Webhook delivered"
            );
            return Ok(());
        }

        let error = attempt
            .error
            .unwrap_or_else(|| "webhook delivery failed".to_string());
        if job.can_retry() {
            return Err(QueueError::ExecutionFailed(error));
        }

        warn!(
            webhook_id = hook.id,
            event = %task.payload.event,
            attempts = job.attempts,
            error = %error,
            "Giving up on webhook delivery"
        );
        Ok(())
    }

    async fn record(&self, task: &WebhookTask, attempt: &WebhookAttempt, number: u32) -> Result<()> {
        let now = self.clock.now();
        self.store
            .record_webhook_result(task.webhook_id, attempt.is_success(), now)
            .await?;
        self.store
            .log_webhook_call(WebhookCall {
                webhook_id: task.webhook_id,
                event: task.payload.event.clone(),
                status: attempt.status.clone(),
                response_status: attempt.status_code,
                duration_ms: attempt.duration_ms,
                attempt: number,
                error: attempt.error.clone(),
                created_at: now,
            })
            .await
    }
}
