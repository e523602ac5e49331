//! Transactional send worker (`email:send`).

use postern_queue::{Job, Queue, QueueResult};
use postern_transport::{ErrorClass, OutboundMessage, Transport};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::SendConfig;
use crate::error::{EngineError, Result};
use crate::model::{Email, EmailStatus, EventKind, SuppressionSource};
use crate::store::DeliveryStore;
use crate::suppression::{self, REASON_PERMANENT_FAILURE};
use crate::tasks::{EmailSendTask, Task};
use crate::text::html_to_text;
use crate::webhook_worker::{self, events};

/// What happened to one email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to the transport.
    Sent { provider_message_id: String },
    /// Nothing to do: the email was cancelled or already finished.
    Skipped(EmailStatus),
    /// Refused before sending; lists the suppressed recipients.
    Suppressed(Vec<String>),
    /// Transport gave up.
    Failed { class: ErrorClass, error: String },
}

/// Sends one stored email per job, retrying transient transport errors in process.
///
/// Transport failures end in a terminal `failed` state and complete the job. Store
/// errors are returned to the queue, which retries the whole job.
pub struct TransactionalWorker {
    store: Arc<dyn DeliveryStore>,
    queue: Queue,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    config: SendConfig,
}

impl TransactionalWorker {
    pub fn new(
        store: Arc<dyn DeliveryStore>,
        queue: Queue,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        config: SendConfig,
    ) -> Self {
        Self {
            store,
            queue,
            transport,
            clock,
            config,
        }
    }

    pub async fn handle(&self, job: Job) -> QueueResult<()> {
        let task = EmailSendTask::from_job(&job)?;
        self.send(&task).await?;
        Ok(())
    }

    /// Run the send pipeline for one email.
    pub async fn send(&self, task: &EmailSendTask) -> Result<SendOutcome> {
        let email = self
            .store
            .get_email(task.email_id)
            .await?
            .filter(|email| email.org_id == task.org_id)
            .ok_or_else(|| EngineError::not_found("email", task.email_id))?;

        if email.status.is_terminal() {
            debug!(email_id = email.id, status = %email.status, "Email already settled, skipping");
            return Ok(SendOutcome::Skipped(email.status));
        }

        self.store
            .set_email_status(email.id, EmailStatus::Sending)
            .await?;
        self.store
            .append_event(email.id, EventKind::Sending, None)
            .await?;

        let blocked =
            suppression::suppressed_recipients(self.store.as_ref(), email.org_id, email.recipients())
                .await?;
        if !blocked.is_empty() {
            warn!(email_id = email.id, recipients = ?blocked, "Send refused: recipient suppressed");
            self.store
                .set_email_status(email.id, EmailStatus::Failed)
                .await?;
            self.store
                .append_event(email.id, EventKind::Failed, Some("recipient suppressed"))
                .await?;
            return Ok(SendOutcome::Suppressed(blocked));
        }

        let message = build_message(&email);
        let mut attempt = 0;
        let failure = loop {
            match self.transport.send_email(&message).await {
                Ok(result) => return self.complete(&email, &result.message_id, &result.provider).await,
                Err(e) => {
                    let class = e.class();
                    if class != ErrorClass::Retryable || attempt >= task.max_retries {
                        break (class, e.to_string());
                    }

                    attempt += 1;
                    let delay = self.config.retry_delay(attempt);
                    warn!(
                        email_id = email.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient send failure, retrying"
                    );
                    self.store
                        .append_event(
                            email.id,
                            EventKind::Retry,
                            Some(&format!("Retry attempt {} after backoff: {}", attempt, e)),
                        )
                        .await?;
                    tokio::time::sleep(delay).await;

                    if let Some(current) = self.store.get_email(email.id).await?
                        && current.status == EmailStatus::Cancelled
                    {
                        info!(email_id = email.id, "Email cancelled during retry backoff");
                        return Ok(SendOutcome::Skipped(EmailStatus::Cancelled));
                    }
                }
            }
        };

        self.fail(&email, failure.0, failure.1).await
    }

    async fn complete(&self, email: &Email, provider_id: &str, provider: &str) -> Result<SendOutcome> {
        let now = self.clock.now();
        self.store
            .mark_email_sent(email.id, provider_id, provider, now)
            .await?;
        self.store
            .append_event(email.id, EventKind::Sent, Some(provider_id))
            .await?;
        info!(email_id = email.id, provider, provider_message_id = %provider_id, "Email sent");

        let data = json!({
            "emailId": email.id,
            "messageId": provider_id,
            "to": email.to,
            "subject": email.subject,
            "sentAt": now.to_rfc3339(),
        });
        // Subscribers never hold up or fail the send itself.
        if let Err(e) = webhook_worker::dispatch(
            self.store.as_ref(),
            &self.queue,
            email.org_id,
            events::EMAIL_SENT,
            Some(email.id),
            data,
        )
        .await
        {
            warn!(email_id = email.id, error = %e, "Failed to enqueue email.sent webhooks");
        }

        Ok(SendOutcome::Sent {
            provider_message_id: provider_id.to_string(),
        })
    }

    async fn fail(&self, email: &Email, class: ErrorClass, error: String) -> Result<SendOutcome> {
        error!(email_id = email.id, class = ?class, error = %error, "Email send failed");
        self.store
            .set_email_status(email.id, EmailStatus::Failed)
            .await?;
        self.store
            .append_event(email.id, EventKind::Failed, Some(&error))
            .await?;

        // Only the primary recipients are known to have been refused.
        if class == ErrorClass::Permanent {
            suppression::suppress_all(
                self.store.as_ref(),
                email.org_id,
                email.to.iter().map(String::as_str),
                REASON_PERMANENT_FAILURE,
                SuppressionSource::Bounce,
            )
            .await?;
        }

        Ok(SendOutcome::Failed { class, error })
    }
}

/// Outbound message for a stored email, deriving a text part from HTML-only bodies.
pub(crate) fn build_message(email: &Email) -> OutboundMessage {
    let mut message = OutboundMessage::new(&email.from, &email.subject);
    message.to = email.to.clone();
    message.cc = email.cc.clone();
    message.bcc = email.bcc.clone();
    message.reply_to = email.reply_to.clone();
    message.html_body = email.html_body.clone();
    message.text_body = match (&email.text_body, &email.html_body) {
        (Some(text), _) => Some(text.clone()),
        (None, Some(html)) => Some(html_to_text(html)),
        (None, None) => None,
    };
    message.message_id = email.message_id.clone();
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_build_message_derives_text() {
        let email = Email {
            id: 1,
            org_id: 1,
            from: "app@acme.test".into(),
            to: vec!["ada@example.com".into()],
            cc: vec![],
            bcc: vec!["audit@acme.test".into()],
            reply_to: None,
            subject: "Receipt".into(),
            html_body: Some("<p>Thanks</p><p>Total: 5&nbsp;EUR</p>".into()),
            text_body: None,
            message_id: Some("<abc@acme.test>".into()),
            status: EmailStatus::Queued,
            provider_message_id: None,
            provider: None,
            idempotency_key: None,
            campaign_id: None,
            contact_id: None,
            job_id: None,
            created_at: Utc::now(),
            sent_at: None,
        };

        let message = build_message(&email);
        assert_eq!(message.text_body.as_deref(), Some("Thanks\nTotal: 5 EUR"));
        assert_eq!(message.bcc, vec!["audit@acme.test"]);
        assert_eq!(message.message_id.as_deref(), Some("<abc@acme.test>"));
    }
}
