//! Bounce worker (`bounce:process`).

use postern_queue::{Job, Queue, QueueResult};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{EngineError, Result};
use crate::model::{ContactStatus, EmailStatus, EventKind, SuppressionSource};
use crate::store::DeliveryStore;
use crate::suppression::{self, REASON_HARD_BOUNCE};
use crate::tasks::{BounceTask, BounceType, Task};
use crate::webhook_worker::{self, events};

/// Applies a reported bounce to the email, the suppression list and the contact.
pub struct BounceWorker {
    store: Arc<dyn DeliveryStore>,
    queue: Queue,
}

impl BounceWorker {
    pub fn new(store: Arc<dyn DeliveryStore>, queue: Queue) -> Self {
        Self { store, queue }
    }

    pub async fn handle(&self, job: Job) -> QueueResult<()> {
        let task = BounceTask::from_job(&job)?;
        self.process(&task).await?;
        Ok(())
    }

    pub async fn process(&self, task: &BounceTask) -> Result<()> {
        let email = self
            .store
            .get_email(task.email_id)
            .await?
            .filter(|email| email.org_id == task.org_id)
            .ok_or_else(|| EngineError::not_found("email", task.email_id))?;

        self.store
            .set_email_status(email.id, EmailStatus::Bounced)
            .await?;
        let detail = format!("{:?} bounce: {}", task.bounce_type, task.bounce_reason);
        self.store
            .append_event(email.id, EventKind::Bounced, Some(&detail))
            .await?;

        if task.bounce_type == BounceType::Hard {
            suppression::suppress_all(
                self.store.as_ref(),
                task.org_id,
                [task.recipient.as_str()],
                REASON_HARD_BOUNCE,
                SuppressionSource::Bounce,
            )
            .await?;
            self.store
                .set_contact_status(task.org_id, &task.recipient, ContactStatus::Bounced)
                .await?;
        }

        info!(
            email_id = email.id,
            recipient = %task.recipient,
            bounce_type = ?task.bounce_type,
            "Bounce processed"
        );

        let data = json!({
            "emailId": email.id,
            "recipient": task.recipient,
            "bounceType": task.bounce_type,
            "reason": task.bounce_reason,
        });
        if let Err(e) = webhook_worker::dispatch(
            self.store.as_ref(),
            &self.queue,
            task.org_id,
            events::EMAIL_BOUNCED,
            Some(email.id),
            data,
        )
        .await
        {
            warn!(email_id = email.id, error = %e, "Failed to enqueue email.bounced webhooks");
        }
        Ok(())
    }
}
