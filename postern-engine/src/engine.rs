//! Wiring: one [`Engine`] owns the store, queue, transport and every worker.

use chrono::{DateTime, Duration, Utc};
use postern_queue::{JobId, Queue, Worker};
use postern_transport::{Transport, build_transport};
use postern_webhooks::WebhookClient;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::alerts::DeadLetterAlerts;
use crate::bounce::BounceWorker;
use crate::campaign::CampaignRunner;
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::inbound::{InboundHandler, InboundSink};
use crate::model::{CampaignStatus, Email, EventKind, NewEmail, OrgId};
use crate::store::{DeliveryStore, MemoryStore};
use crate::tasks::{self, BounceTask, EmailSendTask, Task, job_types};
use crate::transactional::TransactionalWorker;
use crate::warmup::{BounceCheck, WarmupController};
use crate::webhook_worker::WebhookWorker;

/// How long an idempotency key deduplicates sends.
pub const IDEMPOTENCY_WINDOW_HOURS: i64 = 24;

/// The delivery engine.
///
/// Cloning is cheap; every clone shares the same workers.
#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn DeliveryStore>,
    queue: Queue,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    warmup: Arc<WarmupController>,
    campaigns: Arc<CampaignRunner>,
    transactional: Arc<TransactionalWorker>,
    webhooks: Arc<WebhookWorker>,
    bounces: Arc<BounceWorker>,
    inbound: Arc<InboundHandler>,
    config: EngineConfig,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// Connect the queue and transport named in `config` and build over `store`.
    pub async fn connect(config: EngineConfig, store: Arc<dyn DeliveryStore>) -> Result<Self> {
        let queue = Queue::connect(config.queue.clone()).await?;
        let transport = build_transport(&config.transport).await?;
        Self::builder()
            .store(store)
            .queue(queue)
            .transport(transport)
            .config(config)
            .build()
    }

    pub fn store(&self) -> &Arc<dyn DeliveryStore> {
        &self.store
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn warmup(&self) -> &WarmupController {
        &self.warmup
    }

    pub fn campaigns(&self) -> &CampaignRunner {
        &self.campaigns
    }

    pub fn transactional(&self) -> &TransactionalWorker {
        &self.transactional
    }

    pub fn inbound(&self) -> &InboundHandler {
        &self.inbound
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Store a transactional email and queue it for sending.
    ///
    /// A repeated idempotency key within [`IDEMPOTENCY_WINDOW_HOURS`] returns the
    /// email and job of the first request instead of sending again.
    pub async fn send_email(&self, email: NewEmail) -> Result<(Email, JobId)> {
        self.queue_email(email, None).await
    }

    /// Like [`send_email`](Self::send_email), but the first attempt waits until `at`.
    pub async fn send_email_at(&self, email: NewEmail, at: DateTime<Utc>) -> Result<(Email, JobId)> {
        self.queue_email(email, Some(at)).await
    }

    async fn queue_email(&self, email: NewEmail, at: Option<DateTime<Utc>>) -> Result<(Email, JobId)> {
        if let Some(key) = email.idempotency_key.as_deref() {
            let since = self.clock.now() - Duration::hours(IDEMPOTENCY_WINDOW_HOURS);
            if let Some(existing) = self
                .store
                .find_email_by_idempotency_key(email.org_id, key, since)
                .await?
            {
                if let Some(job_id) = existing.job_id {
                    debug!(email_id = existing.id, idempotency_key = key, "Duplicate send request");
                    return Ok((existing, job_id));
                }
                // Stored but never queued: finish the first request.
                return self.enqueue_send(existing, at).await;
            }
        }

        let email = self.store.create_email(email).await?;
        self.store
            .append_event(email.id, EventKind::Queued, None)
            .await?;
        self.enqueue_send(email, at).await
    }

    async fn enqueue_send(&self, mut email: Email, at: Option<DateTime<Utc>>) -> Result<(Email, JobId)> {
        let task = EmailSendTask::new(email.id, email.org_id).max_retries(self.config.send.max_retries);
        let mut options = EmailSendTask::options();
        if let Some(at) = at {
            options = options.run_at(at);
        }
        let job_id = tasks::enqueue_with(&self.queue, &task, options).await?;
        self.store.set_email_job(email.id, job_id).await?;
        email.job_id = Some(job_id);
        info!(
            email_id = email.id,
            org_id = email.org_id,
            job_id = %job_id,
            run_at = ?at,
            "Email queued"
        );
        Ok((email, job_id))
    }

    /// Queue a run of a scheduled campaign.
    pub async fn start_campaign(&self, campaign_id: i64) -> Result<JobId> {
        self.campaigns.start(campaign_id).await
    }

    /// Queue a run of a draft or scheduled campaign that begins at `at`.
    pub async fn schedule_campaign(&self, campaign_id: i64, at: DateTime<Utc>) -> Result<JobId> {
        self.campaigns.schedule(campaign_id, at).await
    }

    /// Check a tenant's recent bounce rate. Above the pause threshold its sending
    /// campaigns are paused along with its warmup.
    pub async fn check_bounce_rate(&self, org_id: OrgId) -> Result<BounceCheck> {
        let check = self.warmup.check_bounce_rate(org_id).await?;
        if let BounceCheck::Paused(_) = check {
            for id in self
                .store
                .campaigns_with_status(org_id, CampaignStatus::Sending)
                .await?
            {
                // Lost a race with the runner finishing or an operator.
                if let Err(e) = self.campaigns.pause(id).await {
                    warn!(campaign_id = id, error = %e, "Could not pause campaign for bounce rate");
                }
            }
        }
        Ok(check)
    }

    /// Queue a reported bounce for processing on the critical tier.
    pub async fn report_bounce(&self, bounce: BounceTask) -> Result<JobId> {
        Ok(tasks::enqueue(&self.queue, &bounce).await?)
    }

    /// Bind a handler for every job type the engine produces.
    pub fn register_handlers(&self, worker: &mut Worker) {
        let transactional = Arc::clone(&self.transactional);
        worker.register_handler(job_types::EMAIL_SEND, move |job| {
            let transactional = Arc::clone(&transactional);
            async move { transactional.handle(job).await }
        });

        let campaigns = Arc::clone(&self.campaigns);
        worker.register_handler(job_types::CAMPAIGN_PROCESS, move |job| {
            let campaigns = Arc::clone(&campaigns);
            async move { campaigns.handle(job).await }
        });

        let webhooks = Arc::clone(&self.webhooks);
        worker.register_handler(job_types::WEBHOOK_DELIVER, move |job| {
            let webhooks = Arc::clone(&webhooks);
            async move { webhooks.handle(job).await }
        });

        let bounces = Arc::clone(&self.bounces);
        worker.register_handler(job_types::BOUNCE_PROCESS, move |job| {
            let bounces = Arc::clone(&bounces);
            async move { bounces.handle(job).await }
        });
    }

    /// A worker pool over the engine's queue with every handler registered.
    pub fn worker(&self) -> Worker {
        let mut worker = Worker::with_config(self.queue.clone(), self.config.worker.clone());
        self.register_handlers(&mut worker);
        worker
    }
}

/// Builder for [`Engine`].
#[derive(Default)]
pub struct EngineBuilder {
    store: Option<Arc<dyn DeliveryStore>>,
    queue: Option<Queue>,
    transport: Option<Arc<dyn Transport>>,
    webhook_client: Option<WebhookClient>,
    clock: Option<Arc<dyn Clock>>,
    inbound_sink: Option<Arc<dyn InboundSink>>,
    config: EngineConfig,
}

impl EngineBuilder {
    /// Persistence. Defaults to a [`MemoryStore`] on the engine clock.
    pub fn store(mut self, store: Arc<dyn DeliveryStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Job queue. Defaults to [`Queue::memory`].
    pub fn queue(mut self, queue: Queue) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Mail transport. Required.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Outbound webhook client. Defaults to one built from `config.webhooks`.
    pub fn webhook_client(mut self, client: WebhookClient) -> Self {
        self.webhook_client = Some(client);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn inbound_sink(mut self, sink: Arc<dyn InboundSink>) -> Self {
        self.inbound_sink = Some(sink);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<Engine> {
        let config = self.config;
        let transport = self
            .transport
            .ok_or_else(|| EngineError::Config("a mail transport is required".into()))?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::with_clock(Arc::clone(&clock))));
        let queue = self
            .queue
            .unwrap_or_else(Queue::memory)
            .with_dead_letter_sink(Arc::new(DeadLetterAlerts::new(Arc::clone(&store))));
        let webhook_client = match self.webhook_client {
            Some(client) => client,
            None => WebhookClient::new(config.webhooks.clone())?,
        };

        let warmup = Arc::new(WarmupController::new(Arc::clone(&store), Arc::clone(&clock)));
        let campaigns = Arc::new(CampaignRunner::new(
            Arc::clone(&store),
            queue.clone(),
            Arc::clone(&transport),
            Arc::clone(&warmup),
            Arc::clone(&clock),
            config.campaign.clone(),
        ));
        let transactional = Arc::new(TransactionalWorker::new(
            Arc::clone(&store),
            queue.clone(),
            Arc::clone(&transport),
            Arc::clone(&clock),
            config.send.clone(),
        ));
        let webhooks = Arc::new(WebhookWorker::new(
            Arc::clone(&store),
            webhook_client,
            Arc::clone(&clock),
        ));
        let bounces = Arc::new(BounceWorker::new(Arc::clone(&store), queue.clone()));

        let mut inbound = InboundHandler::new(Arc::clone(&store), queue.clone(), config.inbound.clone())?;
        if let Some(sink) = self.inbound_sink {
            inbound = inbound.with_sink(sink);
        }

        info!(transport = transport.name(), "Delivery engine ready");
        Ok(Engine {
            store,
            queue,
            transport,
            clock,
            warmup,
            campaigns,
            transactional,
            webhooks,
            bounces,
            inbound: Arc::new(inbound),
            config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use postern_transport::MockTransport;

    #[test]
    fn test_transport_required() {
        assert!(matches!(
            Engine::builder().build(),
            Err(EngineError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_worker_handles_every_job_type() {
        let engine = Engine::builder()
            .transport(Arc::new(MockTransport::new()))
            .build()
            .unwrap();
        let worker = engine.worker();
        assert_eq!(
            worker.job_types(),
            vec!["bounce:process", "campaign:process", "email:send", "webhook:deliver"]
        );
    }

    #[tokio::test]
    async fn test_send_email_queues_job() {
        let transport = Arc::new(MockTransport::new());
        let engine = Engine::builder()
            .transport(transport.clone())
            .build()
            .unwrap();

        let (email, _) = engine
            .send_email(NewEmail::new(1, "app@acme.test", "Welcome").to("ada@example.com"))
            .await
            .unwrap();
        assert_eq!(engine.queue().stats().await.unwrap().default, 1);

        engine.worker().drain().await.unwrap();
        assert!(transport.was_sent_to("ada@example.com"));
        let email = engine.store().get_email(email.id).await.unwrap().unwrap();
        assert_eq!(email.status, crate::model::EmailStatus::Sent);
    }
}
