//! Campaign runner.

use chrono::{DateTime, Utc};
use postern_queue::{Job, JobId, Queue, QueueResult};
use postern_transport::Transport;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::personalize::personalize;
use super::registry::{RunGuard, RunnerRegistry};
use crate::alerts;
use crate::clock::Clock;
use crate::config::CampaignConfig;
use crate::error::{EngineError, Result};
use crate::model::*;
use crate::store::DeliveryStore;
use crate::tasks::{self, CampaignTask, Task};
use crate::transactional::build_message;
use crate::warmup::WarmupController;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Another runner holds the campaign.
    AlreadyRunning,
    /// Campaign was not in a sendable status.
    Skipped(CampaignStatus),
    /// Every contact processed; campaign is `sent`.
    Completed { sent: i64, failed: i64 },
    /// Paused or cancelled by an operator.
    Stopped { sent: i64, failed: i64 },
    /// Paused at the tenant's warmup ceiling.
    WarmupLimited { limit: u32, sent: i64, failed: i64 },
}

/// Counters of one run plus the part not yet written to the store.
#[derive(Debug, Default)]
struct Tally {
    sent: i64,
    failed: i64,
    pending: CampaignProgress,
    since_flush: usize,
}

impl Tally {
    fn record(&mut self, contact: ContactId, delivered: bool) {
        if delivered {
            self.sent += 1;
            self.pending.sent += 1;
        } else {
            self.failed += 1;
            self.pending.failed += 1;
        }
        self.skip(contact);
    }

    fn skip(&mut self, contact: ContactId) {
        self.pending.cursor = contact;
        self.since_flush += 1;
    }

    fn processed(&self) -> i64 {
        self.sent + self.failed
    }
}

/// Sends a campaign to its list, rate limited, resumable and cancellable.
///
/// Progress (`sent_count`, `failed_count` and the contact cursor) is flushed every
/// [`CampaignConfig::flush_every`] contacts and when the run ends. A crashed run is
/// resumed from the flushed cursor, so contacts processed after the last flush may
/// receive the campaign twice.
pub struct CampaignRunner {
    store: Arc<dyn DeliveryStore>,
    queue: Queue,
    transport: Arc<dyn Transport>,
    warmup: Arc<WarmupController>,
    registry: Arc<RunnerRegistry>,
    clock: Arc<dyn Clock>,
    config: CampaignConfig,
}

impl CampaignRunner {
    pub fn new(
        store: Arc<dyn DeliveryStore>,
        queue: Queue,
        transport: Arc<dyn Transport>,
        warmup: Arc<WarmupController>,
        clock: Arc<dyn Clock>,
        config: CampaignConfig,
    ) -> Self {
        Self {
            store,
            queue,
            transport,
            warmup,
            registry: RunnerRegistry::new(),
            clock,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<RunnerRegistry> {
        &self.registry
    }

    /// Whether a runner for `id` is live in this process.
    pub fn is_active(&self, id: CampaignId) -> bool {
        self.registry.is_active(id)
    }

    /// Enqueue a run of a scheduled campaign.
    pub async fn start(&self, id: CampaignId) -> Result<JobId> {
        let campaign = self.campaign(id).await?;
        if !matches!(campaign.status, CampaignStatus::Scheduled | CampaignStatus::Sending) {
            return Err(EngineError::InvalidState(format!(
                "campaign {} is {}",
                id, campaign.status
            )));
        }
        Ok(self.enqueue(&campaign).await?)
    }

    /// Enqueue a run that starts at `at`. A draft becomes `scheduled`.
    pub async fn schedule(&self, id: CampaignId, at: DateTime<Utc>) -> Result<JobId> {
        let campaign = self.campaign(id).await?;
        match campaign.status {
            CampaignStatus::Scheduled => {}
            CampaignStatus::Draft => {
                self.transition(id, &[CampaignStatus::Draft], CampaignStatus::Scheduled)
                    .await?;
            }
            status => {
                return Err(EngineError::InvalidState(format!(
                    "campaign {} is {}",
                    id, status
                )));
            }
        }

        let job_id = tasks::enqueue_with(
            &self.queue,
            &CampaignTask {
                campaign_id: campaign.id,
                org_id: campaign.org_id,
            },
            CampaignTask::options().run_at(at),
        )
        .await?;
        info!(campaign_id = id, job_id = %job_id, run_at = %at, "Campaign scheduled");
        Ok(job_id)
    }

    /// Pause a campaign. A live runner stops before its next recipient.
    pub async fn pause(&self, id: CampaignId) -> Result<()> {
        self.transition(
            id,
            &[CampaignStatus::Scheduled, CampaignStatus::Sending],
            CampaignStatus::Paused,
        )
        .await?;
        self.registry.stop(id);
        info!(campaign_id = id, "Campaign paused");
        Ok(())
    }

    /// Cancel a campaign for good.
    pub async fn cancel(&self, id: CampaignId) -> Result<()> {
        self.transition(
            id,
            &[
                CampaignStatus::Draft,
                CampaignStatus::Scheduled,
                CampaignStatus::Sending,
                CampaignStatus::Paused,
            ],
            CampaignStatus::Cancelled,
        )
        .await?;
        self.registry.stop(id);
        info!(campaign_id = id, "Campaign cancelled");
        Ok(())
    }

    /// Resume a paused campaign from its cursor.
    pub async fn resume(&self, id: CampaignId) -> Result<JobId> {
        self.transition(id, &[CampaignStatus::Paused], CampaignStatus::Sending)
            .await?;
        let campaign = self.campaign(id).await?;
        let job_id = self.enqueue(&campaign).await?;
        info!(campaign_id = id, job_id = %job_id, cursor = campaign.cursor, "Campaign resumed");
        Ok(job_id)
    }

    pub async fn handle(&self, job: Job) -> QueueResult<()> {
        let task = CampaignTask::from_job(&job)?;
        self.run(task.campaign_id).await?;
        Ok(())
    }

    /// Process a campaign until its contacts are exhausted, it is stopped, or the
    /// warmup ceiling is reached.
    pub async fn run(&self, id: CampaignId) -> Result<RunOutcome> {
        let Some(guard) = self.registry.register(id) else {
            info!(campaign_id = id, "Campaign already has a live runner, skipping");
            return Ok(RunOutcome::AlreadyRunning);
        };

        let mut campaign = self.campaign(id).await?;
        match campaign.status {
            CampaignStatus::Sending => {}
            CampaignStatus::Scheduled => {
                self.store
                    .transition_campaign(id, &[CampaignStatus::Scheduled], CampaignStatus::Sending)
                    .await?;
                campaign.status = CampaignStatus::Sending;
            }
            other => {
                debug!(campaign_id = id, status = %other, "Campaign not sendable, skipping");
                return Ok(RunOutcome::Skipped(other));
            }
        }

        info!(campaign_id = id, org_id = campaign.org_id, cursor = campaign.cursor, "Campaign run started");
        self.send_all(&campaign, &guard).await
    }

    async fn send_all(&self, campaign: &Campaign, guard: &RunGuard) -> Result<RunOutcome> {
        let mut tally = Tally {
            pending: CampaignProgress {
                cursor: campaign.cursor,
                ..Default::default()
            },
            ..Default::default()
        };

        let mut day = self.clock.today();
        let mut ceiling = self.warmup.ceiling(campaign.org_id).await?;
        let mut sent_today = self.store.daily_email_count(campaign.org_id, day).await?;
        let mut sent_this_day: i64 = 0;

        let mut ticker = tokio::time::interval(self.config.send_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let page = self
                .store
                .campaign_contacts(campaign, tally.pending.cursor, self.config.page_size)
                .await?;
            if page.is_empty() {
                break;
            }

            for contact in page {
                tokio::select! {
                    biased;
                    _ = guard.stopped() => {}
                    _ = ticker.tick() => {}
                }
                if guard.is_stopped() {
                    self.flush(campaign.id, &mut tally).await?;
                    info!(campaign_id = campaign.id, sent = tally.sent, failed = tally.failed, "Campaign run stopped");
                    return Ok(RunOutcome::Stopped {
                        sent: tally.sent,
                        failed: tally.failed,
                    });
                }

                let today = self.clock.today();
                if today != day {
                    day = today;
                    ceiling = self.warmup.ceiling(campaign.org_id).await?;
                    sent_today = self.store.daily_email_count(campaign.org_id, day).await?;
                    sent_this_day = 0;
                }

                // Suppressed since the page was read. Skipping costs no warmup budget.
                if self
                    .store
                    .is_suppressed(campaign.org_id, &contact.email)
                    .await?
                {
                    debug!(campaign_id = campaign.id, contact_id = contact.id, "Contact suppressed mid-run, skipping");
                    tally.skip(contact.id);
                } else {
                    if ceiling > 0 && sent_today + sent_this_day >= i64::from(ceiling) {
                        return self.warmup_pause(campaign, &mut tally, ceiling).await;
                    }
                    let delivered = self.send_one(campaign, &contact).await?;
                    sent_this_day += 1;
                    tally.record(contact.id, delivered);
                }

                if tally.since_flush >= self.config.flush_every {
                    self.flush(campaign.id, &mut tally).await?;
                }
            }
        }

        self.flush(campaign.id, &mut tally).await?;
        // Paused or cancelled after the last contact was sent.
        if !self
            .store
            .transition_campaign(campaign.id, &[CampaignStatus::Sending], CampaignStatus::Sent)
            .await?
        {
            info!(campaign_id = campaign.id, sent = tally.sent, failed = tally.failed, "Campaign left sending before completion");
            return Ok(RunOutcome::Stopped {
                sent: tally.sent,
                failed: tally.failed,
            });
        }
        info!(
            campaign_id = campaign.id,
            sent = tally.sent,
            failed = tally.failed,
            processed = tally.processed(),
            "Campaign completed"
        );
        Ok(RunOutcome::Completed {
            sent: tally.sent,
            failed: tally.failed,
        })
    }

    async fn warmup_pause(
        &self,
        campaign: &Campaign,
        tally: &mut Tally,
        limit: u32,
    ) -> Result<RunOutcome> {
        info!(
            campaign_id = campaign.id,
            org_id = campaign.org_id,
            limit,
            "Warmup daily limit reached, pausing campaign"
        );
        self.flush(campaign.id, tally).await?;
        self.store
            .transition_campaign(campaign.id, &[CampaignStatus::Sending], CampaignStatus::Paused)
            .await?;
        alerts::warmup_limit_reached(self.store.as_ref(), campaign.org_id, limit).await?;
        Ok(RunOutcome::WarmupLimited {
            limit,
            sent: tally.sent,
            failed: tally.failed,
        })
    }

    /// Send to one contact. Returns whether the transport accepted the message;
    /// transport failures are recorded on the email and never retried.
    async fn send_one(&self, campaign: &Campaign, contact: &Contact) -> Result<bool> {
        let domain = campaign
            .from_email
            .rsplit_once('@')
            .map(|(_, domain)| domain)
            .unwrap_or("localhost");

        let mut new_email = NewEmail::new(
            campaign.org_id,
            campaign.sender(),
            personalize(&campaign.subject, contact),
        )
        .to(contact.email.clone())
        .message_id(format!("<{}@{}>", Uuid::new_v4(), domain))
        .campaign(campaign.id, contact.id);
        if let Some(html) = &campaign.html_content {
            new_email = new_email.html(personalize(html, contact));
        }
        if let Some(text) = &campaign.text_content {
            new_email = new_email.text(personalize(text, contact));
        }
        if let Some(reply_to) = &campaign.reply_to {
            new_email = new_email.reply_to(reply_to.clone());
        }

        let email = self.store.create_email(new_email).await?;
        self.store
            .append_event(email.id, EventKind::Queued, None)
            .await?;

        let message = build_message(&email)
            .header("List-Unsubscribe", format!("<{}>", self.unsubscribe_url(campaign, contact)))
            .header("List-Unsubscribe-Post", "List-Unsubscribe=One-Click");

        match self.transport.send_email(&message).await {
            Ok(result) => {
                self.store
                    .mark_email_sent(email.id, &result.message_id, &result.provider, self.clock.now())
                    .await?;
                self.store
                    .append_event(email.id, EventKind::Sent, Some(&result.message_id))
                    .await?;
                Ok(true)
            }
            Err(e) => {
                warn!(
                    campaign_id = campaign.id,
                    contact_id = contact.id,
                    error = %e,
                    "Campaign send failed"
                );
                self.store
                    .set_email_status(email.id, EmailStatus::Failed)
                    .await?;
                self.store
                    .append_event(email.id, EventKind::Failed, Some(&e.to_string()))
                    .await?;
                Ok(false)
            }
        }
    }

    fn unsubscribe_url(&self, campaign: &Campaign, contact: &Contact) -> String {
        format!(
            "{}/api/v1/unsubscribe/{}-{}-{}",
            self.config.api_url, contact.id, campaign.org_id, contact.email
        )
    }

    async fn flush(&self, id: CampaignId, tally: &mut Tally) -> Result<()> {
        if tally.since_flush == 0 {
            return Ok(());
        }
        self.store
            .flush_campaign_progress(id, tally.pending)
            .await?;
        debug!(
            campaign_id = id,
            sent = tally.pending.sent,
            failed = tally.pending.failed,
            cursor = tally.pending.cursor,
            "Campaign progress flushed"
        );
        tally.pending.sent = 0;
        tally.pending.failed = 0;
        tally.since_flush = 0;
        Ok(())
    }

    async fn campaign(&self, id: CampaignId) -> Result<Campaign> {
        self.store
            .get_campaign(id)
            .await?
            .ok_or_else(|| EngineError::not_found("campaign", id))
    }

    async fn transition(
        &self,
        id: CampaignId,
        from: &[CampaignStatus],
        to: CampaignStatus,
    ) -> Result<()> {
        let campaign = self.campaign(id).await?;
        if !self.store.transition_campaign(id, from, to).await? {
            return Err(EngineError::InvalidState(format!(
                "cannot move campaign {} from {} to {}",
                id, campaign.status, to
            )));
        }
        Ok(())
    }

    async fn enqueue(&self, campaign: &Campaign) -> QueueResult<JobId> {
        tasks::enqueue(
            &self.queue,
            &CampaignTask {
                campaign_id: campaign.id,
                org_id: campaign.org_id,
            },
        )
        .await
    }
}
