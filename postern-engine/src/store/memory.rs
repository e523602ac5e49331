//! In-process store.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use postern_queue::JobId;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use super::DeliveryStore;
use crate::clock::{Clock, SystemClock};
use crate::error::{EngineError, Result};
use crate::model::*;

/// [`DeliveryStore`] backed by process memory.
///
/// Besides the trait it offers seeding helpers (`add_*`) and can simulate an
/// outage with [`set_unavailable`](MemoryStore::set_unavailable).
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    next_id: AtomicI64,
    unavailable: AtomicBool,
    emails: DashMap<EmailId, Email>,
    events: Mutex<Vec<DeliveryEvent>>,
    campaigns: DashMap<CampaignId, Campaign>,
    contacts: RwLock<BTreeMap<ContactId, Contact>>,
    lists: RwLock<HashMap<ListId, BTreeSet<ContactId>>>,
    suppressions: DashMap<(OrgId, String), Suppression>,
    warmup: DashMap<OrgId, WarmupProgress>,
    webhooks: DashMap<WebhookId, Webhook>,
    webhook_calls: Mutex<Vec<WebhookCall>>,
    alerts: Mutex<Vec<Alert>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Store that stamps rows with `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            next_id: AtomicI64::new(1),
            unavailable: AtomicBool::new(false),
            emails: DashMap::new(),
            events: Mutex::new(Vec::new()),
            campaigns: DashMap::new(),
            contacts: RwLock::new(BTreeMap::new()),
            lists: RwLock::new(HashMap::new()),
            suppressions: DashMap::new(),
            warmup: DashMap::new(),
            webhooks: DashMap::new(),
            webhook_calls: Mutex::new(Vec::new()),
            alerts: Mutex::new(Vec::new()),
        }
    }

    /// Make every query fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(EngineError::Store("store unavailable".to_string()));
        }
        Ok(())
    }

    /// Insert a contact and return its id.
    pub fn add_contact(&self, mut contact: Contact) -> ContactId {
        contact.id = self.id();
        let id = contact.id;
        self.contacts.write().insert(id, contact);
        id
    }

    pub fn add_list_member(&self, list_id: ListId, contact_id: ContactId) {
        self.lists.write().entry(list_id).or_default().insert(contact_id);
    }

    /// Insert contacts and put them all on `list_id`.
    pub fn add_list<I>(&self, list_id: ListId, contacts: I) -> Vec<ContactId>
    where
        I: IntoIterator<Item = Contact>,
    {
        contacts
            .into_iter()
            .map(|contact| {
                let id = self.add_contact(contact);
                self.add_list_member(list_id, id);
                id
            })
            .collect()
    }

    pub fn contact(&self, id: ContactId) -> Option<Contact> {
        self.contacts.read().get(&id).cloned()
    }

    pub fn add_campaign(&self, mut campaign: Campaign) -> CampaignId {
        campaign.id = self.id();
        let id = campaign.id;
        self.campaigns.insert(id, campaign);
        id
    }

    /// Change a stored campaign in place. Returns false if it does not exist.
    pub fn edit_campaign(&self, id: CampaignId, edit: impl FnOnce(&mut Campaign)) -> bool {
        match self.campaigns.get_mut(&id) {
            Some(mut campaign) => {
                edit(&mut campaign);
                true
            }
            None => false,
        }
    }

    pub fn add_webhook(&self, mut webhook: Webhook) -> WebhookId {
        webhook.id = self.id();
        let id = webhook.id;
        self.webhooks.insert(id, webhook);
        id
    }

    /// Add a suppression entry unless the address is already suppressed.
    pub fn add_suppression(&self, mut entry: Suppression) -> bool {
        entry.email = entry.email.trim().to_lowercase();
        match self.suppressions.entry((entry.org_id, entry.email.clone())) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(entry);
                true
            }
        }
    }

    /// Every email, in id order.
    pub fn emails(&self) -> Vec<Email> {
        let mut emails: Vec<Email> = self.emails.iter().map(|e| e.value().clone()).collect();
        emails.sort_by_key(|e| e.id);
        emails
    }

    /// Emails created by one campaign, in id order.
    pub fn campaign_emails(&self, campaign_id: CampaignId) -> Vec<Email> {
        self.emails()
            .into_iter()
            .filter(|e| e.campaign_id == Some(campaign_id))
            .collect()
    }
}

#[async_trait]
impl DeliveryStore for MemoryStore {
    async fn create_email(&self, email: NewEmail) -> Result<Email> {
        self.check()?;
        let row = Email {
            id: self.id(),
            org_id: email.org_id,
            from: email.from,
            to: email.to,
            cc: email.cc,
            bcc: email.bcc,
            reply_to: email.reply_to,
            subject: email.subject,
            html_body: email.html_body,
            text_body: email.text_body,
            message_id: email.message_id,
            status: EmailStatus::Queued,
            provider_message_id: None,
            provider: None,
            idempotency_key: email.idempotency_key,
            campaign_id: email.campaign_id,
            contact_id: email.contact_id,
            job_id: None,
            created_at: self.clock.now(),
            sent_at: None,
        };
        self.emails.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_email(&self, id: EmailId) -> Result<Option<Email>> {
        self.check()?;
        Ok(self.emails.get(&id).map(|e| e.value().clone()))
    }

    async fn set_email_status(&self, id: EmailId, status: EmailStatus) -> Result<()> {
        self.check()?;
        let mut email = self
            .emails
            .get_mut(&id)
            .ok_or_else(|| EngineError::not_found("email", id))?;
        email.status = status;
        Ok(())
    }

    async fn mark_email_sent(
        &self,
        id: EmailId,
        provider_message_id: &str,
        provider: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<()> {
        self.check()?;
        let mut email = self
            .emails
            .get_mut(&id)
            .ok_or_else(|| EngineError::not_found("email", id))?;
        email.status = EmailStatus::Sent;
        email.provider_message_id = Some(provider_message_id.to_string());
        email.provider = Some(provider.to_string());
        email.sent_at = Some(sent_at);
        Ok(())
    }

    async fn find_email_by_provider_id(&self, provider_message_id: &str) -> Result<Option<Email>> {
        self.check()?;
        Ok(self
            .emails
            .iter()
            .find(|e| e.provider_message_id.as_deref() == Some(provider_message_id))
            .map(|e| e.value().clone()))
    }

    async fn find_email_by_idempotency_key(
        &self,
        org_id: OrgId,
        key: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Email>> {
        self.check()?;
        Ok(self
            .emails
            .iter()
            .filter(|e| {
                e.org_id == org_id
                    && e.idempotency_key.as_deref() == Some(key)
                    && e.created_at >= since
            })
            .max_by_key(|e| e.id)
            .map(|e| e.value().clone()))
    }

    async fn set_email_job(&self, id: EmailId, job_id: JobId) -> Result<()> {
        self.check()?;
        let mut email = self
            .emails
            .get_mut(&id)
            .ok_or_else(|| EngineError::not_found("email", id))?;
        email.job_id = Some(job_id);
        Ok(())
    }

    async fn daily_email_count(&self, org_id: OrgId, day: NaiveDate) -> Result<i64> {
        self.check()?;
        Ok(self
            .emails
            .iter()
            .filter(|e| e.org_id == org_id && e.created_at.date_naive() == day)
            .count() as i64)
    }

    async fn delivery_counts(&self, org_id: OrgId, since: DateTime<Utc>) -> Result<DeliveryCounts> {
        self.check()?;
        let mut counts = DeliveryCounts::default();
        for email in self.emails.iter().filter(|e| e.org_id == org_id && e.created_at >= since) {
            counts.total += 1;
            if email.status == EmailStatus::Bounced {
                counts.bounced += 1;
            }
        }
        Ok(counts)
    }

    async fn append_event(
        &self,
        email_id: EmailId,
        kind: EventKind,
        detail: Option<&str>,
    ) -> Result<()> {
        self.check()?;
        self.events.lock().push(DeliveryEvent {
            email_id,
            kind,
            detail: detail.map(str::to_string),
            occurred_at: self.clock.now(),
        });
        Ok(())
    }

    async fn events(&self, email_id: EmailId) -> Result<Vec<DeliveryEvent>> {
        self.check()?;
        Ok(self
            .events
            .lock()
            .iter()
            .filter(|e| e.email_id == email_id)
            .cloned()
            .collect())
    }

    async fn get_campaign(&self, id: CampaignId) -> Result<Option<Campaign>> {
        self.check()?;
        Ok(self.campaigns.get(&id).map(|c| c.value().clone()))
    }

    async fn campaigns_with_status(
        &self,
        org_id: OrgId,
        status: CampaignStatus,
    ) -> Result<Vec<CampaignId>> {
        self.check()?;
        let mut ids: Vec<CampaignId> = self
            .campaigns
            .iter()
            .filter(|c| c.org_id == org_id && c.status == status)
            .map(|c| c.id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn set_campaign_status(&self, id: CampaignId, status: CampaignStatus) -> Result<()> {
        self.check()?;
        let mut campaign = self
            .campaigns
            .get_mut(&id)
            .ok_or_else(|| EngineError::not_found("campaign", id))?;
        campaign.status = status;
        if status == CampaignStatus::Sent {
            campaign.completed_at = Some(self.clock.now());
        }
        Ok(())
    }

    async fn transition_campaign(
        &self,
        id: CampaignId,
        from: &[CampaignStatus],
        to: CampaignStatus,
    ) -> Result<bool> {
        self.check()?;
        let mut campaign = self
            .campaigns
            .get_mut(&id)
            .ok_or_else(|| EngineError::not_found("campaign", id))?;
        if !from.contains(&campaign.status) {
            return Ok(false);
        }
        campaign.status = to;
        if to == CampaignStatus::Sent {
            campaign.completed_at = Some(self.clock.now());
        }
        Ok(true)
    }

    async fn flush_campaign_progress(
        &self,
        id: CampaignId,
        progress: CampaignProgress,
    ) -> Result<()> {
        self.check()?;
        let mut campaign = self
            .campaigns
            .get_mut(&id)
            .ok_or_else(|| EngineError::not_found("campaign", id))?;
        campaign.sent_count += progress.sent;
        campaign.failed_count += progress.failed;
        campaign.cursor = campaign.cursor.max(progress.cursor);
        Ok(())
    }

    async fn campaign_contacts(
        &self,
        campaign: &Campaign,
        after: ContactId,
        limit: usize,
    ) -> Result<Vec<Contact>> {
        self.check()?;
        let lists = self.lists.read();
        let Some(members) = lists.get(&campaign.list_id) else {
            return Ok(Vec::new());
        };
        let contacts = self.contacts.read();

        Ok(members
            .range(after.saturating_add(1)..)
            .filter_map(|id| contacts.get(id))
            .filter(|c| c.org_id == campaign.org_id && c.status == ContactStatus::Active)
            .filter(|c| {
                !self
                    .suppressions
                    .contains_key(&(campaign.org_id, c.email.trim().to_lowercase()))
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn set_contact_status(
        &self,
        org_id: OrgId,
        email: &str,
        status: ContactStatus,
    ) -> Result<()> {
        self.check()?;
        let mut contacts = self.contacts.write();
        for contact in contacts.values_mut() {
            if contact.org_id == org_id && contact.email.eq_ignore_ascii_case(email.trim()) {
                contact.status = status;
            }
        }
        Ok(())
    }

    async fn suppress(&self, entry: Suppression) -> Result<bool> {
        self.check()?;
        Ok(self.add_suppression(entry))
    }

    async fn is_suppressed(&self, org_id: OrgId, email: &str) -> Result<bool> {
        self.check()?;
        Ok(self
            .suppressions
            .contains_key(&(org_id, email.trim().to_lowercase())))
    }

    async fn suppressions(&self, org_id: OrgId) -> Result<Vec<Suppression>> {
        self.check()?;
        let mut entries: Vec<Suppression> = self
            .suppressions
            .iter()
            .filter(|s| s.org_id == org_id)
            .map(|s| s.value().clone())
            .collect();
        entries.sort_by(|a, b| a.email.cmp(&b.email));
        Ok(entries)
    }

    async fn get_warmup(&self, org_id: OrgId) -> Result<Option<WarmupProgress>> {
        self.check()?;
        Ok(self.warmup.get(&org_id).map(|w| w.value().clone()))
    }

    async fn upsert_warmup(&self, progress: WarmupProgress) -> Result<()> {
        self.check()?;
        self.warmup.insert(progress.org_id, progress);
        Ok(())
    }

    async fn touch_warmup(&self, org_id: OrgId, today: NaiveDate) -> Result<Option<WarmupProgress>> {
        self.check()?;
        let Some(mut progress) = self.warmup.get_mut(&org_id) else {
            return Ok(None);
        };
        if progress.status == WarmupStatus::Active
            && progress.last_send_on.is_some_and(|last| last < today)
        {
            progress.current_day += 1;
        }
        if progress.last_send_on.is_none_or(|last| last < today) {
            progress.last_send_on = Some(today);
        }
        Ok(Some(progress.value().clone()))
    }

    async fn set_warmup_status(&self, org_id: OrgId, status: WarmupStatus) -> Result<()> {
        self.check()?;
        if let Some(mut progress) = self.warmup.get_mut(&org_id) {
            progress.status = status;
        }
        Ok(())
    }

    async fn get_webhook(&self, id: WebhookId) -> Result<Option<Webhook>> {
        self.check()?;
        Ok(self.webhooks.get(&id).map(|w| w.value().clone()))
    }

    async fn webhooks_for_event(&self, org_id: OrgId, event: &str) -> Result<Vec<Webhook>> {
        self.check()?;
        let mut hooks: Vec<Webhook> = self
            .webhooks
            .iter()
            .filter(|w| w.org_id == org_id && w.active && w.subscribes_to(event))
            .map(|w| w.value().clone())
            .collect();
        hooks.sort_by_key(|w| w.id);
        Ok(hooks)
    }

    async fn record_webhook_result(
        &self,
        id: WebhookId,
        success: bool,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.check()?;
        let mut hook = self
            .webhooks
            .get_mut(&id)
            .ok_or_else(|| EngineError::not_found("webhook", id))?;
        if success {
            hook.success_count += 1;
        } else {
            hook.failure_count += 1;
        }
        hook.last_triggered_at = Some(at);
        Ok(())
    }

    async fn log_webhook_call(&self, call: WebhookCall) -> Result<()> {
        self.check()?;
        self.webhook_calls.lock().push(call);
        Ok(())
    }

    async fn webhook_calls(&self, id: WebhookId) -> Result<Vec<WebhookCall>> {
        self.check()?;
        Ok(self
            .webhook_calls
            .lock()
            .iter()
            .filter(|c| c.webhook_id == id)
            .cloned()
            .collect())
    }

    async fn insert_alert(&self, mut alert: Alert) -> Result<Alert> {
        self.check()?;
        alert.id = self.id();
        alert.created_at = self.clock.now();
        self.alerts.lock().push(alert.clone());
        Ok(alert)
    }

    async fn alerts(&self, org_id: Option<OrgId>) -> Result<Vec<Alert>> {
        self.check()?;
        Ok(self
            .alerts
            .lock()
            .iter()
            .rev()
            .filter(|a| org_id.is_none() || a.org_id == org_id)
            .cloned()
            .collect())
    }
}
