//! Shared fixtures for engine integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use postern_engine::config::{CampaignConfig, EngineConfig, SendConfig};
use postern_engine::model::{Campaign, CampaignId, Contact, ContactId, ListId};
use postern_engine::{DeliveryStore, Engine, ManualClock, MemoryStore};
use postern_queue::Queue;
use postern_transport::{
    DomainVerification, MockTransport, OutboundMessage, SendQuota, SendResult, Transport,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub const ORG: i64 = 1;
pub const LIST: ListId = 10;

pub struct Harness {
    pub engine: Engine,
    pub store: Arc<MemoryStore>,
    pub transport: Arc<HookTransport>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn mock(&self) -> &MockTransport {
        &self.transport.inner
    }

    /// Process every ready job.
    pub async fn drain(&self) -> usize {
        self.engine.worker().drain().await.unwrap()
    }

    pub async fn campaign(&self, id: CampaignId) -> Campaign {
        self.store.get_campaign(id).await.unwrap().unwrap()
    }
}

pub fn config() -> EngineConfig {
    EngineConfig {
        campaign: CampaignConfig::default()
            .with_rate_limit(1000)
            .with_flush_every(10),
        send: SendConfig::default().with_retry_base(Duration::from_secs(1)),
        ..Default::default()
    }
}

pub fn harness() -> Harness {
    harness_with(config(), |_| HookTransport::new())
}

/// Build a harness; `transport` gets the store so send hooks can reach it.
pub fn harness_with<F>(config: EngineConfig, transport: F) -> Harness
where
    F: FnOnce(&Arc<MemoryStore>) -> HookTransport,
{
    build(config, None, transport)
}

/// Default harness over an explicit queue.
pub fn harness_on(queue: Queue) -> Harness {
    build(config(), Some(queue), |_| HookTransport::new())
}

fn build<F>(config: EngineConfig, queue: Option<Queue>, transport: F) -> Harness
where
    F: FnOnce(&Arc<MemoryStore>) -> HookTransport,
{
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(),
    ));
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let transport = Arc::new(transport(&store));
    let mut builder = Engine::builder()
        .store(store.clone())
        .transport(transport.clone())
        .clock(clock.clone())
        .config(config);
    if let Some(queue) = queue {
        builder = builder.queue(queue);
    }
    let engine = builder.build().unwrap();
    Harness {
        engine,
        store,
        transport,
        clock,
    }
}

/// `count` active contacts `user{n}@example.com` on [`LIST`].
pub fn seed_contacts(store: &MemoryStore, count: usize) -> Vec<ContactId> {
    store.add_list(
        LIST,
        (1..=count).map(|n| Contact::new(ORG, format!("user{}@example.com", n))),
    )
}

pub fn seed_campaign(store: &MemoryStore) -> CampaignId {
    store.add_campaign(
        Campaign::new(ORG, LIST, "News for {{email}}", "news@acme.test")
            .from_name("Acme")
            .html("<p>Hello</p>"),
    )
}

type SendHook = Box<dyn Fn(usize) + Send + Sync>;

/// [`MockTransport`] with a callback run before each send, given the 1-based send
/// number.
pub struct HookTransport {
    pub inner: MockTransport,
    hook: Option<SendHook>,
    calls: AtomicUsize,
}

impl HookTransport {
    pub fn new() -> Self {
        Self::wrap(MockTransport::new())
    }

    pub fn wrap(inner: MockTransport) -> Self {
        Self {
            inner,
            hook: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn on_send(mut self, hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }
}

#[async_trait]
impl Transport for HookTransport {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn send_email(&self, message: &OutboundMessage) -> postern_transport::Result<SendResult> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(hook) = &self.hook {
            hook(n);
        }
        self.inner.send_email(message).await
    }

    async fn send_raw_email(
        &self,
        from: &str,
        to: &[String],
        raw: &[u8],
    ) -> postern_transport::Result<SendResult> {
        self.inner.send_raw_email(from, to, raw).await
    }

    async fn verify_domain(&self, domain: &str) -> postern_transport::Result<DomainVerification> {
        self.inner.verify_domain(domain).await
    }

    async fn check_domain_verification(
        &self,
        domain: &str,
    ) -> postern_transport::Result<DomainVerification> {
        self.inner.check_domain_verification(domain).await
    }

    async fn get_send_quota(&self) -> postern_transport::Result<SendQuota> {
        self.inner.get_send_quota().await
    }
}
