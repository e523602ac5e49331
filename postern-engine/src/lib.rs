//! # Postern Engine
//!
//! Multi-tenant email delivery on top of [`postern_queue`], [`postern_transport`] and
//! [`postern_webhooks`].
//!
//! ## Features
//!
//! - **Transactional sends**: one job per email, in-process retry of transient
//!   failures with exponential backoff, suppression of permanent failures,
//!   idempotency keys and delayed sends
//! - **Campaigns**: rate-limited, resumable list sends with pause, resume and cancel
//! - **Warmup**: per-tenant daily ceilings that ramp up over a schedule, paused
//!   when the bounce rate spikes
//! - **Suppression**: bounced and complaining addresses are never mailed again
//! - **Webhooks**: signed delivery events with per-endpoint counters and a call log
//! - **Provider notifications**: verified bounce, complaint and delivery callbacks
//!
//! ## Quick Start
//!
//! ```no_run
//! use postern_engine::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> postern_engine::Result<()> {
//!     let config = EngineConfig::from_env()?;
//!     init_tracing(&config.log)?;
//!
//!     let engine = Engine::connect(config, Arc::new(MemoryStore::new())).await?;
//!     let mut worker = engine.worker();
//!     worker.start()?;
//!
//!     engine
//!         .send_email(
//!             NewEmail::new(1, "Acme <app@acme.test>", "Welcome")
//!                 .to("ada@example.com")
//!                 .html("<p>Hello!</p>"),
//!         )
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await.ok();
//!     worker.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod alerts;
pub mod bounce;
pub mod campaign;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod inbound;
pub mod model;
pub mod store;
pub mod suppression;
pub mod tasks;
pub mod telemetry;
pub mod text;
pub mod transactional;
pub mod warmup;
pub mod webhook_worker;

pub use alerts::DeadLetterAlerts;
pub use bounce::BounceWorker;
pub use campaign::{CampaignRunner, RunOutcome, RunnerRegistry};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CampaignConfig, EngineConfig, InboundConfig, LogConfig, LogFormat, SendConfig};
pub use engine::{Engine, EngineBuilder};
pub use error::{EngineError, Result};
pub use inbound::{InboundHandler, InboundResponse, InboundSink};
pub use store::{DeliveryStore, MemoryStore};
pub use tasks::{BounceTask, BounceType, CampaignTask, EmailSendTask, Task, WebhookTask};
pub use telemetry::init_tracing;
pub use transactional::{SendOutcome, TransactionalWorker};
pub use warmup::{BounceCheck, WarmupController};
pub use webhook_worker::WebhookWorker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::model::*;
    pub use crate::{
        CampaignRunner, DeliveryStore, Engine, EngineConfig, EngineError, InboundHandler,
        MemoryStore, RunOutcome, SendOutcome, WarmupController, init_tracing,
    };
}
