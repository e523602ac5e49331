// Postern - multi-tenant email delivery for Rust
//
// This library bundles the delivery engine with the queue, transport and webhook
// crates it is built on.

// Re-export the engine
pub use postern_engine::*;

// Re-export building blocks
pub use postern_queue as queue;
pub use postern_transport as transport;
pub use postern_webhooks as webhooks;

pub use postern_queue::{Job, JobId, JobState, Queue, QueueConfig, QueueError, Worker, WorkerConfig};
pub use postern_transport::{ErrorClass, OutboundMessage, Transport, TransportConfig, TransportError};
pub use postern_webhooks::{WebhookClient, WebhookConfig, WebhookPayload};

#[cfg(feature = "testing")]
pub use postern_transport::MockTransport;

// Prelude for common imports
pub mod prelude {
    pub use postern_engine::prelude::*;
    pub use postern_queue::{Queue, QueueConfig, Worker, WorkerConfig};
    pub use postern_transport::{OutboundMessage, Transport, TransportConfig};
    pub use postern_webhooks::{WebhookClient, WebhookConfig, WebhookPayload};
}
