//! Durable task queue and worker pool for postern.
//!
//! Provides:
//! - Redis-backed persistence, with an in-memory backend for tests
//! - Three strictly ordered priority tiers: `critical`, `default`, `low`
//! - Retries on a fixed backoff table (1s up to 10m)
//! - Delayed jobs
//! - A dead set with an alert hook and manual requeue
//! - A bounded worker pool with per-job timeouts
//! - Leased processing: jobs abandoned by a crashed worker return to the queue
//!
//! ## Job Creation
//!
//! ```
//! use postern_queue::{Job, JobOptions, QueueTier};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! let job = Job::new("bounce:process", json!({"email_id": 42}))
//!     .with_options(JobOptions::new(QueueTier::Critical, 3, Duration::from_secs(60)));
//!
//! assert_eq!(job.tier, QueueTier::Critical);
//! assert_eq!(job.max_attempts, 3);
//! ```
//!
//! ## Delayed Jobs
//!
//! ```
//! use postern_queue::Job;
//! use serde_json::json;
//! use chrono::Duration;
//!
//! let scheduled = Job::new("campaign:process", json!({"campaign_id": 9}))
//!     .run_after(Duration::hours(1));
//!
//! assert!(!scheduled.is_ready());
//! ```
//!
//! ## Queue Configuration
//!
//! ```
//! use postern_queue::QueueConfig;
//!
//! let config = QueueConfig::new("redis://:secret@cache.internal:6379")
//!     .with_key_prefix("postern:queue")
//!     .with_max_size(100_000);
//!
//! assert_eq!(
//!     config.resolve(),
//!     ("cache.internal:6379".to_string(), Some("secret".to_string()))
//! );
//! ```
//!
//! ## Complete Example
//!
//! ```no_run
//! use postern_queue::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), QueueError> {
//!     let queue = Queue::connect(QueueConfig::new("redis://localhost:6379")).await?;
//!
//!     queue
//!         .enqueue("email:send", serde_json::json!({"email_id": 1}), JobOptions::default())
//!         .await?;
//!
//!     let mut worker = Worker::new(queue);
//!     worker.register_handler("email:send", |_job| async move { Ok(()) });
//!     worker.start()?;
//!
//!     tokio::signal::ctrl_c().await.ok();
//!     worker.stop().await
//! }
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod job;
pub mod queue;
pub mod redis_backend;
pub mod stats;
pub mod worker;

pub use backend::{MemoryBackend, QueueBackend};
pub use config::{QueueConfig, WorkerConfig};
pub use error::{QueueError, QueueResult};
pub use job::{Job, JobData, JobId, JobOptions, JobState, JobStatus, QueueTier, retry_delay};
pub use queue::{DeadLetterSink, Queue};
pub use redis_backend::RedisBackend;
pub use stats::QueueStats;
pub use worker::{JobHandler, Worker};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{QueueConfig, WorkerConfig};
    pub use crate::error::{QueueError, QueueResult};
    pub use crate::job::{Job, JobData, JobId, JobOptions, JobState, QueueTier};
    pub use crate::queue::{DeadLetterSink, Queue};
    pub use crate::worker::{JobHandler, Worker};
}
