//! Queue and worker configuration.

use crate::error::{QueueError, QueueResult};
use std::time::Duration;
use url::Url;

const DEFAULT_REDIS_ADDR: &str = "localhost:6379";

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redis location: `redis://host:port`, `redis://:pass@host:port` or bare `host:port`
    pub redis_url: String,

    /// Password used when the URL does not carry one
    pub redis_password: Option<String>,

    /// Key prefix for Redis keys
    pub key_prefix: String,

    /// Maximum number of outstanding jobs (0 = unlimited)
    pub max_size: usize,

    /// How long completed job bodies are kept
    pub retention_time: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::new(DEFAULT_REDIS_ADDR)
    }
}

impl QueueConfig {
    /// Create a new queue configuration.
    pub fn new(redis_url: impl Into<String>) -> Self {
        Self {
            redis_url: redis_url.into(),
            redis_password: None,
            key_prefix: "postern:queue".to_string(),
            max_size: 0,
            retention_time: Duration::from_secs(86400),
        }
    }

    /// Set the fallback password.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        let password = password.into();
        self.redis_password = (!password.is_empty()).then_some(password);
        self
    }

    /// Set the key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set the maximum queue size.
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Set the retention time for completed jobs.
    pub fn with_retention_time(mut self, retention_time: Duration) -> Self {
        self.retention_time = retention_time;
        self
    }

    /// Resolve the configured location into `(host:port, password)`.
    ///
    /// A URL password wins over the fallback password. Anything that does not parse
    /// as a URL with a host is taken as a bare address.
    pub fn resolve(&self) -> (String, Option<String>) {
        let raw = self.redis_url.trim();
        if raw.is_empty() {
            return (DEFAULT_REDIS_ADDR.to_string(), self.redis_password.clone());
        }

        match Url::parse(raw) {
            Ok(url) if url.host_str().is_some_and(|host| !host.is_empty()) => {
                let host = url.host_str().unwrap_or("localhost");
                let addr = format!("{}:{}", host, url.port().unwrap_or(6379));
                let password = url
                    .password()
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .or_else(|| self.redis_password.clone());
                (addr, password)
            }
            _ => (raw.to_string(), self.redis_password.clone()),
        }
    }

    /// Normalized `redis://` connection URL.
    pub fn connection_url(&self) -> QueueResult<String> {
        let (addr, password) = self.resolve();
        let mut url = Url::parse(&format!("redis://{}", addr))
            .map_err(|e| QueueError::Config(format!("invalid redis address '{}': {}", addr, e)))?;

        if let Some(password) = password {
            url.set_password(Some(&password))
                .map_err(|_| QueueError::Config("redis address cannot carry a password".into()))?;
        }
        Ok(url.to_string())
    }

    /// Build Redis key.
    pub(crate) fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.key_prefix, suffix)
    }
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of concurrent job loops
    pub concurrency: usize,

    /// Sleep between polls when every tier is empty
    pub poll_interval: Duration,

    /// How long `stop` waits for in-flight jobs
    pub shutdown_timeout: Duration,

    /// How often the pool looks for jobs abandoned by dead workers
    pub recovery_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            poll_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
            recovery_interval: Duration::from_secs(60),
        }
    }
}

impl WorkerConfig {
    /// Set concurrency (at least one loop).
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Set poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set how often abandoned jobs are recovered.
    pub fn with_recovery_interval(mut self, interval: Duration) -> Self {
        self.recovery_interval = interval;
        self
    }
}
