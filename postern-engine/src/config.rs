//! Engine configuration.
//!
//! Everything can be built in code with the builder methods, or read from
//! `POSTERN_*` environment variables with [`EngineConfig::from_env`].
//!
//! | Variable | Default |
//! |---|---|
//! | `POSTERN_REDIS_URL` | `redis://localhost:6379` |
//! | `POSTERN_REDIS_PASSWORD` | none |
//! | `POSTERN_QUEUE_PREFIX` | `postern:queue` |
//! | `POSTERN_WORKER_CONCURRENCY` | `10` |
//! | `POSTERN_CAMPAIGN_RATE_LIMIT` | `50` (emails per second) |
//! | `POSTERN_CAMPAIGN_FLUSH_EVERY` | `100` |
//! | `POSTERN_API_URL` | `http://localhost:8080` |
//! | `POSTERN_SEND_MAX_RETRIES` | `3` |
//! | `POSTERN_TRANSPORT` | `smtp` (or `ses`) |
//! | `POSTERN_SMTP_HOST` / `_PORT` / `_SECURITY` / `_USERNAME` / `_PASSWORD` / `_HELO` | `localhost` / `587` / `starttls` |
//! | `POSTERN_SES_REGION` / `_CONFIGURATION_SET` / `_MAIL_FROM_SUBDOMAIN` | SDK defaults |
//! | `POSTERN_WEBHOOK_TIMEOUT_SECS` | `30` |
//! | `POSTERN_INBOUND_SECRET` | none (no query-secret check; signatures still verified) |
//! | `POSTERN_LOG_LEVEL` / `POSTERN_LOG_FORMAT` | `info` / `json` |

use postern_queue::{QueueConfig, WorkerConfig};
use postern_transport::{SesConfig, SmtpConfig, SmtpSecurity, TransportConfig};
use postern_webhooks::WebhookConfig;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{EngineError, Result};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Multi-line, human oriented
    Pretty,
    /// Single line
    Compact,
    /// Structured JSON lines
    #[default]
    Json,
}

impl FromStr for LogFormat {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(EngineError::Config(format!("unknown log format '{}'", other))),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter used when `RUST_LOG` is not set, e.g. `info` or `postern_engine=debug`.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

impl LogConfig {
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }
}

/// Campaign runner settings.
#[derive(Debug, Clone)]
pub struct CampaignConfig {
    /// Emails per second per campaign.
    pub rate_limit: u32,
    /// Persist progress after this many processed contacts.
    pub flush_every: usize,
    /// Contacts fetched from the store per query.
    pub page_size: usize,
    /// Public API base URL, used for unsubscribe links.
    pub api_url: String,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            rate_limit: 50,
            flush_every: 100,
            page_size: 500,
            api_url: "http://localhost:8080".to_string(),
        }
    }
}

impl CampaignConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the send rate (at least one per second).
    pub fn with_rate_limit(mut self, per_second: u32) -> Self {
        self.rate_limit = per_second.max(1);
        self
    }

    pub fn with_flush_every(mut self, contacts: usize) -> Self {
        self.flush_every = contacts.max(1);
        self
    }

    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = size.max(1);
        self
    }

    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Interval between two sends.
    pub fn send_interval(&self) -> Duration {
        Duration::from_secs(1) / self.rate_limit.max(1)
    }
}

/// Transactional send settings.
#[derive(Debug, Clone)]
pub struct SendConfig {
    /// In-process retries used when a job does not name its own.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub retry_base: Duration,
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base: Duration::from_secs(1),
        }
    }
}

impl SendConfig {
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_retry_base(mut self, base: Duration) -> Self {
        self.retry_base = base;
        self
    }

    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        self.retry_base * 2u32.saturating_pow(attempt.saturating_sub(1).min(16))
    }
}

/// Provider notification endpoint settings.
#[derive(Debug, Clone)]
pub struct InboundConfig {
    /// Value the `secret` query parameter must carry. `None` skips the check.
    pub shared_secret: Option<String>,
    /// Confirm subscription requests by fetching their `SubscribeURL`.
    pub confirm_subscriptions: bool,
    /// Timeout for certificate fetches and confirmations.
    pub http_timeout: Duration,
}

impl Default for InboundConfig {
    fn default() -> Self {
        Self {
            shared_secret: None,
            confirm_subscriptions: true,
            http_timeout: Duration::from_secs(10),
        }
    }
}

impl InboundConfig {
    pub fn with_shared_secret(mut self, secret: impl Into<String>) -> Self {
        self.shared_secret = Some(secret.into());
        self
    }

    pub fn with_confirm_subscriptions(mut self, confirm: bool) -> Self {
        self.confirm_subscriptions = confirm;
        self
    }

    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub transport: TransportConfig,
    pub webhooks: WebhookConfig,
    pub campaign: CampaignConfig,
    pub send: SendConfig,
    pub inbound: InboundConfig,
    pub log: LogConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::new("redis://localhost:6379"),
            worker: WorkerConfig::default(),
            transport: TransportConfig::Smtp(SmtpConfig::new("localhost")),
            webhooks: WebhookConfig::default(),
            campaign: CampaignConfig::default(),
            send: SendConfig::default(),
            inbound: InboundConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load from the process environment, after reading a `.env` file if present.
    pub fn from_env() -> Result<Self> {
        // A missing .env file is normal in production.
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);
        let defaults = Self::default();

        let mut queue = QueueConfig::new(env.string("POSTERN_REDIS_URL", "redis://localhost:6379"));
        if let Some(password) = env.get("POSTERN_REDIS_PASSWORD") {
            queue = queue.with_password(password);
        }
        if let Some(prefix) = env.get("POSTERN_QUEUE_PREFIX") {
            queue = queue.with_key_prefix(prefix);
        }

        let worker = WorkerConfig::default()
            .with_concurrency(env.parse("POSTERN_WORKER_CONCURRENCY", defaults.worker.concurrency)?);

        let campaign = CampaignConfig::default()
            .with_rate_limit(env.parse("POSTERN_CAMPAIGN_RATE_LIMIT", defaults.campaign.rate_limit)?)
            .with_flush_every(env.parse("POSTERN_CAMPAIGN_FLUSH_EVERY", defaults.campaign.flush_every)?)
            .with_api_url(env.string("POSTERN_API_URL", &defaults.campaign.api_url));

        let send = SendConfig::default()
            .with_max_retries(env.parse("POSTERN_SEND_MAX_RETRIES", defaults.send.max_retries)?);

        let transport = match env.string("POSTERN_TRANSPORT", "smtp").to_lowercase().as_str() {
            "smtp" => TransportConfig::Smtp(smtp_config(&env)?),
            "ses" => TransportConfig::Ses(ses_config(&env)),
            other => {
                return Err(EngineError::Config(format!("unknown transport '{}'", other)));
            }
        };

        let webhooks = WebhookConfig::default().with_timeout(Duration::from_secs(
            env.parse("POSTERN_WEBHOOK_TIMEOUT_SECS", 30u64)?,
        ));

        let mut inbound = InboundConfig::default();
        inbound.shared_secret = env.get("POSTERN_INBOUND_SECRET").filter(|s| !s.is_empty());

        let log = LogConfig::default()
            .with_level(env.string("POSTERN_LOG_LEVEL", "info"))
            .with_format(env.parse("POSTERN_LOG_FORMAT", LogFormat::Json)?);

        Ok(Self {
            queue,
            worker,
            transport,
            webhooks,
            campaign,
            send,
            inbound,
            log,
        })
    }
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).map(|v| v.trim().to_string())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.get(key)
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| default.to_string())
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> Result<T>
    where
        T::Err: std::fmt::Display,
    {
        match self.get(key).filter(|v| !v.is_empty()) {
            Some(raw) => raw
                .parse()
                .map_err(|e| EngineError::Config(format!("{}: {}", key, e))),
            None => Ok(default),
        }
    }
}

fn smtp_config<F: Fn(&str) -> Option<String>>(env: &Env<F>) -> Result<SmtpConfig> {
    let security: SmtpSecurity = env.parse("POSTERN_SMTP_SECURITY", SmtpSecurity::StartTls)?;
    let default_port = match security {
        SmtpSecurity::Tls => 465,
        _ => 587,
    };

    let mut config = SmtpConfig::new(env.string("POSTERN_SMTP_HOST", "localhost"))
        .security(security)
        .port(env.parse("POSTERN_SMTP_PORT", default_port)?);

    if let (Some(user), Some(pass)) = (
        env.get("POSTERN_SMTP_USERNAME"),
        env.get("POSTERN_SMTP_PASSWORD"),
    ) {
        config = config.credentials(user, pass);
    }
    if let Some(helo) = env.get("POSTERN_SMTP_HELO") {
        config = config.helo_name(helo);
    }
    Ok(config)
}

fn ses_config<F: Fn(&str) -> Option<String>>(env: &Env<F>) -> SesConfig {
    let mut config = SesConfig::new();
    if let Some(region) = env.get("POSTERN_SES_REGION") {
        config = config.region(region);
    }
    if let Some(set) = env.get("POSTERN_SES_CONFIGURATION_SET") {
        config = config.configuration_set(set);
    }
    if let Some(sub) = env.get("POSTERN_SES_MAIL_FROM_SUBDOMAIN") {
        config = config.mail_from_subdomain(sub);
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<EngineConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EngineConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.worker.concurrency, 10);
        assert_eq!(config.campaign.rate_limit, 50);
        assert_eq!(config.campaign.flush_every, 100);
        assert_eq!(config.send.max_retries, 3);
        assert_eq!(config.transport.kind(), "smtp");
        assert!(config.inbound.shared_secret.is_none());
        assert_eq!(config.log.format, LogFormat::Json);
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("POSTERN_REDIS_URL", "redis://cache:6380"),
            ("POSTERN_REDIS_PASSWORD", "hunter2"),
            ("POSTERN_WORKER_CONCURRENCY", "4"),
            ("POSTERN_CAMPAIGN_RATE_LIMIT", "10"),
            ("POSTERN_API_URL", "https://api.acme.test/"),
            ("POSTERN_TRANSPORT", "ses"),
            ("POSTERN_SES_REGION", "eu-west-1"),
            ("POSTERN_INBOUND_SECRET", "s3cret"),
            ("POSTERN_LOG_FORMAT", "compact"),
        ])
        .unwrap();

        assert_eq!(config.queue.resolve(), ("cache:6380".to_string(), Some("hunter2".to_string())));
        assert_eq!(config.worker.concurrency, 4);
        assert_eq!(config.campaign.send_interval(), Duration::from_millis(100));
        assert_eq!(config.campaign.api_url, "https://api.acme.test");
        match &config.transport {
            TransportConfig::Ses(ses) => assert_eq!(ses.region.as_deref(), Some("eu-west-1")),
            other => panic!("expected ses, got {:?}", other),
        }
        assert_eq!(config.inbound.shared_secret.as_deref(), Some("s3cret"));
        assert_eq!(config.log.format, LogFormat::Compact);
    }

    #[test]
    fn test_smtp_settings() {
        let config = load(&[
            ("POSTERN_SMTP_HOST", "smtp.acme.test"),
            ("POSTERN_SMTP_SECURITY", "tls"),
            ("POSTERN_SMTP_USERNAME", "mailer"),
            ("POSTERN_SMTP_PASSWORD", "pw"),
        ])
        .unwrap();

        let TransportConfig::Smtp(smtp) = config.transport else {
            panic!("expected smtp");
        };
        assert_eq!(smtp.host, "smtp.acme.test");
        assert_eq!(smtp.port, 465);
        assert_eq!(smtp.username.as_deref(), Some("mailer"));
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            load(&[("POSTERN_WORKER_CONCURRENCY", "lots")]),
            Err(EngineError::Config(_))
        ));
        assert!(load(&[("POSTERN_TRANSPORT", "pigeon")]).is_err());
        assert!(load(&[("POSTERN_LOG_FORMAT", "xml")]).is_err());
    }

    #[test]
    fn test_retry_delay_doubles() {
        let send = SendConfig::default();
        assert_eq!(send.retry_delay(1), Duration::from_secs(1));
        assert_eq!(send.retry_delay(2), Duration::from_secs(2));
        assert_eq!(send.retry_delay(3), Duration::from_secs(4));
    }
}
