//! SMTP transport over lettre.

use async_trait::async_trait;
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Tokio1Executor,
    address::Envelope,
    transport::smtp::{authentication::Credentials, extension::ClientId},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::message::parse_mailbox;
use crate::{
    DomainVerification, OutboundMessage, Result, SendQuota, SendResult, Transport, TransportError,
};

/// SMTP security mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmtpSecurity {
    /// No encryption (local relays and test sinks only).
    None,
    /// STARTTLS upgrade (port 587).
    #[default]
    StartTls,
    /// Implicit TLS (port 465).
    Tls,
}

impl std::str::FromStr for SmtpSecurity {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "plain" => Ok(Self::None),
            "starttls" => Ok(Self::StartTls),
            "tls" | "ssl" => Ok(Self::Tls),
            other => Err(TransportError::Config(format!("unknown SMTP security mode '{}'", other))),
        }
    }
}

/// SMTP configuration.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    /// SMTP server host.
    pub host: String,
    /// SMTP server port.
    pub port: u16,
    /// Security mode.
    pub security: SmtpSecurity,
    /// Username for authentication.
    pub username: Option<String>,
    /// Password for authentication.
    pub password: Option<String>,
    /// Name announced in EHLO.
    pub helo_name: Option<String>,
    /// Connection timeout.
    pub timeout: Duration,
}

impl SmtpConfig {
    /// Create a new SMTP configuration.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 587,
            security: SmtpSecurity::StartTls,
            username: None,
            password: None,
            helo_name: None,
            timeout: Duration::from_secs(30),
        }
    }

    /// Set credentials.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set the port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the security mode, keeping the port.
    pub fn security(mut self, security: SmtpSecurity) -> Self {
        self.security = security;
        self
    }

    /// Use STARTTLS security (port 587).
    pub fn starttls(mut self) -> Self {
        self.security = SmtpSecurity::StartTls;
        self.port = 587;
        self
    }

    /// Use implicit TLS security (port 465).
    pub fn tls(mut self) -> Self {
        self.security = SmtpSecurity::Tls;
        self.port = 465;
        self
    }

    /// Use no encryption.
    pub fn insecure(mut self) -> Self {
        self.security = SmtpSecurity::None;
        self
    }

    /// Set the EHLO name.
    pub fn helo_name(mut self, name: impl Into<String>) -> Self {
        self.helo_name = Some(name.into());
        self
    }

    /// Set the connection timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// SMTP transport.
pub struct SmtpTransport {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    config: SmtpConfig,
}

impl SmtpTransport {
    /// Create a new SMTP transport. No connection is opened until the first send.
    pub fn new(config: SmtpConfig) -> Result<Self> {
        let mut builder = match config.security {
            SmtpSecurity::None => {
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
            }
            SmtpSecurity::StartTls => {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)?
            }
            SmtpSecurity::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)?,
        };

        builder = builder.port(config.port).timeout(Some(config.timeout));

        if let Some(helo) = &config.helo_name {
            builder = builder.hello_name(ClientId::Domain(helo.clone()));
        }

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        let transport = builder.build();

        info!(
            host = %config.host,
            port = config.port,
            security = ?config.security,
            "SMTP transport initialized"
        );

        Ok(Self { transport, config })
    }

    /// Get the configuration.
    pub fn config(&self) -> &SmtpConfig {
        &self.config
    }

    /// Test the SMTP connection.
    pub async fn test_connection(&self) -> Result<bool> {
        self.transport
            .test_connection()
            .await
            .map_err(TransportError::from)
    }
}

#[async_trait]
impl Transport for SmtpTransport {
    fn name(&self) -> &'static str {
        "smtp"
    }

    async fn send_email(&self, message: &OutboundMessage) -> Result<SendResult> {
        let mut message = message.clone();
        let message_id = match &message.message_id {
            Some(id) => id.clone(),
            None => {
                let domain = message.from_domain().unwrap_or("localhost").to_string();
                let id = format!("<{}@{}>", Uuid::new_v4(), domain);
                message.message_id = Some(id.clone());
                id
            }
        };

        let email = message.to_lettre()?;

        debug!(
            to = ?message.to,
            subject = %message.subject,
            message_id = %message_id,
            "Sending email via SMTP"
        );

        self.transport.send(email).await?;

        debug!(message_id = %message_id, "Email sent successfully");
        Ok(SendResult {
            message_id,
            provider: self.name().to_string(),
        })
    }

    async fn send_raw_email(&self, from: &str, to: &[String], raw: &[u8]) -> Result<SendResult> {
        let from = parse_mailbox(from)?.email;
        let recipients = to
            .iter()
            .map(|addr| parse_mailbox(addr).map(|mailbox| mailbox.email))
            .collect::<Result<Vec<_>>>()?;
        let envelope = Envelope::new(Some(from), recipients)?;

        debug!(recipients = to.len(), bytes = raw.len(), "Sending raw email via SMTP");
        self.transport.send_raw(&envelope, raw).await?;

        Ok(SendResult {
            message_id: String::new(),
            provider: self.name().to_string(),
        })
    }

    async fn verify_domain(&self, _domain: &str) -> Result<DomainVerification> {
        Err(TransportError::NotSupported("domain verification"))
    }

    async fn check_domain_verification(&self, _domain: &str) -> Result<DomainVerification> {
        Err(TransportError::NotSupported("domain verification"))
    }

    async fn get_send_quota(&self) -> Result<SendQuota> {
        Ok(SendQuota::default())
    }

    async fn is_healthy(&self) -> bool {
        self.test_connection().await.unwrap_or(false)
    }
}
