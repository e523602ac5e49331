//! Transport selection.

use std::sync::Arc;
use tracing::info;

use crate::{Result, SmtpConfig, SmtpTransport, Transport};

/// AWS SES configuration.
#[derive(Debug, Clone, Default)]
pub struct SesConfig {
    /// AWS region; falls back to the SDK's default resolution.
    pub region: Option<String>,
    /// Configuration set name (optional).
    pub configuration_set: Option<String>,
    /// Subdomain used as custom MAIL FROM when verifying domains, e.g. `bounce`.
    pub mail_from_subdomain: Option<String>,
}

impl SesConfig {
    /// Create a new SES configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the AWS region.
    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Set the configuration set.
    pub fn configuration_set(mut self, name: impl Into<String>) -> Self {
        self.configuration_set = Some(name.into());
        self
    }

    /// Set the custom MAIL FROM subdomain.
    pub fn mail_from_subdomain(mut self, subdomain: impl Into<String>) -> Self {
        self.mail_from_subdomain = Some(subdomain.into());
        self
    }
}

/// Which transport to run with.
#[derive(Debug, Clone)]
pub enum TransportConfig {
    Smtp(SmtpConfig),
    Ses(SesConfig),
}

impl TransportConfig {
    /// Provider name of the selected transport.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Smtp(_) => "smtp",
            Self::Ses(_) => "ses",
        }
    }
}

/// Build the configured transport.
pub async fn build_transport(config: &TransportConfig) -> Result<Arc<dyn Transport>> {
    info!(provider = config.kind(), "Building mail transport");
    match config {
        TransportConfig::Smtp(smtp) => Ok(Arc::new(SmtpTransport::new(smtp.clone())?)),
        TransportConfig::Ses(ses) => build_ses(ses).await,
    }
}

#[cfg(feature = "ses")]
async fn build_ses(config: &SesConfig) -> Result<Arc<dyn Transport>> {
    Ok(Arc::new(crate::SesTransport::new(config.clone()).await?))
}

#[cfg(not(feature = "ses"))]
async fn build_ses(_config: &SesConfig) -> Result<Arc<dyn Transport>> {
    Err(crate::TransportError::Config(
        "SES transport requested but the `ses` feature is disabled".to_string(),
    ))
}
