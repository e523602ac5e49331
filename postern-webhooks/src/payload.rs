//! Webhook envelope and delivery outcome types

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// The JSON envelope POSTed to subscriber endpoints:
/// `{"event": ..., "timestamp": <RFC3339 UTC>, "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    /// Event type, e.g. `email.sent`
    pub event: String,

    /// When the envelope was built, second precision
    #[serde(serialize_with = "serialize_rfc3339", deserialize_with = "deserialize_rfc3339")]
    pub timestamp: DateTime<Utc>,

    /// Event data
    pub data: serde_json::Value,
}

impl WebhookPayload {
    /// Create a new envelope stamped now
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            timestamp: Utc::now(),
            data,
        }
    }

    /// Set a custom timestamp
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Convert to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

fn serialize_rfc3339<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Secs, true))
}

fn deserialize_rfc3339<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
    let raw = String::deserialize(deserializer)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(serde::de::Error::custom)
}

/// Result of a single delivery attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    /// 2xx response
    Success,
    /// Non-2xx response
    Failed,
    /// No response: connection, TLS or timeout error
    Error,
}

/// Record of one POST to an endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookAttempt {
    /// Outcome class
    pub status: AttemptStatus,

    /// HTTP status code, if a response arrived
    pub status_code: Option<u16>,

    /// Start of the response body for failed responses
    pub response_body: Option<String>,

    /// Error description for anything but success
    pub error: Option<String>,

    /// Round-trip time in milliseconds
    pub duration_ms: u64,
}

impl WebhookAttempt {
    /// Check if the attempt succeeded
    pub fn is_success(&self) -> bool {
        self.status == AttemptStatus::Success
    }
}
