use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{CoreError, CoreResult};

/// Records younger than this are never pruned. Matches the platform's
/// maximum redelivery window.
pub const DEFAULT_RETENTION_DAYS: u32 = 30;

const MAX_NOTIFICATION_ID_LEN: usize = 256;

// ---------------------------------------------------------------------------
// NotificationId — platform-assigned identifier of one deletion event
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationId(String);

impl NotificationId {
    /// Surrounding whitespace is trimmed. Empty values, control characters
    /// and ids longer than 256 bytes are rejected.
    pub fn new(value: impl Into<String>) -> CoreResult<Self> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(CoreError::InvalidNotificationId("empty".into()));
        }
        if trimmed.len() > MAX_NOTIFICATION_ID_LEN {
            return Err(CoreError::InvalidNotificationId(format!(
                "longer than {} bytes",
                MAX_NOTIFICATION_ID_LEN
            )));
        }
        if trimmed.chars().any(char::is_control) {
            return Err(CoreError::InvalidNotificationId(
                "contains control characters".into(),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// EndpointConfiguration — the values registered with the marketplace
// ---------------------------------------------------------------------------

/// Verification token and externally registered endpoint URL.
///
/// Immutable for the life of the process. The token is never printed by the
/// `Debug` impl.
#[derive(Clone, PartialEq, Eq)]
pub struct EndpointConfiguration {
    verification_token: String,
    canonical_endpoint_url: String,
}

impl EndpointConfiguration {
    pub fn new(
        verification_token: impl Into<String>,
        canonical_endpoint_url: impl Into<String>,
    ) -> CoreResult<Self> {
        let verification_token = verification_token.into();
        if verification_token.is_empty() {
            return Err(CoreError::Internal("verification token is empty".into()));
        }
        let canonical_endpoint_url = canonical_endpoint_url.into();
        validate_endpoint_url(&canonical_endpoint_url)?;
        Ok(Self {
            verification_token,
            canonical_endpoint_url,
        })
    }

    pub fn verification_token(&self) -> &str {
        &self.verification_token
    }

    pub fn canonical_endpoint_url(&self) -> &str {
        &self.canonical_endpoint_url
    }
}

impl fmt::Debug for EndpointConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointConfiguration")
            .field("verification_token", &"<redacted>")
            .field("canonical_endpoint_url", &self.canonical_endpoint_url)
            .finish()
    }
}

/// The registered URL must be `https://host[/path]` with no query or fragment.
pub fn validate_endpoint_url(url: &str) -> CoreResult<()> {
    let rest = url
        .strip_prefix("https://")
        .ok_or_else(|| CoreError::InvalidEndpointUrl("scheme must be https".into()))?;
    let host = rest.split('/').next().unwrap_or_default();
    if host.is_empty() {
        return Err(CoreError::InvalidEndpointUrl("missing host".into()));
    }
    if url.contains('?') || url.contains('#') {
        return Err(CoreError::InvalidEndpointUrl(
            "query strings and fragments are not allowed".into(),
        ));
    }
    if url.chars().any(char::is_whitespace) {
        return Err(CoreError::InvalidEndpointUrl("contains whitespace".into()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// NotificationEnvelope — one parsed account-deletion event
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEnvelope {
    pub notification_id: NotificationId,
    pub event_date: DateTime<Utc>,
    pub publish_date: DateTime<Utc>,
    pub publish_attempt_count: u32,
    pub username: String,
    pub user_id: String,
    pub eias_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<String>,
}

impl NotificationEnvelope {
    pub fn deletion_request(&self) -> DeletionRequest {
        DeletionRequest {
            notification_id: self.notification_id.clone(),
            user_id: self.user_id.clone(),
            eias_token: self.eias_token.clone(),
            username: self.username.clone(),
            event_date: self.event_date,
        }
    }
}

/// Message handed to the external deletion pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionRequest {
    pub notification_id: NotificationId,
    pub user_id: String,
    pub eias_token: String,
    pub username: String,
    pub event_date: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Deduplication records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DedupStatus {
    Pending,
    Processed,
    Failed,
}

impl DedupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DedupStatus::Pending => "pending",
            DedupStatus::Processed => "processed",
            DedupStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for DedupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DedupStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DedupStatus::Pending),
            "processed" => Ok(DedupStatus::Processed),
            "failed" => Ok(DedupStatus::Failed),
            other => Err(CoreError::Storage(format!("unknown dedup status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupRecord {
    pub notification_id: NotificationId,
    pub first_seen_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: DedupStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

/// Result of the atomic check-and-set on a notification id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeginOutcome {
    /// This caller created the record and owns the deletion side effect.
    Started,
    /// A record already exists; the caller must not trigger deletion again.
    AlreadySeen,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupStats {
    pub pending: u64,
    pub processed: u64,
    pub failed: u64,
}

impl DedupStats {
    pub fn total(&self) -> u64 {
        self.pending + self.processed + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_id_trims() {
        let id = NotificationId::new("  49feeaeadd0c4bd4b3d5b6fbf1e1a1a1 ").unwrap();
        assert_eq!(id.as_str(), "49feeaeadd0c4bd4b3d5b6fbf1e1a1a1");
    }

    #[test]
    fn test_notification_id_rejects_empty() {
        assert!(NotificationId::new("").is_err());
        assert!(NotificationId::new("   ").is_err());
    }

    #[test]
    fn test_notification_id_rejects_control_chars() {
        assert!(NotificationId::new("abc\u{0}def").is_err());
    }

    #[test]
    fn test_notification_id_rejects_overlong() {
        assert!(NotificationId::new("a".repeat(257)).is_err());
        assert!(NotificationId::new("a".repeat(256)).is_ok());
    }

    #[test]
    fn test_endpoint_configuration_redacts_token() {
        let cfg = EndpointConfiguration::new(
            "super-secret-token-value-0123456789",
            "https://example.com/api/ebay-endpoint",
        )
        .unwrap();
        let printed = format!("{:?}", cfg);
        assert!(!printed.contains("super-secret"));
        assert!(printed.contains("example.com"));
    }

    #[test]
    fn test_endpoint_configuration_rejects_empty_token() {
        assert!(EndpointConfiguration::new("", "https://example.com/x").is_err());
    }

    #[test]
    fn test_validate_endpoint_url() {
        assert!(validate_endpoint_url("https://example.com/api/ebay-endpoint").is_ok());
        assert!(validate_endpoint_url("https://example.com").is_ok());
        assert!(validate_endpoint_url("http://example.com/api").is_err());
        assert!(validate_endpoint_url("https:///api").is_err());
        assert!(validate_endpoint_url("https://example.com/api?x=1").is_err());
        assert!(validate_endpoint_url("https://example.com/api#frag").is_err());
    }

    #[test]
    fn test_dedup_status_roundtrip_str() {
        for status in [
            DedupStatus::Pending,
            DedupStatus::Processed,
            DedupStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<DedupStatus>().unwrap(), status);
        }
        assert!("done".parse::<DedupStatus>().is_err());
    }

    #[test]
    fn test_deletion_request_from_envelope() {
        let now = Utc::now();
        let envelope = NotificationEnvelope {
            notification_id: NotificationId::new("n-1").unwrap(),
            event_date: now,
            publish_date: now,
            publish_attempt_count: 2,
            username: "test_user".into(),
            user_id: "ma8vp1jySJC".into(),
            eias_token: "nY+sHZ2PrBmdj6wVnY+sEZ2PrA2dj6wJnY+gAZGEpwmdj6x9nY+seQ==".into(),
            topic: None,
            schema_version: None,
        };
        let req = envelope.deletion_request();
        assert_eq!(req.notification_id.as_str(), "n-1");
        assert_eq!(req.user_id, "ma8vp1jySJC");
        assert_eq!(req.event_date, now);
    }

    #[test]
    fn test_dedup_stats_total() {
        let stats = DedupStats {
            pending: 1,
            processed: 5,
            failed: 2,
        };
        assert_eq!(stats.total(), 8);
    }
}
