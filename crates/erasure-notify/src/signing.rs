//! HMAC-SHA256 signing of outbound deletion-pipeline deliveries.
//!
//! Signing: HMAC-SHA256(secret, delivery_id "." timestamp "." body), base64-encoded with v1 prefix.
//! Verification: constant-time via `Mac::verify_slice`, bounded clock skew.

use base64::{engine::general_purpose::STANDARD, engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;

use crate::error::{NotifyError, NotifyResult};

type HmacSha256 = Hmac<Sha256>;

pub const DELIVERY_ID_HEADER: &str = "Erasure-Delivery-Id";
pub const TIMESTAMP_HEADER: &str = "Erasure-Timestamp";
pub const SIGNATURE_HEADER: &str = "Erasure-Signature";

/// Maximum allowed clock skew when verifying a delivery (5 minutes).
const TIMESTAMP_TOLERANCE_SECONDS: i64 = 300;

/// Minimum secret length in bytes.
const MIN_SECRET_LEN: usize = 32;

/// Shared secret between this endpoint and the deletion pipeline.
#[derive(Clone)]
pub struct PipelineSecret(Vec<u8>);

impl PipelineSecret {
    pub fn new(bytes: impl Into<Vec<u8>>) -> NotifyResult<Self> {
        let bytes = bytes.into();
        if bytes.len() < MIN_SECRET_LEN {
            return Err(NotifyError::ConfigurationError(format!(
                "pipeline secret must be at least {} bytes",
                MIN_SECRET_LEN
            )));
        }
        Ok(Self(bytes))
    }

    fn key_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for PipelineSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PipelineSecret(<redacted>)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeaders {
    pub delivery_id: String,
    pub timestamp: String,
    pub signature: String,
}

/// Sign a delivery body, producing the three `Erasure-*` headers.
pub fn sign_payload(body: &[u8], secret: &PipelineSecret) -> NotifyResult<SignatureHeaders> {
    sign_payload_at(body, secret, Utc::now())
}

pub fn sign_payload_at(
    body: &[u8],
    secret: &PipelineSecret,
    now: DateTime<Utc>,
) -> NotifyResult<SignatureHeaders> {
    let delivery_id = generate_delivery_id();
    let timestamp = now.timestamp().to_string();
    let mac = compute_hmac(secret.key_bytes(), &delivery_id, &timestamp, body)?;
    Ok(SignatureHeaders {
        delivery_id,
        timestamp,
        signature: format!("v1,{}", STANDARD.encode(mac.finalize().into_bytes())),
    })
}

/// Verify a signed delivery. Used by pipeline consumers and tests.
pub fn verify_payload(
    headers: &SignatureHeaders,
    body: &[u8],
    secret: &PipelineSecret,
    now: DateTime<Utc>,
) -> NotifyResult<()> {
    let ts: i64 = headers
        .timestamp
        .parse()
        .map_err(|_| NotifyError::InvalidSignature)?;
    if (now.timestamp() - ts).abs() > TIMESTAMP_TOLERANCE_SECONDS {
        return Err(NotifyError::InvalidSignature);
    }

    let encoded = headers
        .signature
        .strip_prefix("v1,")
        .ok_or(NotifyError::InvalidSignature)?;
    let expected = STANDARD
        .decode(encoded)
        .map_err(|_| NotifyError::InvalidSignature)?;

    compute_hmac(secret.key_bytes(), &headers.delivery_id, &headers.timestamp, body)?
        .verify_slice(&expected)
        .map_err(|_| NotifyError::InvalidSignature)
}

fn compute_hmac(
    key: &[u8],
    delivery_id: &str,
    timestamp: &str,
    body: &[u8],
) -> NotifyResult<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| NotifyError::InternalError)?;
    mac.update(delivery_id.as_bytes());
    mac.update(b".");
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    Ok(mac)
}

fn generate_delivery_id() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
