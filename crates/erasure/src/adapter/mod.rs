//! Hosting adapters.
//!
//! Each adapter converts its host's native request into a
//! `CanonicalRequest` and the handler's `CanonicalResponse` back into the
//! host's native response. Method, query map, raw body, parsed JSON body,
//! headers (including content type and host) and path survive the trip.

pub mod gateway;
pub mod http;

use std::collections::BTreeMap;
use thiserror::Error;

use crate::handler::{CanonicalRequest, CanonicalResponse};

pub use gateway::{GatewayAdapter, GatewayEvent, GatewayResponse};
pub use http::{build_router, AppState, AxumAdapter};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdapterError {
    #[error("invalid method: {0}")]
    InvalidMethod(String),

    #[error("invalid body: {0}")]
    InvalidBody(String),

    #[error("invalid event: {0}")]
    InvalidEvent(String),
}

pub trait PlatformAdapter {
    type Native;
    type NativeResponse;

    fn adapt(&self, native: Self::Native) -> Result<CanonicalRequest, AdapterError>;

    fn unadapt(&self, response: CanonicalResponse) -> Self::NativeResponse;
}

/// Parse a raw query string; the first value of a repeated key wins.
/// Unparseable input yields an empty map.
pub fn parse_query(raw: &str) -> BTreeMap<String, String> {
    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(raw).unwrap_or_default();
    let mut query = BTreeMap::new();
    for (key, value) in pairs {
        query.entry(key).or_insert(value);
    }
    query
}

/// Parse the body as JSON when it looks like JSON.
pub fn parse_json_body(body: &[u8], content_type: Option<&str>) -> Option<serde_json::Value> {
    let declared_json = content_type
        .map(|ct| ct.to_ascii_lowercase().contains("json"))
        .unwrap_or(false);
    let looks_json = body
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .map(|b| *b == b'{' || *b == b'[' || *b == b'"')
        .unwrap_or(false);
    if !declared_json && !looks_json {
        return None;
    }
    serde_json::from_slice(body).ok()
}
