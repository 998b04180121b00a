//! Notification envelope parser.
//!
//! Normalizes the payload shapes different gateways hand us into one
//! `NotificationEnvelope`:
//!
//! - the platform's nested shape: `{"metadata": {..}, "notification": {.., "data": {..}}}`
//! - a flat JSON object carrying the same keys at the top level
//! - `application/x-www-form-urlencoded` with flat keys
//! - a JSON string whose content is any of the above (double-encoded bodies)
//!
//! Unknown fields are ignored. Only a missing or unusable `notificationId`
//! makes a body malformed.

use chrono::{DateTime, Utc};
use erasure_core::{NotificationEnvelope, NotificationId};
use serde_json::{Map, Value};

use crate::error::{NotifyError, NotifyResult};

/// Topic the platform stamps on account-deletion notifications.
pub const ACCOUNT_DELETION_TOPIC: &str = "MARKETPLACE_ACCOUNT_DELETION";

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Parse a raw request body, using the current time for absent dates.
pub fn parse(body: &[u8], content_type: Option<&str>) -> NotifyResult<NotificationEnvelope> {
    parse_at(body, content_type, Utc::now())
}

/// Parse a raw request body. `received_at` fills in missing or unreadable
/// `eventDate` / `publishDate` values.
pub fn parse_at(
    body: &[u8],
    content_type: Option<&str>,
    received_at: DateTime<Utc>,
) -> NotifyResult<NotificationEnvelope> {
    let text = std::str::from_utf8(body)
        .map_err(|_| malformed("body is not valid UTF-8"))?
        .trim();
    if text.is_empty() {
        return Err(malformed("empty body"));
    }

    let is_form = content_type
        .map(|ct| ct.to_ascii_lowercase().starts_with(FORM_CONTENT_TYPE))
        .unwrap_or(false);

    if is_form {
        return from_object(&form_to_object(text)?, received_at);
    }

    match serde_json::from_str::<Value>(text) {
        Ok(value) => from_value(&value, received_at, true),
        // Some gateways drop the content type; fall back to form decoding.
        Err(_) if text.contains('=') && !text.starts_with('{') => {
            from_object(&form_to_object(text)?, received_at)
        }
        Err(e) => Err(malformed(&format!("body is not JSON: {}", e))),
    }
}

/// Parse a body an adapter already decoded as JSON.
pub fn parse_value(value: &Value) -> NotifyResult<NotificationEnvelope> {
    parse_value_at(value, Utc::now())
}

pub fn parse_value_at(
    value: &Value,
    received_at: DateTime<Utc>,
) -> NotifyResult<NotificationEnvelope> {
    from_value(value, received_at, true)
}

fn from_value(
    value: &Value,
    received_at: DateTime<Utc>,
    allow_nested_string: bool,
) -> NotifyResult<NotificationEnvelope> {
    match value {
        Value::Object(map) => from_object(map, received_at),
        Value::String(inner) if allow_nested_string => {
            let nested: Value = serde_json::from_str(inner.trim())
                .map_err(|_| malformed("string body does not contain JSON"))?;
            from_value(&nested, received_at, false)
        }
        _ => Err(malformed("body must be a JSON object")),
    }
}

fn from_object(
    root: &Map<String, Value>,
    received_at: DateTime<Utc>,
) -> NotifyResult<NotificationEnvelope> {
    let notification = root
        .get("notification")
        .and_then(Value::as_object)
        .unwrap_or(root);
    let data = notification
        .get("data")
        .and_then(Value::as_object)
        .unwrap_or(notification);
    let metadata = root.get("metadata").and_then(Value::as_object);

    let raw_id = text_field(notification, &["notificationId", "notification_id"])
        .ok_or_else(|| malformed("missing notificationId"))?;
    let notification_id = NotificationId::new(raw_id)
        .map_err(|e| NotifyError::MalformedNotification(e.to_string()))?;

    let event_date = date_field(notification, &["eventDate", "event_date"], received_at);
    let publish_date = date_field(notification, &["publishDate", "publish_date"], received_at);
    let publish_attempt_count = count_field(
        notification,
        &["publishAttemptCount", "publish_attempt_count"],
    )
    .unwrap_or(1);

    Ok(NotificationEnvelope {
        notification_id,
        event_date,
        publish_date,
        publish_attempt_count,
        username: text_field(data, &["username"]).unwrap_or_default(),
        user_id: text_field(data, &["userId", "user_id"]).unwrap_or_default(),
        eias_token: text_field(data, &["eiasToken", "eias_token"]).unwrap_or_default(),
        topic: metadata
            .and_then(|m| text_field(m, &["topic"]))
            .or_else(|| text_field(root, &["topic"])),
        schema_version: metadata.and_then(|m| text_field(m, &["schemaVersion", "schema_version"])),
    })
}

fn form_to_object(text: &str) -> NotifyResult<Map<String, Value>> {
    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(text)
        .map_err(|e| malformed(&format!("form body: {}", e)))?;
    Ok(pairs
        .into_iter()
        .map(|(k, v)| (k, Value::String(v)))
        .collect())
}

/// First key present holding a string or a number, as text.
fn text_field(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match map.get(*key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn count_field(map: &Map<String, Value>, keys: &[&str]) -> Option<u32> {
    keys.iter().find_map(|key| match map.get(*key)? {
        Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

fn date_field(map: &Map<String, Value>, keys: &[&str], fallback: DateTime<Utc>) -> DateTime<Utc> {
    let Some(raw) = text_field(map, keys) else {
        return fallback;
    };
    match DateTime::parse_from_rfc3339(raw.trim()) {
        Ok(dt) => dt.with_timezone(&Utc),
        Err(_) => {
            tracing::debug!(value = %raw, "unreadable notification timestamp, using receipt time");
            fallback
        }
    }
}

fn malformed(reason: &str) -> NotifyError {
    NotifyError::MalformedNotification(reason.to_string())
}
