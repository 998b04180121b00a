//! API-gateway proxy events (AWS Lambda, Netlify Functions).
//!
//! Accepts both the REST (v1) and HTTP API (v2) event layouts. Responses are
//! always text, so `isBase64Encoded` is false on the way out.

use axum::http::{Method, StatusCode};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

use super::{parse_json_body, parse_query, AdapterError, PlatformAdapter};
use crate::handler::{CanonicalRequest, CanonicalResponse, ComplianceHandler};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayEvent {
    #[serde(default)]
    pub http_method: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub raw_path: Option<String>,
    #[serde(default)]
    pub raw_url: Option<String>,
    #[serde(default)]
    pub raw_query: Option<String>,
    #[serde(default)]
    pub raw_query_string: Option<String>,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub query_string_parameters: Option<HashMap<String, String>>,
    #[serde(default)]
    pub multi_value_query_string_parameters: Option<HashMap<String, Vec<String>>>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub is_base64_encoded: bool,
    #[serde(default)]
    pub request_context: Option<RequestContext>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    #[serde(default)]
    pub domain_name: Option<String>,
    #[serde(default)]
    pub http: Option<HttpContext>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HttpContext {
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayResponse {
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    pub is_base64_encoded: bool,
}

impl GatewayResponse {
    /// Result for an event that could not be read at all.
    pub fn bad_request() -> Self {
        GatewayAdapter.unadapt(CanonicalResponse::json(
            StatusCode::BAD_REQUEST,
            json!({ "error": "Bad request" }),
        ))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GatewayAdapter;

impl GatewayAdapter {
    /// Adapt, handle and unadapt one event.
    pub async fn dispatch(&self, handler: &ComplianceHandler, event: GatewayEvent) -> GatewayResponse {
        match self.adapt(event) {
            Ok(request) => self.unadapt(handler.handle(&request).await),
            Err(e) => {
                warn!(error = %e, "could not adapt gateway event");
                GatewayResponse::bad_request()
            }
        }
    }
}

impl PlatformAdapter for GatewayAdapter {
    type Native = GatewayEvent;
    type NativeResponse = GatewayResponse;

    fn adapt(&self, event: GatewayEvent) -> Result<CanonicalRequest, AdapterError> {
        let http = event.request_context.as_ref().and_then(|c| c.http.as_ref());

        let method_name = event
            .http_method
            .clone()
            .or_else(|| http.and_then(|h| h.method.clone()))
            .ok_or_else(|| AdapterError::InvalidEvent("missing httpMethod".into()))?;
        let method = Method::from_bytes(method_name.to_ascii_uppercase().as_bytes())
            .map_err(|_| AdapterError::InvalidMethod(method_name.clone()))?;

        let (url_path, url_query) = event
            .raw_url
            .as_deref()
            .map(split_raw_url)
            .unwrap_or((None, None));

        let path = event
            .raw_path
            .clone()
            .or_else(|| event.path.clone())
            .or_else(|| http.and_then(|h| h.path.clone()))
            .or(url_path)
            .unwrap_or_else(|| "/".to_string());

        let mut request = CanonicalRequest::new(method, path);

        for (name, value) in event.headers.unwrap_or_default() {
            request.headers.insert(name.to_ascii_lowercase(), value);
        }
        request.host = request
            .header("host")
            .map(str::to_string)
            .or_else(|| {
                event
                    .request_context
                    .as_ref()
                    .and_then(|c| c.domain_name.clone())
            });

        let raw_query = event
            .raw_query_string
            .as_deref()
            .or(event.raw_query.as_deref())
            .or(url_query.as_deref())
            .unwrap_or_default();
        request.query = parse_query(raw_query);
        for (key, values) in event.multi_value_query_string_parameters.unwrap_or_default() {
            if let Some(first) = values.into_iter().next() {
                request.query.entry(key).or_insert(first);
            }
        }
        for (key, value) in event.query_string_parameters.unwrap_or_default() {
            request.query.entry(key).or_insert(value);
        }

        let body = event.body.unwrap_or_default();
        request.body = if event.is_base64_encoded {
            STANDARD
                .decode(body.trim())
                .map_err(|e| AdapterError::InvalidBody(format!("base64: {}", e)))?
        } else {
            body.into_bytes()
        };
        request.json = parse_json_body(&request.body, request.content_type());
        Ok(request)
    }

    fn unadapt(&self, response: CanonicalResponse) -> GatewayResponse {
        let body = response.body_text();
        GatewayResponse {
            status_code: response.status.as_u16(),
            headers: response.headers.into_iter().collect(),
            body,
            is_base64_encoded: false,
        }
    }
}

/// Split a full URL (`https://host/path?query`) into path and query.
fn split_raw_url(raw: &str) -> (Option<String>, Option<String>) {
    let without_scheme = raw.split_once("://").map(|(_, rest)| rest).unwrap_or(raw);
    let after_host = match without_scheme.find('/') {
        Some(idx) => &without_scheme[idx..],
        None => "/",
    };
    let after_host = after_host.split('#').next().unwrap_or(after_host);
    match after_host.split_once('?') {
        Some((path, query)) => (Some(path.to_string()), Some(query.to_string())),
        None => (Some(after_host.to_string()), None),
    }
}
