//! Axum adapter for the long-running HTTP server.
//!
//! Every path except `/healthz` falls through to the compliance handler, so
//! the endpoint answers wherever the reverse proxy mounts it.

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

use super::{parse_json_body, parse_query, AdapterError, PlatformAdapter};
use crate::handler::{CanonicalRequest, CanonicalResponse, ComplianceHandler};

const FORWARDED_HOST: &str = "x-forwarded-host";

/// The parts of an axum request the adapter reads.
pub struct AxumRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AxumAdapter {
    /// Take the host from `X-Forwarded-Host` when present.
    pub trust_forwarded_host: bool,
}

impl PlatformAdapter for AxumAdapter {
    type Native = AxumRequest;
    type NativeResponse = Response;

    fn adapt(&self, native: AxumRequest) -> Result<CanonicalRequest, AdapterError> {
        let mut request = CanonicalRequest::new(native.method, native.uri.path());

        for (name, value) in &native.headers {
            let Ok(value) = value.to_str() else {
                continue;
            };
            request
                .headers
                .entry(name.as_str().to_ascii_lowercase())
                .or_insert_with(|| value.to_string());
        }

        let forwarded = if self.trust_forwarded_host {
            request
                .header(FORWARDED_HOST)
                .and_then(|v| v.split(',').next())
                .map(|v| v.trim().to_string())
        } else {
            None
        };
        request.host = forwarded
            .or_else(|| request.header("host").map(str::to_string))
            .or_else(|| native.uri.authority().map(|a| a.to_string()));

        request.query = parse_query(native.uri.query().unwrap_or_default());
        request.json = parse_json_body(&native.body, request.content_type());
        request.body = native.body.to_vec();
        Ok(request)
    }

    fn unadapt(&self, response: CanonicalResponse) -> Response {
        let mut builder = Response::builder().status(response.status);
        for (name, value) in &response.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                builder = builder.header(name, value);
            }
        }
        builder
            .body(Body::from(response.body))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }
}

/// Shared application state for Axum handlers.
pub struct AppState {
    pub handler: ComplianceHandler,
    pub adapter: AxumAdapter,
}

/// Build the Axum router: `/healthz` plus a fallback to the compliance handler.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(handle_health))
        .fallback(handle_compliance)
        .with_state(state)
}

/// GET /healthz -- liveness and configuration summary
async fn handle_health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoint_configured": state.handler.endpoint().is_some(),
    }))
}

/// Any other method or path -- the compliance endpoint
async fn handle_compliance(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let native = AxumRequest {
        method,
        uri,
        headers,
        body,
    };
    let response = match state.adapter.adapt(native) {
        Ok(request) => state.handler.handle(&request).await,
        Err(e) => {
            warn!(error = %e, "could not adapt request");
            CanonicalResponse::json(StatusCode::BAD_REQUEST, json!({ "error": "Bad request" }))
        }
    };
    state.adapter.unadapt(response)
}
