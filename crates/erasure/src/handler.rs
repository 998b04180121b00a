//! Platform-independent compliance handler.
//!
//! Adapters turn whatever their host delivers into a `CanonicalRequest`;
//! `ComplianceHandler::handle` classifies it and produces a
//! `CanonicalResponse`. The notification path never waits on the deletion
//! pipeline: it claims the id, hands a job to the `DeletionQueue` and
//! acknowledges.

use axum::http::{header, Method, StatusCode};
use erasure_core::{
    canonical_endpoint_url, compute_challenge_response, BeginOutcome, DedupStore,
    DeletionRequest, EndpointConfiguration, NotificationId,
};
use erasure_notify::{
    envelope, DeletionJob, DeletionQueue, SubmitOutcome, ACCOUNT_DELETION_TOPIC,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::page;

pub const CHALLENGE_PARAM: &str = "challenge_code";
pub const CHALLENGE_PARAM_ALIAS: &str = "challenge";
pub const ALLOWED_METHODS: &str = "GET, POST";
const SIGNATURE_HEADER: &str = "x-ebay-signature";

// ---------------------------------------------------------------------------
// Canonical request / response
// ---------------------------------------------------------------------------

/// Host-independent view of an inbound request.
///
/// Header names are stored lower-cased. Query parameters keep the first value
/// when a key repeats.
#[derive(Debug, Clone)]
pub struct CanonicalRequest {
    pub method: Method,
    pub path: String,
    pub host: Option<String>,
    pub query: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    /// The body parsed as JSON, when it is JSON. The notification path reads
    /// this instead of re-parsing `body`.
    pub json: Option<serde_json::Value>,
}

impl CanonicalRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            host: None,
            query: BTreeMap::new(),
            headers: BTreeMap::new(),
            body: Vec::new(),
            json: None,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header(header::CONTENT_TYPE.as_str())
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    /// The challenge code, accepting the short `challenge` alias.
    pub fn challenge_code(&self) -> Option<&str> {
        self.query_param(CHALLENGE_PARAM)
            .or_else(|| self.query_param(CHALLENGE_PARAM_ALIAS))
    }
}

/// Host-independent response. Bodies are always UTF-8 (JSON or HTML).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalResponse {
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl CanonicalResponse {
    pub fn json(status: StatusCode, value: serde_json::Value) -> Self {
        Self {
            status,
            headers: vec![(
                header::CONTENT_TYPE.as_str().to_string(),
                "application/json".to_string(),
            )],
            body: value.to_string().into_bytes(),
        }
    }

    pub fn html(status: StatusCode, body: String) -> Self {
        Self {
            status,
            headers: vec![(
                header::CONTENT_TYPE.as_str().to_string(),
                "text/html; charset=utf-8".to_string(),
            )],
            body: body.into_bytes(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    fn error(status: StatusCode, message: &str) -> Self {
        Self::json(status, json!({ "error": message }))
    }

    fn without_body(mut self) -> Self {
        self.body.clear();
        self
    }
}

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

/// Which URL feeds the challenge digest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UrlSource {
    /// The configured, externally registered URL. A differing request URL is
    /// logged but not used.
    #[default]
    Registered,
    /// The URL rebuilt from the request's Host header and path.
    Request,
}

/// What to answer when a POST body is not a usable notification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MalformedPolicy {
    /// `200 {"status":"received"}` so the platform stops redelivering.
    #[default]
    Acknowledge,
    /// `400 {"error":"Malformed notification"}`.
    Reject,
}

#[derive(Debug, Clone)]
pub struct HandlerOptions {
    pub url_source: UrlSource,
    pub malformed_policy: MalformedPolicy,
    /// Upper bound on the dedup claim made on the request path.
    pub store_timeout: Duration,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            url_source: UrlSource::default(),
            malformed_policy: MalformedPolicy::default(),
            store_timeout: Duration::from_millis(1500),
        }
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// GET carrying a challenge code (possibly empty).
    Challenge { code: String },
    /// POST, whatever the body.
    Notification,
    /// GET or HEAD without a recognised parameter.
    Browse,
    /// Any other method.
    MethodNotAllowed,
}

/// Decide which path a request takes from its method and query shape alone.
pub fn classify(request: &CanonicalRequest) -> Classification {
    match request.method {
        Method::GET => match request.challenge_code() {
            Some(code) => Classification::Challenge {
                code: code.to_string(),
            },
            None => Classification::Browse,
        },
        Method::HEAD => Classification::Browse,
        Method::POST => Classification::Notification,
        _ => Classification::MethodNotAllowed,
    }
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

pub struct ComplianceHandler {
    endpoint: Option<EndpointConfiguration>,
    store: Arc<dyn DedupStore>,
    queue: DeletionQueue,
    options: HandlerOptions,
}

impl ComplianceHandler {
    /// `endpoint` is `None` only for one-shot invocations that tolerate a
    /// missing configuration; challenges then answer `500`.
    pub fn new(
        endpoint: Option<EndpointConfiguration>,
        store: Arc<dyn DedupStore>,
        queue: DeletionQueue,
        options: HandlerOptions,
    ) -> Self {
        Self {
            endpoint,
            store,
            queue,
            options,
        }
    }

    pub fn endpoint(&self) -> Option<&EndpointConfiguration> {
        self.endpoint.as_ref()
    }

    pub fn options(&self) -> &HandlerOptions {
        &self.options
    }

    pub async fn handle(&self, request: &CanonicalRequest) -> CanonicalResponse {
        match classify(request) {
            Classification::Challenge { code } => self.challenge(request, &code),
            Classification::Notification => self.notification(request).await,
            Classification::Browse => {
                let registered = self.endpoint.as_ref().map(|e| e.canonical_endpoint_url());
                let response = CanonicalResponse::html(StatusCode::OK, page::render(registered));
                if request.method == Method::HEAD {
                    response.without_body()
                } else {
                    response
                }
            }
            Classification::MethodNotAllowed => {
                debug!(method = %request.method, path = %request.path, "method not allowed");
                CanonicalResponse::error(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")
                    .with_header(header::ALLOW.as_str(), ALLOWED_METHODS)
            }
        }
    }

    fn challenge(&self, request: &CanonicalRequest, code: &str) -> CanonicalResponse {
        let Some(endpoint) = &self.endpoint else {
            error!("challenge received but the endpoint is not configured");
            return CanonicalResponse::error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Endpoint not configured",
            );
        };
        if code.is_empty() {
            warn!(path = %request.path, "challenge with empty code");
            return CanonicalResponse::error(StatusCode::BAD_REQUEST, "Missing challenge_code");
        }

        let derived = request
            .host
            .as_deref()
            .map(|host| canonical_endpoint_url(host, &request.path));

        let url = match self.options.url_source {
            UrlSource::Registered => {
                let registered = endpoint.canonical_endpoint_url();
                match &derived {
                    Some(Ok(derived)) if derived != registered => warn!(
                        request_url = %derived,
                        registered_url = %registered,
                        "request URL differs from the registered endpoint URL"
                    ),
                    Some(Err(e)) => debug!(error = %e, "could not rebuild request URL"),
                    _ => {}
                }
                registered.to_string()
            }
            UrlSource::Request => match derived {
                Some(Ok(url)) => url,
                Some(Err(e)) => {
                    warn!(error = %e, "cannot rebuild endpoint URL from request");
                    return CanonicalResponse::error(StatusCode::BAD_REQUEST, "Invalid host");
                }
                None => {
                    warn!("challenge without Host header");
                    return CanonicalResponse::error(StatusCode::BAD_REQUEST, "Missing host");
                }
            },
        };

        let digest = compute_challenge_response(code, endpoint.verification_token(), &url);
        info!(endpoint_url = %url, "answered ownership challenge");
        CanonicalResponse::json(StatusCode::OK, json!({ "challengeResponse": digest }))
    }

    async fn notification(&self, request: &CanonicalRequest) -> CanonicalResponse {
        let parsed = match &request.json {
            Some(value) => envelope::parse_value(value),
            None => envelope::parse(&request.body, request.content_type()),
        };
        let envelope = match parsed {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    error = %e,
                    payload = %String::from_utf8_lossy(&request.body),
                    "malformed notification"
                );
                return match self.options.malformed_policy {
                    MalformedPolicy::Acknowledge => {
                        CanonicalResponse::json(StatusCode::OK, json!({ "status": "received" }))
                    }
                    MalformedPolicy::Reject => CanonicalResponse::error(
                        StatusCode::BAD_REQUEST,
                        "Malformed notification",
                    ),
                };
            }
        };

        let id = envelope.notification_id.clone();
        if let Some(topic) = envelope.topic.as_deref() {
            if topic != ACCOUNT_DELETION_TOPIC {
                warn!(notification_id = %id, topic, "unexpected notification topic");
            }
        }
        if let Some(signature) = request.header(SIGNATURE_HEADER) {
            debug!(
                notification_id = %id,
                signature_len = signature.len(),
                "platform signature present, not verified"
            );
        }

        let attempt = envelope.publish_attempt_count;
        let handoff = tokio::spawn(hand_off(
            Arc::clone(&self.store),
            self.queue.clone(),
            envelope.deletion_request(),
            self.options.store_timeout,
        ));

        // On timeout the handoff task is detached, not cancelled.
        match tokio::time::timeout(self.options.store_timeout, handoff).await {
            Ok(Ok(Handoff::Duplicate)) => {
                info!(notification_id = %id, "duplicate notification acknowledged");
            }
            Ok(Ok(Handoff::Queued(outcome))) => {
                info!(
                    notification_id = %id,
                    attempt,
                    ?outcome,
                    "deletion notification accepted"
                );
            }
            Ok(Ok(Handoff::NotQueued)) => {}
            Ok(Err(e)) => {
                error!(notification_id = %id, error = %e, "deletion handoff task failed");
            }
            Err(_) => {
                warn!(
                    notification_id = %id,
                    timeout_ms = self.options.store_timeout.as_millis() as u64,
                    "dedup claim still running, deletion will be queued once it resolves"
                );
            }
        }

        received(&id)
    }
}

/// What became of a notification once its claim resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handoff {
    Duplicate,
    Queued(SubmitOutcome),
    NotQueued,
}

/// Claim the id and queue the deletion.
///
/// Runs as its own task; a claim that outlives the response still queues its
/// job.
async fn hand_off(
    store: Arc<dyn DedupStore>,
    queue: DeletionQueue,
    request: DeletionRequest,
    release_timeout: Duration,
) -> Handoff {
    let id = request.notification_id.clone();
    let job = match store.try_begin_processing(&id).await {
        Ok(BeginOutcome::AlreadySeen) => return Handoff::Duplicate,
        Ok(BeginOutcome::Started) => DeletionJob::claimed(request),
        Err(e) => {
            error!(notification_id = %id, error = %e, "dedup store unavailable, worker will claim");
            DeletionJob::unclaimed(request)
        }
    };

    let claimed = !job.needs_claim;
    match queue.submit(job) {
        Ok(outcome) => Handoff::Queued(outcome),
        Err(e) => {
            error!(notification_id = %id, error = %e, "could not queue deletion");
            if claimed {
                release(store.as_ref(), &id, release_timeout).await;
            }
            Handoff::NotQueued
        }
    }
}

/// Drop a pending claim so a later redelivery can start over.
async fn release(store: &dyn DedupStore, id: &NotificationId, timeout: Duration) {
    match tokio::time::timeout(timeout, store.release(id)).await {
        Ok(Ok(_)) => debug!(notification_id = %id, "released unqueued claim"),
        Ok(Err(e)) => error!(notification_id = %id, error = %e, "could not release claim"),
        Err(_) => error!(notification_id = %id, "timed out releasing claim"),
    }
}

fn received(id: &NotificationId) -> CanonicalResponse {
    CanonicalResponse::json(
        StatusCode::OK,
        json!({ "status": "received", "notificationId": id.as_str() }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use erasure_core::{
        CoreError, CoreResult, DedupRecord, DedupStats, DedupStatus, DeletionPipeline,
        DeletionRequest,
    };
    use erasure_notify::{deletion_channel, InMemoryDedupStore, RetryPolicy, WorkerConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    const TOKEN: &str = "colecciones-app-production-token-2025-secure-key-12345";
    const URL: &str = "https://example.com/api/ebay-endpoint";
    const PINNED: &str = "0f121ac6f1c9ae4b5b8c31467e6abc5c3078bb17dd7d2fc3068bee5626d2a9e6";

    #[derive(Default)]
    struct CountingPipeline {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DeletionPipeline for CountingPipeline {
        async fn enqueue_deletion(&self, _request: &DeletionRequest) -> CoreResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    /// A store whose every call fails.
    struct BrokenStore;

    #[async_trait]
    impl DedupStore for BrokenStore {
        async fn try_begin_processing(&self, _id: &NotificationId) -> CoreResult<BeginOutcome> {
            Err(CoreError::Storage("disk gone".into()))
        }
        async fn mark_processed(&self, _id: &NotificationId) -> CoreResult<()> {
            Err(CoreError::Storage("disk gone".into()))
        }
        async fn mark_failed(&self, _id: &NotificationId, _reason: &str) -> CoreResult<()> {
            Err(CoreError::Storage("disk gone".into()))
        }
        async fn release(&self, _id: &NotificationId) -> CoreResult<bool> {
            Err(CoreError::Storage("disk gone".into()))
        }
        async fn get(&self, _id: &NotificationId) -> CoreResult<Option<DedupRecord>> {
            Err(CoreError::Storage("disk gone".into()))
        }
        async fn prune_expired(&self, _cutoff: chrono::DateTime<chrono::Utc>) -> CoreResult<u64> {
            Err(CoreError::Storage("disk gone".into()))
        }
        async fn stats(&self) -> CoreResult<DedupStats> {
            Err(CoreError::Storage("disk gone".into()))
        }
    }

    /// An in-memory store whose claims take `delay` to land.
    struct SlowStore {
        inner: InMemoryDedupStore,
        delay: Duration,
    }

    #[async_trait]
    impl DedupStore for SlowStore {
        async fn try_begin_processing(&self, id: &NotificationId) -> CoreResult<BeginOutcome> {
            tokio::time::sleep(self.delay).await;
            self.inner.try_begin_processing(id).await
        }
        async fn mark_processed(&self, id: &NotificationId) -> CoreResult<()> {
            self.inner.mark_processed(id).await
        }
        async fn mark_failed(&self, id: &NotificationId, reason: &str) -> CoreResult<()> {
            self.inner.mark_failed(id, reason).await
        }
        async fn release(&self, id: &NotificationId) -> CoreResult<bool> {
            self.inner.release(id).await
        }
        async fn get(&self, id: &NotificationId) -> CoreResult<Option<DedupRecord>> {
            self.inner.get(id).await
        }
        async fn prune_expired(&self, cutoff: chrono::DateTime<chrono::Utc>) -> CoreResult<u64> {
            self.inner.prune_expired(cutoff).await
        }
        async fn stats(&self) -> CoreResult<DedupStats> {
            self.inner.stats().await
        }
    }

    fn endpoint() -> EndpointConfiguration {
        EndpointConfiguration::new(TOKEN, URL).unwrap()
    }

    fn handler_with(
        endpoint: Option<EndpointConfiguration>,
        store: Arc<dyn DedupStore>,
        options: HandlerOptions,
    ) -> (ComplianceHandler, erasure_notify::DeletionWorker, Arc<CountingPipeline>) {
        let pipeline = Arc::new(CountingPipeline::default());
        let (queue, worker) = deletion_channel(
            Arc::clone(&store),
            pipeline.clone() as Arc<dyn DeletionPipeline>,
            WorkerConfig {
                retry: RetryPolicy {
                    max_attempts: 2,
                    initial_backoff: Duration::from_millis(5),
                    max_backoff: Duration::from_millis(10),
                    attempt_timeout: Duration::from_millis(200),
                },
                ..WorkerConfig::default()
            },
        );
        (
            ComplianceHandler::new(endpoint, store, queue, options),
            worker,
            pipeline,
        )
    }

    fn get(query: &[(&str, &str)]) -> CanonicalRequest {
        let mut req = CanonicalRequest::new(Method::GET, "/api/ebay-endpoint");
        req.host = Some("example.com".into());
        for (k, v) in query {
            req.query.insert(k.to_string(), v.to_string());
        }
        req
    }

    fn post(body: &str) -> CanonicalRequest {
        let mut req = CanonicalRequest::new(Method::POST, "/api/ebay-endpoint");
        req.host = Some("example.com".into());
        req.headers
            .insert("content-type".into(), "application/json".into());
        req.body = body.as_bytes().to_vec();
        req
    }

    fn notification_body(id: &str) -> String {
        json!({
            "metadata": { "topic": "MARKETPLACE_ACCOUNT_DELETION", "schemaVersion": "1.0" },
            "notification": {
                "notificationId": id,
                "eventDate": "2025-03-01T10:00:00.000Z",
                "publishDate": "2025-03-01T10:00:01.000Z",
                "publishAttemptCount": 1,
                "data": { "username": "collector", "userId": "u-1", "eiasToken": "eias-1" }
            }
        })
        .to_string()
    }

    fn body_json(response: &CanonicalResponse) -> serde_json::Value {
        serde_json::from_slice(&response.body).unwrap()
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            classify(&get(&[("challenge_code", "abc")])),
            Classification::Challenge { code: "abc".into() }
        );
        assert_eq!(
            classify(&get(&[("challenge", "abc")])),
            Classification::Challenge { code: "abc".into() }
        );
        assert_eq!(classify(&get(&[])), Classification::Browse);
        assert_eq!(classify(&get(&[("other", "x")])), Classification::Browse);
        assert_eq!(classify(&post("{}")), Classification::Notification);
        assert_eq!(
            classify(&CanonicalRequest::new(Method::HEAD, "/")),
            Classification::Browse
        );
        assert_eq!(
            classify(&CanonicalRequest::new(Method::PUT, "/")),
            Classification::MethodNotAllowed
        );
        assert_eq!(
            classify(&CanonicalRequest::new(Method::DELETE, "/")),
            Classification::MethodNotAllowed
        );
    }

    #[test]
    fn test_challenge_code_prefers_full_name() {
        let req = get(&[("challenge_code", "a"), ("challenge", "b")]);
        assert_eq!(req.challenge_code(), Some("a"));
    }

    #[tokio::test]
    async fn test_challenge_pinned_vector() {
        let (handler, _worker, _) = handler_with(
            Some(endpoint()),
            Arc::new(InMemoryDedupStore::new()),
            HandlerOptions::default(),
        );
        let response = handler.handle(&get(&[("challenge_code", "abc123")])).await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.header("content-type"), Some("application/json"));
        assert_eq!(body_json(&response)["challengeResponse"], PINNED);
    }

    #[tokio::test]
    async fn test_challenge_registered_url_ignores_request_host() {
        let (handler, _worker, _) = handler_with(
            Some(endpoint()),
            Arc::new(InMemoryDedupStore::new()),
            HandlerOptions::default(),
        );
        let mut req = get(&[("challenge_code", "abc123")]);
        req.host = Some("internal-lb.local:8080".into());
        let response = handler.handle(&req).await;
        assert_eq!(body_json(&response)["challengeResponse"], PINNED);
    }

    #[tokio::test]
    async fn test_challenge_request_url_source() {
        let options = HandlerOptions {
            url_source: UrlSource::Request,
            ..HandlerOptions::default()
        };
        let (handler, _worker, _) =
            handler_with(Some(endpoint()), Arc::new(InMemoryDedupStore::new()), options);

        let response = handler.handle(&get(&[("challenge_code", "abc123")])).await;
        assert_eq!(body_json(&response)["challengeResponse"], PINNED);

        let mut req = get(&[("challenge_code", "abc123")]);
        req.host = Some("other.example.com".into());
        let response = handler.handle(&req).await;
        assert_ne!(body_json(&response)["challengeResponse"], PINNED);

        req.host = None;
        let response = handler.handle(&req).await;
        assert_eq!(response.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_challenge_empty_code_rejected() {
        let (handler, _worker, _) = handler_with(
            Some(endpoint()),
            Arc::new(InMemoryDedupStore::new()),
            HandlerOptions::default(),
        );
        let response = handler.handle(&get(&[("challenge_code", "")])).await;
        assert_eq!(response.status, StatusCode::BAD_REQUEST);
        assert!(body_json(&response).get("challengeResponse").is_none());
    }

    #[tokio::test]
    async fn test_challenge_without_configuration() {
        let (handler, _worker, _) = handler_with(
            None,
            Arc::new(InMemoryDedupStore::new()),
            HandlerOptions::default(),
        );
        let response = handler.handle(&get(&[("challenge_code", "abc123")])).await;
        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body_json(&response),
            json!({ "error": "Endpoint not configured" })
        );
    }

    #[tokio::test]
    async fn test_browse_returns_html_without_digest() {
        let (handler, _worker, _) = handler_with(
            Some(endpoint()),
            Arc::new(InMemoryDedupStore::new()),
            HandlerOptions::default(),
        );
        let response = handler.handle(&get(&[])).await;
        assert_eq!(response.status, StatusCode::OK);
        assert!(response.header("content-type").unwrap().starts_with("text/html"));
        assert!(!response.body_text().contains("challengeResponse"));

        let head = handler
            .handle(&CanonicalRequest::new(Method::HEAD, "/api/ebay-endpoint"))
            .await;
        assert_eq!(head.status, StatusCode::OK);
        assert!(head.body.is_empty());
    }

    #[tokio::test]
    async fn test_put_is_rejected_without_side_effects() {
        let store = Arc::new(InMemoryDedupStore::new());
        let (handler, _worker, _) =
            handler_with(Some(endpoint()), store.clone(), HandlerOptions::default());

        let mut req = post(&notification_body("n-put"));
        req.method = Method::PUT;
        let response = handler.handle(&req).await;
        assert_eq!(response.status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.header("allow"), Some(ALLOWED_METHODS));
        assert_eq!(body_json(&response), json!({ "error": "Method not allowed" }));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_notification_triggers_one_deletion() {
        let store = Arc::new(InMemoryDedupStore::new());
        let (handler, worker, pipeline) =
            handler_with(Some(endpoint()), store.clone(), HandlerOptions::default());

        let first = handler.handle(&post(&notification_body("n-dup"))).await;
        let second = handler.handle(&post(&notification_body("n-dup"))).await;
        assert_eq!(first.status, StatusCode::OK);
        assert_eq!(second.status, StatusCode::OK);
        assert_eq!(body_json(&first)["notificationId"], "n-dup");

        drop(handler);
        let report = worker.run(CancellationToken::new()).await;
        assert_eq!(report.processed, 1);
        assert_eq!(pipeline.calls.load(Ordering::SeqCst), 1);

        let record = store
            .get(&NotificationId::new("n-dup").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, DedupStatus::Processed);
    }

    #[tokio::test]
    async fn test_malformed_policies() {
        let (handler, _worker, _) = handler_with(
            Some(endpoint()),
            Arc::new(InMemoryDedupStore::new()),
            HandlerOptions::default(),
        );
        let response = handler.handle(&post("{\"foo\":1}")).await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(body_json(&response), json!({ "status": "received" }));

        let options = HandlerOptions {
            malformed_policy: MalformedPolicy::Reject,
            ..HandlerOptions::default()
        };
        let (handler, _worker, _) =
            handler_with(Some(endpoint()), Arc::new(InMemoryDedupStore::new()), options);
        let response = handler.handle(&post("not a notification")).await;
        assert_eq!(response.status, StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(&response),
            json!({ "error": "Malformed notification" })
        );
    }

    #[tokio::test]
    async fn test_broken_store_acknowledges_without_delivering() {
        let (handler, worker, pipeline) = handler_with(
            Some(endpoint()),
            Arc::new(BrokenStore),
            HandlerOptions::default(),
        );
        let response = handler.handle(&post(&notification_body("n-broken"))).await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(body_json(&response)["notificationId"], "n-broken");

        drop(handler);
        let report = worker.run(CancellationToken::new()).await;
        // Neither side won a claim, so nothing reached the pipeline.
        assert_eq!(report.failed, 1);
        assert_eq!(pipeline.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_slow_claim_still_delivers_once() {
        let store = Arc::new(SlowStore {
            inner: InMemoryDedupStore::new(),
            delay: Duration::from_millis(300),
        });
        let options = HandlerOptions {
            store_timeout: Duration::from_millis(50),
            ..HandlerOptions::default()
        };
        let (handler, worker, pipeline) = handler_with(Some(endpoint()), store.clone(), options);

        for _ in 0..2 {
            let started = std::time::Instant::now();
            let response = handler.handle(&post(&notification_body("n-slow"))).await;
            assert_eq!(response.status, StatusCode::OK);
            assert!(started.elapsed() < Duration::from_millis(250));
        }

        drop(handler);
        let report = tokio::time::timeout(
            Duration::from_secs(5),
            worker.run(CancellationToken::new()),
        )
        .await
        .unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(pipeline.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            store
                .inner
                .get(&NotificationId::new("n-slow").unwrap())
                .await
                .unwrap()
                .unwrap()
                .status,
            DedupStatus::Processed
        );
    }

    #[tokio::test]
    async fn test_notification_reads_decoded_json() {
        let store = Arc::new(InMemoryDedupStore::new());
        let (handler, _worker, _) =
            handler_with(Some(endpoint()), store.clone(), HandlerOptions::default());

        let mut req = post("");
        req.json = Some(serde_json::from_str(&notification_body("n-json")).unwrap());
        let response = handler.handle(&req).await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(body_json(&response)["notificationId"], "n-json");
        assert!(!store.is_empty());
    }

    #[tokio::test]
    async fn test_closed_queue_releases_claim() {
        let store = Arc::new(InMemoryDedupStore::new());
        let (handler, worker, _) =
            handler_with(Some(endpoint()), store.clone(), HandlerOptions::default());
        drop(worker);

        let response = handler.handle(&post(&notification_body("n-closed"))).await;
        assert_eq!(response.status, StatusCode::OK);

        for _ in 0..50 {
            if store.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(store.is_empty());
    }
}
