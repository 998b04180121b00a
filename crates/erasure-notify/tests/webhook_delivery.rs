//! Signed webhook deliveries against a local HTTP listener, alone and
//! driven by the deletion worker.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use chrono::Utc;
use erasure_core::{DedupStatus, DedupStore, DeletionPipeline, DeletionRequest, NotificationId};
use erasure_notify::{
    deletion_channel, verify_payload, DeletionJob, InMemoryDedupStore, NotifyError,
    PipelineSecret, RetryPolicy, SignatureHeaders, WebhookPipeline, WorkerConfig,
    DELIVERY_ID_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Records every delivery and answers from a script, then `200`.
#[derive(Default)]
struct Receiver {
    replies: Mutex<VecDeque<StatusCode>>,
    deliveries: Mutex<Vec<(HeaderMap, Bytes)>>,
}

impl Receiver {
    fn deliveries(&self) -> Vec<(HeaderMap, Bytes)> {
        self.deliveries.lock().unwrap().clone()
    }
}

async fn receive(
    State(receiver): State<Arc<Receiver>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    receiver.deliveries.lock().unwrap().push((headers, body));
    receiver
        .replies
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or(StatusCode::OK)
}

async fn listen(replies: &[StatusCode]) -> (String, Arc<Receiver>) {
    let receiver = Arc::new(Receiver {
        replies: Mutex::new(replies.iter().copied().collect()),
        ..Receiver::default()
    });
    let app = Router::new()
        .route("/deletions", post(receive))
        .with_state(Arc::clone(&receiver));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}/deletions", addr), receiver)
}

fn secret() -> PipelineSecret {
    PipelineSecret::new(vec![0x5au8; 32]).unwrap()
}

fn webhook(url: String) -> WebhookPipeline {
    WebhookPipeline::new(url, Some(secret()), Duration::from_secs(2)).unwrap()
}

fn request(id: &str) -> DeletionRequest {
    DeletionRequest {
        notification_id: NotificationId::new(id).unwrap(),
        user_id: "ma8vp1jySJC".into(),
        eias_token: "nY+sHZ2PrBmdj6wVnY+sEZ2PrA2dj6wJnY+gAZGEpwmdj6x9nY+seQ==".into(),
        username: "test_user".into(),
        event_date: Utc::now(),
    }
}

fn header(headers: &HeaderMap, name: &str) -> String {
    headers.get(name).unwrap().to_str().unwrap().to_string()
}

fn signature_headers(headers: &HeaderMap) -> SignatureHeaders {
    SignatureHeaders {
        delivery_id: header(headers, DELIVERY_ID_HEADER),
        timestamp: header(headers, TIMESTAMP_HEADER),
        signature: header(headers, SIGNATURE_HEADER),
    }
}

fn fast_worker() -> WorkerConfig {
    WorkerConfig {
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            attempt_timeout: Duration::from_secs(2),
        },
        ..WorkerConfig::default()
    }
}

#[tokio::test]
async fn test_signed_delivery_verifies() {
    let (url, receiver) = listen(&[]).await;
    let sent = request("n-signed");

    webhook(url).enqueue_deletion(&sent).await.unwrap();

    let deliveries = receiver.deliveries();
    assert_eq!(deliveries.len(), 1);
    let (headers, body) = &deliveries[0];
    assert_eq!(header(headers, "content-type"), "application/json");

    let received: DeletionRequest = serde_json::from_slice(body).unwrap();
    assert_eq!(received, sent);

    let signature = signature_headers(headers);
    assert!(signature.signature.starts_with("v1,"));
    assert!(verify_payload(&signature, body, &secret(), Utc::now()).is_ok());
    assert_eq!(
        verify_payload(&signature, b"{\"tampered\":true}", &secret(), Utc::now()),
        Err(NotifyError::InvalidSignature)
    );
}

#[tokio::test]
async fn test_unsigned_delivery_carries_no_signature() {
    let (url, receiver) = listen(&[]).await;
    let pipeline = WebhookPipeline::new(url, None, Duration::from_secs(2)).unwrap();

    pipeline.enqueue_deletion(&request("n-plain")).await.unwrap();

    let (headers, _) = &receiver.deliveries()[0];
    assert!(headers.get(SIGNATURE_HEADER).is_none());
    assert!(headers.get(DELIVERY_ID_HEADER).is_none());
}

#[tokio::test]
async fn test_reply_status_decides_retry() {
    let (url, _receiver) = listen(&[
        StatusCode::CONFLICT,
        StatusCode::SERVICE_UNAVAILABLE,
        StatusCode::BAD_REQUEST,
    ])
    .await;
    let pipeline = webhook(url);
    let sent = request("n-status");

    // 409: already queued downstream.
    assert!(pipeline.enqueue_deletion(&sent).await.is_ok());
    assert!(pipeline.enqueue_deletion(&sent).await.unwrap_err().is_retryable());
    assert!(!pipeline.enqueue_deletion(&sent).await.unwrap_err().is_retryable());
}

#[tokio::test]
async fn test_worker_retries_unavailable_pipeline() {
    let (url, receiver) = listen(&[StatusCode::SERVICE_UNAVAILABLE]).await;
    let store = Arc::new(InMemoryDedupStore::new());
    let (queue, worker) = deletion_channel(store.clone(), Arc::new(webhook(url)), fast_worker());

    let id = NotificationId::new("n-retry").unwrap();
    store.try_begin_processing(&id).await.unwrap();
    queue.submit(DeletionJob::claimed(request("n-retry"))).unwrap();
    drop(queue);

    let report = worker.run(CancellationToken::new()).await;
    assert_eq!(report.processed, 1);
    assert_eq!(
        store.get(&id).await.unwrap().unwrap().status,
        DedupStatus::Processed
    );

    let deliveries = receiver.deliveries();
    assert_eq!(deliveries.len(), 2);
    let first = signature_headers(&deliveries[0].0);
    let second = signature_headers(&deliveries[1].0);
    assert_ne!(first.delivery_id, second.delivery_id);
    for (headers, body) in &deliveries {
        assert!(verify_payload(&signature_headers(headers), body, &secret(), Utc::now()).is_ok());
    }
}

#[tokio::test]
async fn test_worker_gives_up_on_rejection() {
    let (url, receiver) = listen(&[StatusCode::BAD_REQUEST]).await;
    let store = Arc::new(InMemoryDedupStore::new());
    let (queue, worker) = deletion_channel(store.clone(), Arc::new(webhook(url)), fast_worker());

    let id = NotificationId::new("n-reject").unwrap();
    store.try_begin_processing(&id).await.unwrap();
    queue.submit(DeletionJob::claimed(request("n-reject"))).unwrap();
    drop(queue);

    let report = worker.run(CancellationToken::new()).await;
    assert_eq!(report.failed, 1);
    assert_eq!(receiver.deliveries().len(), 1);

    let record = store.get(&id).await.unwrap().unwrap();
    assert_eq!(record.status, DedupStatus::Failed);
    assert!(record.failure_reason.unwrap().contains("400"));
}
