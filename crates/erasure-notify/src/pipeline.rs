//! Clients for the external deletion pipeline.

use async_trait::async_trait;
use erasure_core::{CoreError, CoreResult, DeletionPipeline, DeletionRequest};
use reqwest::StatusCode;
use std::time::Duration;

use crate::error::{NotifyError, NotifyResult};
use crate::signing::{
    sign_payload, PipelineSecret, DELIVERY_ID_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER,
};

/// POSTs each deletion request as JSON to an internal HTTP endpoint.
///
/// Deliveries are signed when a secret is configured. `409 Conflict` is
/// read as "already queued" and treated as success; other 4xx responses are
/// permanent rejections, 5xx and transport errors are retryable.
pub struct WebhookPipeline {
    client: reqwest::Client,
    url: String,
    secret: Option<PipelineSecret>,
}

impl WebhookPipeline {
    pub fn new(
        url: impl Into<String>,
        secret: Option<PipelineSecret>,
        timeout: Duration,
    ) -> NotifyResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| {
                NotifyError::ConfigurationError(format!("pipeline HTTP client: {}", e))
            })?;
        Ok(Self {
            client,
            url: url.into(),
            secret,
        })
    }
}

#[async_trait]
impl DeletionPipeline for WebhookPipeline {
    async fn enqueue_deletion(&self, request: &DeletionRequest) -> CoreResult<()> {
        let body = serde_json::to_vec(request)?;

        let mut builder = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(secret) = &self.secret {
            let headers = sign_payload(&body, secret)
                .map_err(|e| CoreError::Internal(format!("signing failed: {}", e)))?;
            builder = builder
                .header(DELIVERY_ID_HEADER, headers.delivery_id)
                .header(TIMESTAMP_HEADER, headers.timestamp)
                .header(SIGNATURE_HEADER, headers.signature);
        }

        let response = builder
            .body(body)
            .send()
            .await
            .map_err(|e| CoreError::DownstreamUnavailable(format!("pipeline request failed: {}", e)))?;

        classify_status(response.status())
    }

    fn name(&self) -> &str {
        "webhook"
    }
}

fn classify_status(status: StatusCode) -> CoreResult<()> {
    if status.is_success() || status == StatusCode::CONFLICT {
        Ok(())
    } else if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        Err(CoreError::DownstreamUnavailable(format!(
            "pipeline answered {}",
            status.as_u16()
        )))
    } else {
        Err(CoreError::DownstreamRejected(format!(
            "pipeline answered {}",
            status.as_u16()
        )))
    }
}

/// Records deletion requests in the log only.
///
/// Stand-in for local development when no pipeline URL is configured.
#[derive(Debug, Default)]
pub struct LogPipeline;

#[async_trait]
impl DeletionPipeline for LogPipeline {
    async fn enqueue_deletion(&self, request: &DeletionRequest) -> CoreResult<()> {
        tracing::info!(
            notification_id = %request.notification_id,
            user_id = %request.user_id,
            "deletion requested (log-only pipeline)"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}
