//! Erasure: marketplace account-deletion compliance endpoint.
//!
//! Wires the handler, the dedup store, the deletion queue and the pipeline
//! together from a `RootConfig`, for both the long-running server and the
//! one-shot gateway invocation.

pub mod adapter;
pub mod config;
pub mod error;
pub mod handler;
pub mod page;

use erasure_core::{DedupStore, DeletionPipeline};
use erasure_notify::{
    deletion_channel, DeletionWorker, InMemoryDedupStore, LogPipeline, SqliteDedupStore,
    WebhookPipeline,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub use adapter::{
    build_router, AdapterError, AppState, AxumAdapter, GatewayAdapter, GatewayEvent,
    GatewayResponse, PlatformAdapter,
};
pub use config::{RootConfig, StoreBackend};
pub use error::{ErasureError, ErasureResult};
pub use handler::{
    classify, CanonicalRequest, CanonicalResponse, Classification, ComplianceHandler,
    HandlerOptions, MalformedPolicy, UrlSource,
};

/// How strictly `build_service` treats a missing endpoint configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointRequirement {
    /// Fail startup.
    Required,
    /// Log and answer challenges with `500`.
    Optional,
}

/// A handler plus the worker that drains its queue.
///
/// The worker stops once the handler (the last queue handle) is dropped or
/// its cancellation token fires.
pub struct Service {
    pub handler: ComplianceHandler,
    pub worker: DeletionWorker,
    pub store: Arc<dyn DedupStore>,
    pub drain_timeout: Duration,
}

/// Open the configured dedup store.
pub fn open_store(config: &RootConfig) -> ErasureResult<Arc<dyn DedupStore>> {
    match config.store.backend {
        StoreBackend::Sqlite => {
            let path = &config.store.path;
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let path = path.to_str().ok_or_else(|| {
                ErasureError::Config(format!("database path is not UTF-8: {}", path.display()))
            })?;
            Ok(Arc::new(SqliteDedupStore::open(path)?))
        }
        StoreBackend::Memory => {
            warn!("in-memory dedup store: duplicates across instances will not be detected");
            Ok(Arc::new(InMemoryDedupStore::new()))
        }
    }
}

/// Build the configured deletion pipeline client.
pub fn build_pipeline(config: &RootConfig) -> ErasureResult<Arc<dyn DeletionPipeline>> {
    match &config.pipeline.url {
        Some(url) => Ok(Arc::new(WebhookPipeline::new(
            url.clone(),
            config.pipeline_secret()?,
            Duration::from_millis(config.pipeline.timeout_ms),
        )?)),
        None => {
            warn!("no deletion pipeline configured, deletions will only be logged");
            Ok(Arc::new(LogPipeline))
        }
    }
}

/// Assemble a service from configuration with the configured store and
/// pipeline.
pub fn build_service(
    config: &RootConfig,
    requirement: EndpointRequirement,
) -> ErasureResult<Service> {
    let store = open_store(config)?;
    let pipeline = build_pipeline(config)?;
    build_service_with(config, requirement, store, pipeline)
}

/// Assemble a service around caller-supplied collaborators.
pub fn build_service_with(
    config: &RootConfig,
    requirement: EndpointRequirement,
    store: Arc<dyn DedupStore>,
    pipeline: Arc<dyn DeletionPipeline>,
) -> ErasureResult<Service> {
    config.validate()?;

    let endpoint = match (config.endpoint_configuration(), requirement) {
        (Ok(endpoint), _) => Some(endpoint),
        (Err(e), EndpointRequirement::Required) => return Err(e),
        (Err(e), EndpointRequirement::Optional) => {
            warn!(error = %e, "endpoint not configured, challenges will fail");
            None
        }
    };

    let worker_config = config.worker_config();
    let drain_timeout = worker_config.drain_timeout;
    let (queue, worker) = deletion_channel(Arc::clone(&store), pipeline, worker_config);
    let handler = ComplianceHandler::new(
        endpoint,
        Arc::clone(&store),
        queue,
        config.handler_options(),
    );

    info!(
        store = ?config.store.backend,
        url_source = ?config.handler.url_source,
        malformed_policy = ?config.handler.malformed_policy,
        "compliance service ready"
    );

    Ok(Service {
        handler,
        worker,
        store,
        drain_timeout,
    })
}
