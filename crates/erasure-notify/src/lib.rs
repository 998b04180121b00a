//! Erasure Notification Intake
//!
//! Everything the notification path needs behind the compliance handler:
//!
//! - Envelope parsing across JSON, form-encoded and double-encoded bodies
//! - Deduplication stores: SQLite (shared across instances) and in-memory
//! - Bounded deletion queue drained by a background worker
//! - Retry with exponential backoff and a circuit breaker around the pipeline
//! - Signed webhook client for the external deletion pipeline

pub mod circuit_breaker;
pub mod envelope;
pub mod error;
pub mod in_memory_store;
pub mod pipeline;
pub mod signing;
pub mod storage;
pub mod worker;

pub use circuit_breaker::{CircuitBreaker, CircuitState, PipelineHealth};
pub use envelope::{parse, parse_at, parse_value, parse_value_at, ACCOUNT_DELETION_TOPIC};
pub use error::{NotifyError, NotifyResult};
pub use in_memory_store::InMemoryDedupStore;
pub use pipeline::{LogPipeline, WebhookPipeline};
pub use signing::{
    sign_payload, verify_payload, PipelineSecret, SignatureHeaders, DELIVERY_ID_HEADER,
    SIGNATURE_HEADER, TIMESTAMP_HEADER,
};
pub use storage::SqliteDedupStore;
pub use worker::{
    deletion_channel, DeletionJob, DeletionQueue, DeletionWorker, JobOutcome, RetryPolicy,
    SubmitOutcome, WorkerConfig, WorkerReport,
};
