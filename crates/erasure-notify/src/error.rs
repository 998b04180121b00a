use erasure_core::CoreError;
use thiserror::Error;

/// Error type for the erasure-notify crate.
///
/// Messages never include tokens, secrets or raw payloads; callers log the
/// payload separately at the point where it is safe to do so.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NotifyError {
    #[error("malformed notification: {0}")]
    MalformedNotification(String),

    #[error("deletion queue closed")]
    QueueClosed,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("configuration error: {0}")]
    ConfigurationError(String),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("internal error")]
    InternalError,
}

/// Result type alias for erasure-notify operations.
pub type NotifyResult<T> = Result<T, NotifyError>;
