use thiserror::Error;

use crate::adapter::AdapterError;

/// Error type for the erasure binary, aggregating the errors of the
/// workspace crates.
#[derive(Debug, Error)]
pub enum ErasureError {
    #[error("core error: {0}")]
    Core(#[from] erasure_core::CoreError),

    #[error("notification error: {0}")]
    Notify(#[from] erasure_notify::NotifyError),

    #[error("adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for ErasureError {
    fn from(e: serde_json::Error) -> Self {
        ErasureError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for ErasureError {
    fn from(e: toml::de::Error) -> Self {
        ErasureError::Config(format!("TOML parse error: {}", e))
    }
}

pub type ErasureResult<T> = Result<T, ErasureError>;
