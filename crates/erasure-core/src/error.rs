use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("invalid notification id: {0}")]
    InvalidNotificationId(String),

    #[error("request is missing a host header")]
    MissingHost,

    #[error("invalid endpoint url: {0}")]
    InvalidEndpointUrl(String),

    #[error("storage error: {0}")]
    Storage(String),

    /// Transient failure of a collaborator; the caller may retry.
    #[error("downstream unavailable: {0}")]
    DownstreamUnavailable(String),

    /// The collaborator refused the request; retrying will not help.
    #[error("downstream rejected request: {0}")]
    DownstreamRejected(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Serialization(e.to_string())
    }
}

impl CoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::DownstreamUnavailable(_) | CoreError::Storage(_)
        )
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
