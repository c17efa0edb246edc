use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailure(String),

    /// Informational: the task id was already claimed by an earlier delivery.
    #[error("Duplicate delivery of task {0}")]
    DuplicateDelivery(String),

    #[error("Handler failed: {0}")]
    HandlerFailure(String),

    #[error("Could not publish result to slot {slot}: {reason}")]
    ResultPublishFailure { slot: String, reason: String },

    #[error("Configuration error: {0}")]
    ConfigurationFailure(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RelayError {
    /// Errors that can never be fixed by redelivering the same message.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RelayError::MalformedEnvelope(_)
                | RelayError::AuthenticationFailure(_)
                | RelayError::DuplicateDelivery(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
