mod async_client;
mod sync_client;

pub use async_client::{ClientConfig, RelayClient};
pub use sync_client::BlockingRelayClient;

use thiserror::Error;
use workrelay_core::RelayError;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Context must serialize to a JSON object")]
    InvalidContext,

    /// No result appeared within the poll budget. The task may still have
    /// run, or may still complete later.
    #[error("Timed out waiting for result slot {slot}")]
    Timeout { slot: String },

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ClientError>;
