mod amqp;
mod redis_store;

pub use amqp::{AmqpBroker, AmqpConfig};
pub use redis_store::{RedisConfig, RedisStore};

use thiserror::Error;
use workrelay_core::RelayError;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl From<BackendError> for RelayError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Amqp(e) => RelayError::Broker(e.to_string()),
            BackendError::Redis(e) => RelayError::Store(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, BackendError>;

/// Strip credentials from a connection URL before logging it.
pub(crate) fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}***{}", &url[..scheme_end + 3], &url[at..])
        }
        _ => url.to_string(),
    }
}
