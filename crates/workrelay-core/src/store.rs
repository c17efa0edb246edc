use crate::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Shared key/value store used for result slots, idempotency records and
/// the persisted message counter.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Unconditional write, optionally expiring after `ttl`.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;

    /// Atomic write-if-absent. Returns `true` when this call created the key.
    async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>)
        -> Result<bool>;

    /// Atomic increment, returning the new value.
    async fn incr(&self, key: &str, by: i64) -> Result<i64>;

    /// Returns `true` when a key was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn close(&self) -> Result<()>;
}
