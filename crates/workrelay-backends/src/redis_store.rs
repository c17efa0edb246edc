use crate::{redact_url, BackendError, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};
use workrelay_core::KvStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        RedisConfig {
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

/// Redis-backed store using a multiplexed, auto-reconnecting connection.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str())?;
        let connection = ConnectionManager::new(client).await?;

        info!(url = %redact_url(&config.url), "Connected to Redis");
        Ok(RedisStore { connection })
    }
}

/// Redis expiries are whole seconds, never zero.
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> workrelay_core::Result<Option<Vec<u8>>> {
        let mut conn = self.connection.clone();
        let value = redis::cmd("GET")
            .arg(key)
            .query_async::<Option<Vec<u8>>>(&mut conn)
            .await
            .map_err(BackendError::from)?;
        Ok(value)
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> workrelay_core::Result<()> {
        let mut conn = self.connection.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl_secs(ttl));
        }
        cmd.query_async::<()>(&mut conn)
            .await
            .map_err(BackendError::from)?;

        debug!(key, "SET");
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> workrelay_core::Result<bool> {
        let mut conn = self.connection.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl_secs(ttl));
        }
        // Nil reply when the key already existed
        let reply = cmd
            .query_async::<Option<String>>(&mut conn)
            .await
            .map_err(BackendError::from)?;
        Ok(reply.is_some())
    }

    async fn incr(&self, key: &str, by: i64) -> workrelay_core::Result<i64> {
        let mut conn = self.connection.clone();
        let value = redis::cmd("INCRBY")
            .arg(key)
            .arg(by)
            .query_async::<i64>(&mut conn)
            .await
            .map_err(BackendError::from)?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> workrelay_core::Result<bool> {
        let mut conn = self.connection.clone();
        let removed = redis::cmd("DEL")
            .arg(key)
            .query_async::<i64>(&mut conn)
            .await
            .map_err(BackendError::from)?;
        Ok(removed > 0)
    }

    async fn close(&self) -> workrelay_core::Result<()> {
        // The connection manager closes its socket when the last clone drops.
        debug!("Releasing Redis connection");
        Ok(())
    }
}
