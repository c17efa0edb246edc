use crate::{ClientError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;
use workrelay_core::{
    result_key, Broker, Context, Envelope, Headers, KvStore, Meta, Outcome, AUTH_HEADER,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Delay between two reads of a result slot
    pub poll_interval_ms: u64,
    /// Reads before giving up on a result slot
    pub poll_attempts: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            poll_interval_ms: 500,
            poll_attempts: 100,
        }
    }
}

/// Producer side of the relay: enqueue tasks and collect their results.
#[derive(Clone)]
pub struct RelayClient {
    broker: Arc<dyn Broker>,
    store: Arc<dyn KvStore>,
    worker_key: String,
    config: ClientConfig,
}

impl RelayClient {
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<dyn KvStore>,
        worker_key: impl Into<String>,
    ) -> Self {
        RelayClient {
            broker,
            store,
            worker_key: worker_key.into(),
            config: ClientConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Publish a task and return immediately.
    pub async fn enqueue<C: Serialize + ?Sized>(
        &self,
        queue: &str,
        ctx: &C,
        meta: Meta,
    ) -> Result<()> {
        let envelope = Envelope::new(to_context(ctx)?, meta);
        let body = envelope.to_bytes()?;

        let mut headers = Headers::new();
        headers.insert(AUTH_HEADER.to_string(), self.worker_key.clone());

        self.broker.publish(queue, body, headers).await?;
        debug!(queue, task_id = ?envelope.meta.task_id, "Enqueued task");
        Ok(())
    }

    /// Publish a task and wait for its outcome.
    ///
    /// A fresh result slot is allocated unless `meta` already names one.
    pub async fn enqueue_with_result<C: Serialize + ?Sized>(
        &self,
        queue: &str,
        ctx: &C,
        meta: Meta,
    ) -> Result<Outcome> {
        let meta = match meta.result_slot {
            Some(_) => meta,
            None => meta.with_result_slot(Uuid::new_v4().to_string()),
        };
        let slot = meta.result_slot.clone().unwrap_or_default();

        self.enqueue(queue, ctx, meta).await?;
        self.wait_for_result(&slot).await
    }

    /// Read a result slot once, consuming it when present.
    pub async fn fetch_result(&self, slot: &str) -> Result<Option<Outcome>> {
        let key = result_key(slot);
        let Some(bytes) = self.store.get(&key).await? else {
            return Ok(None);
        };

        let outcome = Outcome::from_bytes(&bytes)?;
        if let Err(e) = self.store.delete(&key).await {
            warn!(slot, "Failed to clear result slot: {}", e);
        }
        Ok(Some(outcome))
    }

    /// Poll a result slot until it fills or the poll budget runs out.
    pub async fn wait_for_result(&self, slot: &str) -> Result<Outcome> {
        let interval = Duration::from_millis(self.config.poll_interval_ms);

        for attempt in 0..self.config.poll_attempts {
            if attempt > 0 {
                tokio::time::sleep(interval).await;
            }
            if let Some(outcome) = self.fetch_result(slot).await? {
                debug!(slot, attempt, "Result received");
                return Ok(outcome);
            }
        }

        Err(ClientError::Timeout {
            slot: slot.to_string(),
        })
    }
}

fn to_context<C: Serialize + ?Sized>(ctx: &C) -> Result<Context> {
    match serde_json::to_value(ctx)? {
        Value::Object(map) => Ok(map),
        _ => Err(ClientError::InvalidContext),
    }
}
