use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use workrelay_core::{result_key, KvStore, Outcome, RelayError, Result};

/// Writes handler outcomes into result slots.
pub struct ResultPublisher {
    store: Arc<dyn KvStore>,
    ttl: Duration,
}

impl ResultPublisher {
    pub fn new(store: Arc<dyn KvStore>, ttl: Duration) -> Self {
        ResultPublisher { store, ttl }
    }

    /// Publish `outcome` under `slot`.
    ///
    /// When the first write fails a string describing the failure is written
    /// instead, flagged as an error. If that write fails too the result is
    /// dropped and the error returned.
    pub async fn publish(&self, slot: &str, outcome: &Outcome) -> Result<()> {
        let key = result_key(slot);

        let reason = match self.write(&key, outcome).await {
            Ok(()) => {
                debug!(slot, "Result published");
                return Ok(());
            }
            Err(e) => e,
        };

        warn!(slot, "Could not save result, publishing failure instead: {}", reason);
        let fallback = Outcome::failure(format!(
            "Could not save return in json: {} ({})",
            outcome.result, reason
        ));

        self.write(&key, &fallback).await.map_err(|e| {
            error!(slot, "Result lost: {}", e);
            RelayError::ResultPublishFailure {
                slot: slot.to_string(),
                reason: e.to_string(),
            }
        })
    }

    async fn write(&self, key: &str, outcome: &Outcome) -> Result<()> {
        let bytes = outcome.to_bytes()?;
        self.store.set(key, bytes, Some(self.ttl)).await
    }
}
