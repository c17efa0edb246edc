use dashmap::DashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use workrelay_core::{task_key, KvStore, Result};

const MARKER: &[u8] = b"1";

/// Records which task ids have already been processed.
///
/// Claims taken by this worker stay in `held` until the delivery that took
/// them is acknowledged or released, so a worker stopped mid-message can
/// hand its unfinished task ids back.
pub struct IdempotencyTracker {
    store: Arc<dyn KvStore>,
    retention: Option<Duration>,
    held: DashSet<String>,
}

impl IdempotencyTracker {
    pub fn new(store: Arc<dyn KvStore>, retention: Option<Duration>) -> Self {
        IdempotencyTracker {
            store,
            retention,
            held: DashSet::new(),
        }
    }

    pub async fn seen(&self, task_id: &str) -> Result<bool> {
        Ok(self.store.get(&task_key(task_id)).await?.is_some())
    }

    pub async fn mark(&self, task_id: &str) -> Result<()> {
        self.store
            .set(&task_key(task_id), MARKER.to_vec(), self.retention)
            .await
    }

    /// Atomically mark `task_id`, returning `false` when it was already
    /// marked. Two consumers racing on the same id get one `true`.
    pub async fn claim(&self, task_id: &str) -> Result<bool> {
        let claimed = self
            .store
            .set_if_absent(&task_key(task_id), MARKER.to_vec(), self.retention)
            .await?;
        if claimed {
            self.held.insert(task_id.to_string());
        }
        Ok(claimed)
    }

    /// The delivery holding `task_id` was acknowledged; the marker stays.
    pub fn settle(&self, task_id: &str) {
        self.held.remove(task_id);
    }

    /// Forget a claim so a redelivery of the task is processed again.
    pub async fn release(&self, task_id: &str) -> Result<()> {
        self.held.remove(task_id);
        self.store.delete(&task_key(task_id)).await.map(|_| ())
    }

    /// Task ids claimed by deliveries that are neither acknowledged nor
    /// released yet.
    pub fn held(&self) -> Vec<String> {
        let mut held: Vec<String> = self.held.iter().map(|id| id.key().clone()).collect();
        held.sort();
        held
    }

    /// Release every claim still held. Returns how many were released.
    pub async fn release_held(&self) -> usize {
        let mut released = 0;
        for task_id in self.held() {
            match self.release(&task_id).await {
                Ok(()) => released += 1,
                Err(e) => warn!(task_id, "Could not release idempotency claim: {}", e),
            }
        }
        released
    }
}
