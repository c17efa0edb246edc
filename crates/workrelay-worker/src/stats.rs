use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{info, warn};
use workrelay_core::{Delivery, Envelope, RelayError};

const MAX_FAULTS: usize = 1000;

/// A message whose handler failed on a queue without ack-all. It stays
/// unacknowledged until cured.
#[derive(Debug, Clone)]
pub struct FailedMessage {
    pub queue: String,
    pub task_id: Option<String>,
    pub description: String,
    pub failed_at: DateTime<Utc>,
    pub delivery: Delivery,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedSummary {
    pub index: usize,
    pub queue: String,
    pub task_id: Option<String>,
    pub description: String,
    pub failed_at: DateTime<Utc>,
}

/// A handler failure, kept for introspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerFault {
    pub queue: String,
    pub description: String,
    pub envelope: Envelope,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Error, Debug)]
pub enum CureError {
    #[error("No failed message at index {0}")]
    NoSuchMessage(usize),

    #[error("Acknowledge failed: {0}")]
    Ack(#[from] RelayError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub seen: u64,
    pub handled: u64,
    pub errors: u64,
    pub total_msgs: u64,
    pub failed_unacked: usize,
}

/// Worker counters and failure ledgers.
///
/// Locks are never held across an await point; acknowledgements happen after
/// the entry has left the ledger.
#[derive(Default)]
pub struct Stats {
    seen: AtomicU64,
    handled: AtomicU64,
    errors: AtomicU64,
    total_msgs: AtomicU64,
    failed: Mutex<Vec<FailedMessage>>,
    faults: Mutex<Vec<HandlerFault>>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a received message, returning its 1-based sequence number.
    pub fn record_seen(&self) -> u64 {
        self.seen.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn record_handled(&self) {
        self.handled.fetch_add(1, Ordering::SeqCst);
        self.total_msgs.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }

    /// Seed the running total with the value persisted by earlier runs.
    pub fn restore_total(&self, total: u64) {
        self.total_msgs.store(total, Ordering::SeqCst);
    }

    pub fn seen(&self) -> u64 {
        self.seen.load(Ordering::SeqCst)
    }

    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::SeqCst)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::SeqCst)
    }

    pub fn total_msgs(&self) -> u64 {
        self.total_msgs.load(Ordering::SeqCst)
    }

    pub fn push_failed(&self, failed: FailedMessage) {
        self.failed.lock().push(failed);
    }

    pub fn failed_count(&self) -> usize {
        self.failed.lock().len()
    }

    pub fn failed_summaries(&self) -> Vec<FailedSummary> {
        self.failed
            .lock()
            .iter()
            .enumerate()
            .map(|(index, f)| FailedSummary {
                index,
                queue: f.queue.clone(),
                task_id: f.task_id.clone(),
                description: f.description.clone(),
                failed_at: f.failed_at,
            })
            .collect()
    }

    pub fn record_fault(&self, fault: HandlerFault) {
        let mut faults = self.faults.lock();
        if faults.len() >= MAX_FAULTS {
            faults.remove(0);
        }
        faults.push(fault);
    }

    pub fn faults(&self) -> Vec<HandlerFault> {
        self.faults.lock().clone()
    }

    /// Acknowledge the failed message at `index` and drop it from the ledger.
    ///
    /// The error counter goes down by one. If the acknowledgement fails the
    /// entry goes back to its position.
    pub async fn cure(&self, index: usize) -> Result<(), CureError> {
        let failed = {
            let mut ledger = self.failed.lock();
            if index >= ledger.len() {
                return Err(CureError::NoSuchMessage(index));
            }
            ledger.remove(index)
        };

        if let Err(e) = failed.delivery.ack().await {
            warn!("Failed to acknowledge cured message {}: {}", index, e);
            let mut ledger = self.failed.lock();
            let position = index.min(ledger.len());
            ledger.insert(position, failed);
            return Err(e.into());
        }

        self.decrement_errors();
        info!(queue = %failed.queue, "Cured failed message {}", index);
        Ok(())
    }

    /// Cure every failed message, returning how many were acknowledged.
    pub async fn cure_all(&self) -> usize {
        let pending = std::mem::take(&mut *self.failed.lock());
        let mut cured = 0;
        let mut kept = Vec::new();

        for failed in pending {
            match failed.delivery.ack().await {
                Ok(()) => {
                    self.decrement_errors();
                    cured += 1;
                }
                Err(e) => {
                    warn!(queue = %failed.queue, "Failed to acknowledge cured message: {}", e);
                    kept.push(failed);
                }
            }
        }

        if !kept.is_empty() {
            let mut ledger = self.failed.lock();
            kept.append(&mut ledger);
            *ledger = kept;
        }

        info!("Cured {} failed messages", cured);
        cured
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            seen: self.seen(),
            handled: self.handled(),
            errors: self.errors(),
            total_msgs: self.total_msgs(),
            failed_unacked: self.failed_count(),
        }
    }

    fn decrement_errors(&self) {
        let _ = self
            .errors
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}
