//! In-process broker and store.
//!
//! Both keep the semantics the engine relies on (independent acknowledgement,
//! expiry, atomic set-if-absent) so the worker can run embedded or under test
//! without RabbitMQ or Redis.

use crate::transport::{Acknowledger, Broker, Delivery, Headers, Subscription};
use crate::{KvStore, RelayError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

struct QueueSlot {
    tx: mpsc::UnboundedSender<Delivery>,
    rx: Option<mpsc::UnboundedReceiver<Delivery>>,
}

impl QueueSlot {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        QueueSlot { tx, rx: Some(rx) }
    }
}

#[derive(Default)]
struct BrokerInner {
    queues: Mutex<HashMap<String, QueueSlot>>,
    acks: Mutex<HashMap<u64, u32>>,
    next_tag: AtomicU64,
    subscriptions: AtomicUsize,
    closed: AtomicBool,
}

/// Broker backed by unbounded channels, one per queue.
///
/// Each queue accepts a single subscriber. Deliveries are handed out in
/// publish order; the consumer loop processes them one at a time, which is
/// the prefetch-1 behaviour of a real broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish and return the delivery tag assigned to the message.
    pub fn publish_raw(&self, queue: &str, body: Vec<u8>, headers: Headers) -> Result<u64> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(RelayError::Broker("broker is closed".to_string()));
        }

        let tag = self.inner.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
        let acker = Arc::new(MemoryAcker {
            tag,
            broker: Arc::downgrade(&self.inner),
        });
        let delivery = Delivery::new(tag, body, headers, acker);

        let mut queues = self.inner.queues.lock();
        let slot = queues
            .entry(queue.to_string())
            .or_insert_with(QueueSlot::new);
        slot.tx
            .send(delivery)
            .map_err(|_| RelayError::Broker(format!("queue {} is gone", queue)))?;

        debug!(queue, tag, "Published message");
        Ok(tag)
    }

    /// Number of times the delivery with `tag` was acknowledged.
    pub fn ack_count(&self, tag: u64) -> u32 {
        self.inner.acks.lock().get(&tag).copied().unwrap_or(0)
    }

    pub fn is_acked(&self, tag: u64) -> bool {
        self.ack_count(tag) > 0
    }

    pub fn total_acks(&self) -> u32 {
        self.inner.acks.lock().values().sum()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn subscribe(&self, queue: &str, _prefetch: u16) -> Result<Box<dyn Subscription>> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(RelayError::Broker("broker is closed".to_string()));
        }

        let rx = {
            let mut queues = self.inner.queues.lock();
            let slot = queues
                .entry(queue.to_string())
                .or_insert_with(QueueSlot::new);
            slot.rx.take().ok_or_else(|| {
                RelayError::Broker(format!("queue {} already has a subscriber", queue))
            })?
        };

        self.inner.subscriptions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySubscription { rx }))
    }

    async fn publish(&self, queue: &str, body: Vec<u8>, headers: Headers) -> Result<()> {
        self.publish_raw(queue, body, headers).map(|_| ())
    }

    async fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        // Dropping the senders ends every open subscription once drained.
        self.inner.queues.lock().clear();
        Ok(())
    }
}

struct MemorySubscription {
    rx: mpsc::UnboundedReceiver<Delivery>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_delivery(&mut self) -> Option<Result<Delivery>> {
        self.rx.recv().await.map(Ok)
    }
}

struct MemoryAcker {
    tag: u64,
    broker: Weak<BrokerInner>,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        let broker = self
            .broker
            .upgrade()
            .ok_or_else(|| RelayError::Broker("broker dropped before ack".to_string()))?;
        *broker.acks.lock().entry(self.tag).or_insert(0) += 1;
        Ok(())
    }
}

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Default)]
struct StoreInner {
    entries: Mutex<HashMap<String, Entry>>,
    failing_writes: AtomicUsize,
    writes: AtomicU64,
    closed: AtomicBool,
}

/// Key/value store with per-key expiry, driven by the tokio clock.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` write operations fail with a store error.
    pub fn fail_next_writes(&self, count: usize) {
        self.inner.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Number of successful writes since creation.
    pub fn write_count(&self) -> u64 {
        self.inner.writes.load(Ordering::SeqCst)
    }

    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.inner
            .entries
            .lock()
            .get(key)
            .map_or(false, |entry| entry.is_live(now))
    }

    /// Remaining time to live of `key`, `None` when absent or persistent.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.inner
            .entries
            .lock()
            .get(key)
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn begin_write(&self) -> Result<()> {
        let injected = self
            .inner
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(RelayError::Store("injected write failure".to_string()));
        }
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(RelayError::Store("store is closed".to_string()));
        }
        Ok(())
    }

    fn expiry(ttl: Option<Duration>) -> Option<Instant> {
        ttl.map(|ttl| Instant::now() + ttl)
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = Instant::now();
        let mut entries = self.inner.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        self.begin_write()?;
        self.inner.entries.lock().insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Self::expiry(ttl),
            },
        );
        self.inner.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        self.begin_write()?;
        let now = Instant::now();
        let mut entries = self.inner.entries.lock();
        if entries.get(key).map_or(false, |entry| entry.is_live(now)) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Self::expiry(ttl),
            },
        );
        self.inner.writes.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn incr(&self, key: &str, by: i64) -> Result<i64> {
        self.begin_write()?;
        let now = Instant::now();
        let mut entries = self.inner.entries.lock();
        let current = match entries.get(key) {
            Some(entry) if entry.is_live(now) => std::str::from_utf8(&entry.value)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or_else(|| RelayError::Store(format!("value at {} is not an integer", key)))?,
            _ => 0,
        };
        let next = current + by;
        entries.insert(
            key.to_string(),
            Entry {
                value: next.to_string().into_bytes(),
                expires_at: None,
            },
        );
        self.inner.writes.fetch_add(1, Ordering::SeqCst);
        Ok(next)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.inner.entries.lock().remove(key).is_some())
    }

    async fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
