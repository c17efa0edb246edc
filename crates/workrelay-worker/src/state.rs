use crate::auth::Authenticator;
use crate::config::WorkerConfig;
use crate::handler::HandlerRegistry;
use crate::idempotency::IdempotencyTracker;
use crate::metrics::WorkerMetrics;
use crate::publisher::ResultPublisher;
use crate::stats::Stats;
use crate::worker::Lifecycle;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{info, warn};
use uuid::Uuid;
use workrelay_client::RelayClient;
use workrelay_core::{Broker, KvStore, RelayError, TOTAL_MESSAGES_KEY};

/// A handler invocation currently in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunningTask {
    pub queue: String,
    pub task_id: Option<String>,
    pub started_at: DateTime<Utc>,
}

struct Tracked {
    task: RunningTask,
    abort: AbortHandle,
}

/// State shared by every consumer loop and handler of one worker.
pub struct WorkerState {
    worker_id: String,
    config: WorkerConfig,
    broker: Arc<dyn Broker>,
    store: Arc<dyn KvStore>,
    registry: Arc<HandlerRegistry>,
    hooks: Arc<dyn Lifecycle>,
    client: RelayClient,

    authenticator: Authenticator,
    tracker: IdempotencyTracker,
    publisher: ResultPublisher,

    stats: Stats,
    metrics: WorkerMetrics,
    running: DashMap<Uuid, Tracked>,

    preparations: OnceCell<Value>,
    started_at: DateTime<Utc>,
    load_time: OnceCell<Duration>,
}

impl WorkerState {
    pub(crate) fn new(
        config: WorkerConfig,
        broker: Arc<dyn Broker>,
        store: Arc<dyn KvStore>,
        registry: Arc<HandlerRegistry>,
        hooks: Arc<dyn Lifecycle>,
    ) -> Result<Self, RelayError> {
        let metrics = WorkerMetrics::new()
            .map_err(|e| RelayError::ConfigurationFailure(format!("metrics: {}", e)))?;

        Ok(WorkerState {
            worker_id: config.generate_worker_id(),
            authenticator: Authenticator::new(&config.worker_key),
            tracker: IdempotencyTracker::new(store.clone(), config.idempotency_ttl()),
            publisher: ResultPublisher::new(store.clone(), config.result_ttl()),
            client: RelayClient::new(broker.clone(), store.clone(), config.worker_key.clone()),
            config,
            broker,
            store,
            registry,
            hooks,
            stats: Stats::new(),
            metrics,
            running: DashMap::new(),
            preparations: OnceCell::new(),
            started_at: Utc::now(),
            load_time: OnceCell::new(),
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn hooks(&self) -> &Arc<dyn Lifecycle> {
        &self.hooks
    }

    /// Client for enqueueing follow-up tasks from inside a handler
    pub fn client(&self) -> &RelayClient {
        &self.client
    }

    pub fn authenticator(&self) -> &Authenticator {
        &self.authenticator
    }

    pub fn tracker(&self) -> &IdempotencyTracker {
        &self.tracker
    }

    pub fn publisher(&self) -> &ResultPublisher {
        &self.publisher
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn metrics(&self) -> &WorkerMetrics {
        &self.metrics
    }

    /// Whatever the prepare hook produced, if anything
    pub fn preparations(&self) -> Option<&Value> {
        self.preparations.get()
    }

    pub(crate) fn set_preparations(&self, value: Value) {
        if self.preparations.set(value).is_err() {
            warn!("Preparations already set, keeping the first value");
        }
    }

    pub(crate) fn track_running(
        &self,
        queue: &str,
        task_id: Option<&str>,
        abort: AbortHandle,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let task = RunningTask {
            queue: queue.to_string(),
            task_id: task_id.map(str::to_string),
            started_at: Utc::now(),
        };
        self.running.insert(id, Tracked { task, abort });
        id
    }

    pub(crate) fn finish_running(&self, id: &Uuid) {
        self.running.remove(id);
    }

    /// Abort every handler still in flight. Returns how many were aborted.
    pub(crate) fn abort_running(&self) -> usize {
        let ids: Vec<Uuid> = self.running.iter().map(|e| *e.key()).collect();
        let mut aborted = 0;
        for id in ids {
            if let Some((_, tracked)) = self.running.remove(&id) {
                tracked.abort.abort();
                aborted += 1;
            }
        }
        aborted
    }

    pub fn running_tasks(&self) -> Vec<RunningTask> {
        let mut tasks: Vec<RunningTask> =
            self.running.iter().map(|e| e.value().task.clone()).collect();
        tasks.sort_by_key(|t| t.started_at);
        tasks
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn load_time(&self) -> Option<Duration> {
        self.load_time.get().copied()
    }

    pub(crate) fn mark_loaded(&self, elapsed: Duration) {
        let _ = self.load_time.set(elapsed);
    }

    /// Seed the running total from the store. A missing or unreadable value
    /// leaves the total at zero.
    pub(crate) async fn restore_total(&self) {
        match self.store.get(TOTAL_MESSAGES_KEY).await {
            Ok(Some(bytes)) => {
                let parsed = std::str::from_utf8(&bytes)
                    .ok()
                    .and_then(|s| s.trim().parse().ok());
                match parsed {
                    Some(total) => {
                        self.stats.restore_total(total);
                        info!("Restored message total: {}", total);
                    }
                    None => warn!("Ignoring unparsable message total in store"),
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Could not restore message total: {}", e),
        }
    }

    /// Bump the persisted running total by one handled message.
    pub(crate) async fn persist_total(&self) {
        if let Err(e) = self.store.incr(TOTAL_MESSAGES_KEY, 1).await {
            warn!("Could not persist message total: {}", e);
        }
    }

    /// Counters plus identity and timing, as served by `/stats` and the
    /// `get_stats` admin operation.
    pub fn stats_report(&self) -> Value {
        let snapshot = self.stats.snapshot();
        let uptime = (Utc::now() - self.started_at).num_seconds().max(0);

        json!({
            "worker_id": self.worker_id,
            "queues": self.registry.queues(),
            "seen": snapshot.seen,
            "handled": snapshot.handled,
            "errors": snapshot.errors,
            "total_msgs": snapshot.total_msgs,
            "failed_unacked": snapshot.failed_unacked,
            "running": self.running.len(),
            "started_at": self.started_at.to_rfc3339(),
            "uptime_secs": uptime,
            "load_time_ms": self.load_time().map(|d| d.as_millis() as u64),
        })
    }
}
