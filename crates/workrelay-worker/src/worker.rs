use crate::admin::{admin_entry, ADMIN_QUEUE};
use crate::config::WorkerConfig;
use crate::consumer::QueueConsumer;
use crate::handler::HandlerRegistry;
use crate::metrics::start_metrics_server;
use crate::state::WorkerState;
use crate::stats::HandlerFault;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use workrelay_core::{Broker, KvStore, RelayError, Result};

/// Phase of a started worker, as reported by [`WorkerHandle::phase`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    Running,
    Stopping,
    Stopped,
}

/// Connections handed over by the startup hook. Both are required.
#[derive(Default, Clone)]
pub struct Connections {
    pub broker: Option<Arc<dyn Broker>>,
    pub store: Option<Arc<dyn KvStore>>,
}

impl Connections {
    pub fn new(broker: Arc<dyn Broker>, store: Arc<dyn KvStore>) -> Self {
        Connections {
            broker: Some(broker),
            store: Some(store),
        }
    }
}

/// Hooks run at fixed points of the worker lifecycle.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    /// Open the broker and store connections.
    async fn on_startup(&self, config: &WorkerConfig) -> anyhow::Result<Connections>;

    /// Runs once the state exists, before any queue is consumed. The value
    /// returned is available to handlers as preparations.
    async fn on_prepare(&self, _state: &WorkerState) -> anyhow::Result<Option<Value>> {
        Ok(None)
    }

    async fn on_stop(&self, _state: &WorkerState) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called for every handler failure, after the outcome is decided.
    async fn on_error(&self, _state: &WorkerState, _fault: &HandlerFault) {}
}

/// Lifecycle hooks over connections opened by the caller.
pub struct Preconnected {
    connections: Connections,
}

impl Preconnected {
    pub fn new(broker: Arc<dyn Broker>, store: Arc<dyn KvStore>) -> Self {
        Preconnected {
            connections: Connections::new(broker, store),
        }
    }
}

#[async_trait]
impl Lifecycle for Preconnected {
    async fn on_startup(&self, _config: &WorkerConfig) -> anyhow::Result<Connections> {
        Ok(self.connections.clone())
    }
}

/// A worker consuming every registered queue.
pub struct Worker {
    config: WorkerConfig,
    registry: HandlerRegistry,
    hooks: Arc<dyn Lifecycle>,
}

impl Worker {
    pub fn new<L: Lifecycle + 'static>(
        config: WorkerConfig,
        registry: HandlerRegistry,
        hooks: L,
    ) -> Self {
        Worker {
            config,
            registry,
            hooks: Arc::new(hooks),
        }
    }

    /// Bring the worker up: connect, restore counters, prepare, then open
    /// one subscription per registered queue.
    ///
    /// Nothing is consumed if the startup hook fails or leaves a connection
    /// unset.
    pub async fn start(self) -> Result<WorkerHandle> {
        let started = Instant::now();
        let Worker {
            config,
            mut registry,
            hooks,
        } = self;

        if config.worker_key.is_empty() {
            return Err(RelayError::ConfigurationFailure(
                "worker_key must not be empty".to_string(),
            ));
        }

        info!("Starting worker");

        let connections = hooks.on_startup(&config).await.map_err(|e| {
            RelayError::ConfigurationFailure(format!("startup hook failed: {:#}", e))
        })?;

        let broker = connections.broker.ok_or_else(|| {
            RelayError::ConfigurationFailure("startup hook did not provide a broker".to_string())
        })?;
        let store = connections.store.ok_or_else(|| {
            RelayError::ConfigurationFailure("startup hook did not provide a store".to_string())
        })?;

        if config.admin_enabled && !registry.has_handler(ADMIN_QUEUE) {
            registry.register(admin_entry())?;
        }
        if registry.is_empty() {
            warn!("No handlers registered, the worker will sit idle");
        }

        let state = Arc::new(WorkerState::new(
            config.clone(),
            broker.clone(),
            store.clone(),
            Arc::new(registry),
            hooks.clone(),
        )?);

        if config.restore_total {
            state.restore_total().await;
        }

        match hooks.on_prepare(&state).await {
            Ok(Some(preparations)) => state.set_preparations(preparations),
            Ok(None) => {}
            Err(e) => {
                let _ = broker.close().await;
                let _ = store.close().await;
                return Err(RelayError::ConfigurationFailure(format!(
                    "prepare hook failed: {:#}",
                    e
                )));
            }
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut loops = Vec::new();

        for entry in state.registry().entries() {
            let subscription = match broker.subscribe(&entry.queue, config.prefetch).await {
                Ok(subscription) => subscription,
                Err(e) => {
                    error!(queue = %entry.queue, "Subscribe failed: {}", e);
                    let _ = shutdown_tx.send(true);
                    let _ = broker.close().await;
                    let _ = store.close().await;
                    return Err(e);
                }
            };

            let consumer = QueueConsumer::new(state.clone(), entry.clone());
            let handle = tokio::spawn(consumer.run(subscription, shutdown_rx.clone()));
            loops.push((entry.queue.clone(), handle));
        }

        let metrics_server = config.metrics_port.map(|port| {
            let state = state.clone();
            tokio::spawn(async move {
                if let Err(e) = start_metrics_server(state, port).await {
                    error!("Metrics server error: {}", e);
                }
            })
        });

        state.mark_loaded(started.elapsed());
        info!(
            "Worker {} up in {:?}, consuming {:?}",
            state.worker_id(),
            started.elapsed(),
            state.registry().queues()
        );

        Ok(WorkerHandle {
            state,
            shutdown_tx,
            loops,
            metrics_server,
            phase: LifecyclePhase::Running,
        })
    }

    /// Start, then run until Ctrl-C or until every consumer has stopped.
    pub async fn run(self) -> Result<()> {
        let mut handle = self.start().await?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received shutdown signal"),
            _ = handle.closed() => warn!("All consumers stopped"),
        }

        handle.shutdown().await
    }
}

/// A started worker.
pub struct WorkerHandle {
    state: Arc<WorkerState>,
    shutdown_tx: watch::Sender<bool>,
    loops: Vec<(String, JoinHandle<()>)>,
    metrics_server: Option<JoinHandle<()>>,
    phase: LifecyclePhase,
}

impl WorkerHandle {
    pub fn state(&self) -> &Arc<WorkerState> {
        &self.state
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.phase
    }

    /// Wait until every consumer loop has ended.
    pub async fn closed(&mut self) {
        while let Some((queue, handle)) = self.loops.last_mut() {
            if let Err(e) = handle.await {
                error!(queue = %queue, "Consumer task failed: {}", e);
            }
            self.loops.pop();
        }
    }

    /// Stop consuming, let in-flight messages finish (up to the graceful
    /// shutdown timeout), run the stop hook, then close the connections.
    ///
    /// Past the deadline, consumers and handlers still running are aborted
    /// and the idempotency claims of their messages are released, so the
    /// broker's redelivery is processed instead of skipped as a duplicate.
    pub async fn shutdown(&mut self) -> Result<()> {
        if self.phase == LifecyclePhase::Stopped {
            return Ok(());
        }

        self.phase = LifecyclePhase::Stopping;
        info!("Stopping worker {}", self.state.worker_id());
        let _ = self.shutdown_tx.send(true);

        let timeout = Duration::from_secs(self.state.config().graceful_shutdown_timeout_secs);
        let mut loops = std::mem::take(&mut self.loops);
        let joined = futures::future::join_all(loops.iter_mut().map(|(_, h)| h));

        if tokio::time::timeout(timeout, joined).await.is_err() {
            warn!("Shutdown deadline exceeded, aborting {} consumers", loops.len());
            for (_, handle) in &loops {
                handle.abort();
            }
            for (_, handle) in loops.iter_mut().filter(|(_, h)| !h.is_finished()) {
                let _ = handle.await;
            }

            let aborted = self.state.abort_running();
            if aborted > 0 {
                warn!("Aborted {} running handlers", aborted);
            }
        }

        let released = self.state.tracker().release_held().await;
        if released > 0 {
            warn!("Released {} idempotency claims of unfinished messages", released);
        }

        if let Some(server) = self.metrics_server.take() {
            server.abort();
        }

        if let Err(e) = self.state.hooks().on_stop(&self.state).await {
            warn!("Stop hook failed: {:#}", e);
        }

        let broker_closed = self.state.broker().close().await;
        let store_closed = self.state.store().close().await;

        self.phase = LifecyclePhase::Stopped;
        info!(
            "Worker stopped after {} messages ({} errors)",
            self.state.stats().handled(),
            self.state.stats().errors()
        );

        broker_closed.and(store_closed)
    }
}
