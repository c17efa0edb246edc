use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use workrelay_client::{ClientConfig, RelayClient};
use workrelay_core::{
    result_key, task_key, Context, Envelope, Headers, KvStore, MemoryBroker, MemoryStore, Meta,
    Outcome, RelayError, Result, AUTH_HEADER, TOTAL_MESSAGES_KEY,
};
use workrelay_worker::handler::SleepHandler;
use workrelay_worker::{
    handler_fn, Connections, HandlerEntry, HandlerError, HandlerOutput, HandlerRegistry,
    Lifecycle, LifecyclePhase, Preconnected, Worker, WorkerConfig, WorkerHandle, WorkerState,
    ADMIN_QUEUE,
};

const KEY: &str = "s3cret";

fn config() -> WorkerConfig {
    WorkerConfig {
        worker_key: KEY.to_string(),
        graceful_shutdown_timeout_secs: 5,
        ..Default::default()
    }
}

fn client(broker: &MemoryBroker, store: &MemoryStore) -> RelayClient {
    RelayClient::new(Arc::new(broker.clone()), Arc::new(store.clone()), KEY).with_config(
        ClientConfig {
            poll_interval_ms: 10,
            poll_attempts: 300,
        },
    )
}

fn body(ctx: Value, meta: Meta) -> Vec<u8> {
    let ctx: Context = serde_json::from_value(ctx).unwrap();
    Envelope::new(ctx, meta).to_bytes().unwrap()
}

fn auth(key: &str) -> Headers {
    let mut headers = Headers::new();
    headers.insert(AUTH_HEADER.to_string(), key.to_string());
    headers
}

async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("Timed out waiting for {}", what);
}

async fn start(
    broker: &MemoryBroker,
    store: &MemoryStore,
    registry: HandlerRegistry,
) -> WorkerHandle {
    Worker::new(
        config(),
        registry,
        Preconnected::new(Arc::new(broker.clone()), Arc::new(store.clone())),
    )
    .start()
    .await
    .unwrap()
}

fn double_registry(calls: Arc<AtomicUsize>) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry
        .register_fn("double", move |ctx| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let x = ctx
                    .field("x")
                    .and_then(Value::as_i64)
                    .ok_or_else(|| HandlerError::new("KeyError", "x"))?;
                Ok(HandlerOutput::Value(json!(x * 2)))
            }
        })
        .unwrap();
    registry
}

fn flaky_registry(ack_all: bool) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    let entry = HandlerEntry::new(
        "flaky",
        handler_fn(|_ctx| async { Err(HandlerError::new("ValueError", "boom")) }),
    )
    .with_ack_all(ack_all);
    registry.register(entry).unwrap();
    registry
}

#[tokio::test]
async fn test_double_roundtrip() {
    let broker = MemoryBroker::new();
    let store = MemoryStore::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut worker = start(&broker, &store, double_registry(calls.clone())).await;

    let outcome = client(&broker, &store)
        .enqueue_with_result(
            "double",
            &json!({"x": 21}),
            Meta::default().with_task_id("t1").with_result_slot("r1"),
        )
        .await
        .unwrap();

    assert_eq!(outcome, Outcome::success(json!(42)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let state = worker.state().clone();
    eventually("handled", || state.stats().handled() == 1).await;
    assert_eq!(broker.total_acks(), 1);
    let stats = state.stats().snapshot();
    assert_eq!(stats.seen, 1);
    assert_eq!(stats.handled, 1);
    assert_eq!(stats.errors, 0);

    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_redelivered_task_runs_once() {
    let broker = MemoryBroker::new();
    let store = MemoryStore::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut worker = start(&broker, &store, double_registry(calls.clone())).await;

    let message = body(json!({"x": 1}), Meta::default().with_task_id("t1").with_result_slot("r1"));
    let first = broker.publish_raw("double", message.clone(), auth(KEY)).unwrap();

    let state = worker.state().clone();
    eventually("first handled", || {
        state.stats().handled() == 1 && store.contains(TOTAL_MESSAGES_KEY)
    })
    .await;
    assert!(broker.is_acked(first));
    let stored = store.get(&result_key("r1")).await.unwrap().unwrap();
    assert_eq!(Outcome::from_bytes(&stored).unwrap(), Outcome::success(json!(2)));
    let writes = store.write_count();

    let second = broker.publish_raw("double", message, auth(KEY)).unwrap();
    eventually("second ack", || broker.is_acked(second)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(state.stats().seen(), 2);
    assert_eq!(state.stats().handled(), 1);
    assert_eq!(store.get(&result_key("r1")).await.unwrap(), Some(stored));
    assert_eq!(store.write_count(), writes);

    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failed_message_stays_unacked_until_cured() {
    let broker = MemoryBroker::new();
    let store = MemoryStore::new();
    let mut worker = start(&broker, &store, flaky_registry(false)).await;

    let tag = broker
        .publish_raw("flaky", body(json!({}), Meta::default().with_result_slot("r9")), auth(KEY))
        .unwrap();

    let state = worker.state().clone();
    eventually("failed ledger entry", || state.stats().failed_count() == 1).await;
    assert!(!broker.is_acked(tag));
    assert_eq!(state.stats().errors(), 1);

    // The caller still learns about the failure.
    let failure = client(&broker, &store).wait_for_result("r9").await.unwrap();
    assert!(failure.is_error);
    assert_eq!(failure.result, json!("ValueError: boom"));

    let cured = client(&broker, &store)
        .enqueue_with_result(ADMIN_QUEUE, &json!({}), Meta::default().with_op("cure_all"))
        .await
        .unwrap();
    assert_eq!(cured.result["cured"], json!(1));

    assert_eq!(broker.ack_count(tag), 1);
    assert_eq!(state.stats().errors(), 0);
    assert_eq!(state.stats().failed_count(), 0);

    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_ack_all_acks_failure_exactly_once() {
    let broker = MemoryBroker::new();
    let store = MemoryStore::new();
    let mut worker = start(&broker, &store, flaky_registry(true)).await;

    let tag = broker
        .publish_raw("flaky", body(json!({}), Meta::default()), auth(KEY))
        .unwrap();

    eventually("handled", || worker.state().stats().handled() == 1).await;
    assert_eq!(broker.ack_count(tag), 1);
    assert_eq!(worker.state().stats().failed_count(), 0);
    assert_eq!(worker.state().stats().errors(), 1);

    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_bad_auth_never_reaches_handler() {
    let broker = MemoryBroker::new();
    let store = MemoryStore::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut worker = start(&broker, &store, double_registry(calls.clone())).await;

    let tag = broker
        .publish_raw(
            "double",
            body(json!({"x": 1}), Meta::default().with_result_slot("r1")),
            auth("wrong"),
        )
        .unwrap();

    eventually("ack", || broker.is_acked(tag)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(worker.state().stats().errors(), 1);
    assert!(!store.contains(&result_key("r1")));

    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_malformed_message_is_dropped() {
    let broker = MemoryBroker::new();
    let store = MemoryStore::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut worker = start(&broker, &store, double_registry(calls.clone())).await;

    let garbage = broker.publish_raw("double", b"{\"ctx\":".to_vec(), auth(KEY)).unwrap();
    let wrong_version = broker
        .publish_raw("double", br#"{"ctx":{"x":1},"meta":{"pv":99}}"#.to_vec(), auth(KEY))
        .unwrap();

    eventually("acks", || broker.is_acked(garbage) && broker.is_acked(wrong_version)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(worker.state().stats().handled(), 0);

    worker.shutdown().await.unwrap();
}

struct MissingStore {
    broker: MemoryBroker,
}

#[async_trait]
impl Lifecycle for MissingStore {
    async fn on_startup(&self, _config: &WorkerConfig) -> anyhow::Result<Connections> {
        Ok(Connections {
            broker: Some(Arc::new(self.broker.clone())),
            store: None,
        })
    }
}

#[tokio::test]
async fn test_startup_without_store_fails() {
    let broker = MemoryBroker::new();
    let worker = Worker::new(
        config(),
        double_registry(Arc::new(AtomicUsize::new(0))),
        MissingStore {
            broker: broker.clone(),
        },
    );

    match worker.start().await {
        Err(RelayError::ConfigurationFailure(reason)) => assert!(reason.contains("store")),
        Err(other) => panic!("Expected ConfigurationFailure, got {:?}", other),
        Ok(_) => panic!("Worker started without a store"),
    }
    assert_eq!(broker.subscription_count(), 0);
}

#[tokio::test]
async fn test_empty_worker_key_is_rejected() {
    let broker = MemoryBroker::new();
    let store = MemoryStore::new();
    let worker = Worker::new(
        WorkerConfig::default(),
        HandlerRegistry::new(),
        Preconnected::new(Arc::new(broker.clone()), Arc::new(store)),
    );

    assert!(matches!(
        worker.start().await,
        Err(RelayError::ConfigurationFailure(_))
    ));
    assert_eq!(broker.subscription_count(), 0);
}

#[derive(Default, Clone)]
struct RecordingHooks {
    broker: MemoryBroker,
    store: MemoryStore,
    stopped: Arc<AtomicBool>,
    errors: Arc<AtomicUsize>,
}

#[async_trait]
impl Lifecycle for RecordingHooks {
    async fn on_startup(&self, _config: &WorkerConfig) -> anyhow::Result<Connections> {
        Ok(Connections::new(
            Arc::new(self.broker.clone()),
            Arc::new(self.store.clone()),
        ))
    }

    async fn on_prepare(&self, _state: &WorkerState) -> anyhow::Result<Option<Value>> {
        Ok(Some(json!({"factor": 3})))
    }

    async fn on_stop(&self, _state: &WorkerState) -> anyhow::Result<()> {
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn on_error(&self, _state: &WorkerState, _fault: &workrelay_worker::HandlerFault) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_lifecycle_hooks_and_preparations() {
    let hooks = RecordingHooks::default();
    let mut registry = flaky_registry(true);
    registry
        .register_fn("scale", |ctx| async move {
            let factor = ctx
                .state()
                .preparations()
                .and_then(|p| p["factor"].as_i64())
                .unwrap_or(1);
            let x = ctx.field("x").and_then(Value::as_i64).unwrap_or(0);
            Ok(HandlerOutput::Value(json!(x * factor)))
        })
        .unwrap();

    let mut worker = Worker::new(config(), registry, hooks.clone()).start().await.unwrap();
    assert_eq!(worker.phase(), LifecyclePhase::Running);
    assert!(worker.state().load_time().is_some());

    let client = client(&hooks.broker, &hooks.store);
    let scaled = client
        .enqueue_with_result("scale", &json!({"x": 5}), Meta::default())
        .await
        .unwrap();
    assert_eq!(scaled.result, json!(15));

    let failed = client
        .enqueue_with_result("flaky", &json!({}), Meta::default())
        .await
        .unwrap();
    assert!(failed.is_error);
    assert_eq!(hooks.errors.load(Ordering::SeqCst), 1);

    worker.shutdown().await.unwrap();
    assert_eq!(worker.phase(), LifecyclePhase::Stopped);
    assert!(hooks.stopped.load(Ordering::SeqCst));
    assert!(hooks.broker.is_closed());
    assert!(hooks.store.is_closed());
}

#[tokio::test]
async fn test_handler_can_enqueue_follow_up() {
    let broker = MemoryBroker::new();
    let store = MemoryStore::new();
    let mut registry = double_registry(Arc::new(AtomicUsize::new(0)));
    registry
        .register_fn("fan_out", |ctx| async move {
            let meta = Meta::default().with_task_id("child").with_result_slot("child-slot");
            ctx.state()
                .client()
                .enqueue("double", &json!({"x": 50}), meta)
                .await
                .map_err(|e| HandlerError::failed(e.to_string()))?;
            Ok(HandlerOutput::Value(json!("queued")))
        })
        .unwrap();

    let mut worker = start(&broker, &store, registry).await;
    let client = client(&broker, &store);

    let parent = client
        .enqueue_with_result("fan_out", &json!({}), Meta::default())
        .await
        .unwrap();
    assert_eq!(parent.result, json!("queued"));

    let child = client.wait_for_result("child-slot").await.unwrap();
    assert_eq!(child, Outcome::success(json!(100)));

    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_running_total_persists_across_restarts() {
    let broker = MemoryBroker::new();
    let store = MemoryStore::new();
    store.set(TOTAL_MESSAGES_KEY, b"10".to_vec(), None).await.unwrap();

    let mut worker = start(&broker, &store, double_registry(Arc::new(AtomicUsize::new(0)))).await;
    assert_eq!(worker.state().stats().total_msgs(), 10);

    client(&broker, &store)
        .enqueue_with_result("double", &json!({"x": 1}), Meta::default())
        .await
        .unwrap();

    let state = worker.state().clone();
    eventually("total", || state.stats().total_msgs() == 11).await;

    let mut persisted = None;
    for _ in 0..100 {
        persisted = store.get(TOTAL_MESSAGES_KEY).await.unwrap();
        if persisted.as_deref() == Some(b"11".as_slice()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(persisted, Some(b"11".to_vec()));

    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_admin_get_stats() {
    let broker = MemoryBroker::new();
    let store = MemoryStore::new();
    let mut worker = start(&broker, &store, double_registry(Arc::new(AtomicUsize::new(0)))).await;
    let client = client(&broker, &store);

    client
        .enqueue_with_result("double", &json!({"x": 2}), Meta::default())
        .await
        .unwrap();
    let state = worker.state().clone();
    eventually("handled", || state.stats().handled() == 1).await;

    let stats = client
        .enqueue_with_result(ADMIN_QUEUE, &json!({}), Meta::default().with_op("get_stats"))
        .await
        .unwrap();
    assert!(!stats.is_error);
    assert_eq!(stats.result["handled"], json!(1));
    assert_eq!(stats.result["queues"], json!(["_admin", "double"]));

    let unknown = client
        .enqueue_with_result(ADMIN_QUEUE, &json!({}), Meta::default().with_op("eval"))
        .await
        .unwrap();
    assert!(unknown.is_error);

    worker.shutdown().await.unwrap();
}

/// Shares a store between workers; closing one worker leaves it usable.
struct SharedStore(MemoryStore);

#[async_trait]
impl KvStore for SharedStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.0.get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        self.0.set(key, value, ttl).await
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        self.0.set_if_absent(key, value, ttl).await
    }

    async fn incr(&self, key: &str, by: i64) -> Result<i64> {
        self.0.incr(key, by).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.0.delete(key).await
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

fn counting_sleep_registry(queue: &str, calls: Arc<AtomicUsize>, sleep_ms: u64) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry
        .register_fn(queue, move |_ctx| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
                Ok(HandlerOutput::Value(json!("done")))
            }
        })
        .unwrap();
    registry
}

async fn start_sharing(
    config: WorkerConfig,
    broker: &MemoryBroker,
    store: &MemoryStore,
    registry: HandlerRegistry,
) -> WorkerHandle {
    let store = Arc::new(SharedStore(store.clone()));
    Worker::new(config, registry, Preconnected::new(Arc::new(broker.clone()), store))
        .start()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_deadline_abort_releases_claim_for_redelivery() {
    let store = MemoryStore::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let message = body(json!({"n": 1}), Meta::default().with_task_id("t1").with_result_slot("r1"));

    let impatient = WorkerConfig {
        graceful_shutdown_timeout_secs: 0,
        ..config()
    };
    let first_broker = MemoryBroker::new();
    let mut first = start_sharing(
        impatient,
        &first_broker,
        &store,
        counting_sleep_registry("slow", calls.clone(), 60_000),
    )
    .await;

    let tag = first_broker.publish_raw("slow", message.clone(), auth(KEY)).unwrap();
    let state = first.state().clone();
    eventually("handler running", || !state.running_tasks().is_empty()).await;
    assert!(store.contains(&task_key("t1")));

    first.shutdown().await.unwrap();
    assert!(!first_broker.is_acked(tag));
    assert!(!store.contains(&task_key("t1")));
    assert!(!store.contains(&result_key("r1")));
    assert!(state.running_tasks().is_empty());
    assert!(state.tracker().held().is_empty());

    // The broker hands the unacknowledged message to another worker.
    let second_broker = MemoryBroker::new();
    let mut second = start_sharing(
        config(),
        &second_broker,
        &store,
        counting_sleep_registry("slow", calls.clone(), 10),
    )
    .await;
    let redelivered = second_broker.publish_raw("slow", message, auth(KEY)).unwrap();

    let outcome = client(&second_broker, &store).wait_for_result("r1").await.unwrap();
    assert_eq!(outcome, Outcome::success(json!("done")));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let second_state = second.state().clone();
    eventually("redelivery handled", || second_state.stats().handled() == 1).await;
    assert!(second_broker.is_acked(redelivered));
    assert!(store.contains(&task_key("t1")));

    second.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stopping_pulls_no_new_message() {
    let broker = MemoryBroker::new();
    let store = MemoryStore::new();
    let mut registry = HandlerRegistry::new();
    registry
        .register(HandlerEntry::new("slow", SleepHandler::new(300)))
        .unwrap();
    let mut worker = start(&broker, &store, registry).await;

    let in_flight = broker
        .publish_raw("slow", body(json!({"n": 1}), Meta::default()), auth(KEY))
        .unwrap();
    let queued = broker
        .publish_raw("slow", body(json!({"n": 2}), Meta::default()), auth(KEY))
        .unwrap();

    let state = worker.state().clone();
    eventually("handler running", || !state.running_tasks().is_empty()).await;
    worker.shutdown().await.unwrap();

    assert_eq!(broker.ack_count(in_flight), 1);
    assert!(!broker.is_acked(queued));
    assert_eq!(state.stats().seen(), 1);
    assert_eq!(state.stats().handled(), 1);
    assert_eq!(worker.phase(), LifecyclePhase::Stopped);
}

#[tokio::test]
async fn test_slow_queue_does_not_block_other_queues() {
    let broker = MemoryBroker::new();
    let store = MemoryStore::new();
    let mut registry = double_registry(Arc::new(AtomicUsize::new(0)));
    registry
        .register(HandlerEntry::new("slow", SleepHandler::new(60_000)))
        .unwrap();

    let config = WorkerConfig {
        graceful_shutdown_timeout_secs: 0,
        ..config()
    };
    let mut worker = Worker::new(
        config,
        registry,
        Preconnected::new(Arc::new(broker.clone()), Arc::new(store.clone())),
    )
    .start()
    .await
    .unwrap();

    broker
        .publish_raw("slow", body(json!({}), Meta::default()), auth(KEY))
        .unwrap();
    let state = worker.state().clone();
    eventually("slow handler running", || !state.running_tasks().is_empty()).await;

    let doubled = client(&broker, &store)
        .enqueue_with_result("double", &json!({"x": 4}), Meta::default())
        .await
        .unwrap();
    assert_eq!(doubled, Outcome::success(json!(8)));

    let running = state.running_tasks();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].queue, "slow");

    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_racing_deliveries_run_handler_once() {
    let store = MemoryStore::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let left_broker = MemoryBroker::new();
    let right_broker = MemoryBroker::new();

    let mut left = start_sharing(
        config(),
        &left_broker,
        &store,
        counting_sleep_registry("race", calls.clone(), 200),
    )
    .await;
    let mut right = start_sharing(
        config(),
        &right_broker,
        &store,
        counting_sleep_registry("race", calls.clone(), 200),
    )
    .await;

    let left_client = client(&left_broker, &store);
    let right_client = client(&right_broker, &store);
    let meta = Meta::default().with_task_id("t1");
    let payload = json!({});
    let (sent_left, sent_right) = tokio::join!(
        left_client.enqueue("race", &payload, meta.clone()),
        right_client.enqueue("race", &payload, meta),
    );
    sent_left.unwrap();
    sent_right.unwrap();

    eventually("both acks", || {
        left_broker.total_acks() + right_broker.total_acks() == 2
    })
    .await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        left.state().stats().handled() + right.state().stats().handled(),
        1
    );
    assert_eq!(left.state().stats().seen() + right.state().stats().seen(), 2);

    left.shutdown().await.unwrap();
    right.shutdown().await.unwrap();
}
