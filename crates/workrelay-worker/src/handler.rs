use crate::state::WorkerState;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use workrelay_core::{Envelope, Outcome, RelayError};

/// Result type for task handlers
pub type HandlerResult = Result<HandlerOutput, HandlerError>;

/// What a handler hands back on normal return.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutput {
    /// A plain value, published with `err: false`
    Value(Value),
    /// A value with an explicit error flag
    Pair(Value, bool),
}

impl HandlerOutput {
    /// Serialize any value into a successful output.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, HandlerError> {
        Ok(HandlerOutput::Value(serde_json::to_value(value)?))
    }

    pub fn into_outcome(self) -> Outcome {
        match self {
            HandlerOutput::Value(value) => Outcome::success(value),
            HandlerOutput::Pair(value, is_error) => Outcome::from((value, is_error)),
        }
    }
}

impl From<Value> for HandlerOutput {
    fn from(value: Value) -> Self {
        HandlerOutput::Value(value)
    }
}

impl From<(Value, bool)> for HandlerOutput {
    fn from((value, is_error): (Value, bool)) -> Self {
        HandlerOutput::Pair(value, is_error)
    }
}

/// Failure raised by a handler. Its display string becomes the published
/// error description.
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("InvalidContext: {0}")]
    InvalidContext(#[from] serde_json::Error),

    #[error("{kind}: {message}")]
    Failed { kind: String, message: String },

    #[error("Panic: {0}")]
    Panicked(String),

    #[error("Cancelled: handler task was cancelled")]
    Cancelled,

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        HandlerError::Failed {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new("HandlerError", message)
    }
}

/// Everything a handler invocation can see: the shared worker state and the
/// decoded message. The envelope is shared read-only.
#[derive(Clone)]
pub struct TaskContext {
    state: Arc<WorkerState>,
    envelope: Arc<Envelope>,
}

impl TaskContext {
    pub fn new(state: Arc<WorkerState>, envelope: Arc<Envelope>) -> Self {
        TaskContext { state, envelope }
    }

    pub fn state(&self) -> &Arc<WorkerState> {
        &self.state
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Decode the message context into a typed argument struct.
    pub fn args<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        Ok(self.envelope.context()?)
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.envelope.field(name)
    }

    pub fn task_id(&self) -> Option<&str> {
        self.envelope.task_id()
    }
}

/// Trait for task handlers
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, ctx: TaskContext) -> HandlerResult;
}

/// Adapter turning an async closure into a [`TaskHandler`].
pub struct FnHandler<F> {
    f: F,
}

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, ctx: TaskContext) -> HandlerResult {
        (self.f)(ctx).await
    }
}

/// A handler bound to the queue it consumes.
#[derive(Clone)]
pub struct HandlerEntry {
    pub queue: String,
    /// Name used in log lines, defaults to the queue name
    pub friendly_name: String,
    /// Acknowledge every message regardless of outcome
    pub ack_all: bool,
    pub handler: Arc<dyn TaskHandler>,
}

impl HandlerEntry {
    pub fn new<H: TaskHandler + 'static>(queue: impl Into<String>, handler: H) -> Self {
        let queue = queue.into();
        HandlerEntry {
            friendly_name: queue.clone(),
            queue,
            ack_all: false,
            handler: Arc::new(handler),
        }
    }

    pub fn with_friendly_name(mut self, name: impl Into<String>) -> Self {
        self.friendly_name = name.into();
        self
    }

    pub fn with_ack_all(mut self, ack_all: bool) -> Self {
        self.ack_all = ack_all;
        self
    }
}

impl std::fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("queue", &self.queue)
            .field("friendly_name", &self.friendly_name)
            .field("ack_all", &self.ack_all)
            .finish()
    }
}

/// Handlers by queue name. Populated before the worker starts and read-only
/// afterwards.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<HandlerEntry>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler entry. A queue can only be bound once.
    pub fn register(&mut self, entry: HandlerEntry) -> Result<(), RelayError> {
        if self.handlers.contains_key(&entry.queue) {
            return Err(RelayError::ConfigurationFailure(format!(
                "queue {} already has a handler",
                entry.queue
            )));
        }
        self.handlers.insert(entry.queue.clone(), Arc::new(entry));
        Ok(())
    }

    pub fn register_fn<F, Fut>(&mut self, queue: &str, f: F) -> Result<(), RelayError>
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(HandlerEntry::new(queue, handler_fn(f)))
    }

    pub fn get(&self, queue: &str) -> Option<Arc<HandlerEntry>> {
        self.handlers.get(queue).cloned()
    }

    pub fn has_handler(&self, queue: &str) -> bool {
        self.handlers.contains_key(queue)
    }

    /// Registered queue names, sorted
    pub fn queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = self.handlers.keys().cloned().collect();
        queues.sort();
        queues
    }

    pub fn entries(&self) -> impl Iterator<Item = &Arc<HandlerEntry>> {
        self.handlers.values()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Example handler that returns its context unchanged
pub struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn handle(&self, ctx: TaskContext) -> HandlerResult {
        Ok(Value::Object(ctx.envelope().ctx.clone()).into())
    }
}

#[derive(Debug, Deserialize)]
struct DoubleArgs {
    x: i64,
}

/// Example handler computing `2 * x`
pub struct DoubleHandler;

#[async_trait]
impl TaskHandler for DoubleHandler {
    async fn handle(&self, ctx: TaskContext) -> HandlerResult {
        let args: DoubleArgs = ctx.args()?;
        let doubled = args
            .x
            .checked_mul(2)
            .ok_or_else(|| {
                HandlerError::new("OverflowError", format!("2 * {} overflows", args.x))
            })?;
        Ok(Value::from(doubled).into())
    }
}

/// Example handler that simulates work, then echoes
pub struct SleepHandler {
    duration: Duration,
}

impl SleepHandler {
    pub fn new(duration_ms: u64) -> Self {
        SleepHandler {
            duration: Duration::from_millis(duration_ms),
        }
    }
}

#[async_trait]
impl TaskHandler for SleepHandler {
    async fn handle(&self, ctx: TaskContext) -> HandlerResult {
        tokio::time::sleep(self.duration).await;
        EchoHandler.handle(ctx).await
    }
}
