pub mod admin;
pub mod auth;
pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod handler;
pub mod idempotency;
pub mod metrics;
pub mod publisher;
pub mod state;
pub mod stats;
pub mod worker;

pub use admin::ADMIN_QUEUE;
pub use config::WorkerConfig;
pub use consumer::{Disposition, QueueConsumer};
pub use handler::{
    handler_fn, HandlerEntry, HandlerError, HandlerOutput, HandlerRegistry, HandlerResult,
    TaskContext, TaskHandler,
};
pub use state::WorkerState;
pub use stats::{HandlerFault, StatsSnapshot};
pub use worker::{Connections, Lifecycle, LifecyclePhase, Preconnected, Worker, WorkerHandle};
