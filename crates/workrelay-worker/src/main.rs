use async_trait::async_trait;
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use workrelay_backends::{AmqpBroker, AmqpConfig, RedisConfig, RedisStore};
use workrelay_worker::handler::{DoubleHandler, EchoHandler, SleepHandler};
use workrelay_worker::{Connections, HandlerEntry, HandlerRegistry, Lifecycle, Worker, WorkerConfig};

#[derive(Parser, Debug)]
#[command(name = "relay-worker")]
#[command(about = "Work relay worker", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(long)]
    config: Option<String>,

    /// Shared key expected in the auth header of every message
    #[arg(long, env = "WORKRELAY_WORKER_KEY", hide_env_values = true)]
    worker_key: Option<String>,

    /// AMQP broker URL
    #[arg(long)]
    amqp_url: Option<String>,

    /// Redis URL
    #[arg(long)]
    redis_url: Option<String>,

    /// Worker ID (auto-generated if not provided)
    #[arg(long)]
    worker_id: Option<String>,

    /// Port for the /metrics and /stats endpoints
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

/// Connects to RabbitMQ and Redis at startup.
struct BackendHooks;

#[async_trait]
impl Lifecycle for BackendHooks {
    async fn on_startup(&self, config: &WorkerConfig) -> anyhow::Result<Connections> {
        let broker = AmqpBroker::connect(&AmqpConfig {
            url: config.amqp_url.clone(),
            ..Default::default()
        })
        .await?;
        let store = RedisStore::connect(&RedisConfig {
            url: config.redis_url.clone(),
        })
        .await?;

        Ok(Connections::new(Arc::new(broker), Arc::new(store)))
    }
}

fn init_tracing(level: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(false))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level, args.json_logs);

    // Load configuration
    let mut config = WorkerConfig::load(args.config.as_deref())?;

    // Override with CLI args
    if let Some(worker_key) = args.worker_key {
        config.worker_key = worker_key;
    }
    if let Some(amqp_url) = args.amqp_url {
        config.amqp_url = amqp_url;
    }
    if let Some(redis_url) = args.redis_url {
        config.redis_url = redis_url;
    }
    if let Some(worker_id) = args.worker_id {
        config.worker_id = Some(worker_id);
    }
    if args.metrics_port.is_some() {
        config.metrics_port = args.metrics_port;
    }

    // Register example handlers
    let mut registry = HandlerRegistry::new();
    registry.register(HandlerEntry::new("echo", EchoHandler))?;
    registry.register(HandlerEntry::new("double", DoubleHandler).with_friendly_name("Doubler"))?;
    registry.register(HandlerEntry::new("sleep", SleepHandler::new(1000)))?;

    tracing::info!("Registered queues: {:?}", registry.queues());

    Worker::new(config, registry, BackendHooks).run().await?;

    Ok(())
}
