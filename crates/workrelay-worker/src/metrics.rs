use crate::state::WorkerState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Prometheus metrics for the worker
pub struct WorkerMetrics {
    pub registry: Registry,

    pub messages_seen: CounterVec,
    pub messages_handled: CounterVec,
    pub errors: CounterVec,

    pub handler_duration: HistogramVec,
}

impl WorkerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let messages_seen = CounterVec::new(
            Opts::new("workrelay_messages_seen_total", "Messages received by queue"),
            &["queue"],
        )?;
        registry.register(Box::new(messages_seen.clone()))?;

        let messages_handled = CounterVec::new(
            Opts::new(
                "workrelay_messages_handled_total",
                "Messages that reached an outcome by queue",
            ),
            &["queue"],
        )?;
        registry.register(Box::new(messages_handled.clone()))?;

        let errors = CounterVec::new(
            Opts::new(
                "workrelay_errors_total",
                "Rejected or failed messages by queue and reason",
            ),
            &["queue", "reason"],
        )?;
        registry.register(Box::new(errors.clone()))?;

        let handler_duration = HistogramVec::new(
            HistogramOpts::new(
                "workrelay_handler_duration_seconds",
                "Handler execution time in seconds",
            ),
            &["queue"],
        )?;
        registry.register(Box::new(handler_duration.clone()))?;

        Ok(WorkerMetrics {
            registry,
            messages_seen,
            messages_handled,
            errors,
            handler_duration,
        })
    }

    pub fn inc_seen(&self, queue: &str) {
        self.messages_seen.with_label_values(&[queue]).inc();
    }

    pub fn inc_handled(&self, queue: &str) {
        self.messages_handled.with_label_values(&[queue]).inc();
    }

    pub fn inc_errors(&self, queue: &str, reason: &str) {
        self.errors.with_label_values(&[queue, reason]).inc();
    }

    pub fn observe_handler_duration(&self, queue: &str, duration_secs: f64) {
        self.handler_duration
            .with_label_values(&[queue])
            .observe(duration_secs);
    }

    /// Encode all metrics in the Prometheus text format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

pub fn metrics_router(state: Arc<WorkerState>) -> Router {
    async fn metrics_handler(State(state): State<Arc<WorkerState>>) -> Result<String, StatusCode> {
        state.metrics().render().map_err(|e| {
            tracing::error!("Failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })
    }

    async fn stats_handler(State(state): State<Arc<WorkerState>>) -> Json<serde_json::Value> {
        Json(state.stats_report())
    }

    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/stats", get(stats_handler))
        .with_state(state)
}

/// Serve `/metrics` and `/stats` until the process exits.
pub async fn start_metrics_server(state: Arc<WorkerState>, port: u16) -> anyhow::Result<()> {
    let app = metrics_router(state);

    let addr = format!("0.0.0.0:{}", port);
    tracing::info!("Metrics server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
