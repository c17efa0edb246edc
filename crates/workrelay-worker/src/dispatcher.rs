use crate::handler::{HandlerEntry, HandlerError, TaskContext};
use crate::state::WorkerState;
use crate::stats::HandlerFault;
use chrono::Utc;
use std::any::Any;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error};
use workrelay_core::{Envelope, Outcome, RelayError};

/// Runs handlers with failure containment.
///
/// Whatever the handler does (return, fail, panic) the caller gets an
/// [`Outcome`] back and the worker keeps going.
pub struct Dispatcher {
    state: Arc<WorkerState>,
}

impl Dispatcher {
    pub fn new(state: Arc<WorkerState>) -> Self {
        Dispatcher { state }
    }

    pub async fn dispatch(&self, entry: &HandlerEntry, envelope: &Arc<Envelope>) -> Outcome {
        let started = Instant::now();
        let handler = entry.handler.clone();
        let ctx = TaskContext::new(self.state.clone(), envelope.clone());

        // Spawned so a panic unwinds into the JoinError instead of the loop.
        let task = tokio::spawn(async move { handler.handle(ctx).await });
        let running_id = self
            .state
            .track_running(&entry.queue, envelope.task_id(), task.abort_handle());

        let result = match task.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(HandlerError::Panicked(panic_message(e.into_panic()))),
            Err(_) => Err(HandlerError::Cancelled),
        };

        self.state.finish_running(&running_id);
        self.state
            .metrics()
            .observe_handler_duration(&entry.queue, started.elapsed().as_secs_f64());

        match result {
            Ok(output) => {
                debug!(queue = %entry.queue, "Handler returned");
                output.into_outcome()
            }
            Err(err) => {
                let description = err.to_string();
                let failure = RelayError::HandlerFailure(description.clone());
                error!(queue = %entry.queue, task_id = ?envelope.task_id(), "{}", failure);
                self.record_fault(entry, envelope, &description).await;
                Outcome::failure(description)
            }
        }
    }

    async fn record_fault(&self, entry: &HandlerEntry, envelope: &Envelope, description: &str) {
        let fault = HandlerFault {
            queue: entry.queue.clone(),
            description: description.to_string(),
            envelope: envelope.clone(),
            occurred_at: Utc::now(),
        };

        self.state.hooks().on_error(&self.state, &fault).await;
        self.state.stats().record_fault(fault);
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
