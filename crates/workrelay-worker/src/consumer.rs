use crate::dispatcher::Dispatcher;
use crate::handler::HandlerEntry;
use crate::state::WorkerState;
use crate::stats::FailedMessage;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use workrelay_core::{Delivery, Envelope, RelayError, Subscription, AUTH_HEADER};

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Body was not a valid envelope; acknowledged and dropped
    Malformed,
    /// Auth header did not match; acknowledged and dropped
    Unauthenticated,
    /// Task id already processed; acknowledged without running the handler
    Duplicate,
    Acknowledged { is_error: bool },
    /// Handler failed on a queue without ack-all; parked in the failed ledger
    LeftPending,
}

struct Admitted {
    envelope: Arc<Envelope>,
    /// This delivery holds the idempotency claim for its task id
    claimed: bool,
}

/// Consumes one queue and drives each delivery through validation,
/// dispatch, result publishing and acknowledgement.
pub struct QueueConsumer {
    state: Arc<WorkerState>,
    entry: Arc<HandlerEntry>,
    dispatcher: Dispatcher,
}

impl QueueConsumer {
    pub fn new(state: Arc<WorkerState>, entry: Arc<HandlerEntry>) -> Self {
        QueueConsumer {
            dispatcher: Dispatcher::new(state.clone()),
            state,
            entry,
        }
    }

    /// Process deliveries until shutdown is signalled or the subscription
    /// ends. A delivery already being processed always runs to completion.
    pub async fn run(
        self,
        mut subscription: Box<dyn Subscription>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(queue = %self.entry.queue, "Consuming queue");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let next = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                next = subscription.next_delivery() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    self.process(delivery).await;
                }
                Some(Err(e)) => {
                    error!(queue = %self.entry.queue, "Delivery error: {}", e);
                }
                None => {
                    info!(queue = %self.entry.queue, "Subscription closed");
                    break;
                }
            }
        }

        info!(queue = %self.entry.queue, "Consumer stopped");
    }

    pub async fn process(&self, delivery: Delivery) -> Disposition {
        let queue = self.entry.queue.as_str();
        let number = self.state.stats().record_seen();
        self.state.metrics().inc_seen(queue);
        info!("{} called (message {})", self.entry.friendly_name, number);

        let Admitted { envelope, claimed } = match self.admit(&delivery, number).await {
            Ok(admitted) => admitted,
            Err(e) => return self.refuse(&delivery, number, e).await,
        };
        let claimed = if claimed { envelope.task_id() } else { None };

        let outcome = self.dispatcher.dispatch(&self.entry, &envelope).await;

        if outcome.is_error {
            self.state.stats().record_error();
            self.state.metrics().inc_errors(queue, "handler");
        }

        if let Some(slot) = envelope.result_slot() {
            // Failures are logged by the publisher.
            let _ = self.state.publisher().publish(slot, &outcome).await;
        }

        let disposition = if self.entry.ack_all || !outcome.is_error {
            self.ack(&delivery).await;
            if let Some(task_id) = claimed {
                self.state.tracker().settle(task_id);
            }
            Disposition::Acknowledged {
                is_error: outcome.is_error,
            }
        } else {
            if let Some(task_id) = claimed {
                if let Err(e) = self.state.tracker().release(task_id).await {
                    warn!(queue, task_id, "Could not release idempotency claim: {}", e);
                }
            }
            self.state.stats().push_failed(FailedMessage {
                queue: queue.to_string(),
                task_id: envelope.task_id().map(str::to_string),
                description: outcome
                    .result
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| outcome.result.to_string()),
                failed_at: Utc::now(),
                delivery,
            });
            Disposition::LeftPending
        };

        self.state.stats().record_handled();
        self.state.metrics().inc_handled(queue);
        self.state.persist_total().await;
        info!("Message {} handled", number);

        disposition
    }

    /// Parse, authenticate and deduplicate a delivery.
    async fn admit(&self, delivery: &Delivery, number: u64) -> Result<Admitted, RelayError> {
        let envelope = Arc::new(Envelope::parse(&delivery.body)?);

        if !self.state.authenticator().authenticate(&delivery.headers) {
            return Err(RelayError::AuthenticationFailure(format!(
                "bad or missing {} header",
                AUTH_HEADER
            )));
        }

        if envelope.meta.debug {
            debug!(queue = %self.entry.queue, envelope = ?envelope, "Message {} contents", number);
        }

        let Some(task_id) = envelope.task_id() else {
            return Ok(Admitted {
                envelope,
                claimed: false,
            });
        };

        match self.state.tracker().claim(task_id).await {
            Ok(true) => Ok(Admitted {
                envelope: envelope.clone(),
                claimed: true,
            }),
            Ok(false) => Err(RelayError::DuplicateDelivery(task_id.to_string())),
            Err(e) => {
                warn!(
                    queue = %self.entry.queue,
                    task_id,
                    "Idempotency check unavailable, processing anyway: {}",
                    e
                );
                Ok(Admitted {
                    envelope: envelope.clone(),
                    claimed: false,
                })
            }
        }
    }

    /// Settle a delivery that must not reach the handler. Terminal errors
    /// are acknowledged, since a redelivery would fail the same way.
    async fn refuse(&self, delivery: &Delivery, number: u64, e: RelayError) -> Disposition {
        let queue = self.entry.queue.as_str();
        let disposition = match e {
            RelayError::DuplicateDelivery(_) => {
                info!(queue, "Skipping message {}: {}", number, e);
                Disposition::Duplicate
            }
            RelayError::AuthenticationFailure(_) => {
                error!(queue, "Dropping message {}: {}", number, e);
                self.count_error("auth");
                Disposition::Unauthenticated
            }
            _ => {
                warn!(queue, "Dropping message {}: {}", number, e);
                self.count_error("malformed");
                Disposition::Malformed
            }
        };

        if e.is_terminal() {
            self.ack(delivery).await;
        }
        disposition
    }

    fn count_error(&self, reason: &str) {
        self.state.stats().record_error();
        self.state.metrics().inc_errors(&self.entry.queue, reason);
    }

    async fn ack(&self, delivery: &Delivery) {
        if let Err(e) = delivery.ack().await {
            error!(
                queue = %self.entry.queue,
                tag = delivery.delivery_tag,
                "Failed to acknowledge: {}",
                e
            );
        }
    }
}
