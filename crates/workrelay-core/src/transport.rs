//! Broker seam: subscriptions, deliveries and acknowledgement.
//!
//! The engine only needs an already-connected handle implementing [`Broker`].
//! Channel management, queue declaration and the AMQP wire format belong to
//! the implementation.

use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Transport-level headers (outside the envelope body)
pub type Headers = HashMap<String, String>;

/// Header carrying the shared worker secret
pub const AUTH_HEADER: &str = "auth";

#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a dedicated subscription on `queue` with at most `prefetch`
    /// unacknowledged deliveries in flight.
    async fn subscribe(&self, queue: &str, prefetch: u16) -> Result<Box<dyn Subscription>>;

    /// Publish a persistent message to `queue`.
    async fn publish(&self, queue: &str, body: Vec<u8>, headers: Headers) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next delivery. `None` means the subscription is closed.
    async fn next_delivery(&mut self) -> Option<Result<Delivery>>;
}

#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;
}

/// One received message, acknowledgeable independently of its subscription.
#[derive(Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub body: Vec<u8>,
    pub headers: Headers,
    acker: Arc<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        body: Vec<u8>,
        headers: Headers,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        Delivery {
            delivery_tag,
            body,
            headers,
            acker,
        }
    }

    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("body_len", &self.body.len())
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .finish()
    }
}
