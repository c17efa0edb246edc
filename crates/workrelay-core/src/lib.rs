mod envelope;
mod error;
pub mod memory;
mod outcome;
mod store;
pub mod transport;

pub use envelope::{Context, Envelope, Meta};
pub use error::{RelayError, Result};
pub use memory::{MemoryBroker, MemoryStore};
pub use outcome::Outcome;
pub use store::KvStore;
pub use transport::{Acknowledger, Broker, Delivery, Headers, Subscription, AUTH_HEADER};

/// Envelope protocol version understood by this engine
pub const PROTOCOL_VERSION: u32 = 1;

/// Store key holding the running total of handled messages across restarts
pub const TOTAL_MESSAGES_KEY: &str = "workrelay:total_msgs";

/// Store key of a result slot
pub fn result_key(slot: &str) -> String {
    format!("workrelay:result:{}", slot)
}

/// Store key of an idempotency record
pub fn task_key(task_id: &str) -> String {
    format!("workrelay:task:{}", task_id)
}
