use crate::{RelayError, Result, PROTOCOL_VERSION};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Handler input payload. Opaque to the engine.
pub type Context = Map<String, Value>;

/// Envelope metadata as it travels on the wire.
///
/// Field names are kept short (`pv`, `dbg`, `ret`) for compatibility with
/// producers already speaking this protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    /// Protocol version, must equal [`PROTOCOL_VERSION`]
    #[serde(rename = "pv")]
    pub protocol_version: u32,

    /// Informational debug flag
    #[serde(rename = "dbg", default)]
    pub debug: bool,

    /// Originating worker, for multi-worker deployments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,

    /// Name of a restricted introspection operation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op: Option<String>,

    /// Idempotency id, unique per logical enqueue
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,

    /// Key/value slot the outcome must be written to
    #[serde(rename = "ret", default, skip_serializing_if = "Option::is_none")]
    pub result_slot: Option<String>,
}

impl Default for Meta {
    fn default() -> Self {
        Meta {
            protocol_version: PROTOCOL_VERSION,
            debug: false,
            worker: None,
            op: None,
            task_id: None,
            result_slot: None,
        }
    }
}

impl Meta {
    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_result_slot(mut self, slot: impl Into<String>) -> Self {
        self.result_slot = Some(slot.into());
        self
    }

    pub fn with_op(mut self, op: impl Into<String>) -> Self {
        self.op = Some(op.into());
        self
    }

    pub fn with_worker(mut self, worker: impl Into<String>) -> Self {
        self.worker = Some(worker.into());
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

/// The unit of work consumed from a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub ctx: Context,
    pub meta: Meta,
}

impl Envelope {
    pub fn new(ctx: Context, meta: Meta) -> Self {
        Envelope { ctx, meta }
    }

    /// Parse a raw message body.
    ///
    /// Anything that is not a JSON object with a `ctx` map and a `meta`
    /// block carrying the supported protocol version is rejected as
    /// [`RelayError::MalformedEnvelope`]. Redelivery can never fix such a
    /// message, so callers acknowledge it without processing.
    pub fn parse(body: &[u8]) -> Result<Self> {
        let envelope: Envelope = serde_json::from_slice(body)
            .map_err(|e| RelayError::MalformedEnvelope(e.to_string()))?;

        if envelope.meta.protocol_version != PROTOCOL_VERSION {
            return Err(RelayError::MalformedEnvelope(format!(
                "unsupported protocol version {} (expected {})",
                envelope.meta.protocol_version, PROTOCOL_VERSION
            )));
        }

        Ok(envelope)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(RelayError::from)
    }

    /// Deserialize the context into a typed argument struct.
    pub fn context<T: DeserializeOwned>(&self) -> std::result::Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.ctx.clone()))
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.ctx.get(name)
    }

    pub fn task_id(&self) -> Option<&str> {
        self.meta.task_id.as_deref()
    }

    pub fn result_slot(&self) -> Option<&str> {
        self.meta.result_slot.as_deref()
    }
}
