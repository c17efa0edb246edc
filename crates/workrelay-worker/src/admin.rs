//! Built-in introspection queue.
//!
//! Messages on `_admin` name an operation in `meta.op`. Only the operations
//! below exist; anything else is answered with an error outcome.

use crate::handler::{
    HandlerEntry, HandlerError, HandlerOutput, HandlerResult, TaskContext, TaskHandler,
};
use crate::state::WorkerState;
use crate::stats::CureError;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

pub const ADMIN_QUEUE: &str = "_admin";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminOp {
    GetStats,
    ListErrors,
    ListRunning,
    CureError { index: usize },
    CureAll,
}

impl AdminOp {
    pub fn parse(op: &str, ctx: &TaskContext) -> Result<Self, HandlerError> {
        match op {
            "get_stats" => Ok(AdminOp::GetStats),
            "list_errors" => Ok(AdminOp::ListErrors),
            "list_running" => Ok(AdminOp::ListRunning),
            "cure_error" => {
                let index = ctx
                    .field("index")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| {
                        HandlerError::new("InvalidContext", "cure_error needs a numeric index")
                    })?;
                Ok(AdminOp::CureError {
                    index: index as usize,
                })
            }
            "cure_all" => Ok(AdminOp::CureAll),
            other => Err(HandlerError::new(
                "UnknownOperation",
                format!("unknown admin operation {}", other),
            )),
        }
    }

    pub async fn execute(self, state: &WorkerState) -> HandlerResult {
        let value = match self {
            AdminOp::GetStats => state.stats_report(),
            AdminOp::ListErrors => json!({
                "failed_unacked": state.stats().failed_summaries(),
                "faults": state.stats().faults(),
            }),
            AdminOp::ListRunning => serde_json::to_value(state.running_tasks())?,
            AdminOp::CureError { index } => {
                state.stats().cure(index).await.map_err(|e| match e {
                    CureError::NoSuchMessage(_) => HandlerError::new("IndexError", e.to_string()),
                    CureError::Ack(_) => HandlerError::new("AckError", e.to_string()),
                })?;
                json!({ "cured": index })
            }
            AdminOp::CureAll => {
                let cured = state.stats().cure_all().await;
                json!({ "cured": cured, "remaining": state.stats().failed_count() })
            }
        };
        Ok(HandlerOutput::Value(value))
    }
}

pub struct AdminHandler;

#[async_trait]
impl TaskHandler for AdminHandler {
    async fn handle(&self, ctx: TaskContext) -> HandlerResult {
        let Some(op) = ctx.envelope().meta.op.clone() else {
            return Ok(HandlerOutput::Value(Value::Null));
        };

        let op = AdminOp::parse(&op, &ctx)?;
        info!("Admin operation {:?}", op);
        op.execute(ctx.state()).await
    }
}

/// The `_admin` queue binding. Always acknowledges.
pub fn admin_entry() -> HandlerEntry {
    HandlerEntry::new(ADMIN_QUEUE, AdminHandler)
        .with_friendly_name("Admin/Monitoring Backend")
        .with_ack_all(true)
}
