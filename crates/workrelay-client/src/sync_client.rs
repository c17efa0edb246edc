use crate::{RelayClient, Result};
use serde::Serialize;
use workrelay_core::{Meta, Outcome};

/// Synchronous client for callers outside an async runtime (wraps the
/// async client)
pub struct BlockingRelayClient {
    runtime: tokio::runtime::Runtime,
    inner: RelayClient,
}

impl BlockingRelayClient {
    pub fn new(inner: RelayClient) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        Ok(BlockingRelayClient { runtime, inner })
    }

    pub fn enqueue<C: Serialize + ?Sized>(&self, queue: &str, ctx: &C, meta: Meta) -> Result<()> {
        self.runtime.block_on(self.inner.enqueue(queue, ctx, meta))
    }

    pub fn enqueue_with_result<C: Serialize + ?Sized>(
        &self,
        queue: &str,
        ctx: &C,
        meta: Meta,
    ) -> Result<Outcome> {
        self.runtime
            .block_on(self.inner.enqueue_with_result(queue, ctx, meta))
    }

    pub fn wait_for_result(&self, slot: &str) -> Result<Outcome> {
        self.runtime.block_on(self.inner.wait_for_result(slot))
    }
}
