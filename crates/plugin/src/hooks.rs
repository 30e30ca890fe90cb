use crate::context::{PluginContext, PluginHttpResponse};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct PluginError(pub String);

impl From<String> for PluginError {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for PluginError {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<serde_json::Error> for PluginError {
    fn from(e: serde_json::Error) -> Self {
        Self(e.to_string())
    }
}

/// Per-plugin, per-stream context. The executor maintains the chunk
/// bookkeeping; `state` is this plugin's private bag for accumulating
/// cross-chunk state (delta counters, tool-call argument buffers, …).
#[derive(Debug, Default)]
pub struct StreamContext {
    pub request_id: String,
    pub chunk_index: u64,
    pub is_first_chunk: bool,
    pub is_last_chunk: bool,
    pub state: HashMap<String, Value>,
}

impl StreamContext {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            ..Default::default()
        }
    }
}

/// A gateway plugin. Hooks default to no-ops; implement any subset.
///
/// Outbound hooks run outer→inner (global plugins before route plugins),
/// inbound hooks run inner→outer. Hook errors are contained by the
/// executor and never abort the chain.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> Option<&str> {
        None
    }

    /// Early per-request initialization; cannot short-circuit.
    async fn on_request_init(&self, ctx: &mut PluginContext) -> Result<(), PluginError> {
        let _ = ctx;
        Ok(())
    }

    /// May mutate the outbound URL (restricted), headers, and body.
    async fn on_before_request(&self, ctx: &mut PluginContext) -> Result<(), PluginError> {
        let _ = ctx;
        Ok(())
    }

    /// May return a complete response, short-circuiting the chain and
    /// the upstream dispatch.
    async fn on_intercept_request(
        &self,
        ctx: &mut PluginContext,
    ) -> Result<Option<PluginHttpResponse>, PluginError> {
        let _ = ctx;
        Ok(None)
    }

    /// Non-streaming responses only. May return a replacement response.
    async fn on_response(
        &self,
        ctx: &mut PluginContext,
    ) -> Result<Option<PluginHttpResponse>, PluginError> {
        let _ = ctx;
        Ok(None)
    }

    /// N:M stream transformer. `None` passes the chunk through
    /// unchanged, an empty vec buffers it, a non-empty vec replaces it.
    async fn process_stream_chunk(
        &self,
        chunk: &Value,
        stream: &mut StreamContext,
    ) -> Result<Option<Vec<Value>>, PluginError> {
        let _ = (chunk, stream);
        Ok(None)
    }

    /// Drain buffered output at end of stream.
    async fn flush_stream(&self, stream: &mut StreamContext) -> Result<Vec<Value>, PluginError> {
        let _ = stream;
        Ok(Vec::new())
    }

    /// Observation only; the executor re-surfaces the original error.
    async fn on_error(&self, ctx: &mut PluginContext) -> Result<(), PluginError> {
        let _ = ctx;
        Ok(())
    }

    /// Release per-instance resources.
    async fn on_destroy(&self) {}
}
