use crate::hooks::StreamContext;
use crate::registry::PluginInstance;
use crate::sse;
use serde_json::Value;

/// Chains the `process_stream_chunk` hooks of a plugin set over a
/// stream of parsed SSE chunks. Each plugin holds a private per-stream
/// state bag; chunk order is preserved, plugins may drop or expand
/// chunks but never reorder them.
pub struct StreamExecutor {
    plugins: Vec<PluginInstance>,
    contexts: Vec<StreamContext>,
    chunk_index: u64,
    finished: bool,
}

impl StreamExecutor {
    pub fn new(plugins: Vec<PluginInstance>, request_id: &str) -> Self {
        let contexts = plugins
            .iter()
            .map(|_| StreamContext::new(request_id))
            .collect();
        Self {
            plugins,
            contexts,
            chunk_index: 0,
            finished: false,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Feed one parsed chunk through the chain; returns the chunks to
    /// emit downstream, in order.
    pub async fn process_chunk(&mut self, chunk: Value) -> Vec<Value> {
        let is_last = sse::is_done(&chunk);
        let index = self.chunk_index;
        self.chunk_index += 1;

        for ctx in &mut self.contexts {
            ctx.chunk_index = index;
            ctx.is_first_chunk = index == 0;
            ctx.is_last_chunk = is_last;
        }

        let mut current = vec![chunk];
        for (i, instance) in self.plugins.iter().enumerate() {
            current = Self::feed_plugin(instance, &mut self.contexts[i], current).await;
            if current.is_empty() {
                break;
            }
        }
        current
    }

    /// End of stream: call `flush_stream` on each plugin in order and
    /// pass its output through the plugins after it only.
    pub async fn finish(&mut self) -> Vec<Value> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;

        for ctx in &mut self.contexts {
            ctx.is_last_chunk = true;
        }

        let mut emitted = Vec::new();
        for i in 0..self.plugins.len() {
            let flushed = match self.plugins[i]
                .plugin
                .flush_stream(&mut self.contexts[i])
                .await
            {
                Ok(chunks) => chunks,
                Err(e) => {
                    tracing::warn!(plugin = %self.plugins[i].name, error = %e, "flush_stream failed");
                    Vec::new()
                }
            };

            let mut current = flushed;
            for j in (i + 1)..self.plugins.len() {
                if current.is_empty() {
                    break;
                }
                current = Self::feed_plugin(&self.plugins[j], &mut self.contexts[j], current).await;
            }
            emitted.extend(current);
        }
        emitted
    }

    async fn feed_plugin(
        instance: &PluginInstance,
        ctx: &mut StreamContext,
        chunks: Vec<Value>,
    ) -> Vec<Value> {
        let mut out = Vec::new();
        for chunk in chunks {
            match instance.plugin.process_stream_chunk(&chunk, ctx).await {
                // pass-through
                Ok(None) => out.push(chunk),
                // empty vec: buffered, no output this tick
                Ok(Some(produced)) => out.extend(produced),
                Err(e) => {
                    tracing::warn!(plugin = %instance.name, error = %e, "process_stream_chunk failed; forwarding input");
                    out.push(chunk);
                }
            }
        }
        out
    }
}
