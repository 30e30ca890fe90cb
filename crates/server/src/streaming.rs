use axum::body::Body;
use axum::http::header;
use axum::response::Response;
use bytes::Bytes;
use futures::Stream;
use futures::StreamExt;
use relay_core::context::ExpressionContext;
use relay_core::rules::{self, ModificationRules};
use relay_plugin::stream::StreamExecutor;
use relay_plugin::{PluginChain, sse};
use serde_json::Value;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::pin::Pin;

type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

struct SpliceState {
    source: Option<ByteStream>,
    parser: sse::SseParser,
    executor: StreamExecutor,
    rules: Option<ModificationRules>,
    ctx: ExpressionContext,
    pending: VecDeque<Bytes>,
    out_index: u64,
}

/// Splice the three-stage pipeline onto an upstream SSE body: parse
/// frames, run the plugin stream executor, re-serialize. The body is
/// never buffered; dropping the response (client disconnect) drops the
/// upstream stream with it.
pub fn splice(
    upstream: reqwest::Response,
    chain: &PluginChain,
    request_id: &str,
    response_rules: Option<ModificationRules>,
    ctx: ExpressionContext,
    upstream_headers: &[(String, String)],
) -> Response {
    let executor = StreamExecutor::new(chain.plugins().to_vec(), request_id);
    let source: ByteStream = Box::pin(upstream.bytes_stream());

    // pure pass-through: relay raw bytes without reframing
    let body = if executor.is_passthrough() && response_rules.is_none() {
        Body::from_stream(source.map(|chunk| match chunk {
            Ok(bytes) => Ok::<_, Infallible>(bytes),
            Err(e) => {
                tracing::warn!(error = %e, "upstream stream failed");
                Ok(Bytes::new())
            }
        }))
    } else {
        let state = SpliceState {
            source: Some(source),
            parser: sse::SseParser::new(),
            executor,
            rules: response_rules,
            ctx,
            pending: VecDeque::new(),
            out_index: 0,
        };
        Body::from_stream(futures::stream::unfold(state, splice_step))
    };

    let mut builder = Response::builder()
        .status(200)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache");
    for (name, value) in upstream_headers {
        if matches!(
            name.as_str(),
            "content-type" | "content-length" | "transfer-encoding" | "connection" | "cache-control"
        ) {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder
        .body(body)
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

async fn splice_step(mut state: SpliceState) -> Option<(Result<Bytes, Infallible>, SpliceState)> {
    loop {
        if let Some(frame) = state.pending.pop_front() {
            return Some((Ok(frame), state));
        }

        let Some(source) = state.source.as_mut() else {
            return None;
        };

        match source.next().await {
            Some(Ok(bytes)) => {
                let events = state.parser.feed(&bytes);
                for event in events {
                    let outputs = state.executor.process_chunk(event).await;
                    enqueue(&mut state, outputs, "stream");
                }
            }
            Some(Err(e)) => {
                tracing::warn!(error = %e, "upstream stream failed mid-flight");
                let error_event =
                    serde_json::json!({"error": {"message": e.to_string()}});
                state
                    .pending
                    .push_back(Bytes::from(sse::serialize_event(&error_event)));
                state.source = None;
            }
            None => {
                let mut tail = Vec::new();
                for event in state.parser.finish() {
                    tail.extend(state.executor.process_chunk(event).await);
                }
                tail.extend(state.executor.finish().await);
                enqueue(&mut state, tail, "flush");
                state.source = None;
            }
        }
    }
}

/// Post-executor chunk handling: response body rules run per chunk with
/// stream phase info, and may expand one chunk into several via the
/// multi-event escape.
fn enqueue(state: &mut SpliceState, chunks: Vec<Value>, phase: &str) {
    for chunk in chunks {
        for transformed in apply_chunk_rules(&chunk, state, phase) {
            state.pending.push_back(Bytes::from(sse::serialize_event(&transformed)));
        }
        state.out_index += 1;
    }
}

fn apply_chunk_rules(chunk: &Value, state: &SpliceState, phase: &str) -> Vec<Value> {
    let Some(rule_set) = &state.rules else {
        return vec![chunk.clone()];
    };
    if !chunk.is_object() {
        return vec![chunk.clone()];
    }
    let ctx = state.ctx.clone().with_stream(phase, state.out_index);
    let mut transformed = chunk.clone();
    rules::apply_body_rules(&mut transformed, rule_set, &ctx);
    match rules::take_multi_events(&mut transformed) {
        Some(events) => events,
        None => vec![transformed],
    }
}
