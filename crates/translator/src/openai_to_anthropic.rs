//! OpenAI-payload → Anthropic-payload translations: requests for the
//! OpenAI-inbound flow, responses and stream synthesis for the
//! Anthropic-inbound flow.

use crate::env;
use crate::state::{get_bool, get_i64, get_str, set};
use relay_plugin::PluginError;
use serde_json::{Value, json};
use std::collections::HashMap;

/// Translate an OpenAI Chat Completions request into an Anthropic
/// Messages request.
pub fn translate_request(req: &Value) -> Result<Value, PluginError> {
    let system_text = extract_system_messages(req);
    let messages = convert_messages(req)?;
    let max_tokens = req
        .get("max_tokens")
        .or_else(|| req.get("max_completion_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or_else(env::anthropic_max_tokens);

    let mut anthropic_req = json!({
        "model": req.get("model").cloned().unwrap_or(Value::Null),
        "messages": messages,
        "max_tokens": max_tokens,
    });

    if !system_text.is_empty() {
        anthropic_req["system"] = Value::String(system_text);
    }
    for field in ["temperature", "top_p", "stream"] {
        if let Some(v) = req.get(field) {
            anthropic_req[field] = v.clone();
        }
    }
    match req.get("stop") {
        Some(Value::String(s)) => anthropic_req["stop_sequences"] = json!([s]),
        Some(Value::Array(stops)) => anthropic_req["stop_sequences"] = json!(stops),
        _ => {}
    }
    if let Some(tools) = convert_tools(req) {
        anthropic_req["tools"] = tools;
    }
    if let Some(tc) = req.get("tool_choice") {
        anthropic_req["tool_choice"] = convert_tool_choice(tc);
    }
    if let Some(effort) = req.get("reasoning_effort").and_then(|e| e.as_str()) {
        let budget = env::openai_effort_to_anthropic_tokens(effort)?;
        anthropic_req["thinking"] = json!({"type": "enabled", "budget_tokens": budget});
    }

    Ok(anthropic_req)
}

fn extract_system_messages(req: &Value) -> String {
    let mut parts = Vec::new();
    if let Some(messages) = req.get("messages").and_then(|m| m.as_array()) {
        for msg in messages {
            if msg.get("role").and_then(|r| r.as_str()) != Some("system") {
                continue;
            }
            match msg.get("content") {
                Some(Value::String(s)) => parts.push(s.clone()),
                Some(Value::Array(blocks)) => {
                    for block in blocks {
                        if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                            parts.push(text.to_string());
                        }
                    }
                }
                _ => {}
            }
        }
    }
    parts.join("\n\n")
}

fn convert_messages(req: &Value) -> Result<Vec<Value>, PluginError> {
    let messages = req
        .get("messages")
        .and_then(|m| m.as_array())
        .ok_or_else(|| PluginError("missing messages field".to_string()))?;

    let mut out: Vec<Value> = Vec::new();
    for msg in messages {
        let role = msg.get("role").and_then(|r| r.as_str()).unwrap_or("");
        match role {
            "system" => continue,
            "tool" => {
                let tool_result = json!({
                    "type": "tool_result",
                    "tool_use_id": msg.get("tool_call_id").cloned().unwrap_or(json!("")),
                    "content": msg.get("content").and_then(|c| c.as_str()).unwrap_or(""),
                });
                // consecutive tool results merge into one user turn
                if let Some(last) = out.last_mut()
                    && last.get("role").and_then(|r| r.as_str()) == Some("user")
                    && let Some(blocks) = last.get_mut("content").and_then(|c| c.as_array_mut())
                    && blocks.iter().all(|b| b.get("type").is_some())
                {
                    blocks.push(tool_result);
                    continue;
                }
                out.push(json!({"role": "user", "content": [tool_result]}));
            }
            "assistant" => {
                let mut blocks = Vec::new();
                if let Some(Value::String(s)) = msg.get("content")
                    && !s.is_empty()
                {
                    blocks.push(json!({"type": "text", "text": s}));
                }
                if let Some(tool_calls) = msg.get("tool_calls").and_then(|tc| tc.as_array()) {
                    for tc in tool_calls {
                        let arguments = tc
                            .get("function")
                            .and_then(|f| f.get("arguments"))
                            .and_then(|a| a.as_str())
                            .unwrap_or("{}");
                        let input: Value =
                            serde_json::from_str(arguments).unwrap_or_else(|_| json!({}));
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": tc.get("id").cloned().unwrap_or(json!("")),
                            "name": tc
                                .get("function")
                                .and_then(|f| f.get("name"))
                                .cloned()
                                .unwrap_or(json!("")),
                            "input": input,
                        }));
                    }
                }
                if blocks.is_empty() {
                    blocks.push(json!({"type": "text", "text": ""}));
                }
                out.push(json!({"role": "assistant", "content": blocks}));
            }
            _ => {
                out.push(json!({
                    "role": "user",
                    "content": convert_user_content(msg.get("content")),
                }));
            }
        }
    }
    Ok(out)
}

fn convert_user_content(content: Option<&Value>) -> Value {
    match content {
        Some(Value::String(s)) => Value::String(s.clone()),
        Some(Value::Array(parts)) => {
            let mut blocks = Vec::new();
            for part in parts {
                match part.get("type").and_then(|t| t.as_str()) {
                    Some("text") => {
                        blocks.push(json!({
                            "type": "text",
                            "text": part.get("text").and_then(|t| t.as_str()).unwrap_or(""),
                        }));
                    }
                    Some("image_url") => {
                        let url = part
                            .get("image_url")
                            .and_then(|u| u.get("url"))
                            .and_then(|u| u.as_str())
                            .unwrap_or("");
                        if let Some(block) = convert_image_url(url) {
                            blocks.push(block);
                        }
                    }
                    _ => {}
                }
            }
            Value::Array(blocks)
        }
        _ => Value::String(String::new()),
    }
}

fn convert_image_url(url: &str) -> Option<Value> {
    if let Some(rest) = url.strip_prefix("data:") {
        let (meta, data) = rest.split_once(',')?;
        let media_type = meta.split(';').next().unwrap_or("image/png");
        return Some(json!({
            "type": "image",
            "source": {"type": "base64", "media_type": media_type, "data": data},
        }));
    }
    Some(json!({
        "type": "image",
        "source": {"type": "url", "url": url},
    }))
}

fn convert_tools(req: &Value) -> Option<Value> {
    let tools = req.get("tools")?.as_array()?;
    let converted: Vec<Value> = tools
        .iter()
        .filter_map(|tool| {
            let func = tool.get("function")?;
            let name = func.get("name")?.as_str()?;
            Some(json!({
                "name": name,
                "description": func.get("description").and_then(|d| d.as_str()).unwrap_or(""),
                "input_schema": func
                    .get("parameters")
                    .cloned()
                    .unwrap_or(json!({"type": "object", "properties": {}})),
            }))
        })
        .collect();
    if converted.is_empty() {
        None
    } else {
        Some(Value::Array(converted))
    }
}

fn convert_tool_choice(tc: &Value) -> Value {
    match tc {
        Value::String(s) => match s.as_str() {
            "none" => json!({"type": "none"}),
            "required" => json!({"type": "any"}),
            _ => json!({"type": "auto"}),
        },
        Value::Object(_) => {
            match tc
                .get("function")
                .and_then(|f| f.get("name"))
                .and_then(|n| n.as_str())
            {
                Some(name) => json!({"type": "tool", "name": name}),
                None => json!({"type": "auto"}),
            }
        }
        _ => json!({"type": "auto"}),
    }
}

// ─── Responses (OpenAI upstream → Anthropic client) ────────────────────────

fn map_finish_reason(finish: Option<&str>) -> &'static str {
    match finish {
        Some("length") => "max_tokens",
        Some("tool_calls") => "tool_use",
        _ => "end_turn",
    }
}

/// Translate a complete OpenAI chat.completion into an Anthropic
/// Messages response.
pub fn translate_response(resp: &Value) -> Result<Value, PluginError> {
    let choice = resp
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|arr| arr.first())
        .ok_or_else(|| PluginError("response has no choices".to_string()))?;
    let message = choice.get("message").cloned().unwrap_or(json!({}));

    let mut content = Vec::new();
    if let Some(text) = message.get("content").and_then(|c| c.as_str())
        && !text.is_empty()
    {
        content.push(json!({"type": "text", "text": text}));
    }
    if let Some(tool_calls) = message.get("tool_calls").and_then(|tc| tc.as_array()) {
        for tc in tool_calls {
            let arguments = tc
                .get("function")
                .and_then(|f| f.get("arguments"))
                .and_then(|a| a.as_str())
                .unwrap_or("{}");
            let input: Value = serde_json::from_str(arguments).unwrap_or_else(|_| json!({}));
            content.push(json!({
                "type": "tool_use",
                "id": tc.get("id").cloned().unwrap_or(json!("")),
                "name": tc
                    .get("function")
                    .and_then(|f| f.get("name"))
                    .cloned()
                    .unwrap_or(json!("")),
                "input": input,
            }));
        }
    }

    let mut anthropic_resp = json!({
        "id": format!("msg_{}", uuid::Uuid::new_v4().simple()),
        "type": "message",
        "role": "assistant",
        "model": resp.get("model").cloned().unwrap_or(json!("unknown")),
        "content": content,
        "stop_reason": map_finish_reason(
            choice.get("finish_reason").and_then(|f| f.as_str()),
        ),
        "stop_sequence": Value::Null,
    });

    if let Some(usage) = resp.get("usage") {
        anthropic_resp["usage"] = json!({
            "input_tokens": usage.get("prompt_tokens").cloned().unwrap_or(json!(0)),
            "output_tokens": usage.get("completion_tokens").cloned().unwrap_or(json!(0)),
        });
    }

    Ok(anthropic_resp)
}

// ─── Stream synthesis (OpenAI chunks → Anthropic events) ───────────────────

const BLOCK_NONE: i64 = -1;

/// Translate one OpenAI chat.completion.chunk into the Anthropic event
/// framing. The first chunk synthesizes `message_start`; block starts
/// and stops are derived from the delta shapes.
pub fn translate_chunk(
    chunk: &Value,
    state: &mut HashMap<String, Value>,
) -> Result<Vec<Value>, PluginError> {
    let mut events = Vec::new();

    if !get_bool(state, "started") {
        set(state, "started", json!(true));
        set(state, "block_index", json!(BLOCK_NONE));
        set(
            state,
            "message_id",
            json!(format!("msg_{}", uuid::Uuid::new_v4().simple())),
        );
        set(
            state,
            "model",
            chunk.get("model").cloned().unwrap_or(json!("unknown")),
        );
        events.push(json!({
            "type": "message_start",
            "message": {
                "id": get_str(state, "message_id").unwrap_or_default(),
                "type": "message",
                "role": "assistant",
                "model": state.get("model").cloned().unwrap_or(json!("unknown")),
                "content": [],
                "stop_reason": Value::Null,
                "usage": {"input_tokens": 0, "output_tokens": 0},
            },
        }));
    }

    let Some(choice) = chunk
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|arr| arr.first())
    else {
        return Ok(events);
    };
    let delta = choice.get("delta").cloned().unwrap_or(json!({}));

    if let Some(text) = delta.get("content").and_then(|c| c.as_str())
        && !text.is_empty()
    {
        if get_str(state, "block_kind").as_deref() != Some("text") {
            events.extend(close_open_block(state));
            let index = next_block_index(state);
            set(state, "block_kind", json!("text"));
            events.push(json!({
                "type": "content_block_start",
                "index": index,
                "content_block": {"type": "text", "text": ""},
            }));
        }
        events.push(json!({
            "type": "content_block_delta",
            "index": get_i64(state, "block_index").unwrap_or(0),
            "delta": {"type": "text_delta", "text": text},
        }));
    }

    if let Some(tool_calls) = delta.get("tool_calls").and_then(|tc| tc.as_array()) {
        for tc in tool_calls {
            let starts_new_call = tc
                .get("function")
                .and_then(|f| f.get("name"))
                .and_then(|n| n.as_str())
                .is_some();
            if starts_new_call {
                events.extend(close_open_block(state));
                let index = next_block_index(state);
                set(state, "block_kind", json!("tool_use"));
                events.push(json!({
                    "type": "content_block_start",
                    "index": index,
                    "content_block": {
                        "type": "tool_use",
                        "id": tc.get("id").cloned().unwrap_or(json!("")),
                        "name": tc
                            .get("function")
                            .and_then(|f| f.get("name"))
                            .cloned()
                            .unwrap_or(json!("")),
                        "input": {},
                    },
                }));
            }
            if let Some(arguments) = tc
                .get("function")
                .and_then(|f| f.get("arguments"))
                .and_then(|a| a.as_str())
                && !arguments.is_empty()
            {
                events.push(json!({
                    "type": "content_block_delta",
                    "index": get_i64(state, "block_index").unwrap_or(0),
                    "delta": {"type": "input_json_delta", "partial_json": arguments},
                }));
            }
        }
    }

    if let Some(finish) = choice.get("finish_reason").and_then(|f| f.as_str()) {
        events.extend(close_open_block(state));
        let stop_reason = match finish {
            "length" => "max_tokens",
            "tool_calls" => "tool_use",
            _ => "end_turn",
        };
        let output_tokens = chunk
            .get("usage")
            .and_then(|u| u.get("completion_tokens"))
            .cloned()
            .unwrap_or(json!(0));
        events.push(json!({
            "type": "message_delta",
            "delta": {"stop_reason": stop_reason, "stop_sequence": Value::Null},
            "usage": {"output_tokens": output_tokens},
        }));
        events.push(json!({"type": "message_stop"}));
        set(state, "finished", json!(true));
    }

    Ok(events)
}

/// End-of-stream synthesis: close out the event framing when the
/// upstream stream ended without a finish_reason.
pub fn flush(state: &mut HashMap<String, Value>) -> Vec<Value> {
    if !get_bool(state, "started") || get_bool(state, "finished") {
        return Vec::new();
    }
    set(state, "finished", json!(true));
    let mut events = close_open_block(state);
    events.push(json!({
        "type": "message_delta",
        "delta": {"stop_reason": "end_turn", "stop_sequence": Value::Null},
        "usage": {"output_tokens": 0},
    }));
    events.push(json!({"type": "message_stop"}));
    events
}

fn close_open_block(state: &mut HashMap<String, Value>) -> Vec<Value> {
    if get_str(state, "block_kind").is_none() {
        return Vec::new();
    }
    let index = get_i64(state, "block_index").unwrap_or(0);
    state.remove("block_kind");
    vec![json!({"type": "content_block_stop", "index": index})]
}

fn next_block_index(state: &mut HashMap<String, Value>) -> i64 {
    let index = get_i64(state, "block_index").unwrap_or(BLOCK_NONE) + 1;
    set(state, "block_index", json!(index));
    index
}
