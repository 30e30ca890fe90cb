//! Anthropic-payload → OpenAI-payload translations: requests for the
//! Anthropic-inbound flow, responses and stream events for the
//! OpenAI-inbound flow.

use crate::env;
use crate::state::{get_i64, get_str, set};
use relay_plugin::PluginError;
use relay_plugin::sse;
use serde_json::{Value, json};
use std::collections::HashMap;

/// Translate an Anthropic Messages request into an OpenAI Chat
/// Completions request.
pub fn translate_request(req: &Value) -> Result<Value, PluginError> {
    let mut messages: Vec<Value> = Vec::new();

    // system prompt becomes the leading system message
    match req.get("system") {
        Some(Value::String(s)) if !s.is_empty() => {
            messages.push(json!({"role": "system", "content": s}));
        }
        Some(Value::Array(blocks)) => {
            let text: Vec<&str> = blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                .collect();
            if !text.is_empty() {
                messages.push(json!({"role": "system", "content": text.join("\n\n")}));
            }
        }
        _ => {}
    }

    let source_messages = req
        .get("messages")
        .and_then(|m| m.as_array())
        .ok_or_else(|| PluginError("missing messages field".to_string()))?;

    for msg in source_messages {
        let role = msg.get("role").and_then(|r| r.as_str()).unwrap_or("");
        match role {
            "assistant" => messages.extend(convert_assistant_message(msg)),
            _ => messages.extend(convert_user_message(msg)),
        }
    }

    let mut openai_req = json!({
        "model": req.get("model").cloned().unwrap_or(Value::Null),
        "messages": messages,
    });

    if let Some(max) = req.get("max_tokens") {
        openai_req["max_tokens"] = max.clone();
    }
    for field in ["temperature", "top_p", "stream"] {
        if let Some(v) = req.get(field) {
            openai_req[field] = v.clone();
        }
    }
    if let Some(stop) = req.get("stop_sequences") {
        openai_req["stop"] = stop.clone();
    }
    if let Some(tools) = convert_tools(req) {
        openai_req["tools"] = tools;
    }
    if let Some(tc) = req.get("tool_choice") {
        openai_req["tool_choice"] = convert_tool_choice(tc);
    }
    if let Some(budget) = req
        .get("thinking")
        .and_then(|t| t.get("budget_tokens"))
        .and_then(|b| b.as_u64())
    {
        openai_req["reasoning_effort"] =
            Value::String(env::anthropic_budget_to_openai_effort(budget).to_string());
    }

    Ok(openai_req)
}

fn convert_assistant_message(msg: &Value) -> Vec<Value> {
    let mut text_parts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<Value> = Vec::new();

    match msg.get("content") {
        Some(Value::String(s)) => text_parts.push(s.clone()),
        Some(Value::Array(blocks)) => {
            for block in blocks {
                match block.get("type").and_then(|t| t.as_str()) {
                    Some("text") => {
                        if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                            text_parts.push(text.to_string());
                        }
                    }
                    Some("tool_use") => {
                        let arguments = block
                            .get("input")
                            .map(|i| i.to_string())
                            .unwrap_or_else(|| "{}".to_string());
                        tool_calls.push(json!({
                            "id": block.get("id").cloned().unwrap_or(json!("")),
                            "type": "function",
                            "function": {
                                "name": block.get("name").cloned().unwrap_or(json!("")),
                                "arguments": arguments,
                            },
                        }));
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }

    let content = text_parts.join("");
    let mut message = json!({
        "role": "assistant",
        "content": if content.is_empty() && !tool_calls.is_empty() {
            Value::Null
        } else {
            Value::String(content)
        },
    });
    if !tool_calls.is_empty() {
        message["tool_calls"] = Value::Array(tool_calls);
    }
    vec![message]
}

/// User messages may fan out: tool_result blocks become individual
/// `role: tool` messages, the rest collapses into one user message.
fn convert_user_message(msg: &Value) -> Vec<Value> {
    let mut out = Vec::new();
    let mut parts: Vec<Value> = Vec::new();
    let mut plain_text: Option<String> = None;

    match msg.get("content") {
        Some(Value::String(s)) => plain_text = Some(s.clone()),
        Some(Value::Array(blocks)) => {
            for block in blocks {
                match block.get("type").and_then(|t| t.as_str()) {
                    Some("text") => {
                        let text = block.get("text").and_then(|t| t.as_str()).unwrap_or("");
                        parts.push(json!({"type": "text", "text": text}));
                    }
                    Some("image") => {
                        if let Some(part) = convert_image_block(block) {
                            parts.push(part);
                        }
                    }
                    Some("tool_result") => {
                        let content = match block.get("content") {
                            Some(Value::String(s)) => s.clone(),
                            Some(Value::Array(blocks)) => blocks
                                .iter()
                                .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                                .collect::<Vec<_>>()
                                .join(""),
                            _ => String::new(),
                        };
                        out.push(json!({
                            "role": "tool",
                            "tool_call_id": block.get("tool_use_id").cloned().unwrap_or(json!("")),
                            "content": content,
                        }));
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }

    if let Some(text) = plain_text {
        out.push(json!({"role": "user", "content": text}));
    } else if parts.len() == 1 && parts[0].get("type").and_then(|t| t.as_str()) == Some("text") {
        out.push(json!({"role": "user", "content": parts[0]["text"].clone()}));
    } else if !parts.is_empty() {
        out.push(json!({"role": "user", "content": parts}));
    }
    out
}

fn convert_image_block(block: &Value) -> Option<Value> {
    let source = block.get("source")?;
    match source.get("type").and_then(|t| t.as_str()) {
        Some("base64") => {
            let media_type = source
                .get("media_type")
                .and_then(|m| m.as_str())
                .unwrap_or("image/png");
            let data = source.get("data").and_then(|d| d.as_str())?;
            Some(json!({
                "type": "image_url",
                "image_url": {"url": format!("data:{media_type};base64,{data}")},
            }))
        }
        Some("url") => Some(json!({
            "type": "image_url",
            "image_url": {"url": source.get("url").cloned().unwrap_or(json!(""))},
        })),
        _ => None,
    }
}

fn convert_tools(req: &Value) -> Option<Value> {
    let tools = req.get("tools")?.as_array()?;
    let converted: Vec<Value> = tools
        .iter()
        .filter_map(|tool| {
            let name = tool.get("name")?.as_str()?;
            Some(json!({
                "type": "function",
                "function": {
                    "name": name,
                    "description": tool.get("description").cloned().unwrap_or(json!("")),
                    "parameters": tool
                        .get("input_schema")
                        .cloned()
                        .unwrap_or(json!({"type": "object", "properties": {}})),
                },
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
    match tc.get("type").and_then(|t| t.as_str()) {
        Some("auto") => json!("auto"),
        Some("any") => json!("required"),
        Some("none") => json!("none"),
        Some("tool") => json!({
            "type": "function",
            "function": {"name": tc.get("name").cloned().unwrap_or(json!(""))},
        }),
        _ => json!("auto"),
    }
}

// ─── Responses (Anthropic upstream → OpenAI client) ────────────────────────

fn map_stop_reason(stop_reason: Option<&str>) -> &'static str {
    match stop_reason {
        Some("max_tokens") => "length",
        Some("tool_use") => "tool_calls",
        // end_turn, stop_sequence, and everything else
        _ => "stop",
    }
}

/// Translate a complete Anthropic Messages response into an OpenAI
/// chat.completion object.
pub fn translate_response(resp: &Value) -> Result<Value, PluginError> {
    let id = format!(
        "chatcmpl-{}",
        resp.get("id").and_then(|v| v.as_str()).unwrap_or("unknown")
    );
    let model = resp.get("model").and_then(|v| v.as_str()).unwrap_or("unknown");

    let mut text_parts = Vec::new();
    let mut tool_calls = Vec::new();

    if let Some(content) = resp.get("content").and_then(|c| c.as_array()) {
        for block in content {
            match block.get("type").and_then(|t| t.as_str()) {
                Some("text") => {
                    if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                        text_parts.push(text.to_string());
                    }
                }
                Some("tool_use") => {
                    let arguments = block
                        .get("input")
                        .map(|i| i.to_string())
                        .unwrap_or_else(|| "{}".to_string());
                    tool_calls.push(json!({
                        "id": block.get("id").cloned().unwrap_or(json!("")),
                        "type": "function",
                        "function": {
                            "name": block.get("name").cloned().unwrap_or(json!("")),
                            "arguments": arguments,
                        },
                        "index": tool_calls.len(),
                    }));
                }
                _ => {}
            }
        }
    }

    let finish_reason =
        map_stop_reason(resp.get("stop_reason").and_then(|v| v.as_str()));

    let content = text_parts.join("");
    let mut message = json!({
        "role": "assistant",
        "content": if content.is_empty() && !tool_calls.is_empty() {
            Value::Null
        } else {
            Value::String(content)
        },
    });
    if !tool_calls.is_empty() {
        message["tool_calls"] = Value::Array(tool_calls);
    }

    let mut openai_resp = json!({
        "id": id,
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": finish_reason,
        }],
    });

    if let Some(usage) = resp.get("usage") {
        let input = usage.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
        let output = usage.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
        openai_resp["usage"] = json!({
            "prompt_tokens": input,
            "completion_tokens": output,
            "total_tokens": input + output,
        });
    }

    Ok(openai_resp)
}

/// Translate one Anthropic SSE event into zero or more OpenAI
/// chat.completion.chunk objects. State accumulates across the stream.
pub fn translate_chunk(
    event: &Value,
    state: &mut HashMap<String, Value>,
) -> Result<Vec<Value>, PluginError> {
    let event_type = event
        .get("type")
        .or_else(|| event.get(sse::EVENT_FIELD))
        .and_then(|t| t.as_str())
        .unwrap_or("");
    let mut chunks = Vec::new();

    match event_type {
        "message_start" => {
            if let Some(msg) = event.get("message") {
                set(
                    state,
                    "id",
                    json!(format!(
                        "chatcmpl-{}",
                        msg.get("id").and_then(|v| v.as_str()).unwrap_or("unknown")
                    )),
                );
                set(state, "model", msg.get("model").cloned().unwrap_or(json!("unknown")));
                set(state, "created", json!(chrono::Utc::now().timestamp()));
                set(state, "tool_index", json!(-1));
                set(
                    state,
                    "input_tokens",
                    msg.get("usage")
                        .and_then(|u| u.get("input_tokens"))
                        .cloned()
                        .unwrap_or(json!(0)),
                );
            }
            chunks.push(base_chunk(
                state,
                json!({"role": "assistant", "content": ""}),
                Value::Null,
            ));
        }

        "content_block_start" => {
            if let Some(cb) = event.get("content_block")
                && cb.get("type").and_then(|t| t.as_str()) == Some("tool_use")
            {
                let index = get_i64(state, "tool_index").unwrap_or(-1) + 1;
                set(state, "tool_index", json!(index));
                chunks.push(base_chunk(
                    state,
                    json!({
                        "tool_calls": [{
                            "index": index,
                            "id": cb.get("id").cloned().unwrap_or(json!("")),
                            "type": "function",
                            "function": {
                                "name": cb.get("name").cloned().unwrap_or(json!("")),
                                "arguments": "",
                            },
                        }],
                    }),
                    Value::Null,
                ));
            }
        }

        "content_block_delta" => {
            if let Some(delta) = event.get("delta") {
                match delta.get("type").and_then(|t| t.as_str()) {
                    Some("text_delta") => {
                        let text = delta.get("text").cloned().unwrap_or(json!(""));
                        chunks.push(base_chunk(state, json!({"content": text}), Value::Null));
                    }
                    Some("input_json_delta") => {
                        let partial = delta.get("partial_json").cloned().unwrap_or(json!(""));
                        let index = get_i64(state, "tool_index").unwrap_or(0);
                        chunks.push(base_chunk(
                            state,
                            json!({
                                "tool_calls": [{
                                    "index": index,
                                    "function": {"arguments": partial},
                                }],
                            }),
                            Value::Null,
                        ));
                    }
                    _ => {}
                }
            }
        }

        "message_delta" => {
            let finish = map_stop_reason(
                event
                    .get("delta")
                    .and_then(|d| d.get("stop_reason"))
                    .and_then(|v| v.as_str()),
            );
            let mut chunk = base_chunk(state, json!({}), json!(finish));
            if let Some(usage) = event.get("usage") {
                let output = usage.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
                let input = get_i64(state, "input_tokens").unwrap_or(0) as u64;
                chunk["usage"] = json!({
                    "prompt_tokens": input,
                    "completion_tokens": output,
                    "total_tokens": input + output,
                });
            }
            chunks.push(chunk);
        }

        "message_stop" => {
            chunks.push(sse::done_sentinel());
        }

        // ping, content_block_stop, error frames: nothing to emit
        _ => {}
    }

    Ok(chunks)
}

fn base_chunk(state: &HashMap<String, Value>, delta: Value, finish_reason: Value) -> Value {
    json!({
        "id": get_str(state, "id").unwrap_or_else(|| "chatcmpl-unknown".to_string()),
        "object": "chat.completion.chunk",
        "created": get_i64(state, "created").unwrap_or(0),
        "model": get_str(state, "model").unwrap_or_else(|| "unknown".to_string()),
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish_reason,
        }],
    })
}
