//! Gemini generateContent responses → OpenAI Chat Completions shapes.

use crate::state::{get_bool, get_i64, get_str, set};
use relay_plugin::PluginError;
use relay_plugin::sse;
use serde_json::{Value, json};
use std::collections::HashMap;

fn map_finish_reason(finish: &str) -> &'static str {
    match finish {
        "MAX_TOKENS" => "length",
        "SAFETY" | "RECITATION" => "content_filter",
        // STOP and anything else
        _ => "stop",
    }
}

pub fn translate_response(resp: &Value) -> Result<Value, PluginError> {
    let model = resp
        .get("modelVersion")
        .and_then(|v| v.as_str())
        .unwrap_or("gemini");
    let candidate = resp
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|arr| arr.first());

    let mut text_parts = Vec::new();
    let mut tool_calls = Vec::new();
    let mut finish_reason = "stop";

    if let Some(candidate) = candidate {
        if let Some(parts) = candidate
            .get("content")
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.as_array())
        {
            for part in parts {
                if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                    text_parts.push(text.to_string());
                } else if let Some(fc) = part.get("functionCall") {
                    let args = fc.get("args").cloned().unwrap_or_else(|| json!({}));
                    tool_calls.push(json!({
                        "id": format!("call_{}", uuid::Uuid::new_v4()),
                        "type": "function",
                        "function": {
                            "name": fc.get("name").cloned().unwrap_or(json!("")),
                            "arguments": args.to_string(),
                        },
                        "index": tool_calls.len(),
                    }));
                }
            }
        }
        if let Some(finish) = candidate.get("finishReason").and_then(|v| v.as_str()) {
            finish_reason = map_finish_reason(finish);
        }
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

    let mut openai_resp = json!({
        "id": format!("chatcmpl-{}", uuid::Uuid::new_v4()),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": finish_reason,
        }],
    });

    if let Some(u) = resp.get("usageMetadata") {
        let prompt = u.get("promptTokenCount").and_then(|v| v.as_u64()).unwrap_or(0);
        let completion = u
            .get("candidatesTokenCount")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let total = u
            .get("totalTokenCount")
            .and_then(|v| v.as_u64())
            .unwrap_or(prompt + completion);
        openai_resp["usage"] = json!({
            "prompt_tokens": prompt,
            "completion_tokens": completion,
            "total_tokens": total,
        });
    }

    Ok(openai_resp)
}

/// Translate one Gemini stream payload into OpenAI chunks. Gemini
/// streams full candidate objects per event; each becomes one or more
/// delta chunks.
pub fn translate_chunk(
    event: &Value,
    state: &mut HashMap<String, Value>,
) -> Result<Vec<Value>, PluginError> {
    let mut chunks = Vec::new();

    if !get_bool(state, "started") {
        set(state, "started", json!(true));
        set(
            state,
            "id",
            json!(format!("chatcmpl-{}", uuid::Uuid::new_v4())),
        );
        set(state, "created", json!(chrono::Utc::now().timestamp()));
        set(state, "tool_index", json!(-1));
        set(state, "model", json!("gemini"));
        chunks.push(base_chunk(
            state,
            json!({"role": "assistant", "content": ""}),
            Value::Null,
        ));
    }

    if let Some(model) = event.get("modelVersion").and_then(|v| v.as_str()) {
        set(state, "model", json!(model));
    }

    let Some(candidate) = event
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|arr| arr.first())
    else {
        return Ok(chunks);
    };

    if let Some(parts) = candidate
        .get("content")
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
    {
        for part in parts {
            if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                chunks.push(base_chunk(state, json!({"content": text}), Value::Null));
            } else if let Some(fc) = part.get("functionCall") {
                let index = get_i64(state, "tool_index").unwrap_or(-1) + 1;
                set(state, "tool_index", json!(index));
                let args = fc.get("args").cloned().unwrap_or_else(|| json!({}));
                chunks.push(base_chunk(
                    state,
                    json!({
                        "tool_calls": [{
                            "index": index,
                            "id": format!("call_{}", uuid::Uuid::new_v4()),
                            "type": "function",
                            "function": {
                                "name": fc.get("name").cloned().unwrap_or(json!("")),
                                "arguments": args.to_string(),
                            },
                        }],
                    }),
                    Value::Null,
                ));
            }
        }
    }

    if let Some(finish) = candidate.get("finishReason").and_then(|v| v.as_str()) {
        let mut chunk = base_chunk(state, json!({}), json!(map_finish_reason(finish)));
        if let Some(u) = event.get("usageMetadata") {
            let prompt = u.get("promptTokenCount").and_then(|v| v.as_u64()).unwrap_or(0);
            let completion = u
                .get("candidatesTokenCount")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            chunk["usage"] = json!({
                "prompt_tokens": prompt,
                "completion_tokens": completion,
                "total_tokens": prompt + completion,
            });
        }
        chunks.push(chunk);
        chunks.push(sse::done_sentinel());
    }

    Ok(chunks)
}

fn base_chunk(state: &HashMap<String, Value>, delta: Value, finish_reason: Value) -> Value {
    json!({
        "id": get_str(state, "id").unwrap_or_else(|| "chatcmpl-unknown".to_string()),
        "object": "chat.completion.chunk",
        "created": get_i64(state, "created").unwrap_or(0),
        "model": get_str(state, "model").unwrap_or_else(|| "gemini".to_string()),
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish_reason,
        }],
    })
}
