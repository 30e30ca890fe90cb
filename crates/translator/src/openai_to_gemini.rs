//! OpenAI Chat Completions request → Gemini generateContent request.

use crate::env;
use relay_plugin::PluginError;
use serde_json::{Value, json};

pub fn translate_request(req: &Value) -> Result<Value, PluginError> {
    let mut gemini_req = json!({
        "contents": convert_messages(req)?,
    });

    if let Some(si) = extract_system_instruction(req) {
        gemini_req["systemInstruction"] = si;
    }
    if let Some(gc) = build_generation_config(req)? {
        gemini_req["generationConfig"] = gc;
    }
    if let Some(tools) = convert_tools(req) {
        gemini_req["tools"] = tools;
    }

    // model and stream travel in the URL for Gemini, not the body
    Ok(gemini_req)
}

fn extract_system_instruction(req: &Value) -> Option<Value> {
    let messages = req.get("messages")?.as_array()?;
    let mut parts = Vec::new();
    for msg in messages {
        if msg.get("role").and_then(|r| r.as_str()) != Some("system") {
            continue;
        }
        match msg.get("content") {
            Some(Value::String(s)) => parts.push(json!({"text": s})),
            Some(Value::Array(blocks)) => {
                for block in blocks {
                    if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                        parts.push(json!({"text": text}));
                    }
                }
            }
            _ => {}
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(json!({"parts": parts}))
    }
}

fn convert_messages(req: &Value) -> Result<Vec<Value>, PluginError> {
    let messages = req
        .get("messages")
        .and_then(|m| m.as_array())
        .ok_or_else(|| PluginError("missing messages field".to_string()))?;

    let mut contents: Vec<Value> = Vec::new();
    for msg in messages {
        let role = msg.get("role").and_then(|r| r.as_str()).unwrap_or("");
        if role == "system" {
            continue;
        }

        if role == "tool" {
            let name = msg.get("name").and_then(|n| n.as_str()).unwrap_or("function");
            let content_text = msg.get("content").and_then(|c| c.as_str()).unwrap_or("");
            let response_val = serde_json::from_str::<Value>(content_text)
                .unwrap_or_else(|_| json!({"result": content_text}));
            let part = json!({
                "functionResponse": {"name": name, "response": response_val},
            });
            if let Some(last) = contents.last_mut()
                && last.get("role").and_then(|r| r.as_str()) == Some("user")
                && let Some(parts) = last.get_mut("parts").and_then(|p| p.as_array_mut())
            {
                parts.push(part);
                continue;
            }
            contents.push(json!({"role": "user", "parts": [part]}));
            continue;
        }

        let gemini_role = if role == "assistant" { "model" } else { "user" };
        let parts = convert_content_to_parts(msg);

        // adjacent same-role turns merge, as Gemini requires alternation
        if let Some(last) = contents.last_mut()
            && last.get("role").and_then(|r| r.as_str()) == Some(gemini_role)
            && let Some(existing) = last.get_mut("parts").and_then(|p| p.as_array_mut())
        {
            existing.extend(parts);
            continue;
        }
        contents.push(json!({"role": gemini_role, "parts": parts}));
    }
    Ok(contents)
}

fn convert_content_to_parts(msg: &Value) -> Vec<Value> {
    let mut parts = Vec::new();

    match msg.get("content") {
        Some(Value::String(s)) => parts.push(json!({"text": s})),
        Some(Value::Array(content_parts)) => {
            for part in content_parts {
                match part.get("type").and_then(|t| t.as_str()) {
                    Some("text") => {
                        parts.push(json!({
                            "text": part.get("text").and_then(|t| t.as_str()).unwrap_or(""),
                        }));
                    }
                    Some("image_url") => {
                        let url = part
                            .get("image_url")
                            .and_then(|u| u.get("url"))
                            .and_then(|u| u.as_str())
                            .unwrap_or("");
                        if let Some(inline) = convert_image_url_to_inline(url) {
                            parts.push(inline);
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }

    if let Some(tool_calls) = msg.get("tool_calls").and_then(|tc| tc.as_array()) {
        for tc in tool_calls {
            let arguments = tc
                .get("function")
                .and_then(|f| f.get("arguments"))
                .and_then(|a| a.as_str())
                .unwrap_or("{}");
            let args: Value = serde_json::from_str(arguments).unwrap_or_else(|_| json!({}));
            parts.push(json!({
                "functionCall": {
                    "name": tc
                        .get("function")
                        .and_then(|f| f.get("name"))
                        .and_then(|n| n.as_str())
                        .unwrap_or(""),
                    "args": args,
                }
            }));
        }
    }

    if parts.is_empty() {
        parts.push(json!({"text": ""}));
    }
    parts
}

fn convert_image_url_to_inline(url: &str) -> Option<Value> {
    if let Some(rest) = url.strip_prefix("data:") {
        let (meta, data) = rest.split_once(',')?;
        let mime_type = meta.split(';').next().unwrap_or("image/png");
        return Some(json!({
            "inlineData": {"mimeType": mime_type, "data": data},
        }));
    }
    // remote URLs cannot be inlined; degrade to a text reference
    Some(json!({"text": format!("[image: {url}]")}))
}

fn convert_tools(req: &Value) -> Option<Value> {
    let tools = req.get("tools")?.as_array()?;
    let mut declarations = Vec::new();
    for tool in tools {
        let Some(func) = tool.get("function") else {
            continue;
        };
        let mut decl = json!({
            "name": func.get("name").and_then(|n| n.as_str()).unwrap_or(""),
            "description": func.get("description").and_then(|d| d.as_str()).unwrap_or(""),
        });
        if let Some(params) = func.get("parameters") {
            decl["parameters"] = params.clone();
        }
        declarations.push(decl);
    }
    if declarations.is_empty() {
        None
    } else {
        Some(json!([{"functionDeclarations": declarations}]))
    }
}

fn build_generation_config(req: &Value) -> Result<Option<Value>, PluginError> {
    let mut config = json!({});
    let mut has_any = false;

    if let Some(temp) = req.get("temperature") {
        config["temperature"] = temp.clone();
        has_any = true;
    }
    if let Some(top_p) = req.get("top_p") {
        config["topP"] = top_p.clone();
        has_any = true;
    }
    if let Some(max) = req.get("max_tokens").or_else(|| req.get("max_completion_tokens")) {
        config["maxOutputTokens"] = max.clone();
        has_any = true;
    }
    match req.get("stop") {
        Some(Value::String(s)) => {
            config["stopSequences"] = json!([s]);
            has_any = true;
        }
        Some(Value::Array(stops)) => {
            config["stopSequences"] = json!(stops);
            has_any = true;
        }
        _ => {}
    }
    if let Some(effort) = req.get("reasoning_effort").and_then(|e| e.as_str()) {
        let budget = env::openai_effort_to_gemini_tokens(effort)?;
        config["thinkingConfig"] = json!({"thinkingBudget": budget});
        has_any = true;
    }

    Ok(if has_any { Some(config) } else { None })
}
