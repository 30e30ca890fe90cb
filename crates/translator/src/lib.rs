//! Wire-format transformer plugins. Each plugin adapts one inbound
//! vendor format to one upstream format: request bodies on the way out,
//! response bodies and SSE streams on the way back.

pub mod anthropic_to_openai;
pub mod env;
pub mod gemini_to_openai;
pub mod openai_to_anthropic;
pub mod openai_to_gemini;
mod state;

use async_trait::async_trait;
use relay_plugin::{
    Plugin, PluginContext, PluginError, PluginFactory, PluginHttpResponse, PluginRegistry,
    StreamContext, sse,
};
use serde_json::Value;
use std::sync::Arc;

/// OpenAI-format clients talking to an Anthropic upstream.
pub struct OpenAiToAnthropic;

#[async_trait]
impl Plugin for OpenAiToAnthropic {
    fn name(&self) -> &str {
        "openai-to-anthropic"
    }

    fn version(&self) -> Option<&str> {
        Some("1.0.0")
    }

    async fn on_before_request(&self, ctx: &mut PluginContext) -> Result<(), PluginError> {
        if let Some(body) = &ctx.body {
            ctx.body = Some(openai_to_anthropic::translate_request(body)?);
            ctx.url.set_pathname("/v1/messages");
        }
        Ok(())
    }

    async fn on_response(
        &self,
        ctx: &mut PluginContext,
    ) -> Result<Option<PluginHttpResponse>, PluginError> {
        translate_json_response(ctx, anthropic_to_openai::translate_response)
    }

    async fn process_stream_chunk(
        &self,
        chunk: &Value,
        stream: &mut StreamContext,
    ) -> Result<Option<Vec<Value>>, PluginError> {
        if sse::is_done(chunk) {
            // the translated stream emits its own sentinel on message_stop
            return Ok(Some(Vec::new()));
        }
        anthropic_to_openai::translate_chunk(chunk, &mut stream.state).map(Some)
    }
}

/// Anthropic-format clients talking to an OpenAI upstream.
pub struct AnthropicToOpenAi;

#[async_trait]
impl Plugin for AnthropicToOpenAi {
    fn name(&self) -> &str {
        "anthropic-to-openai"
    }

    fn version(&self) -> Option<&str> {
        Some("1.0.0")
    }

    async fn on_before_request(&self, ctx: &mut PluginContext) -> Result<(), PluginError> {
        if let Some(body) = &ctx.body {
            ctx.body = Some(anthropic_to_openai::translate_request(body)?);
            ctx.url.set_pathname("/v1/chat/completions");
        }
        Ok(())
    }

    async fn on_response(
        &self,
        ctx: &mut PluginContext,
    ) -> Result<Option<PluginHttpResponse>, PluginError> {
        translate_json_response(ctx, openai_to_anthropic::translate_response)
    }

    async fn process_stream_chunk(
        &self,
        chunk: &Value,
        stream: &mut StreamContext,
    ) -> Result<Option<Vec<Value>>, PluginError> {
        if sse::is_done(chunk) {
            // Anthropic framing ends with message_stop, not [DONE]
            return Ok(Some(Vec::new()));
        }
        openai_to_anthropic::translate_chunk(chunk, &mut stream.state).map(Some)
    }

    async fn flush_stream(&self, stream: &mut StreamContext) -> Result<Vec<Value>, PluginError> {
        Ok(openai_to_anthropic::flush(&mut stream.state))
    }
}

/// OpenAI-format clients talking to a Gemini upstream.
pub struct OpenAiToGemini;

#[async_trait]
impl Plugin for OpenAiToGemini {
    fn name(&self) -> &str {
        "openai-to-gemini"
    }

    fn version(&self) -> Option<&str> {
        Some("1.0.0")
    }

    async fn on_before_request(&self, ctx: &mut PluginContext) -> Result<(), PluginError> {
        let Some(body) = &ctx.body else {
            return Ok(());
        };
        let model = body
            .get("model")
            .and_then(|m| m.as_str())
            .unwrap_or("gemini-pro")
            .to_string();
        let stream = body.get("stream").and_then(|s| s.as_bool()).unwrap_or(false);

        ctx.body = Some(openai_to_gemini::translate_request(body)?);

        if stream {
            ctx.url
                .set_pathname(format!("/v1beta/models/{model}:streamGenerateContent"));
            ctx.url.set_search("alt=sse");
        } else {
            ctx.url
                .set_pathname(format!("/v1beta/models/{model}:generateContent"));
        }
        Ok(())
    }

    async fn on_response(
        &self,
        ctx: &mut PluginContext,
    ) -> Result<Option<PluginHttpResponse>, PluginError> {
        translate_json_response(ctx, gemini_to_openai::translate_response)
    }

    async fn process_stream_chunk(
        &self,
        chunk: &Value,
        stream: &mut StreamContext,
    ) -> Result<Option<Vec<Value>>, PluginError> {
        if sse::is_done(chunk) {
            return Ok(Some(Vec::new()));
        }
        gemini_to_openai::translate_chunk(chunk, &mut stream.state).map(Some)
    }
}

/// Shared response-hook shape: translate successful JSON bodies, pass
/// upstream errors through untouched.
fn translate_json_response(
    ctx: &mut PluginContext,
    translate: fn(&Value) -> Result<Value, PluginError>,
) -> Result<Option<PluginHttpResponse>, PluginError> {
    let Some(response) = &ctx.response else {
        return Ok(None);
    };
    if response.status >= 400 {
        return Ok(None);
    }
    let Ok(body) = serde_json::from_slice::<Value>(&response.body) else {
        return Ok(None);
    };
    let translated = translate(&body)?;
    Ok(Some(PluginHttpResponse::json(response.status, &translated)))
}

/// Resolver for the plugin registry: the built-in transformer catalog.
pub fn catalog(name: &str) -> Option<PluginFactory> {
    let factory: PluginFactory = match name {
        "openai-to-anthropic" => {
            Arc::new(|_opts| Ok(Arc::new(OpenAiToAnthropic) as Arc<dyn Plugin>))
        }
        "anthropic-to-openai" => {
            Arc::new(|_opts| Ok(Arc::new(AnthropicToOpenAi) as Arc<dyn Plugin>))
        }
        "openai-to-gemini" => Arc::new(|_opts| Ok(Arc::new(OpenAiToGemini) as Arc<dyn Plugin>)),
        _ => return None,
    };
    Some(factory)
}

/// Pre-register the catalog on a registry.
pub fn register_all(registry: &PluginRegistry) {
    for name in ["openai-to-anthropic", "anthropic-to-openai", "openai-to-gemini"] {
        if let Some(factory) = catalog(name) {
            registry.register(name, factory);
        }
    }
}

/// Convenience for tests and the streaming pipeline: run a full event
/// sequence through one plugin's stream hooks.
#[doc(hidden)]
pub async fn run_stream_through(
    plugin: &dyn Plugin,
    events: Vec<Value>,
) -> Result<Vec<Value>, PluginError> {
    let mut ctx = StreamContext::new("test");
    let mut out = Vec::new();
    for event in &events {
        match plugin.process_stream_chunk(event, &mut ctx).await? {
            Some(chunks) => out.extend(chunks),
            None => out.push(event.clone()),
        }
    }
    out.extend(plugin.flush_stream(&mut ctx).await?);
    Ok(out)
}
