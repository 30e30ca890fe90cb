use serde_json::{Map, Value};

/// URL fields visible to expressions.
#[derive(Debug, Clone, Default)]
pub struct UrlParts {
    pub pathname: String,
    pub search: String,
    pub host: String,
    pub protocol: String,
}

/// Streaming phase info, present only while a stream is being translated.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub phase: String,
    pub chunk_index: u64,
}

/// The read-only context expressions evaluate against. Built once per
/// attempt from the request snapshot; rule code never mutates it.
#[derive(Debug, Clone)]
pub struct ExpressionContext {
    pub headers: Value,
    pub body: Value,
    pub url: UrlParts,
    pub method: String,
    pub env: Value,
    pub stream: Option<StreamInfo>,
}

impl ExpressionContext {
    pub fn new(headers: Value, body: Value, url: UrlParts, method: String) -> Self {
        Self {
            headers,
            body,
            url,
            method,
            env: capture_env(),
            stream: None,
        }
    }

    pub fn with_stream(mut self, phase: impl Into<String>, chunk_index: u64) -> Self {
        self.stream = Some(StreamInfo {
            phase: phase.into(),
            chunk_index,
        });
        self
    }

    /// The `url` object as expressions see it.
    pub fn url_value(&self) -> Value {
        serde_json::json!({
            "pathname": self.url.pathname,
            "search": self.url.search,
            "host": self.url.host,
            "protocol": self.url.protocol,
        })
    }

    pub fn stream_value(&self) -> Option<Value> {
        self.stream.as_ref().map(|s| {
            serde_json::json!({
                "phase": s.phase,
                "chunkIndex": s.chunk_index,
            })
        })
    }
}

impl Default for ExpressionContext {
    fn default() -> Self {
        Self::new(
            Value::Object(Map::new()),
            Value::Null,
            UrlParts::default(),
            "GET".to_string(),
        )
    }
}

fn capture_env() -> Value {
    let mut map = Map::new();
    for (k, v) in std::env::vars() {
        map.insert(k, Value::String(v));
    }
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_is_captured() {
        // SAFETY: test-local variable, no concurrent env readers in this test binary care.
        unsafe { std::env::set_var("RELAY_CTX_TEST_VAR", "42") };
        let ctx = ExpressionContext::default();
        assert_eq!(ctx.env["RELAY_CTX_TEST_VAR"], "42");
    }

    #[test]
    fn url_value_shape() {
        let ctx = ExpressionContext::new(
            Value::Object(Map::new()),
            Value::Null,
            UrlParts {
                pathname: "/v1/chat".into(),
                search: "?a=1".into(),
                host: "example.com".into(),
                protocol: "https".into(),
            },
            "POST".into(),
        );
        let url = ctx.url_value();
        assert_eq!(url["pathname"], "/v1/chat");
        assert_eq!(url["host"], "example.com");
    }
}
