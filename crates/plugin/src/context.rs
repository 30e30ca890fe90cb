use crate::url::PluginUrl;
use bytes::Bytes;
use serde_json::Value;

/// A complete response a plugin can produce, either to intercept the
/// outbound request or to replace an upstream response.
#[derive(Debug, Clone)]
pub struct PluginHttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl PluginHttpResponse {
    pub fn json(status: u16, body: &Value) -> Self {
        Self {
            status,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: Bytes::from(body.to_string()),
        }
    }
}

/// Mutable per-hook-call view of the in-flight request.
#[derive(Debug)]
pub struct PluginContext {
    /// Correlation id of the client request this attempt belongs to.
    pub request_id: String,
    pub method: String,
    pub url: PluginUrl,
    /// Outbound headers, lowercased names, declaration order.
    pub headers: Vec<(String, String)>,
    /// Parsed JSON body; `None` for non-JSON or empty payloads.
    pub body: Option<Value>,
    /// Present during `on_response`.
    pub response: Option<PluginHttpResponse>,
    /// Present during `on_error`.
    pub error: Option<String>,
}

impl PluginContext {
    pub fn new(
        request_id: impl Into<String>,
        method: impl Into<String>,
        url: PluginUrl,
        headers: Vec<(String, String)>,
        body: Option<Value>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            method: method.into(),
            url,
            headers,
            body,
            response: None,
            error: None,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        let lower = name.to_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| *k == lower)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let lower = name.to_lowercase();
        self.headers.retain(|(k, _)| *k != lower);
        self.headers.push((lower, value.into()));
    }

    pub fn remove_header(&mut self, name: &str) {
        let lower = name.to_lowercase();
        self.headers.retain(|(k, _)| *k != lower);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn header_helpers_are_case_insensitive() {
        let url = PluginUrl::from_url(&url::Url::parse("http://u/x").unwrap());
        let mut ctx = PluginContext::new(
            "req-1",
            "POST",
            url,
            vec![("content-type".into(), "application/json".into())],
            Some(json!({})),
        );
        assert_eq!(ctx.header("Content-Type"), Some("application/json"));
        ctx.set_header("X-Custom", "v");
        assert_eq!(ctx.header("x-custom"), Some("v"));
        ctx.remove_header("CONTENT-TYPE");
        assert!(ctx.header("content-type").is_none());
    }
}
