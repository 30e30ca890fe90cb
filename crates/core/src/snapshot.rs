use crate::error::GatewayError;
use bytes::Bytes;
use serde_json::Value;
use url::Url;

/// Maximum request body captured into a snapshot.
pub const MAX_SNAPSHOT_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone)]
enum SnapshotBody {
    Empty,
    Json(Value),
    Raw(Bytes),
}

/// An immutable copy of the client request, captured once and read by
/// every attempt. Parsed-body reads hand out deep clones so no attempt
/// can observe another attempt's mutations.
#[derive(Debug)]
pub struct RequestSnapshot {
    method: String,
    url: Url,
    headers: Vec<(String, String)>,
    content_type: Option<String>,
    is_json_body: bool,
    body: SnapshotBody,
}

impl RequestSnapshot {
    pub fn capture<'a>(
        method: &str,
        url: Url,
        headers: impl IntoIterator<Item = (&'a str, &'a str)>,
        body: Bytes,
    ) -> Result<Self, GatewayError> {
        let headers: Vec<(String, String)> = headers
            .into_iter()
            .map(|(k, v)| (k.to_lowercase(), v.to_string()))
            .collect();

        let declared_len = headers
            .iter()
            .find(|(k, _)| k == "content-length")
            .and_then(|(_, v)| v.parse::<usize>().ok());
        if declared_len.is_some_and(|n| n > MAX_SNAPSHOT_BYTES) || body.len() > MAX_SNAPSHOT_BYTES {
            return Err(GatewayError::PayloadTooLarge {
                limit: MAX_SNAPSHOT_BYTES,
            });
        }

        let content_type = headers
            .iter()
            .find(|(k, _)| k == "content-type")
            .map(|(_, v)| v.clone());
        let is_json = content_type
            .as_deref()
            .is_some_and(|ct| ct.contains("application/json"));

        let body = if body.is_empty() {
            SnapshotBody::Empty
        } else if is_json {
            match serde_json::from_slice::<Value>(&body) {
                Ok(v) => SnapshotBody::Json(v),
                // declared JSON that does not parse is carried as bytes
                Err(_) => SnapshotBody::Raw(body),
            }
        } else {
            SnapshotBody::Raw(body)
        };

        Ok(Self {
            method: method.to_string(),
            url,
            headers,
            content_type,
            is_json_body: is_json,
            body,
        })
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn pathname(&self) -> &str {
        self.url.path()
    }

    pub fn search(&self) -> String {
        match self.url.query() {
            Some(q) if !q.is_empty() => format!("?{q}"),
            _ => String::new(),
        }
    }

    pub fn host(&self) -> String {
        match (self.url.host_str(), self.url.port()) {
            (Some(h), Some(p)) => format!("{h}:{p}"),
            (Some(h), None) => h.to_string(),
            _ => String::new(),
        }
    }

    pub fn protocol(&self) -> String {
        format!("{}:", self.url.scheme())
    }

    /// Ordered headers with lowercased names.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        let lower = name.to_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| *k == lower)
            .map(|(_, v)| v.as_str())
    }

    pub fn headers_value(&self) -> Value {
        let mut map = serde_json::Map::new();
        for (k, v) in &self.headers {
            map.insert(k.clone(), Value::String(v.clone()));
        }
        Value::Object(map)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn is_json_body(&self) -> bool {
        self.is_json_body
    }

    pub fn has_body(&self) -> bool {
        !matches!(self.body, SnapshotBody::Empty)
    }

    /// Deep-cloned parsed body; `None` when the body is absent or not JSON.
    pub fn body_json(&self) -> Option<Value> {
        match &self.body {
            SnapshotBody::Json(v) => Some(v.clone()),
            _ => None,
        }
    }

    /// Raw body bytes for non-JSON payloads.
    pub fn body_bytes(&self) -> Option<Bytes> {
        match &self.body {
            SnapshotBody::Raw(b) => Some(b.clone()),
            _ => None,
        }
    }

    /// Query parameters in declaration order, duplicates preserved.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        self.url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot_with_body(body: Value) -> RequestSnapshot {
        RequestSnapshot::capture(
            "POST",
            Url::parse("http://localhost:8787/v1/chat/completions?a=1&a=2").unwrap(),
            vec![("Content-Type", "application/json")],
            Bytes::from(serde_json::to_vec(&body).unwrap()),
        )
        .unwrap()
    }

    #[test]
    fn mutation_of_one_read_does_not_leak() {
        let snap = snapshot_with_body(json!({"model": "gpt-4o", "messages": []}));

        let mut first = snap.body_json().unwrap();
        first["model"] = json!("clobbered");
        first["messages"].as_array_mut().unwrap().push(json!("x"));

        let second = snap.body_json().unwrap();
        assert_eq!(second["model"], json!("gpt-4o"));
        assert!(second["messages"].as_array().unwrap().is_empty());
    }

    #[test]
    fn header_names_lowercased_and_ordered() {
        let snap = RequestSnapshot::capture(
            "GET",
            Url::parse("http://u/").unwrap(),
            vec![("X-First", "1"), ("Authorization", "Bearer t"), ("X-Last", "2")],
            Bytes::new(),
        )
        .unwrap();
        let names: Vec<&str> = snap.headers().iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(names, vec!["x-first", "authorization", "x-last"]);
        assert_eq!(snap.header("AUTHORIZATION"), Some("Bearer t"));
    }

    #[test]
    fn oversized_content_length_rejected() {
        let err = RequestSnapshot::capture(
            "POST",
            Url::parse("http://u/").unwrap(),
            vec![("Content-Length", "10485761")],
            Bytes::new(),
        )
        .unwrap_err();
        assert!(matches!(err, GatewayError::PayloadTooLarge { .. }));
    }

    #[test]
    fn non_json_body_kept_as_bytes() {
        let snap = RequestSnapshot::capture(
            "POST",
            Url::parse("http://u/upload").unwrap(),
            vec![("Content-Type", "text/plain")],
            Bytes::from_static(b"raw payload"),
        )
        .unwrap();
        assert!(!snap.is_json_body());
        assert!(snap.body_json().is_none());
        assert_eq!(snap.body_bytes().unwrap(), Bytes::from_static(b"raw payload"));
    }

    #[test]
    fn invalid_json_with_json_content_type_kept_raw() {
        let snap = RequestSnapshot::capture(
            "POST",
            Url::parse("http://u/").unwrap(),
            vec![("Content-Type", "application/json")],
            Bytes::from_static(b"{not json"),
        )
        .unwrap();
        assert!(snap.is_json_body());
        assert!(snap.body_json().is_none());
        assert!(snap.body_bytes().is_some());
    }

    #[test]
    fn url_parts() {
        let snap = snapshot_with_body(json!({}));
        assert_eq!(snap.pathname(), "/v1/chat/completions");
        assert_eq!(snap.search(), "?a=1&a=2");
        assert_eq!(snap.host(), "localhost:8787");
        assert_eq!(snap.protocol(), "http:");
        assert_eq!(
            snap.query_pairs(),
            vec![("a".to_string(), "1".to_string()), ("a".to_string(), "2".to_string())]
        );
    }
}
