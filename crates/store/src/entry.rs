use serde::{Deserialize, Serialize};

/// How an attempt relates to its client request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestType {
    /// The attempt whose response was returned to the client.
    #[default]
    Final,
    /// A failed attempt that triggered failover.
    Retry,
    /// An attempt against a half-open upstream.
    Recovery,
}

impl RequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::Final => "final",
            RequestType::Retry => "retry",
            RequestType::Recovery => "recovery",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "retry" => RequestType::Retry,
            "recovery" => RequestType::Recovery,
            _ => RequestType::Final,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthInfo {
    pub success: bool,
    pub level: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SideRefs {
    pub req: Option<String>,
    pub resp: Option<String>,
    pub orig_req: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailoverInfo {
    pub is_attempt: bool,
    pub parent_request_id: Option<String>,
    pub attempt_number: u32,
    pub attempt_upstream: Option<String>,
    pub request_type: RequestType,
}

impl Default for FailoverInfo {
    fn default() -> Self {
        Self {
            is_attempt: false,
            parent_request_id: None,
            attempt_number: 1,
            attempt_upstream: None,
            request_type: RequestType::Final,
        }
    }
}

/// One record per attempt. `request_id` is globally unique; replaying a
/// batch with seen ids inserts nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub request_id: String,
    /// Milliseconds since epoch.
    pub timestamp: i64,
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub status: u16,
    pub duration_ms: u64,
    pub route_path: Option<String>,
    pub upstream: Option<String>,
    pub transformer: Option<String>,
    pub transformed_path: Option<String>,
    pub processing_steps: Vec<String>,
    pub auth: AuthInfo,
    pub error_message: Option<String>,
    pub body_refs: SideRefs,
    pub header_refs: SideRefs,
    pub failover: FailoverInfo,
}

impl LogEntry {
    pub fn success(&self) -> bool {
        self.status < 400
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_type_round_trip() {
        for rt in [RequestType::Final, RequestType::Retry, RequestType::Recovery] {
            assert_eq!(RequestType::parse(rt.as_str()), rt);
        }
        assert_eq!(RequestType::parse("garbage"), RequestType::Final);
    }

    #[test]
    fn serializes_camel_case() {
        let entry = LogEntry {
            request_id: "r1".into(),
            timestamp: 0,
            method: "GET".into(),
            path: "/x".into(),
            query: None,
            status: 200,
            duration_ms: 12,
            route_path: None,
            upstream: None,
            transformer: None,
            transformed_path: None,
            processing_steps: vec!["route".into()],
            auth: AuthInfo { success: true, level: "bearer".into() },
            error_message: None,
            body_refs: SideRefs::default(),
            header_refs: SideRefs::default(),
            failover: FailoverInfo::default(),
        };
        let v = serde_json::to_value(&entry).unwrap();
        assert_eq!(v["requestId"], "r1");
        assert_eq!(v["durationMs"], 12);
        assert_eq!(v["failover"]["requestType"], "final");
        assert!(entry.success());
    }
}
