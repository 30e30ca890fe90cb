use relay_store::{
    AccessLogWriter, AuthInfo, FailoverInfo, JsonlMirror, LogEntry, RequestType, SideKind,
    SideRefs, SideStore,
};
use std::sync::Arc;
use std::time::Instant;

/// Per-request attempt bookkeeping. Owned exclusively by the request
/// handler; every attempt produces one log entry, posted to the async
/// writer in attempt order.
pub struct RequestLogger {
    writer: AccessLogWriter,
    mirror: Arc<JsonlMirror>,
    body_store: Arc<SideStore>,
    header_store: Arc<SideStore>,
    parent_id: String,
    method: String,
    path: String,
    query: Option<String>,
    route_path: Option<String>,
    auth: AuthInfo,
    steps: Vec<String>,
    original_body: Option<bytes::Bytes>,
    original_headers: Vec<(String, String)>,
    started: Instant,
}

/// What one attempt produced, for the log record.
#[derive(Default)]
pub struct AttemptRecord {
    pub attempt_number: u32,
    pub upstream: Option<String>,
    pub status: u16,
    pub request_type: RequestType,
    pub error_message: Option<String>,
    pub transformer: Option<String>,
    pub transformed_path: Option<String>,
    pub request_body: Option<bytes::Bytes>,
    pub request_headers: Option<Vec<(String, String)>>,
    pub response_body: Option<bytes::Bytes>,
    pub response_headers: Option<Vec<(String, String)>>,
}

impl RequestLogger {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        writer: AccessLogWriter,
        mirror: Arc<JsonlMirror>,
        body_store: Arc<SideStore>,
        header_store: Arc<SideStore>,
        method: &str,
        path: &str,
        query: Option<String>,
    ) -> Self {
        Self {
            writer,
            mirror,
            body_store,
            header_store,
            parent_id: uuid::Uuid::new_v4().to_string(),
            method: method.to_string(),
            path: path.to_string(),
            query,
            route_path: None,
            auth: AuthInfo::default(),
            steps: Vec::new(),
            original_body: None,
            original_headers: Vec::new(),
            started: Instant::now(),
        }
    }

    pub fn parent_id(&self) -> &str {
        &self.parent_id
    }

    pub fn set_route(&mut self, route_path: &str) {
        self.route_path = Some(route_path.to_string());
    }

    pub fn set_auth(&mut self, auth: AuthInfo) {
        self.auth = auth;
    }

    /// Capture the untouched client request once, for the
    /// original-request side store entries of every attempt.
    pub fn capture_original(&mut self, headers: &[(String, String)], body: Option<bytes::Bytes>) {
        self.original_headers = headers.to_vec();
        self.original_body = body;
    }

    pub fn step(&mut self, step: &str) {
        self.steps.push(step.to_string());
    }

    /// Emit the log entry for one attempt: side stores first, then the
    /// async writer and the JSONL mirror.
    pub fn log_attempt(&mut self, record: AttemptRecord) {
        let request_id = uuid::Uuid::new_v4().to_string();
        let status = record.status;

        let mut body_refs = SideRefs::default();
        let mut header_refs = SideRefs::default();

        if let Some(body) = &self.original_body {
            body_refs.orig_req =
                self.body_store
                    .save(&request_id, body, SideKind::OriginalRequest, status);
        }
        if !self.original_headers.is_empty() {
            header_refs.orig_req = self.save_headers(
                &request_id,
                &self.original_headers,
                SideKind::OriginalRequest,
                status,
            );
        }
        if let Some(body) = &record.request_body {
            body_refs.req = self.body_store.save(&request_id, body, SideKind::Request, status);
        }
        if let Some(headers) = &record.request_headers {
            header_refs.req = self.save_headers(&request_id, headers, SideKind::Request, status);
        }
        if let Some(body) = &record.response_body {
            body_refs.resp = self.body_store.save(&request_id, body, SideKind::Response, status);
        }
        if let Some(headers) = &record.response_headers {
            header_refs.resp = self.save_headers(&request_id, headers, SideKind::Response, status);
        }

        let is_attempt =
            record.attempt_number > 1 || record.request_type != RequestType::Final;
        let attempt_upstream = record.upstream.clone();
        let entry = LogEntry {
            request_id,
            timestamp: chrono::Utc::now().timestamp_millis(),
            method: self.method.clone(),
            path: self.path.clone(),
            query: self.query.clone(),
            status,
            duration_ms: self.started.elapsed().as_millis() as u64,
            route_path: self.route_path.clone(),
            upstream: record.upstream,
            transformer: record.transformer,
            transformed_path: record.transformed_path,
            processing_steps: self.steps.clone(),
            auth: self.auth.clone(),
            error_message: record.error_message,
            body_refs,
            header_refs,
            failover: FailoverInfo {
                is_attempt,
                parent_request_id: Some(self.parent_id.clone()),
                attempt_number: record.attempt_number.max(1),
                attempt_upstream,
                request_type: record.request_type,
            },
        };

        // the writer enqueues without blocking; the mirror append is a
        // small buffered write
        self.mirror.append(&entry);
        self.writer.write(entry);
    }

    fn save_headers(
        &self,
        request_id: &str,
        headers: &[(String, String)],
        kind: SideKind,
        status: u16,
    ) -> Option<String> {
        let map: serde_json::Map<String, serde_json::Value> = headers
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect();
        let payload = serde_json::Value::Object(map).to_string();
        self.header_store
            .save(request_id, payload.as_bytes(), kind, status)
    }
}
