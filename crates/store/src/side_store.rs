use std::path::PathBuf;

/// Which payload of the attempt a stored file holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideKind {
    Request,
    Response,
    OriginalRequest,
}

impl SideKind {
    fn prefix(&self) -> &'static str {
        match self {
            SideKind::Request => "request",
            SideKind::Response => "response",
            SideKind::OriginalRequest => "original-request",
        }
    }
}

/// Filesystem store for request/response bodies and headers,
/// partitioned by date: `<root>/YYYY-MM-DD/<kind>-<requestId>.json`.
///
/// Payloads above `max_size` are skipped, except error responses
/// (status ≥ 400), which are always kept.
#[derive(Debug, Clone)]
pub struct SideStore {
    root: PathBuf,
    max_size: usize,
    enabled: bool,
}

impl SideStore {
    pub fn new(root: impl Into<PathBuf>, max_size: usize, enabled: bool) -> Self {
        Self {
            root: root.into(),
            max_size,
            enabled,
        }
    }

    /// Persist one payload. Returns the stored id (relative path) for
    /// the log entry, or `None` when skipped or failed.
    pub fn save(&self, request_id: &str, payload: &[u8], kind: SideKind, status: u16) -> Option<String> {
        if !self.enabled {
            return None;
        }
        if payload.len() > self.max_size && status < 400 {
            return None;
        }

        let date = chrono::Utc::now().format("%Y-%m-%d").to_string();
        let file_name = format!("{}-{}.json", kind.prefix(), request_id);
        let dir = self.root.join(&date);
        if let Err(e) = std::fs::create_dir_all(&dir) {
            tracing::warn!(error = %e, "side store directory creation failed");
            return None;
        }
        let path = dir.join(&file_name);
        match std::fs::write(&path, payload) {
            Ok(()) => Some(format!("{date}/{file_name}")),
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "side store write failed");
                None
            }
        }
    }

    /// Read a stored payload back by its id.
    pub fn load(&self, id: &str) -> Option<Vec<u8>> {
        std::fs::read(self.root.join(id)).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &tempfile::TempDir, max_size: usize) -> SideStore {
        SideStore::new(dir.path(), max_size, true)
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, 1024);
        let id = store
            .save("req-1", b"{\"model\":\"gpt-4o\"}", SideKind::Request, 200)
            .unwrap();
        assert!(id.ends_with("request-req-1.json"));
        assert_eq!(store.load(&id).unwrap(), b"{\"model\":\"gpt-4o\"}");
    }

    #[test]
    fn oversized_payload_skipped_unless_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, 8);
        let big = vec![b'x'; 64];
        assert!(store.save("r", &big, SideKind::Response, 200).is_none());
        // error responses are always stored
        assert!(store.save("r", &big, SideKind::Response, 502).is_some());
    }

    #[test]
    fn disabled_store_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = SideStore::new(dir.path(), 1024, false);
        assert!(store.save("r", b"{}", SideKind::Request, 200).is_none());
    }

    #[test]
    fn kinds_use_distinct_prefixes() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, 1024);
        let a = store.save("r", b"{}", SideKind::Request, 200).unwrap();
        let b = store.save("r", b"{}", SideKind::Response, 200).unwrap();
        let c = store.save("r", b"{}", SideKind::OriginalRequest, 200).unwrap();
        assert!(a.contains("request-r"));
        assert!(b.contains("response-r"));
        assert!(c.contains("original-request-r"));
    }
}
