use crate::entry::LogEntry;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

/// JSON-Lines mirror of the access log for external tailers, one file
/// per day: `<dir>/access-YYYY-MM-DD.log`.
pub struct JsonlMirror {
    dir: PathBuf,
    current: Mutex<Option<(String, std::fs::File)>>,
}

impl JsonlMirror {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            current: Mutex::new(None),
        }
    }

    pub fn append(&self, entry: &LogEntry) {
        let line = match serde_json::to_string(entry) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "access log mirror serialization failed");
                return;
            }
        };

        let date = chrono::Utc::now().format("%Y-%m-%d").to_string();
        let mut guard = self.current.lock().expect("mirror lock poisoned");

        let rotate = guard.as_ref().map(|(d, _)| d != &date).unwrap_or(true);
        if rotate {
            if let Err(e) = std::fs::create_dir_all(&self.dir) {
                tracing::warn!(error = %e, "access log mirror directory creation failed");
                return;
            }
            let path = self.dir.join(format!("access-{date}.log"));
            match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
                Ok(file) => *guard = Some((date, file)),
                Err(e) => {
                    tracing::warn!(error = %e, path = %path.display(), "access log mirror open failed");
                    return;
                }
            }
        }

        if let Some((_, file)) = guard.as_mut()
            && let Err(e) = writeln!(file, "{line}")
        {
            tracing::warn!(error = %e, "access log mirror write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{AuthInfo, FailoverInfo, SideRefs};

    fn entry(id: &str) -> LogEntry {
        LogEntry {
            request_id: id.to_string(),
            timestamp: 0,
            method: "GET".into(),
            path: "/x".into(),
            query: None,
            status: 200,
            duration_ms: 1,
            route_path: None,
            upstream: None,
            transformer: None,
            transformed_path: None,
            processing_steps: Vec::new(),
            auth: AuthInfo::default(),
            error_message: None,
            body_refs: SideRefs::default(),
            header_refs: SideRefs::default(),
            failover: FailoverInfo::default(),
        }
    }

    #[test]
    fn appends_json_lines_to_daily_file() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = JsonlMirror::new(dir.path());
        mirror.append(&entry("r1"));
        mirror.append(&entry("r2"));

        let date = chrono::Utc::now().format("%Y-%m-%d").to_string();
        let contents =
            std::fs::read_to_string(dir.path().join(format!("access-{date}.log"))).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["requestId"], "r1");
    }
}
