use crate::entry::{AuthInfo, FailoverInfo, LogEntry, RequestType, SideRefs};
use crate::migrate;
use rusqlite::Connection;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Queue length that triggers an early asynchronous flush.
const FLUSH_THRESHOLD: usize = 100;
/// Periodic flush interval.
const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Asynchronous batched writer for attempt logs. `write` is
/// enqueue-only and never blocks the request path; batches go to SQLite
/// in a single transaction with `INSERT OR IGNORE` on the unique
/// request id.
#[derive(Clone)]
pub struct AccessLogWriter {
    inner: Arc<Inner>,
}

struct Inner {
    /// `None` when running in degraded mode (migration failure).
    conn: Mutex<Option<Connection>>,
    queue: Mutex<VecDeque<LogEntry>>,
    is_processing: AtomicBool,
    shutdown: AtomicBool,
}

impl AccessLogWriter {
    /// Open (or create) the store and apply migrations. A migration
    /// failure downgrades to degraded logging instead of failing boot.
    pub fn open(path: &Path) -> Self {
        let conn = match migrate::open_database(path) {
            Ok(conn) => match migrate::run_migrations(&conn) {
                Ok(applied) => {
                    if applied > 0 {
                        tracing::info!(applied, "access log migrations applied");
                    }
                    Some(conn)
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "access log migration failed; continuing with degraded logging"
                    );
                    None
                }
            },
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "access log store unavailable; continuing with degraded logging"
                );
                None
            }
        };
        Self::from_conn(conn)
    }

    /// A writer with no backing store; entries are accepted and dropped.
    pub fn degraded() -> Self {
        Self::from_conn(None)
    }

    fn from_conn(conn: Option<Connection>) -> Self {
        Self {
            inner: Arc::new(Inner {
                conn: Mutex::new(conn),
                queue: Mutex::new(VecDeque::new()),
                is_processing: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.inner.conn.lock().expect("conn lock poisoned").is_none()
    }

    /// Start the periodic flusher.
    pub fn start(&self) {
        let writer = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if writer.inner.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                let _ = writer.flush().await;
            }
        });
    }

    /// Enqueue one entry. Kicks an error-silent background flush when
    /// the queue crosses the threshold.
    pub fn write(&self, entry: LogEntry) {
        let len = {
            let mut queue = self.inner.queue.lock().expect("queue lock poisoned");
            queue.push_back(entry);
            queue.len()
        };
        if len >= FLUSH_THRESHOLD {
            let writer = self.clone();
            tokio::spawn(async move {
                let _ = writer.flush().await;
            });
        }
    }

    /// Drain the queue into one transaction. Single-flight; concurrent
    /// callers return immediately.
    pub async fn flush(&self) -> Result<usize, anyhow::Error> {
        if self
            .inner
            .is_processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(0);
        }

        let inner = Arc::clone(&self.inner);
        let result = tokio::task::spawn_blocking(move || {
            let result = flush_blocking(&inner);
            inner.is_processing.store(false, Ordering::SeqCst);
            result
        })
        .await;

        match result {
            Ok(r) => r,
            Err(e) => {
                self.inner.is_processing.store(false, Ordering::SeqCst);
                Err(anyhow::anyhow!("flush task failed: {e}"))
            }
        }
    }

    /// Stop the timer, drain once, and close the store.
    pub async fn close(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        if let Err(e) = self.flush().await {
            tracing::warn!(error = %e, "final access log flush failed");
        }
        let _ = self
            .inner
            .conn
            .lock()
            .expect("conn lock poisoned")
            .take();
    }

    /// Delete rows older than the retention window and compact. Returns
    /// the deleted row count.
    pub async fn cleanup(&self, retention_days: u32) -> Result<usize, anyhow::Error> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let guard = inner.conn.lock().expect("conn lock poisoned");
            let Some(conn) = guard.as_ref() else {
                return Ok(0);
            };
            let cutoff =
                chrono::Utc::now().timestamp() - i64::from(retention_days) * 24 * 60 * 60;
            let deleted =
                conn.execute("DELETE FROM access_logs WHERE created_at < ?1", [cutoff])?;
            conn.execute_batch("VACUUM")?;
            Ok(deleted)
        })
        .await?
    }

    /// Most recent entries, newest first. Consumed by the management
    /// sub-router.
    pub async fn recent(&self, limit: usize) -> Result<Vec<LogEntry>, anyhow::Error> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let guard = inner.conn.lock().expect("conn lock poisoned");
            let Some(conn) = guard.as_ref() else {
                return Ok(Vec::new());
            };
            let mut stmt = conn.prepare(
                "SELECT request_id, timestamp, method, path, query, status, duration_ms,
                        route_path, upstream, transformer, transformed_path, processing_steps,
                        auth_success, auth_level, error_message,
                        body_req_ref, body_resp_ref, body_orig_req_ref,
                        header_req_ref, header_resp_ref, header_orig_req_ref,
                        failover_is_attempt, failover_parent_request_id,
                        failover_attempt_number, failover_attempt_upstream, request_type
                 FROM access_logs ORDER BY timestamp DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map([limit as i64], row_to_entry)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await?
    }

    #[cfg(test)]
    pub(crate) fn queued(&self) -> usize {
        self.inner.queue.lock().unwrap().len()
    }
}

fn flush_blocking(inner: &Inner) -> Result<usize, anyhow::Error> {
    let batch: Vec<LogEntry> = {
        let mut queue = inner.queue.lock().expect("queue lock poisoned");
        queue.drain(..).collect()
    };
    if batch.is_empty() {
        return Ok(0);
    }

    let mut guard = inner.conn.lock().expect("conn lock poisoned");
    let Some(conn) = guard.as_mut() else {
        // degraded mode drops entries
        return Ok(0);
    };

    let result = insert_batch(conn, &batch);
    if result.is_err() {
        // put the batch back at the head of the queue, preserving order
        let mut queue = inner.queue.lock().expect("queue lock poisoned");
        for entry in batch.into_iter().rev() {
            queue.push_front(entry);
        }
    }
    result
}

fn insert_batch(conn: &mut Connection, batch: &[LogEntry]) -> Result<usize, anyhow::Error> {
    let tx = conn.transaction()?;
    let mut inserted = 0;
    {
        let mut stmt = tx.prepare_cached(
            "INSERT OR IGNORE INTO access_logs (
                request_id, timestamp, method, path, query, status, duration_ms,
                route_path, upstream, transformer, transformed_path, processing_steps,
                auth_success, auth_level, error_message,
                body_req_ref, body_resp_ref, body_orig_req_ref,
                header_req_ref, header_resp_ref, header_orig_req_ref,
                failover_is_attempt, failover_parent_request_id,
                failover_attempt_number, failover_attempt_upstream, request_type,
                success, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                      ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28)",
        )?;
        let created_at = chrono::Utc::now().timestamp();
        for entry in batch {
            inserted += stmt.execute(rusqlite::params![
                entry.request_id,
                entry.timestamp,
                entry.method,
                entry.path,
                entry.query,
                entry.status,
                entry.duration_ms as i64,
                entry.route_path,
                entry.upstream,
                entry.transformer,
                entry.transformed_path,
                serde_json::to_string(&entry.processing_steps)?,
                entry.auth.success,
                entry.auth.level,
                entry.error_message,
                entry.body_refs.req,
                entry.body_refs.resp,
                entry.body_refs.orig_req,
                entry.header_refs.req,
                entry.header_refs.resp,
                entry.header_refs.orig_req,
                entry.failover.is_attempt,
                entry.failover.parent_request_id,
                entry.failover.attempt_number,
                entry.failover.attempt_upstream,
                entry.failover.request_type.as_str(),
                entry.success(),
                created_at,
            ])?;
        }
    }
    tx.commit()?;
    Ok(inserted)
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<LogEntry> {
    let steps: String = row.get(11)?;
    let request_type: String = row.get(25)?;
    Ok(LogEntry {
        request_id: row.get(0)?,
        timestamp: row.get(1)?,
        method: row.get(2)?,
        path: row.get(3)?,
        query: row.get(4)?,
        status: row.get(5)?,
        duration_ms: row.get::<_, i64>(6)? as u64,
        route_path: row.get(7)?,
        upstream: row.get(8)?,
        transformer: row.get(9)?,
        transformed_path: row.get(10)?,
        processing_steps: serde_json::from_str(&steps).unwrap_or_default(),
        auth: AuthInfo {
            success: row.get(12)?,
            level: row.get(13)?,
        },
        error_message: row.get(14)?,
        body_refs: SideRefs {
            req: row.get(15)?,
            resp: row.get(16)?,
            orig_req: row.get(17)?,
        },
        header_refs: SideRefs {
            req: row.get(18)?,
            resp: row.get(19)?,
            orig_req: row.get(20)?,
        },
        failover: FailoverInfo {
            is_attempt: row.get(21)?,
            parent_request_id: row.get(22)?,
            attempt_number: row.get(23)?,
            attempt_upstream: row.get(24)?,
            request_type: RequestType::parse(&request_type),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str) -> LogEntry {
        LogEntry {
            request_id: id.to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            method: "POST".into(),
            path: "/v1/chat/completions".into(),
            query: None,
            status: 200,
            duration_ms: 42,
            route_path: Some("/v1".into()),
            upstream: Some("http://u/".into()),
            transformer: None,
            transformed_path: None,
            processing_steps: vec!["route".into(), "proxy".into()],
            auth: AuthInfo { success: true, level: "bearer".into() },
            error_message: None,
            body_refs: SideRefs::default(),
            header_refs: SideRefs::default(),
            failover: FailoverInfo::default(),
        }
    }

    fn open_writer(dir: &tempfile::TempDir) -> AccessLogWriter {
        AccessLogWriter::open(&dir.path().join("access.db"))
    }

    #[tokio::test]
    async fn write_then_flush_persists() {
        let dir = tempfile::tempdir().unwrap();
        let writer = open_writer(&dir);
        writer.write(entry("r1"));
        writer.write(entry("r2"));
        assert_eq!(writer.queued(), 2);
        assert_eq!(writer.flush().await.unwrap(), 2);
        assert_eq!(writer.queued(), 0);

        let recent = writer.recent(10).await.unwrap();
        assert_eq!(recent.len(), 2);
    }

    #[tokio::test]
    async fn duplicate_request_ids_insert_once() {
        let dir = tempfile::tempdir().unwrap();
        let writer = open_writer(&dir);
        writer.write(entry("dup"));
        writer.flush().await.unwrap();

        // replaying the same id inserts zero new rows
        writer.write(entry("dup"));
        assert_eq!(writer.flush().await.unwrap(), 0);
        assert_eq!(writer.recent(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn threshold_kicks_background_flush() {
        let dir = tempfile::tempdir().unwrap();
        let writer = open_writer(&dir);
        for i in 0..FLUSH_THRESHOLD {
            writer.write(entry(&format!("r{i}")));
        }
        // the spawned flush drains the queue shortly after
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if writer.queued() == 0 {
                break;
            }
        }
        assert_eq!(writer.queued(), 0);
        assert_eq!(writer.recent(200).await.unwrap().len(), FLUSH_THRESHOLD);
    }

    #[tokio::test]
    async fn degraded_mode_accepts_and_drops() {
        let writer = AccessLogWriter::degraded();
        assert!(writer.is_degraded());
        writer.write(entry("r1"));
        assert_eq!(writer.flush().await.unwrap(), 0);
        assert!(writer.recent(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cleanup_deletes_old_rows() {
        let dir = tempfile::tempdir().unwrap();
        let writer = open_writer(&dir);
        writer.write(entry("old"));
        writer.flush().await.unwrap();

        // nothing is old enough yet
        assert_eq!(writer.cleanup(1).await.unwrap(), 0);

        // backdate the row, then cleanup removes it
        {
            let guard = writer.inner.conn.lock().unwrap();
            guard
                .as_ref()
                .unwrap()
                .execute(
                    "UPDATE access_logs SET created_at = created_at - 200000",
                    [],
                )
                .unwrap();
        }
        assert_eq!(writer.cleanup(1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn close_drains_queue() {
        let dir = tempfile::tempdir().unwrap();
        let writer = open_writer(&dir);
        writer.write(entry("r1"));
        writer.close().await;
        // store is closed; a reopened connection sees the row
        let reopened = open_writer(&dir);
        assert_eq!(reopened.recent(10).await.unwrap().len(), 1);
    }
}
