use rusqlite::Connection;

/// Numbered migrations, applied in order at startup. Each success is
/// recorded in `schema_migrations`; an already-applied version is
/// skipped on the next boot.
const MIGRATIONS: &[(i64, &str)] = &[
    (
        1,
        "CREATE TABLE IF NOT EXISTS access_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            request_id TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            method TEXT NOT NULL,
            path TEXT NOT NULL,
            query TEXT,
            status INTEGER NOT NULL,
            duration_ms INTEGER NOT NULL,
            route_path TEXT,
            upstream TEXT,
            transformer TEXT,
            transformed_path TEXT,
            processing_steps TEXT NOT NULL DEFAULT '[]',
            auth_success INTEGER NOT NULL DEFAULT 0,
            auth_level TEXT NOT NULL DEFAULT '',
            error_message TEXT,
            body_req_ref TEXT,
            body_resp_ref TEXT,
            body_orig_req_ref TEXT,
            header_req_ref TEXT,
            header_resp_ref TEXT,
            header_orig_req_ref TEXT,
            failover_is_attempt INTEGER NOT NULL DEFAULT 0,
            failover_parent_request_id TEXT,
            failover_attempt_number INTEGER NOT NULL DEFAULT 1,
            failover_attempt_upstream TEXT,
            request_type TEXT NOT NULL DEFAULT 'final',
            success INTEGER NOT NULL DEFAULT 1,
            created_at INTEGER NOT NULL
        )",
    ),
    (
        2,
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_access_logs_request_id
            ON access_logs (request_id)",
    ),
    (
        3,
        "CREATE INDEX IF NOT EXISTS idx_access_logs_timestamp
            ON access_logs (timestamp DESC)",
    ),
    (4, "CREATE INDEX IF NOT EXISTS idx_access_logs_path ON access_logs (path)"),
    (5, "CREATE INDEX IF NOT EXISTS idx_access_logs_status ON access_logs (status)"),
    (6, "CREATE INDEX IF NOT EXISTS idx_access_logs_success ON access_logs (success)"),
    (
        7,
        "CREATE INDEX IF NOT EXISTS idx_access_logs_created_at
            ON access_logs (created_at)",
    ),
];

/// Open the database with the journal settings the write path expects.
pub fn open_database(path: &std::path::Path) -> Result<Connection, anyhow::Error> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(conn)
}

/// Apply pending migrations. Returns the number applied. The caller
/// treats failure as "degraded logging", not a crash.
pub fn run_migrations(conn: &Connection) -> Result<usize, anyhow::Error> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let mut applied = 0;
    for (version, sql) in MIGRATIONS {
        let exists: bool = conn
            .prepare("SELECT 1 FROM schema_migrations WHERE version = ?1")?
            .exists([version])?;
        if exists {
            continue;
        }
        conn.execute_batch(sql)
            .map_err(|e| anyhow::anyhow!("migration {version} failed: {e}"))?;
        conn.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            rusqlite::params![version, chrono::Utc::now().timestamp()],
        )?;
        applied += 1;
    }
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_apply_once() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_database(&dir.path().join("access.db")).unwrap();
        let first = run_migrations(&conn).unwrap();
        assert_eq!(first, MIGRATIONS.len());
        let second = run_migrations(&conn).unwrap();
        assert_eq!(second, 0);

        // the table is usable
        conn.execute(
            "INSERT INTO access_logs (request_id, timestamp, method, path, status, duration_ms, created_at)
             VALUES ('r1', 0, 'GET', '/x', 200, 5, 0)",
            [],
        )
        .unwrap();
    }

    #[test]
    fn unique_request_id_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_database(&dir.path().join("access.db")).unwrap();
        run_migrations(&conn).unwrap();
        let insert = "INSERT OR IGNORE INTO access_logs
            (request_id, timestamp, method, path, status, duration_ms, created_at)
            VALUES ('dup', 0, 'GET', '/x', 200, 5, 0)";
        assert_eq!(conn.execute(insert, []).unwrap(), 1);
        assert_eq!(conn.execute(insert, []).unwrap(), 0);
    }
}
