//! Persistent index of MKV videos that still need processing.
//!
//! Database trouble never stops the pipeline: when the index cannot be
//! opened or a statement fails, the engine keeps running with in-memory
//! state only.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{params, Connection};
use tracing::warn;

/// Durable MKV work records keyed by path.
pub struct WorkIndex {
    conn: Option<Mutex<Connection>>,
}

impl WorkIndex {
    /// Opens the index at `path`, degrading to a no-op store on failure.
    pub fn open(path: &Path) -> Self {
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(path = %parent.display(), error = %e, "Work index directory unavailable");
                return Self::disabled();
            }
        }
        let conn = match Connection::open(path) {
            Ok(conn) => conn,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to open work index");
                return Self::disabled();
            }
        };
        if let Err(e) = conn.execute(
            "CREATE TABLE IF NOT EXISTS mkv_work (
                path TEXT PRIMARY KEY,
                mtime_ns INTEGER,
                size_bytes INTEGER,
                status TEXT,
                priority INTEGER DEFAULT 1
            )",
            [],
        ) {
            warn!(path = %path.display(), error = %e, "Failed to initialize work index");
            return Self::disabled();
        }
        Self {
            conn: Some(Mutex::new(conn)),
        }
    }

    /// An index that records nothing.
    pub fn disabled() -> Self {
        Self { conn: None }
    }

    /// Upserts a pending row for `path`.
    ///
    /// An identical pending row with the same or lower stored priority is
    /// left untouched; otherwise the row is overwritten with
    /// `status='pending'` and the minimum of the stored and new priority.
    pub fn record_pending(&self, path: &Path, mtime_ns: i64, size_bytes: i64, priority: u8) {
        let Some(conn) = &self.conn else { return };
        let key = path.to_string_lossy();
        let priority = i64::from(priority.min(1));
        let conn = conn.lock().unwrap();
        let result = conn.execute(
            "INSERT INTO mkv_work (path, mtime_ns, size_bytes, status, priority)
             VALUES (?1, ?2, ?3, 'pending', ?4)
             ON CONFLICT(path) DO UPDATE SET
                mtime_ns = excluded.mtime_ns,
                size_bytes = excluded.size_bytes,
                status = 'pending',
                priority = min(excluded.priority, mkv_work.priority)",
            params![key, mtime_ns, size_bytes, priority],
        );
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "Failed to record pending work");
        }
    }

    /// Marks the row for `path` as in progress.
    pub fn mark_in_progress(&self, path: &Path) {
        let Some(conn) = &self.conn else { return };
        let conn = conn.lock().unwrap();
        if let Err(e) = conn.execute(
            "UPDATE mkv_work SET status = 'in_progress' WHERE path = ?1",
            params![path.to_string_lossy()],
        ) {
            warn!(path = %path.display(), error = %e, "Failed to mark work in progress");
        }
    }

    /// Finalizes the row for `path`.
    ///
    /// `missing` deletes the row; `pending` demotes it back to pending,
    /// refreshing mtime/size when provided; otherwise the row is deleted.
    pub fn mark_finished(
        &self,
        path: &Path,
        mtime_ns: Option<i64>,
        size_bytes: Option<i64>,
        pending: bool,
        missing: bool,
    ) {
        if missing {
            self.delete(path);
            return;
        }
        let Some(conn) = &self.conn else { return };
        let key = path.to_string_lossy();
        let conn = conn.lock().unwrap();
        let result = if pending {
            match (mtime_ns, size_bytes) {
                (Some(mtime), Some(size)) => conn.execute(
                    "UPDATE mkv_work SET mtime_ns = ?2, size_bytes = ?3, status = 'pending'
                     WHERE path = ?1",
                    params![key, mtime, size],
                ),
                _ => conn.execute(
                    "UPDATE mkv_work SET status = 'pending' WHERE path = ?1",
                    params![key],
                ),
            }
        } else {
            conn.execute("DELETE FROM mkv_work WHERE path = ?1", params![key])
        };
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "Failed to finalize work record");
        }
    }

    /// Returns every pending or in-progress row, demoting `in_progress` to
    /// `pending` in place. Rows whose path no longer exists are deleted and
    /// omitted.
    pub fn recover_pending(&self) -> Vec<(PathBuf, u8)> {
        let Some(conn) = &self.conn else {
            return Vec::new();
        };
        let rows: Vec<(String, i64)> = {
            let conn = conn.lock().unwrap();
            let mut stmt = match conn.prepare(
                "SELECT path, priority FROM mkv_work WHERE status IN ('pending', 'in_progress')",
            ) {
                Ok(stmt) => stmt,
                Err(e) => {
                    warn!(error = %e, "Failed to query pending work");
                    return Vec::new();
                }
            };
            let result = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
                .and_then(|rows| rows.collect());
            match result {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(error = %e, "Failed to read pending work");
                    return Vec::new();
                }
            }
        };
        {
            let conn = conn.lock().unwrap();
            if let Err(e) = conn.execute(
                "UPDATE mkv_work SET status = 'pending' WHERE status = 'in_progress'",
                [],
            ) {
                warn!(error = %e, "Failed to demote in-progress work");
            }
        }

        let mut recovered = Vec::new();
        for (raw_path, priority) in rows {
            let path = PathBuf::from(raw_path);
            if !path.exists() {
                self.delete(&path);
                continue;
            }
            recovered.push((path, priority.clamp(0, 1) as u8));
        }
        recovered
    }

    /// Deletes rows whose path is not in `valid_paths`. An empty set deletes
    /// every row.
    pub fn prune_missing(&self, valid_paths: &HashSet<String>) {
        let Some(conn) = &self.conn else { return };
        let conn = conn.lock().unwrap();
        let result = if valid_paths.is_empty() {
            conn.execute("DELETE FROM mkv_work", [])
        } else {
            let placeholders = vec!["?"; valid_paths.len()].join(",");
            let sql = format!("DELETE FROM mkv_work WHERE path NOT IN ({placeholders})");
            let params: Vec<&dyn rusqlite::ToSql> = valid_paths
                .iter()
                .map(|p| p as &dyn rusqlite::ToSql)
                .collect();
            conn.execute(&sql, params.as_slice())
        };
        if let Err(e) = result {
            warn!(error = %e, "Failed to prune work index");
        }
    }

    /// Deletes the row for `path`.
    pub fn delete(&self, path: &Path) {
        let Some(conn) = &self.conn else { return };
        let conn = conn.lock().unwrap();
        if let Err(e) = conn.execute(
            "DELETE FROM mkv_work WHERE path = ?1",
            params![path.to_string_lossy()],
        ) {
            warn!(path = %path.display(), error = %e, "Failed to delete work record");
        }
    }

    #[cfg(test)]
    fn rows(&self) -> Vec<(String, String, i64)> {
        let conn = self.conn.as_ref().unwrap().lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT path, status, priority FROM mkv_work ORDER BY path")
            .unwrap();
        stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap()
    }
}
