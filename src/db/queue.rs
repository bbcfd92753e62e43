//! Persistent sidecar translation queue.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{params, Connection};
use tracing::warn;

use crate::error::QueueError;

/// One persisted sidecar translation, keyed by `(path, lang)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueRecord {
    pub path: PathBuf,
    pub lang: String,
    pub priority: u8,
}

/// Repository wrapper around the SQLite queue database.
///
/// A single shared connection is serialized behind a mutex so workers may
/// call in freely.
pub struct QueueRepository {
    conn: Mutex<Connection>,
}

impl QueueRepository {
    /// Opens (creating if necessary) the queue database at `path`.
    pub fn open(path: &Path) -> Result<Self, QueueError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| QueueError::OpenFailed {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        }
        let conn = Connection::open(path).map_err(|e| QueueError::OpenFailed {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS queue (
                path TEXT NOT NULL,
                lang TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 1,
                PRIMARY KEY (path, lang)
            )",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Inserts `(path, lang)` if absent, returning whether a row was added.
    ///
    /// A re-add with a numerically lower priority overwrites the stored
    /// priority; it never raises it.
    pub fn add(&self, path: &Path, lang: &str, priority: u8) -> Result<bool, QueueError> {
        let key = path.to_string_lossy();
        let conn = self.conn.lock().unwrap();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO queue (path, lang, priority) VALUES (?1, ?2, ?3)",
            params![key, lang, priority],
        )?;
        if inserted == 0 {
            conn.execute(
                "UPDATE queue SET priority = ?3 WHERE path = ?1 AND lang = ?2 AND priority > ?3",
                params![key, lang, priority],
            )?;
        }
        Ok(inserted > 0)
    }

    /// Removes the record for `(path, lang)`; no-op when absent.
    pub fn remove(&self, path: &Path, lang: &str) -> Result<(), QueueError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM queue WHERE path = ?1 AND lang = ?2",
            params![path.to_string_lossy(), lang],
        )?;
        Ok(())
    }

    /// Removes every record for `path`, regardless of language.
    pub fn remove_path(&self, path: &Path) -> Result<(), QueueError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM queue WHERE path = ?1",
            params![path.to_string_lossy()],
        )?;
        Ok(())
    }

    /// Returns every queued record.
    pub fn all(&self) -> Result<Vec<QueueRecord>, QueueError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT path, lang, priority FROM queue")?;
        let rows = stmt.query_map([], |row| {
            Ok(QueueRecord {
                path: PathBuf::from(row.get::<_, String>(0)?),
                lang: row.get(1)?,
                priority: row.get::<_, i64>(2)?.clamp(0, 1) as u8,
            })
        })?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    /// Returns the number of queued records.
    pub fn count(&self) -> u64 {
        let conn = self.conn.lock().unwrap();
        match conn.query_row("SELECT COUNT(*) FROM queue", [], |row| row.get::<_, i64>(0)) {
            Ok(count) => count.max(0) as u64,
            Err(e) => {
                warn!(error = %e, "Failed to count queue records");
                0
            }
        }
    }

    /// Deletes every record, returning how many were removed.
    pub fn clear(&self) -> Result<u64, QueueError> {
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute("DELETE FROM queue", [])?;
        Ok(removed as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> (tempfile::TempDir, QueueRepository) {
        let dir = tempfile::tempdir().unwrap();
        let repo = QueueRepository::open(&dir.path().join("queue.db")).unwrap();
        (dir, repo)
    }

    #[test]
    fn add_is_idempotent_per_key() {
        let (_dir, repo) = repo();
        let path = Path::new("/data/a.en.srt");
        assert!(repo.add(path, "nl", 1).unwrap());
        assert!(!repo.add(path, "nl", 1).unwrap());
        assert!(repo.add(path, "es", 1).unwrap());
        assert_eq!(repo.count(), 2);
    }

    #[test]
    fn readd_lowers_priority_but_never_raises() {
        let (_dir, repo) = repo();
        let path = Path::new("/data/a.en.srt");
        repo.add(path, "nl", 1).unwrap();
        repo.add(path, "nl", 0).unwrap();
        assert_eq!(repo.all().unwrap()[0].priority, 0);
        repo.add(path, "nl", 1).unwrap();
        assert_eq!(repo.all().unwrap()[0].priority, 0);
    }

    #[test]
    fn remove_is_a_noop_when_absent() {
        let (_dir, repo) = repo();
        let path = Path::new("/data/a.en.srt");
        repo.remove(path, "nl").unwrap();
        repo.add(path, "nl", 1).unwrap();
        repo.remove(path, "nl").unwrap();
        assert_eq!(repo.count(), 0);
    }

    #[test]
    fn remove_path_drops_all_languages() {
        let (_dir, repo) = repo();
        let path = Path::new("/data/a.en.srt");
        repo.add(path, "nl", 1).unwrap();
        repo.add(path, "es", 0).unwrap();
        repo.add(Path::new("/data/b.en.srt"), "nl", 1).unwrap();
        repo.remove_path(path).unwrap();
        let remaining = repo.all().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].path, PathBuf::from("/data/b.en.srt"));
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("queue.db");
        {
            let repo = QueueRepository::open(&db).unwrap();
            repo.add(Path::new("/data/v.en.srt"), "nl", 0).unwrap();
        }
        let repo = QueueRepository::open(&db).unwrap();
        let records = repo.all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].lang, "nl");
        assert_eq!(records[0].priority, 0);
    }
}
