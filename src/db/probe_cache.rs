//! Cached ffprobe results and per-video language completion state.
//!
//! Two layers: a bounded in-memory map for hot paths and a SQLite mirror
//! that survives restarts. Any entry whose stored mtime differs from the
//! file's current mtime is a miss.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};

use crate::error::MkvToolError;
use crate::mkv::extract::{MkvExtractor, SubtitleStream};
use crate::mkv::mtime_ns;

struct MemCache {
    entries: HashMap<String, (i64, Vec<SubtitleStream>)>,
    order: VecDeque<String>,
}

/// Probe cache with an in-memory LRU bound and a SQLite backing store.
pub struct ProbeCache {
    extractor: Arc<MkvExtractor>,
    mem: Mutex<MemCache>,
    conn: Option<Mutex<Connection>>,
    max_entries: usize,
}

impl ProbeCache {
    /// Opens the cache, degrading to memory-only when the database is
    /// unavailable.
    pub fn open(extractor: Arc<MkvExtractor>, db_path: Option<&Path>, max_entries: usize) -> Self {
        let conn = db_path.and_then(|path| {
            if let Some(parent) = path.parent() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    warn!(path = %parent.display(), error = %e, "Probe cache directory unavailable");
                    return None;
                }
            }
            match Connection::open(path) {
                Ok(conn) => {
                    let created = conn
                        .execute(
                            "CREATE TABLE IF NOT EXISTS probe_cache (
                                path TEXT PRIMARY KEY, mtime_ns INTEGER, streams TEXT
                            )",
                            [],
                        )
                        .and_then(|_| {
                            conn.execute(
                                "CREATE TABLE IF NOT EXISTS cache_entries (
                                    path TEXT PRIMARY KEY, mtime_ns INTEGER, languages TEXT
                                )",
                                [],
                            )
                        });
                    match created {
                        Ok(_) => Some(Mutex::new(conn)),
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "Failed to initialize probe cache");
                            None
                        }
                    }
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to open probe cache");
                    None
                }
            }
        });

        Self {
            extractor,
            mem: Mutex::new(MemCache {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            conn,
            max_entries,
        }
    }

    /// Returns cached subtitle streams for `path`, probing on miss.
    ///
    /// A missing file invalidates any entry and surfaces as
    /// [`MkvToolError::Missing`].
    pub async fn list_streams(&self, path: &Path) -> Result<Vec<SubtitleStream>, MkvToolError> {
        let key = path.to_string_lossy().to_string();
        let mtime = match mtime_ns(path) {
            Ok(mtime) => mtime,
            Err(_) => {
                self.invalidate_path(path);
                return Err(MkvToolError::Missing(path.to_path_buf()));
            }
        };

        {
            let mem = self.mem.lock().unwrap();
            if let Some((stored_mtime, streams)) = mem.entries.get(&key) {
                if *stored_mtime == mtime {
                    return Ok(streams.clone());
                }
            }
        }

        if let Some(streams) = self.load_streams_from_db(&key, mtime) {
            self.store_in_memory(&key, mtime, streams.clone());
            return Ok(streams);
        }

        let streams = self.extractor.list_streams(path).await?;
        self.store_in_memory(&key, mtime, streams.clone());
        self.save_streams_to_db(&key, mtime, &streams);
        Ok(streams)
    }

    fn store_in_memory(&self, key: &str, mtime: i64, streams: Vec<SubtitleStream>) {
        let mut mem = self.mem.lock().unwrap();
        if mem.entries.insert(key.to_string(), (mtime, streams)).is_none() {
            mem.order.push_back(key.to_string());
        }
        while mem.entries.len() > self.max_entries {
            let Some(oldest) = mem.order.pop_front() else {
                break;
            };
            mem.entries.remove(&oldest);
        }
    }

    fn load_streams_from_db(&self, key: &str, mtime: i64) -> Option<Vec<SubtitleStream>> {
        let conn = self.conn.as_ref()?;
        let row: Option<(Option<i64>, Option<String>)> = {
            let conn = conn.lock().unwrap();
            conn.query_row(
                "SELECT mtime_ns, streams FROM probe_cache WHERE path = ?1",
                params![key],
                |row| Ok((row.get(0).ok(), row.get(1).ok())),
            )
            .optional()
            .unwrap_or_default()
        };
        let (stored_mtime, payload) = row?;
        let Some(stored_mtime) = stored_mtime else {
            // Unparseable mtime: drop the row silently.
            self.delete_streams_row(key);
            return None;
        };
        if stored_mtime != mtime {
            return None;
        }
        let payload = payload?;
        match serde_json::from_str::<Vec<SubtitleStream>>(&payload) {
            Ok(streams) => Some(streams),
            Err(e) => {
                debug!(path = key, error = %e, "Dropping undecodable probe cache row");
                self.delete_streams_row(key);
                None
            }
        }
    }

    fn save_streams_to_db(&self, key: &str, mtime: i64, streams: &[SubtitleStream]) {
        let Some(conn) = &self.conn else { return };
        let payload = match serde_json::to_string(streams) {
            Ok(payload) => payload,
            Err(_) => return,
        };
        let conn = conn.lock().unwrap();
        if let Err(e) = conn.execute(
            "INSERT INTO probe_cache (path, mtime_ns, streams) VALUES (?1, ?2, ?3)
             ON CONFLICT(path) DO UPDATE SET
                mtime_ns = excluded.mtime_ns, streams = excluded.streams",
            params![key, mtime, payload],
        ) {
            warn!(path = key, error = %e, "Failed to persist probe result");
        }
    }

    fn delete_streams_row(&self, key: &str) {
        let Some(conn) = &self.conn else { return };
        let conn = conn.lock().unwrap();
        let _ = conn.execute("DELETE FROM probe_cache WHERE path = ?1", params![key]);
    }

    /// Reads the language-completion entry for `path`.
    pub fn get_entry(&self, path: &Path) -> (Option<i64>, Option<HashSet<String>>) {
        let Some(conn) = &self.conn else {
            return (None, None);
        };
        let key = path.to_string_lossy().to_string();
        let row: Option<(Option<i64>, Option<String>)> = {
            let conn = conn.lock().unwrap();
            conn.query_row(
                "SELECT mtime_ns, languages FROM cache_entries WHERE path = ?1",
                params![key],
                |row| Ok((row.get(0).ok(), row.get(1).ok())),
            )
            .optional()
            .unwrap_or_default()
        };
        let Some((stored_mtime, payload)) = row else {
            return (None, None);
        };
        if stored_mtime.is_none() {
            self.delete_entry(path);
            return (None, None);
        }
        let languages = payload.map(|raw| decode_languages(&raw)).unwrap_or_default();
        (stored_mtime, Some(languages))
    }

    /// Writes the language-completion entry for `path` at `mtime_ns`.
    pub fn update_entry(&self, path: &Path, mtime_ns: i64, languages: Option<&HashSet<String>>) {
        let Some(conn) = &self.conn else { return };
        let payload = encode_languages(languages);
        let conn = conn.lock().unwrap();
        if let Err(e) = conn.execute(
            "INSERT INTO cache_entries (path, mtime_ns, languages) VALUES (?1, ?2, ?3)
             ON CONFLICT(path) DO UPDATE SET
                mtime_ns = excluded.mtime_ns, languages = excluded.languages",
            params![path.to_string_lossy(), mtime_ns, payload],
        ) {
            warn!(path = %path.display(), error = %e, "Failed to update cache entry");
        }
    }

    /// Deletes the language-completion entry for `path`.
    pub fn delete_entry(&self, path: &Path) {
        let Some(conn) = &self.conn else { return };
        let conn = conn.lock().unwrap();
        let _ = conn.execute(
            "DELETE FROM cache_entries WHERE path = ?1",
            params![path.to_string_lossy()],
        );
    }

    /// Drops cached streams and metadata for `path` from every layer.
    pub fn invalidate_path(&self, path: &Path) {
        let key = path.to_string_lossy().to_string();
        {
            let mut mem = self.mem.lock().unwrap();
            if mem.entries.remove(&key).is_some() {
                mem.order.retain(|k| k != &key);
            }
        }
        self.delete_streams_row(&key);
        self.delete_entry(path);
    }

    /// Deletes persisted entries whose path is not in `valid_paths`. An empty
    /// set deletes everything.
    pub fn prune_entries(&self, valid_paths: &HashSet<String>) {
        let Some(conn) = &self.conn else { return };
        let conn = conn.lock().unwrap();
        let result = if valid_paths.is_empty() {
            conn.execute("DELETE FROM cache_entries", [])
                .and_then(|_| conn.execute("DELETE FROM probe_cache", []))
        } else {
            let placeholders = vec!["?"; valid_paths.len()].join(",");
            let params: Vec<&dyn rusqlite::ToSql> = valid_paths
                .iter()
                .map(|p| p as &dyn rusqlite::ToSql)
                .collect();
            conn.execute(
                &format!("DELETE FROM cache_entries WHERE path NOT IN ({placeholders})"),
                params.as_slice(),
            )
            .and_then(|_| {
                conn.execute(
                    &format!("DELETE FROM probe_cache WHERE path NOT IN ({placeholders})"),
                    params.as_slice(),
                )
            })
        };
        if let Err(e) = result {
            warn!(error = %e, "Failed to prune probe cache");
        }
    }

    #[cfg(test)]
    pub(crate) fn memory_len(&self) -> usize {
        self.mem.lock().unwrap().entries.len()
    }

    #[cfg(test)]
    pub(crate) fn seed_memory(&self, path: &Path, mtime: i64, streams: Vec<SubtitleStream>) {
        self.store_in_memory(&path.to_string_lossy(), mtime, streams);
    }
}

fn encode_languages(languages: Option<&HashSet<String>>) -> Option<String> {
    let languages = languages?;
    let mut sorted: Vec<&String> = languages.iter().filter(|l| !l.is_empty()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort();
    serde_json::to_string(&sorted).ok()
}

fn decode_languages(payload: &str) -> HashSet<String> {
    match serde_json::from_str::<Vec<String>>(payload) {
        Ok(langs) => langs.into_iter().collect(),
        Err(_) => {
            debug!(data = payload, "Dropping undecodable language payload");
            HashSet::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    fn stream(lang: &str) -> SubtitleStream {
        SubtitleStream {
            ffprobe_index: 2,
            subtitle_index: 1,
            codec: Some("subrip".into()),
            language: Some(lang.into()),
            title: None,
            forced: false,
            default: false,
            char_count: None,
            cue_count: None,
            duration: None,
        }
    }

    fn cache(dir: &tempfile::TempDir, max_entries: usize) -> ProbeCache {
        ProbeCache::open(
            Arc::new(MkvExtractor::new()),
            Some(&dir.path().join("probe_cache.db")),
            max_entries,
        )
    }

    fn touch(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, "x").unwrap();
        path
    }

    #[tokio::test]
    async fn memory_hit_at_matching_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir, 8);
        let video = touch(&dir, "a.mkv");
        let mtime = mtime_ns(&video).unwrap();

        cache.seed_memory(&video, mtime, vec![stream("eng")]);
        let streams = cache.list_streams(&video).await.unwrap();
        assert_eq!(streams[0].language.as_deref(), Some("eng"));
    }

    #[tokio::test]
    async fn stale_mtime_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir, 8);
        let video = touch(&dir, "a.mkv");
        let mtime = mtime_ns(&video).unwrap();

        // Seed with a different mtime; the lookup must fall through to the
        // extractor, which fails here because ffprobe has nothing to probe.
        cache.seed_memory(&video, mtime - 10, vec![stream("eng")]);
        assert!(cache.list_streams(&video).await.is_err());
    }

    #[tokio::test]
    async fn missing_file_invalidates_and_errors() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir, 8);
        let gone = dir.path().join("gone.mkv");
        cache.update_entry(&gone, 5, None);

        match cache.list_streams(&gone).await {
            Err(MkvToolError::Missing(path)) => assert_eq!(path, gone),
            other => panic!("expected missing error, got {other:?}"),
        }
        assert_eq!(cache.get_entry(&gone).0, None);
    }

    #[test]
    fn language_entry_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir, 8);
        let video = touch(&dir, "a.mkv");

        assert_eq!(cache.get_entry(&video), (None, None));

        let langs: HashSet<String> = ["es".to_string(), "nl".to_string()].into();
        cache.update_entry(&video, 42, Some(&langs));
        let (mtime, stored) = cache.get_entry(&video);
        assert_eq!(mtime, Some(42));
        assert_eq!(stored.unwrap(), langs);

        cache.delete_entry(&video);
        assert_eq!(cache.get_entry(&video), (None, None));
    }

    #[test]
    fn corrupt_language_payload_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir, 8);
        let video = touch(&dir, "a.mkv");
        cache.update_entry(&video, 42, None);
        {
            let conn = cache.conn.as_ref().unwrap().lock().unwrap();
            conn.execute(
                "UPDATE cache_entries SET languages = 'not-json'",
                [],
            )
            .unwrap();
        }
        let (mtime, langs) = cache.get_entry(&video);
        assert_eq!(mtime, Some(42));
        assert!(langs.unwrap().is_empty());
    }

    #[test]
    fn memory_bound_evicts_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir, 2);
        for name in ["a.mkv", "b.mkv", "c.mkv"] {
            let path = touch(&dir, name);
            cache.seed_memory(&path, 1, vec![]);
        }
        assert_eq!(cache.memory_len(), 2);
        let mem = cache.mem.lock().unwrap();
        assert!(!mem
            .entries
            .contains_key(&dir.path().join("a.mkv").to_string_lossy().to_string()));
    }

    #[test]
    fn prune_keeps_only_valid_paths() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir, 8);
        let a = touch(&dir, "a.mkv");
        let b = touch(&dir, "b.mkv");
        cache.update_entry(&a, 1, None);
        cache.update_entry(&b, 1, None);

        let valid: HashSet<String> = [a.to_string_lossy().to_string()].into();
        cache.prune_entries(&valid);
        assert!(cache.get_entry(&a).0.is_some());
        assert!(cache.get_entry(&b).0.is_none());

        cache.prune_entries(&HashSet::new());
        assert!(cache.get_entry(&a).0.is_none());
    }
}
