//! Cache store: fingerprint-addressed node outputs backed by SQLite.
//!
//! Entries are append-only: a fingerprint is written once and never updated.
//! An unreadable payload is evicted and reported as a miss so the node is
//! recomputed.

use crate::EngineError;
use chrono::{DateTime, Utc};
use df_core::record::Record;
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

/// One stored node output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub node: String,
    pub records: Vec<Record>,
    /// Cost paid when the entry was computed.
    pub cost_usd: f64,
    pub op_version: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: u64,
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub corrupt_evictions: u64,
}

/// Thread-safe cache backed by SQLite.
#[derive(Debug)]
pub struct CacheStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    corrupt: AtomicU64,
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS node_cache (
    fingerprint TEXT PRIMARY KEY,
    node TEXT NOT NULL,
    records_json TEXT NOT NULL,
    cost_usd REAL NOT NULL DEFAULT 0,
    op_version TEXT NOT NULL,
    created_at TEXT NOT NULL,
    hit_count INTEGER NOT NULL DEFAULT 0
)";

fn namespace_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]{0,63}$").ok())
        .as_ref()
}

/// Whether `namespace` is usable as a cache directory name.
pub fn is_valid_namespace(namespace: &str) -> bool {
    namespace_pattern().is_some_and(|re| re.is_match(namespace))
}

fn cache_err(context: &str) -> impl Fn(rusqlite::Error) -> EngineError + '_ {
    move |e| EngineError::Cache(format!("{context}: {e}"))
}

impl CacheStore {
    fn from_connection(conn: Connection, path: Option<PathBuf>) -> Result<Self, EngineError> {
        conn.execute(SCHEMA, [])
            .map_err(cache_err("failed to create cache table"))?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            corrupt: AtomicU64::new(0),
        })
    }

    /// Open (or create) the store at `db_path`.
    pub fn open(db_path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| EngineError::Cache(format!("failed to create {}: {e}", parent.display())))?;
        }
        let conn = Connection::open(db_path).map_err(cache_err("failed to open cache DB"))?;
        Self::from_connection(conn, Some(db_path.to_path_buf()))
    }

    /// Open the store for `namespace` under `root` (`<root>/<namespace>/cache.db`).
    pub fn open_namespace(root: &Path, namespace: &str) -> Result<Self, EngineError> {
        if !is_valid_namespace(namespace) {
            return Err(EngineError::Cache(format!("invalid namespace '{namespace}'")));
        }
        Self::open(&root.join(namespace).join("cache.db"))
    }

    /// Create an in-memory cache (for testing).
    pub fn in_memory() -> Result<Self, EngineError> {
        let conn = Connection::open_in_memory().map_err(cache_err("failed to open in-memory DB"))?;
        Self::from_connection(conn, None)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, EngineError> {
        self.conn
            .lock()
            .map_err(|_| EngineError::Cache("lock poisoned".into()))
    }

    /// Look up an entry. A corrupt payload is deleted, counted as a miss and
    /// reported as `CacheCorruption` so the caller can recompute.
    pub fn lookup(&self, fingerprint: &str) -> Result<Option<CacheEntry>, EngineError> {
        let conn = self.lock()?;
        let row: Option<(String, String, f64, String, String)> = conn
            .query_row(
                "SELECT node, records_json, cost_usd, op_version, created_at
                 FROM node_cache WHERE fingerprint = ?1",
                params![fingerprint],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )
            .optional()
            .map_err(cache_err("cache lookup failed"))?;

        let Some((node, records_json, cost_usd, op_version, created_at)) = row else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        match decode(fingerprint, &records_json, &created_at) {
            Ok((records, created_at)) => {
                let _ = conn.execute(
                    "UPDATE node_cache SET hit_count = hit_count + 1 WHERE fingerprint = ?1",
                    params![fingerprint],
                );
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(CacheEntry {
                    fingerprint: fingerprint.to_string(),
                    node,
                    records,
                    cost_usd,
                    op_version,
                    created_at,
                }))
            }
            Err(err) => {
                tracing::warn!(fingerprint, node = %node, error = %err, "evicting corrupt cache entry");
                conn.execute("DELETE FROM node_cache WHERE fingerprint = ?1", params![fingerprint])
                    .map_err(cache_err("failed to evict corrupt entry"))?;
                self.corrupt.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    /// Write an entry unless the fingerprint is already present.
    /// Returns whether a row was inserted.
    pub fn store(&self, entry: &CacheEntry) -> Result<bool, EngineError> {
        let records_json = serde_json::to_string(&entry.records)
            .map_err(|e| EngineError::Cache(format!("failed to serialize records: {e}")))?;
        let conn = self.lock()?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO node_cache
                 (fingerprint, node, records_json, cost_usd, op_version, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    entry.fingerprint,
                    entry.node,
                    records_json,
                    entry.cost_usd,
                    entry.op_version,
                    entry.created_at.to_rfc3339(),
                ],
            )
            .map_err(cache_err("failed to store cache entry"))?;
        if inserted > 0 {
            self.writes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(inserted > 0)
    }

    /// Presence check that does not touch hit/miss counters.
    pub fn contains(&self, fingerprint: &str) -> Result<bool, EngineError> {
        let conn = self.lock()?;
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM node_cache WHERE fingerprint = ?1",
                params![fingerprint],
                |row| row.get(0),
            )
            .map_err(cache_err("cache lookup failed"))?;
        Ok(n > 0)
    }

    /// Clear all cache entries. Returns the number removed.
    pub fn clear(&self) -> Result<usize, EngineError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM node_cache", [])
            .map_err(cache_err("clear failed"))
    }

    pub fn stats(&self) -> Result<CacheStats, EngineError> {
        let conn = self.lock()?;
        let entries: i64 = conn
            .query_row("SELECT COUNT(*) FROM node_cache", [], |row| row.get(0))
            .map_err(cache_err("stats failed"))?;
        Ok(CacheStats {
            entries: entries.max(0) as u64,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            corrupt_evictions: self.corrupt.load(Ordering::Relaxed),
        })
    }

    #[cfg(test)]
    pub(crate) fn corrupt_payload(&self, fingerprint: &str) {
        if let Ok(conn) = self.lock() {
            let _ = conn.execute(
                "UPDATE node_cache SET records_json = '{not json' WHERE fingerprint = ?1",
                params![fingerprint],
            );
        }
    }
}

fn decode(
    fingerprint: &str,
    records_json: &str,
    created_at: &str,
) -> Result<(Vec<Record>, DateTime<Utc>), EngineError> {
    let corrupt = |message: String| EngineError::CacheCorruption {
        fingerprint: fingerprint.to_string(),
        message,
    };
    let records: Vec<Record> = serde_json::from_str(records_json).map_err(|e| corrupt(e.to_string()))?;
    let created_at = DateTime::parse_from_rfc3339(created_at)
        .map_err(|e| corrupt(e.to_string()))?
        .with_timezone(&Utc);
    Ok((records, created_at))
}

#[cfg(test)]
mod tests {
    use super::*;
    use df_core::record::records_from_value;
    use serde_json::json;

    fn entry(fp: &str, text: &str) -> CacheEntry {
        CacheEntry {
            fingerprint: fp.into(),
            node: "s/upper".into(),
            records: records_from_value(json!([{ "text": text }])),
            cost_usd: 0.25,
            op_version: "1".into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn in_memory_roundtrip_and_counters() {
        let cache = CacheStore::in_memory().unwrap();
        assert!(cache.lookup("fp1").unwrap().is_none());

        assert!(cache.store(&entry("fp1", "A")).unwrap());
        let hit = cache.lookup("fp1").unwrap().unwrap();
        assert_eq!(hit.records[0]["text"], "A");
        assert_eq!(hit.cost_usd, 0.25);

        let stats = cache.stats().unwrap();
        assert_eq!(stats, CacheStats { entries: 1, hits: 1, misses: 1, writes: 1, corrupt_evictions: 0 });
    }

    #[test]
    fn entries_are_append_only() {
        let cache = CacheStore::in_memory().unwrap();
        assert!(cache.store(&entry("fp", "first")).unwrap());
        assert!(!cache.store(&entry("fp", "second")).unwrap());
        assert_eq!(cache.lookup("fp").unwrap().unwrap().records[0]["text"], "first");
        assert_eq!(cache.stats().unwrap().writes, 1);
    }

    #[test]
    fn corrupt_entry_is_evicted_and_missed() {
        let cache = CacheStore::in_memory().unwrap();
        cache.store(&entry("fp", "x")).unwrap();
        cache.corrupt_payload("fp");
        assert!(matches!(cache.lookup("fp"), Err(EngineError::CacheCorruption { .. })));
        assert!(!cache.contains("fp").unwrap());
        assert!(cache.lookup("fp").unwrap().is_none());
        assert_eq!(cache.stats().unwrap().corrupt_evictions, 1);
        // recomputed entry can be written again
        assert!(cache.store(&entry("fp", "y")).unwrap());
    }

    #[test]
    fn clear_removes_everything() {
        let cache = CacheStore::in_memory().unwrap();
        cache.store(&entry("a", "1")).unwrap();
        cache.store(&entry("b", "2")).unwrap();
        assert_eq!(cache.clear().unwrap(), 2);
        assert_eq!(cache.stats().unwrap().entries, 0);
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = CacheStore::open_namespace(dir.path(), "team-a").unwrap();
            cache.store(&entry("fp", "kept")).unwrap();
        }
        let reopened = CacheStore::open_namespace(dir.path(), "team-a").unwrap();
        assert!(reopened.contains("fp").unwrap());
        let other = CacheStore::open_namespace(dir.path(), "team-b").unwrap();
        assert!(!other.contains("fp").unwrap());
    }

    #[test]
    fn namespace_validation() {
        assert!(is_valid_namespace("default"));
        assert!(is_valid_namespace("team_1.v2"));
        assert!(!is_valid_namespace("../etc"));
        assert!(!is_valid_namespace(".hidden"));
        assert!(!is_valid_namespace(""));
        let dir = tempfile::tempdir().unwrap();
        assert!(CacheStore::open_namespace(dir.path(), "a/b").is_err());
    }
}
