//! Browser-local-storage equivalent backed by SQLite.
//!
//! Every value is a JSON text under a string key. Series are persisted as
//! `{"<block>": "<hex without 0x>"}` objects; event datasets as plain JSON documents.
//! Corrupt or absent entries read back as empty, never as an error.

use crate::error::{AggregatorError, Result};
use alloy::primitives::Address;
use rusqlite::ffi::ErrorCode;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const DEFAULT_CACHE_DB_PATH: &str = "bwork_cache.db";

static LAST_CACHE_DB_NOW_MS: AtomicU64 = AtomicU64::new(1);

/// Persisted series: block number -> hex-encoded sample value.
pub type SeriesEntries = BTreeMap<u64, String>;

/// `<descriptor>_<rangeLabel>_<contractPrefix>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(descriptor: &str, range_label: &str, contract: Address) -> Self {
        Self(format!(
            "{}_{}_{}",
            descriptor,
            range_label,
            contract_prefix(contract)
        ))
    }

    pub fn fixed(name: &str) -> Self {
        Self(name.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// First seven characters of the lower-case `0x`-prefixed address (`0x` + five hex digits).
pub fn contract_prefix(contract: Address) -> String {
    let full = format!("{contract:#x}");
    full[..7].to_string()
}

#[derive(Debug, Clone)]
pub struct CacheDb {
    path: PathBuf,
}

impl CacheDb {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Self {
            path: path.as_ref().to_path_buf(),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_schema(&self) -> Result<()> {
        self.with_connection("ensure_schema", |conn| {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS kv_cache (
                    cache_key TEXT PRIMARY KEY NOT NULL,
                    value TEXT NOT NULL,
                    updated_at_ms INTEGER NOT NULL
                );
                "#,
            )?;
            let _ = conn.execute_batch(
                r#"
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                "#,
            );
            Ok(())
        })
    }

    fn read_raw(&self, key: &CacheKey) -> Option<String> {
        match self.with_connection("read_raw", |conn| {
            conn.query_row(
                "SELECT value FROM kv_cache WHERE cache_key = ?1 LIMIT 1",
                params![key.as_str()],
                |row| row.get::<_, String>(0),
            )
            .optional()
        }) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!("[CACHE] read of `{}` failed, treating as empty: {}", key, err);
                None
            }
        }
    }

    fn write_raw(&self, key: &CacheKey, value: &str) -> Result<()> {
        let now = to_i64(now_ms());
        self.with_connection("write_raw", |conn| {
            conn.execute(
                r#"
                INSERT INTO kv_cache (cache_key, value, updated_at_ms)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(cache_key) DO UPDATE SET
                    value = excluded.value,
                    updated_at_ms = excluded.updated_at_ms
                "#,
                params![key.as_str(), value, now],
            )
        })
        .map(|_| ())
    }

    pub fn delete(&self, key: &CacheKey) -> Result<()> {
        self.with_connection("delete", |conn| {
            conn.execute(
                "DELETE FROM kv_cache WHERE cache_key = ?1",
                params![key.as_str()],
            )
        })
        .map(|_| ())
    }

    /// Decoded JSON document under `key`; `None` when absent or corrupt.
    pub fn read_json<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let raw = self.read_raw(key)?;
        match serde_json::from_str::<T>(&raw) {
            Ok(value) => Some(value),
            Err(err) => {
                let corrupt = AggregatorError::CacheCorrupt {
                    key: key.to_string(),
                    reason: err.to_string(),
                };
                tracing::warn!("[CACHE] {}; ignoring entry", corrupt);
                None
            }
        }
    }

    pub fn write_json<T: Serialize + ?Sized>(&self, key: &CacheKey, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.write_raw(key, &raw)
    }

    pub fn read_u64(&self, key: &CacheKey) -> Option<u64> {
        self.read_json::<u64>(key)
    }

    pub fn write_u64(&self, key: &CacheKey, value: u64) -> Result<()> {
        self.write_json(key, &value)
    }

    /// Cached series under `key`. Entries whose block does not parse are skipped.
    pub fn read_series(&self, key: &CacheKey) -> SeriesEntries {
        let Some(raw) = self.read_json::<BTreeMap<String, String>>(key) else {
            return SeriesEntries::new();
        };
        let mut out = SeriesEntries::new();
        for (block, value) in raw {
            match block.trim().parse::<u64>() {
                Ok(block) => {
                    out.insert(block, value);
                }
                Err(_) => tracing::debug!("[CACHE] `{}`: skipping non-numeric block `{}`", key, block),
            }
        }
        out
    }

    /// Overwrite `key` with the union of the stored entries and `entries`; new values win.
    pub fn write_series(&self, key: &CacheKey, entries: &SeriesEntries) -> Result<()> {
        let mut merged = self.read_series(key);
        for (block, value) in entries {
            merged.insert(*block, value.clone());
        }
        let as_json: BTreeMap<String, &String> = merged
            .iter()
            .map(|(block, value)| (block.to_string(), value))
            .collect();
        self.write_json(key, &as_json)
    }

    fn with_connection<T, F>(&self, context: &str, op: F) -> Result<T>
    where
        F: Fn(&Connection) -> rusqlite::Result<T>,
    {
        let max_attempts = 6u32;
        let mut last_err = String::new();

        for attempt in 1..=max_attempts {
            let conn = Connection::open(&self.path).map_err(|err| {
                AggregatorError::fatal(format!(
                    "failed to open sqlite database {}: {}",
                    self.path.display(),
                    err
                ))
            })?;
            conn.busy_timeout(Duration::from_millis(5_000))?;

            match op(&conn) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    last_err = err.to_string();
                    if is_sqlite_locked_error(&err) && attempt < max_attempts {
                        continue;
                    }
                    return Err(AggregatorError::fatal(format!(
                        "{} failed for {}: {}",
                        context,
                        self.path.display(),
                        last_err
                    )));
                }
            }
        }

        Err(AggregatorError::fatal(format!(
            "{} failed for {} after {} attempt(s): {}",
            context,
            self.path.display(),
            max_attempts,
            last_err
        )))
    }
}

fn is_sqlite_locked_error(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(code, _) => {
            matches!(
                code.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            )
        }
        _ => {
            let msg = err.to_string().to_ascii_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
    }
}

fn now_ms() -> u64 {
    let sample = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|duration| duration.as_millis() as u64);
    let mut prev = LAST_CACHE_DB_NOW_MS.load(Ordering::Relaxed);
    loop {
        let normalized = sample.unwrap_or(prev).max(prev).max(1);
        match LAST_CACHE_DB_NOW_MS.compare_exchange_weak(
            prev,
            normalized,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return normalized,
            Err(actual) => prev = actual,
        }
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn temp_db_path(prefix: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .ok()
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{}_{}.db", prefix, nanos))
    }

    #[test]
    fn test_cache_key_uses_descriptor_range_and_prefix() {
        let contract: Address = "0xAbCdEf0123456789abcdef0123456789ABCDEF01"
            .parse()
            .expect("address");
        let key = CacheKey::new("miningTarget", "90d", contract);
        assert_eq!(key.as_str(), "miningTarget_90d_0xabcde");
    }

    #[test]
    fn test_series_write_merges_with_existing_entries() {
        let path = temp_db_path("cache_db_merge");
        let db = CacheDb::open(&path).expect("db open");
        let key = CacheKey::fixed("series");

        let first: SeriesEntries = [(10, "01".to_string()), (20, "02".to_string())].into();
        db.write_series(&key, &first).expect("write first");
        let second: SeriesEntries = [(20, "0f".to_string()), (30, "03".to_string())].into();
        db.write_series(&key, &second).expect("write second");

        let read = db.read_series(&key);
        assert_eq!(read.len(), 3);
        assert_eq!(read.get(&10).map(String::as_str), Some("01"));
        assert_eq!(read.get(&20).map(String::as_str), Some("0f"));
        assert_eq!(read.get(&30).map(String::as_str), Some("03"));

        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_corrupt_entries_read_back_empty() {
        let path = temp_db_path("cache_db_corrupt");
        let db = CacheDb::open(&path).expect("db open");
        let key = CacheKey::fixed("broken");
        db.write_raw(&key, "{not json").expect("raw write");

        assert!(db.read_series(&key).is_empty());
        assert_eq!(db.read_u64(&key), None);
        assert!(db.read_series(&CacheKey::fixed("absent")).is_empty());

        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_series_skips_non_numeric_blocks() {
        let path = temp_db_path("cache_db_blocks");
        let db = CacheDb::open(&path).expect("db open");
        let key = CacheKey::fixed("mixed");
        db.write_raw(&key, r#"{"100":"0a","abc":"0b"}"#).expect("raw write");

        let read = db.read_series(&key);
        assert_eq!(read.len(), 1);
        assert_eq!(read.get(&100).map(String::as_str), Some("0a"));

        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_u64_and_delete_round_trip() {
        let path = temp_db_path("cache_db_u64");
        let db = CacheDb::open(&path).expect("db open");
        let key = CacheKey::fixed("tip");
        db.write_u64(&key, 42).expect("write");
        assert_eq!(db.read_u64(&key), Some(42));
        db.delete(&key).expect("delete");
        assert_eq!(db.read_u64(&key), None);

        let _ = fs::remove_file(path);
    }
}
