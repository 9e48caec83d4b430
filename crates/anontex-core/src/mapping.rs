//! Request-scoped mapping storage using SQLite
//!
//! Each anonymized request owns one record holding its synthetic -> original
//! mapping. Records expire after a TTL measured from creation and are read
//! back at most once through [`MappingStore::consume`]. All calls run on the
//! blocking pool so a slow disk never stalls the async workers.

use crate::config::MappingConfig;
use crate::error::{AnontexError, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Synthetic value -> original value for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FakeMapping {
    entries: HashMap<String, String>,
}

impl FakeMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a pair. A later insert for the same synthetic value wins.
    pub fn insert(
        &mut self,
        fake_value: impl Into<String>,
        original_value: impl Into<String>,
    ) -> Option<String> {
        self.entries.insert(fake_value.into(), original_value.into())
    }

    pub fn original_for(&self, fake_value: &str) -> Option<&str> {
        self.entries.get(fake_value).map(String::as_str)
    }

    pub fn contains_fake(&self, fake_value: &str) -> bool {
        self.entries.contains_key(fake_value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(f, o)| (f.as_str(), o.as_str()))
    }

    /// Synthetic values, longest first. Ties break lexically so the order
    /// is stable across runs.
    pub fn fakes_longest_first(&self) -> Vec<&str> {
        let mut fakes: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        fakes.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        fakes
    }
}

impl<F: Into<String>, O: Into<String>> FromIterator<(F, O)> for FakeMapping {
    fn from_iter<I: IntoIterator<Item = (F, O)>>(iter: I) -> Self {
        let mut mapping = FakeMapping::new();
        for (fake, original) in iter {
            mapping.insert(fake, original);
        }
        mapping
    }
}

#[derive(Debug, Clone)]
pub struct MappingRecord {
    pub request_id: String,
    pub mapping: FakeMapping,
    pub created_at: u64,
    pub ttl_seconds: u64,
}

#[derive(Clone)]
pub struct MappingStore {
    conn: Arc<Mutex<Connection>>,
    config: MappingConfig,
}

impl MappingStore {
    pub fn new(config: MappingConfig) -> Result<Self> {
        let conn = if config.database_path == Path::new(":memory:") {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = config.database_path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| AnontexError::MappingStore(e.to_string()))?;
                }
            }
            Connection::open(&config.database_path)?
        };

        initialize_schema(&conn)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            config,
        };

        info!("Initialized mapping store at {:?}", store.config.database_path);
        Ok(store)
    }

    pub fn default_ttl(&self) -> u64 {
        self.config.ttl_seconds
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.config.sweep_interval_seconds.max(1))
    }

    async fn with_conn<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| AnontexError::MappingStore("connection lock poisoned".to_string()))?;
            op(&mut guard)
        })
        .await?
    }

    /// Stores a new record. Writing an id that is still live is an error.
    pub async fn put(
        &self,
        request_id: &str,
        mapping: &FakeMapping,
        ttl_seconds: u64,
    ) -> Result<()> {
        let request_id = request_id.to_string();
        let payload = serde_json::to_string(mapping)?;
        let entries = mapping.len();

        self.with_conn(move |conn| {
            let now = now_millis()?;
            let expires_at = now.saturating_add(ttl_seconds.saturating_mul(1000));
            let tx = conn.transaction()?;
            // An expired record under the same id is dead; make room for the new one.
            tx.execute(
                "DELETE FROM request_mappings WHERE request_id = ?1 AND expires_at <= ?2",
                params![request_id, now as i64],
            )?;
            tx.execute(
                "INSERT INTO request_mappings (request_id, mapping, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![request_id, payload, now as i64, expires_at as i64],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    AnontexError::MappingStore(format!(
                        "request id '{}' already has a live mapping",
                        request_id
                    ))
                }
                other => other.into(),
            })?;
            tx.commit()?;
            debug!(
                "Stored mapping for request '{}' ({} entries, ttl {}s)",
                request_id, entries, ttl_seconds
            );
            Ok(())
        })
        .await
    }

    pub async fn get(&self, request_id: &str) -> Result<FakeMapping> {
        Ok(self.get_record(request_id).await?.mapping)
    }

    pub async fn get_record(&self, request_id: &str) -> Result<MappingRecord> {
        let request_id = request_id.to_string();
        self.with_conn(move |conn| {
            let now = now_millis()?;
            let row: Option<(String, i64, i64)> = conn
                .query_row(
                    "SELECT mapping, created_at, expires_at FROM request_mappings
                     WHERE request_id = ?1 AND expires_at > ?2",
                    params![request_id, now as i64],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;

            match row {
                Some((payload, created_at, expires_at)) => Ok(MappingRecord {
                    mapping: serde_json::from_str(&payload)?,
                    created_at: created_at as u64,
                    ttl_seconds: ((expires_at - created_at).max(0) as u64) / 1000,
                    request_id,
                }),
                None => Err(AnontexError::NotFound(request_id)),
            }
        })
        .await
    }

    /// Atomic read-then-delete. Exactly one of several concurrent callers
    /// for the same id gets the mapping; the rest see `NotFound`.
    pub async fn consume(&self, request_id: &str) -> Result<FakeMapping> {
        let request_id = request_id.to_string();
        self.with_conn(move |conn| {
            let now = now_millis()?;
            let tx = conn.transaction()?;
            let payload: Option<String> = tx
                .query_row(
                    "SELECT mapping FROM request_mappings
                     WHERE request_id = ?1 AND expires_at > ?2",
                    params![request_id, now as i64],
                    |row| row.get(0),
                )
                .optional()?;
            tx.execute("DELETE FROM request_mappings WHERE request_id = ?1", params![request_id])?;
            tx.commit()?;

            match payload {
                Some(payload) => {
                    debug!("Consumed mapping for request '{}'", request_id);
                    Ok(serde_json::from_str(&payload)?)
                }
                None => Err(AnontexError::NotFound(request_id)),
            }
        })
        .await
    }

    /// Removes a record. Returns whether anything was deleted.
    pub async fn delete(&self, request_id: &str) -> Result<bool> {
        let request_id = request_id.to_string();
        self.with_conn(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM request_mappings WHERE request_id = ?1",
                params![request_id],
            )?;
            Ok(deleted > 0)
        })
        .await
    }

    pub async fn purge_expired(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let now = now_millis()?;
            let deleted = conn.execute(
                "DELETE FROM request_mappings WHERE expires_at <= ?1",
                params![now as i64],
            )?;
            if deleted > 0 {
                info!("Purged {} expired mapping records", deleted);
            }
            Ok(deleted)
        })
        .await
    }

    pub async fn statistics(&self) -> Result<MappingStatistics> {
        self.with_conn(|conn| {
            let now = now_millis()? as i64;
            let live_records: i64 = conn.query_row(
                "SELECT COUNT(*) FROM request_mappings WHERE expires_at > ?1",
                params![now],
                |row| row.get(0),
            )?;
            let expired_records: i64 = conn.query_row(
                "SELECT COUNT(*) FROM request_mappings WHERE expires_at <= ?1",
                params![now],
                |row| row.get(0),
            )?;
            let oldest_created_at: Option<i64> = conn.query_row(
                "SELECT MIN(created_at) FROM request_mappings WHERE expires_at > ?1",
                params![now],
                |row| row.get(0),
            )?;

            Ok(MappingStatistics {
                live_records: live_records as usize,
                expired_records: expired_records as usize,
                oldest_live_age_ms: oldest_created_at.map(|created| (now - created).max(0) as u64),
            })
        })
        .await
    }

    pub async fn clear_all(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let deleted = conn.execute("DELETE FROM request_mappings", [])?;
            warn!("Cleared all {} mapping records", deleted);
            Ok(deleted)
        })
        .await
    }
}

fn initialize_schema(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS request_mappings (
            request_id TEXT PRIMARY KEY,
            mapping TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_request_mappings_expires_at
         ON request_mappings(expires_at)",
        [],
    )?;

    debug!("Database schema initialized");
    Ok(())
}

fn now_millis() -> Result<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .map_err(|e| AnontexError::Internal(format!("system clock before epoch: {}", e)))
}

#[derive(Debug)]
pub struct MappingStatistics {
    pub live_records: usize,
    pub expired_records: usize,
    pub oldest_live_age_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn create_test_config() -> (MappingConfig, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test_mappings.db");

        let config = MappingConfig {
            database_path: db_path,
            ttl_seconds: 600,
            sweep_interval_seconds: 60,
        };

        (config, temp_dir)
    }

    fn in_memory_store() -> MappingStore {
        MappingStore::new(MappingConfig {
            database_path: PathBuf::from(":memory:"),
            ttl_seconds: 600,
            sweep_interval_seconds: 60,
        })
        .unwrap()
    }

    fn create_test_mapping() -> FakeMapping {
        [("Alice Smith", "Jane Doe"), ("fake@company.com", "jane@example.com")]
            .into_iter()
            .collect()
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let (config, _temp_dir) = create_test_config();
        let store = MappingStore::new(config).unwrap();
        let mapping = create_test_mapping();

        store.put("req-1", &mapping, 600).await.unwrap();

        let record = store.get_record("req-1").await.unwrap();
        assert_eq!(record.mapping, mapping);
        assert_eq!(record.ttl_seconds, 600);
        assert!(record.created_at > 0);

        // get does not consume
        assert_eq!(store.get("req-1").await.unwrap(), mapping);
    }

    #[tokio::test]
    async fn test_unknown_id_not_found() {
        let store = in_memory_store();
        assert!(matches!(store.get("missing").await, Err(AnontexError::NotFound(_))));
        assert!(matches!(store.consume("missing").await, Err(AnontexError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_consume_is_single_use() {
        let store = in_memory_store();
        let mapping = create_test_mapping();
        store.put("req-1", &mapping, 600).await.unwrap();

        assert_eq!(store.consume("req-1").await.unwrap(), mapping);
        assert!(matches!(store.consume("req-1").await, Err(AnontexError::NotFound(_))));
        assert!(matches!(store.get("req-1").await, Err(AnontexError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_concurrent_consume_single_winner() {
        let store = in_memory_store();
        store.put("contended", &create_test_mapping(), 600).await.unwrap();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.consume("contended").await })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => winners += 1,
                Err(AnontexError::NotFound(_)) => {}
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = in_memory_store();
        store.put("short-lived", &create_test_mapping(), 1).await.unwrap();
        assert!(store.get("short-lived").await.is_ok());

        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(matches!(store.get("short-lived").await, Err(AnontexError::NotFound(_))));
        assert!(matches!(store.consume("short-lived").await, Err(AnontexError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_duplicate_live_id_rejected() {
        let store = in_memory_store();
        store.put("dup", &create_test_mapping(), 600).await.unwrap();

        let result = store.put("dup", &FakeMapping::new(), 600).await;
        assert!(matches!(result, Err(AnontexError::MappingStore(_))));
        assert_eq!(store.get("dup").await.unwrap(), create_test_mapping());
    }

    #[tokio::test]
    async fn test_delete() {
        let store = in_memory_store();
        store.put("req-1", &create_test_mapping(), 600).await.unwrap();

        assert!(store.delete("req-1").await.unwrap());
        assert!(!store.delete("req-1").await.unwrap());
        assert!(matches!(store.get("req-1").await, Err(AnontexError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_purge_and_statistics() {
        let store = in_memory_store();
        store.put("expiring", &create_test_mapping(), 1).await.unwrap();
        store.put("live", &create_test_mapping(), 600).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;

        let stats = store.statistics().await.unwrap();
        assert_eq!(stats.live_records, 1);
        assert_eq!(stats.expired_records, 1);
        assert!(stats.oldest_live_age_ms.is_some());

        assert_eq!(store.purge_expired().await.unwrap(), 1);
        let stats = store.statistics().await.unwrap();
        assert_eq!(stats.expired_records, 0);
        assert_eq!(stats.live_records, 1);
    }

    #[tokio::test]
    async fn test_records_isolated_by_id() {
        let store = in_memory_store();
        let first: FakeMapping = [("Bob Stone", "Carl Marx")].into_iter().collect();
        let second: FakeMapping = [("Eve Adams", "Dana Scully")].into_iter().collect();

        store.put("a", &first, 600).await.unwrap();
        store.put("b", &second, 600).await.unwrap();

        assert_eq!(store.consume("b").await.unwrap(), second);
        assert_eq!(store.consume("a").await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_clear_all() {
        let store = in_memory_store();
        store.put("a", &create_test_mapping(), 600).await.unwrap();
        store.put("b", &create_test_mapping(), 600).await.unwrap();

        assert_eq!(store.clear_all().await.unwrap(), 2);
        assert_eq!(store.statistics().await.unwrap().live_records, 0);
    }

    #[test]
    fn test_fake_mapping_ordering() {
        let mapping: FakeMapping = [("Ann", "X"), ("Ann Lee", "Y"), ("Bo", "Z")]
            .into_iter()
            .collect();
        assert_eq!(mapping.fakes_longest_first(), vec!["Ann Lee", "Ann", "Bo"]);
        assert_eq!(mapping.original_for("Bo"), Some("Z"));
    }

    #[test]
    fn test_fake_mapping_last_write_wins() {
        let mut mapping = FakeMapping::new();
        assert_eq!(mapping.insert("Alice Smith", "Jane Doe"), None);
        assert_eq!(mapping.insert("Alice Smith", "John Roe"), Some("Jane Doe".to_string()));
        assert_eq!(mapping.original_for("Alice Smith"), Some("John Roe"));
        assert_eq!(mapping.len(), 1);
    }
}
