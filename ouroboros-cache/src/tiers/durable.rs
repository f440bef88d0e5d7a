//! Tier3: persistent result store
//!
//! Records survive process restarts and are only removed by invalidation.
//! Expired records stay on disk for analytics; the coordinator simply stops
//! serving them.

use super::{decode_entry, encode_entry, with_timeout};
use crate::config::TierPolicy;
use crate::entry::CacheEntry;
use crate::error::{CacheError, Result};
use crate::types::TierKind;
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Keyed persistent byte store
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn put(&self, key: &str, record: Vec<u8>) -> Result<()>;

    /// Deleting a missing key succeeds
    async fn delete(&self, key: &str) -> Result<()>;

    async fn list_keys(&self) -> Result<Vec<String>>;
}

/// Durable store kept in memory, for tests and single-process setups
#[derive(Debug, Default)]
pub struct InMemoryDurableStore {
    records: DashMap<String, Vec<u8>>,
    down: AtomicBool,
}

impl InMemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shutdown(&self) {
        self.down.store(true, Ordering::SeqCst);
    }

    pub fn restore(&self) {
        self.down.store(false, Ordering::SeqCst);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }

    pub fn insert_raw(&self, key: &str, bytes: Vec<u8>) {
        self.records.insert(key.to_string(), bytes);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn check(&self) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            Err(CacheError::unavailable(TierKind::Durable, "store offline"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DurableStore for InMemoryDurableStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check()?;
        Ok(self.records.get(key).map(|r| r.value().clone()))
    }

    async fn put(&self, key: &str, record: Vec<u8>) -> Result<()> {
        self.check()?;
        self.records.insert(key.to_string(), record);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check()?;
        self.records.remove(key);
        Ok(())
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        self.check()?;
        Ok(self.records.iter().map(|r| r.key().clone()).collect())
    }
}

/// One JSON file per key under a base directory
///
/// Writes go to a temporary file first and are renamed into place, so a
/// crash never leaves a half-written record.
#[derive(Debug, Clone)]
pub struct FileDurableStore {
    base_dir: PathBuf,
}

impl FileDurableStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        // directory is created lazily on first put
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &std::path::Path {
        &self.base_dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(CacheError::Other(format!("invalid durable key: {:?}", key)));
        }
        Ok(self.base_dir.join(format!("{}.json", key)))
    }
}

fn io_error(context: &str, e: std::io::Error) -> CacheError {
    CacheError::unavailable(TierKind::Durable, format!("{}: {}", context, e))
}

#[async_trait]
impl DurableStore for FileDurableStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error("read failed", e)),
        }
    }

    async fn put(&self, key: &str, record: Vec<u8>) -> Result<()> {
        let path = self.path_for(key)?;
        tokio::fs::create_dir_all(&self.base_dir)
            .await
            .map_err(|e| io_error("create dir failed", e))?;

        let tmp = self
            .base_dir
            .join(format!(".{}.{}.tmp", key, uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, record)
            .await
            .map_err(|e| io_error("write failed", e))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_error("rename failed", e));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("delete failed", e)),
        }
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.base_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(io_error("list failed", e)),
        };

        while let Some(item) = dir
            .next_entry()
            .await
            .map_err(|e| io_error("list failed", e))?
        {
            let path = item.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if !stem.starts_with('.') {
                    keys.push(stem.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Tier3 wrapper: timeout and entry encoding
pub struct DurableTier {
    store: Arc<dyn DurableStore>,
    policy: TierPolicy,
    timeout: Duration,
}

impl DurableTier {
    pub fn new(store: Arc<dyn DurableStore>, policy: TierPolicy, timeout: Duration) -> Self {
        Self {
            store,
            policy,
            timeout,
        }
    }

    pub fn policy(&self) -> &TierPolicy {
        &self.policy
    }

    /// Fetch a record
    ///
    /// Undecodable records are deleted and reported as `Serialization`.
    pub async fn get(&self, fingerprint: &str) -> Result<Option<CacheEntry>> {
        let bytes = match with_timeout(TierKind::Durable, self.timeout, self.store.get(fingerprint)).await? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };

        match decode_entry(&bytes) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                warn!("Dropping undecodable durable record {}: {}", fingerprint, e);
                if let Err(del) = self.delete(fingerprint).await {
                    debug!("Failed to drop undecodable record {}: {}", fingerprint, del);
                }
                Err(e)
            }
        }
    }

    pub async fn put(&self, entry: &CacheEntry) -> Result<()> {
        let bytes = encode_entry(entry)?;
        with_timeout(
            TierKind::Durable,
            self.timeout,
            self.store.put(entry.fingerprint(), bytes),
        )
        .await
    }

    pub async fn delete(&self, fingerprint: &str) -> Result<()> {
        with_timeout(TierKind::Durable, self.timeout, self.store.delete(fingerprint)).await
    }

    /// Every decodable record, for analytics
    pub async fn entries(&self) -> Result<Vec<CacheEntry>> {
        let keys = with_timeout(TierKind::Durable, self.timeout, self.store.list_keys()).await?;
        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            match self.get(&key).await {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => {}
                Err(e) => debug!("Skipping durable record {}: {}", key, e),
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::CacheKeyBuilder;
    use crate::types::DocumentRef;
    use chrono::Utc;

    fn entry(query: &str) -> CacheEntry {
        let now = Utc::now();
        let key = CacheKeyBuilder::answers("m")
            .build(query, &[DocumentRef::new("d1", "h1")])
            .unwrap();
        CacheEntry::new(
            key,
            query.as_bytes().to_vec(),
            TierKind::Durable,
            now,
            now,
            Duration::from_secs(3600),
        )
    }

    fn tier(store: Arc<dyn DurableStore>) -> DurableTier {
        DurableTier::new(
            store,
            TierPolicy::new(usize::MAX, Duration::from_secs(3600), Duration::ZERO),
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn test_file_store_round_trip_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let e = entry("q1");
        let fp = e.fingerprint().to_string();

        {
            let tier = tier(Arc::new(FileDurableStore::new(dir.path())));
            tier.put(&e).await.unwrap();
        }

        // a fresh store over the same directory sees the record
        let tier = tier(Arc::new(FileDurableStore::new(dir.path())));
        let got = tier.get(&fp).await.unwrap().unwrap();
        assert_eq!(got.value, b"q1".to_vec());
        assert_eq!(got.created_at, e.created_at);

        let store = FileDurableStore::new(dir.path());
        assert_eq!(store.list_keys().await.unwrap(), vec![fp.clone()]);

        tier.delete(&fp).await.unwrap();
        tier.delete(&fp).await.unwrap();
        assert!(tier.get(&fp).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileDurableStore::new(dir.path().join("not-yet"));
        assert!(store.list_keys().await.unwrap().is_empty());
        assert!(store.get("abc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_rejects_path_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileDurableStore::new(dir.path());
        assert!(store.put("../escape", vec![1]).await.is_err());
    }

    #[tokio::test]
    async fn test_corrupt_record_is_dropped() {
        let store = Arc::new(InMemoryDurableStore::new());
        store.insert_raw("abc", b"{broken".to_vec());
        let tier = tier(store.clone());

        let err = tier.get("abc").await.unwrap_err();
        assert!(matches!(err, CacheError::Serialization(_)));
        assert!(!store.contains("abc"));
    }

    #[tokio::test]
    async fn test_offline_store_is_unavailable() {
        let store = Arc::new(InMemoryDurableStore::new());
        let tier = tier(store.clone());
        store.shutdown();

        let err = tier.put(&entry("q1")).await.unwrap_err();
        assert!(matches!(
            err,
            CacheError::TierUnavailable {
                tier: TierKind::Durable,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_entries_lists_records() {
        let store = Arc::new(InMemoryDurableStore::new());
        let tier = tier(store);
        tier.put(&entry("q1")).await.unwrap();
        tier.put(&entry("q2")).await.unwrap();

        assert_eq!(tier.entries().await.unwrap().len(), 2);
    }
}
