//! Inventory store backends.
//!
//! The production inventory lives in an external service; everything in this
//! crate talks to it through the [`InventoryStore`] trait. [`MemoryStore`] is
//! the in-process adapter used by tests, [`FileStore`] persists the same
//! record set to a JSON file for standalone deployments.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::attrs::{AttributeMap, AttributeValue};
use crate::error::{InventoryError, Result};

/// Access to the keyed attribute store holding host records.
///
/// Mutations are committed as a delta per host; readers always see the last
/// committed state.
#[async_trait]
pub trait InventoryStore: Send + Sync {
    /// Fetch the full attribute map of one host.
    async fn fetch(&self, hostname: &str) -> Result<AttributeMap>;

    /// Return all records whose attributes equal every `(key, value)` filter.
    async fn query(&self, filters: &[(&str, AttributeValue)]) -> Result<Vec<AttributeMap>>;

    /// Apply staged changes to a host record.
    async fn commit(&self, hostname: &str, changes: &AttributeMap) -> Result<()>;
}

/// In-memory inventory store.
///
/// Serves the same contract as the real service without any network,
/// for unit and integration tests.
pub struct MemoryStore {
    records: RwLock<BTreeMap<String, AttributeMap>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
        }
    }

    /// Insert or replace a record. The `hostname` attribute is filled in
    /// from the key so records stay self-describing.
    pub async fn insert(&self, hostname: &str, mut attrs: AttributeMap) {
        attrs
            .entry("hostname".to_string())
            .or_insert_with(|| AttributeValue::from(hostname));
        self.records.write().await.insert(hostname.to_string(), attrs);
    }

    /// Full copy of the record set, for snapshot comparisons in tests.
    pub async fn snapshot(&self) -> BTreeMap<String, AttributeMap> {
        self.records.read().await.clone()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InventoryStore for MemoryStore {
    async fn fetch(&self, hostname: &str) -> Result<AttributeMap> {
        self.records
            .read()
            .await
            .get(hostname)
            .cloned()
            .ok_or_else(|| InventoryError::HostNotFound(hostname.to_string()))
    }

    async fn query(&self, filters: &[(&str, AttributeValue)]) -> Result<Vec<AttributeMap>> {
        let records = self.records.read().await;
        Ok(records
            .values()
            .filter(|attrs| {
                filters
                    .iter()
                    .all(|(key, value)| attrs.get(*key) == Some(value))
            })
            .cloned()
            .collect())
    }

    async fn commit(&self, hostname: &str, changes: &AttributeMap) -> Result<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(hostname)
            .ok_or_else(|| InventoryError::HostNotFound(hostname.to_string()))?;
        for (key, value) in changes {
            record.insert(key.clone(), value.clone());
        }
        debug!(host = %hostname, attributes = changes.len(), "Committed inventory changes");
        Ok(())
    }
}

/// JSON-file-backed inventory store.
///
/// The file holds a map of hostname to attribute map. Every commit rewrites
/// the file, which is fine at fleet-inventory sizes.
pub struct FileStore {
    path: PathBuf,
    inner: MemoryStore,
}

impl FileStore {
    /// Load the record set from `path`.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let content = tokio::fs::read(&path).await?;
        let records: BTreeMap<String, AttributeMap> = serde_json::from_slice(&content)?;

        let inner = MemoryStore::new();
        let count = records.len();
        for (hostname, attrs) in records {
            inner.insert(&hostname, attrs).await;
        }
        info!(path = %path.display(), records = count, "Loaded inventory");

        Ok(Self { path, inner })
    }

    async fn persist(&self) -> Result<()> {
        let records = self.inner.snapshot().await;
        let content = serde_json::to_vec_pretty(&records)?;
        tokio::fs::write(&self.path, content).await?;
        Ok(())
    }
}

#[async_trait]
impl InventoryStore for FileStore {
    async fn fetch(&self, hostname: &str) -> Result<AttributeMap> {
        self.inner.fetch(hostname).await
    }

    async fn query(&self, filters: &[(&str, AttributeValue)]) -> Result<Vec<AttributeMap>> {
        self.inner.query(filters).await
    }

    async fn commit(&self, hostname: &str, changes: &AttributeMap) -> Result<()> {
        self.inner.commit(hostname, changes).await?;
        self.persist().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm_record(xen_host: &str) -> AttributeMap {
        let mut attrs = AttributeMap::new();
        attrs.insert("servertype".into(), "vm".into());
        attrs.insert("xen_host".into(), xen_host.into());
        attrs.insert("memory".into(), AttributeValue::Int(2048));
        attrs
    }

    #[tokio::test]
    async fn query_filters_by_equality() {
        let store = MemoryStore::new();
        store.insert("a.example.com", vm_record("hv1")).await;
        store.insert("b.example.com", vm_record("hv1")).await;
        store.insert("c.example.com", vm_record("hv2")).await;

        let on_hv1 = store
            .query(&[("servertype", "vm".into()), ("xen_host", "hv1".into())])
            .await
            .unwrap();
        assert_eq!(on_hv1.len(), 2);
    }

    #[tokio::test]
    async fn commit_merges_changes() {
        let store = MemoryStore::new();
        store.insert("a.example.com", vm_record("hv1")).await;

        let mut changes = AttributeMap::new();
        changes.insert("xen_host".into(), "hv2".into());
        store.commit("a.example.com", &changes).await.unwrap();

        let record = store.fetch("a.example.com").await.unwrap();
        assert_eq!(record.get("xen_host"), Some(&"hv2".into()));
        assert_eq!(record.get("memory"), Some(&AttributeValue::Int(2048)));
    }

    #[tokio::test]
    async fn commit_to_unknown_host_fails() {
        let store = MemoryStore::new();
        let err = store
            .commit("missing.example.com", &AttributeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, InventoryError::HostNotFound(_)));
    }

    #[tokio::test]
    async fn file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inventory.json");

        let mut records = BTreeMap::new();
        records.insert("a.example.com".to_string(), vm_record("hv1"));
        tokio::fs::write(&path, serde_json::to_vec(&records).unwrap())
            .await
            .unwrap();

        let store = FileStore::open(&path).await.unwrap();
        let mut changes = AttributeMap::new();
        changes.insert("xen_host".into(), "hv2".into());
        store.commit("a.example.com", &changes).await.unwrap();

        // A fresh open sees the committed state.
        let reopened = FileStore::open(&path).await.unwrap();
        let record = reopened.fetch("a.example.com").await.unwrap();
        assert_eq!(record.get("xen_host"), Some(&"hv2".into()));
    }
}
