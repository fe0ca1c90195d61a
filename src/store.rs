//! Persistence of whole taxonomies.
//!
//! A taxonomy is stored as one record: its id, the serialized tree and the
//! name of its vector-index collection. Saves overwrite by id.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxonomyRecord {
    pub id: Uuid,
    pub tree: String,
    pub collection: String,
}

#[async_trait::async_trait]
pub trait TaxonomyStore: Send + Sync {
    async fn load(&self, id: Uuid) -> Result<Option<TaxonomyRecord>>;
    async fn save(&self, record: &TaxonomyRecord) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryTaxonomyStore {
    records: Arc<RwLock<HashMap<Uuid, TaxonomyRecord>>>,
}

impl InMemoryTaxonomyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl TaxonomyStore for InMemoryTaxonomyStore {
    async fn load(&self, id: Uuid) -> Result<Option<TaxonomyRecord>> {
        Ok(self.records.read().unwrap().get(&id).cloned())
    }

    async fn save(&self, record: &TaxonomyRecord) -> Result<()> {
        self.records
            .write()
            .unwrap()
            .insert(record.id, record.clone());
        Ok(())
    }
}

/// One JSON file per taxonomy under a data directory.
#[derive(Debug, Clone)]
pub struct FileTaxonomyStore {
    dir: PathBuf,
}

impl FileTaxonomyStore {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create data directory: {:?}", dir))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn path_for(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }
}

#[async_trait::async_trait]
impl TaxonomyStore for FileTaxonomyStore {
    async fn load(&self, id: Uuid) -> Result<Option<TaxonomyRecord>> {
        let path = self.path_for(id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Failed to read taxonomy: {:?}", path)),
        };
        let record = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse taxonomy: {:?}", path))?;
        Ok(Some(record))
    }

    async fn save(&self, record: &TaxonomyRecord) -> Result<()> {
        let path = self.path_for(record.id);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_vec(record)?;
        tokio::fs::write(&tmp, content)
            .await
            .with_context(|| format!("Failed to write taxonomy: {:?}", tmp))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to replace taxonomy: {:?}", path))?;
        debug!("Saved taxonomy {} to {:?}", record.id, path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: Uuid, tree: &str) -> TaxonomyRecord {
        TaxonomyRecord {
            id,
            tree: tree.to_string(),
            collection: id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_in_memory_overwrites_by_id() {
        let store = InMemoryTaxonomyStore::new();
        let id = Uuid::new_v4();
        assert!(store.load(id).await.unwrap().is_none());
        store.save(&record(id, "v1")).await.unwrap();
        store.save(&record(id, "v2")).await.unwrap();
        assert_eq!(store.load(id).await.unwrap().unwrap().tree, "v2");
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTaxonomyStore::open(&dir.path().join("taxonomies")).unwrap();
        let id = Uuid::new_v4();
        assert!(store.load(id).await.unwrap().is_none());

        store.save(&record(id, "{\"name\":\"root\"}")).await.unwrap();
        store.save(&record(id, "{\"name\":\"renamed\"}")).await.unwrap();
        let loaded = store.load(id).await.unwrap().unwrap();
        assert_eq!(loaded, record(id, "{\"name\":\"renamed\"}"));
        assert!(!dir.path().join("taxonomies").join(format!("{}.json.tmp", id)).exists());
    }

    #[tokio::test]
    async fn test_file_store_corrupt_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTaxonomyStore::open(dir.path()).unwrap();
        let id = Uuid::new_v4();
        std::fs::write(dir.path().join(format!("{}.json", id)), "not json").unwrap();
        assert!(store.load(id).await.is_err());
    }
}
