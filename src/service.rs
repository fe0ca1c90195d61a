//! Entry point for callers: serializes mutations per taxonomy id.

use crate::builder::TreeBuilder;
use crate::concept::Concept;
use crate::definition::DefinitionGenerator;
use crate::error::{TaxonomyError, TaxonomyResult};
use crate::sheet_parser;
use crate::taxonomy::{Engine, InsertAttemptResult, Taxonomy};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

/// Opened aggregate for one id, loaded on first use.
type Slot = Arc<RwLock<Option<Taxonomy>>>;

pub const DEFAULT_CACHE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Serialize)]
pub struct UploadSummary {
    pub id: Uuid,
    pub n_concepts: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaxonomySummary {
    pub id: Uuid,
    pub collection: String,
    pub root: String,
    pub n_nodes: usize,
    pub n_embeddings: usize,
}

#[derive(Debug, Clone)]
pub struct ExportedTable {
    pub filename: String,
    pub data: Vec<u8>,
}

/// Insertions into one taxonomy run one at a time; reads share access but
/// never overlap an insertion.
///
/// Each id maps to exactly one slot for as long as anyone holds it. A slot
/// leaves the map only while the map mutex is held and the map owns the
/// last reference, so no two slots ever exist for the same id.
#[derive(Clone)]
pub struct TaxonomyService {
    engine: Engine,
    generator: Arc<dyn DefinitionGenerator>,
    slots: Arc<Mutex<HashMap<Uuid, Slot>>>,
    capacity: usize,
}

impl TaxonomyService {
    pub fn new(engine: Engine, generator: Arc<dyn DefinitionGenerator>) -> Self {
        Self {
            engine,
            generator,
            slots: Arc::new(Mutex::new(HashMap::new())),
            capacity: DEFAULT_CACHE_CAPACITY,
        }
    }

    /// Number of opened taxonomies kept before idle ones are evicted.
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    fn lock_slots(&self) -> MutexGuard<'_, HashMap<Uuid, Slot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn slot(&self, id: Uuid) -> Slot {
        let mut slots = self.lock_slots();
        if let Some(slot) = slots.get(&id) {
            return slot.clone();
        }
        if slots.len() >= self.capacity {
            // Idle slots are referenced only by the map; their state is
            // already persisted and is reloaded on next use.
            let before = slots.len();
            slots.retain(|_, slot| Arc::strong_count(slot) > 1);
            debug!("Evicted {} idle taxonomies from cache", before - slots.len());
        }
        let slot = Slot::default();
        slots.insert(id, slot.clone());
        slot
    }

    /// Drop a slot that never loaded, unless someone else still uses it.
    fn release_unloaded(&self, id: Uuid, slot: Slot) {
        let mut slots = self.lock_slots();
        drop(slot);
        let unused = slots.get(&id).is_some_and(|s| {
            Arc::strong_count(s) == 1 && s.try_read().is_ok_and(|guard| guard.is_none())
        });
        if unused {
            slots.remove(&id);
        }
    }

    /// Shared access to an opened taxonomy, loading it under the exclusive
    /// guard if this is the first use.
    async fn read(&self, id: Uuid) -> TaxonomyResult<OwnedRwLockReadGuard<Option<Taxonomy>>> {
        let slot = self.slot(id);
        {
            let guard = slot.clone().read_owned().await;
            if guard.is_some() {
                return Ok(guard);
            }
        }
        let mut guard = slot.clone().write_owned().await;
        if let Err(e) = load_into(&mut guard, id, &self.engine).await {
            drop(guard);
            self.release_unloaded(id, slot);
            return Err(e);
        }
        Ok(guard.downgrade())
    }

    /// Parse an uploaded table, build and persist a new taxonomy.
    pub async fn create_from_table(&self, filename: &str, data: &[u8]) -> TaxonomyResult<UploadSummary> {
        let sheet = sheet_parser::parse_file(filename, data)?;
        let records = sheet.records();
        info!(
            "Building taxonomy from {} ({} rows, sheet '{}')",
            filename,
            records.len(),
            sheet.name
        );

        let tree = TreeBuilder::new(self.generator.as_ref(), self.engine.timeouts.llm())
            .build(&records)
            .await?;
        let taxonomy = Taxonomy::create(tree, self.engine.clone()).await?;
        let summary = UploadSummary {
            id: taxonomy.id(),
            n_concepts: taxonomy.len(),
        };
        *self.slot(summary.id).write().await = Some(taxonomy);
        Ok(summary)
    }

    /// Run an insertion attempt to completion.
    ///
    /// The locked pipeline runs on its own task: dropping the returned
    /// future stops the wait, not the write, so the stored tree, the index
    /// and the cached aggregate never diverge.
    pub async fn insert(&self, id: Uuid, concept: &Concept) -> TaxonomyResult<InsertAttemptResult> {
        let slot = self.slot(id);
        let guard = slot.clone().write_owned().await;
        let task = tokio::spawn(insert_locked(guard, id, self.engine.clone(), concept.clone()));
        let result = task.await?;
        if result.is_err() {
            self.release_unloaded(id, slot);
        }
        result
    }

    pub async fn get(&self, id: Uuid) -> TaxonomyResult<TaxonomySummary> {
        let guard = self.read(id).await?;
        let taxonomy = guard.as_ref().ok_or(TaxonomyError::NotFound(id))?;
        Ok(TaxonomySummary {
            id: taxonomy.id(),
            collection: taxonomy.collection().to_string(),
            root: taxonomy.tree().root().name.clone(),
            n_nodes: taxonomy.len(),
            n_embeddings: taxonomy.index_size().await?,
        })
    }

    pub async fn display(&self, id: Uuid) -> TaxonomyResult<String> {
        let guard = self.read(id).await?;
        let taxonomy = guard.as_ref().ok_or(TaxonomyError::NotFound(id))?;
        taxonomy.display().await
    }

    pub async fn export(&self, id: Uuid) -> TaxonomyResult<ExportedTable> {
        let guard = self.read(id).await?;
        let taxonomy = guard.as_ref().ok_or(TaxonomyError::NotFound(id))?;
        Ok(ExportedTable {
            filename: format!("{}.csv", taxonomy.collection()),
            data: taxonomy.export_csv()?,
        })
    }
}

/// Load the taxonomy into an empty slot. A failed load leaves the slot
/// empty for the next holder to retry.
async fn load_into(
    guard: &mut OwnedRwLockWriteGuard<Option<Taxonomy>>,
    id: Uuid,
    engine: &Engine,
) -> TaxonomyResult<()> {
    if guard.is_none() {
        **guard = Some(Taxonomy::load(id, engine.clone()).await?);
    }
    Ok(())
}

async fn insert_locked(
    mut guard: OwnedRwLockWriteGuard<Option<Taxonomy>>,
    id: Uuid,
    engine: Engine,
    concept: Concept,
) -> TaxonomyResult<InsertAttemptResult> {
    load_into(&mut guard, id, &engine).await?;
    let taxonomy = guard.as_mut().ok_or(TaxonomyError::NotFound(id))?;
    taxonomy.insert(&concept).await
}
