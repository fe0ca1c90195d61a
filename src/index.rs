//! Semantic vector index used for nearest-neighbour lookups.
//!
//! The index is never authoritative: the taxonomy tree is, and the index is
//! rebuilt from it whenever the two disagree.

use crate::node::NodeId;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// A query hit. Distance is squared Euclidean; score is `1 - distance`, so
/// for unit-length embeddings the score equals `2 * cos - 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub id: NodeId,
    pub distance: f64,
}

impl Neighbor {
    pub fn score(&self) -> f64 {
        1.0 - self.distance
    }
}

/// One collection of embedded documents, keyed by node id.
#[async_trait::async_trait]
pub trait VectorIndex: Send + Sync {
    fn collection(&self) -> &str;

    /// Number of stored documents.
    async fn size(&self) -> Result<usize>;

    async fn insert(&self, id: &NodeId, text: &str) -> Result<()> {
        self.insert_many(&[id.clone()], &[text.to_string()]).await
    }

    async fn insert_many(&self, ids: &[NodeId], texts: &[String]) -> Result<()>;

    /// Nearest neighbours by ascending distance.
    async fn query(&self, text: &str, top_k: usize) -> Result<Vec<Neighbor>>;

    /// Drop and recreate the collection.
    async fn reset(&self) -> Result<()>;
}

/// Opens the index collection bound to a taxonomy.
pub trait IndexProvider: Send + Sync {
    fn open(&self, collection: &str) -> Arc<dyn VectorIndex>;
}

/// Turns text into vectors.
#[async_trait::async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts, returning one vector per text.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

struct Entry {
    id: NodeId,
    vector: Vec<f32>,
}

/// In-process vector store with squared L2 distance.
///
/// Collections are kept per name; handles returned by [`IndexProvider::open`]
/// share the same storage.
#[derive(Clone)]
pub struct InMemoryVectorStore {
    embedder: Arc<dyn Embedder>,
    collections: Arc<RwLock<HashMap<String, Vec<Entry>>>>,
}

impl InMemoryVectorStore {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            collections: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl IndexProvider for InMemoryVectorStore {
    fn open(&self, collection: &str) -> Arc<dyn VectorIndex> {
        Arc::new(InMemoryCollection {
            store: self.clone(),
            name: collection.to_string(),
        })
    }
}

pub struct InMemoryCollection {
    store: InMemoryVectorStore,
    name: String,
}

#[async_trait::async_trait]
impl VectorIndex for InMemoryCollection {
    fn collection(&self) -> &str {
        &self.name
    }

    async fn size(&self) -> Result<usize> {
        let collections = self.store.collections.read().unwrap();
        Ok(collections.get(&self.name).map_or(0, Vec::len))
    }

    async fn insert_many(&self, ids: &[NodeId], texts: &[String]) -> Result<()> {
        let vectors = embed_documents(self.store.embedder.as_ref(), ids, texts).await?;

        let mut collections = self.store.collections.write().unwrap();
        let entries = collections.entry(self.name.clone()).or_default();
        for (id, vector) in ids.iter().zip(vectors) {
            match entries.iter_mut().find(|e| &e.id == id) {
                Some(existing) => existing.vector = vector,
                None => entries.push(Entry {
                    id: id.clone(),
                    vector,
                }),
            }
        }
        debug!("Added {} documents to collection '{}'", ids.len(), self.name);
        Ok(())
    }

    async fn query(&self, text: &str, top_k: usize) -> Result<Vec<Neighbor>> {
        let query = embed_query(self.store.embedder.as_ref(), text).await?;

        let collections = self.store.collections.read().unwrap();
        let Some(entries) = collections.get(&self.name) else {
            return Ok(Vec::new());
        };

        let mut hits: Vec<Neighbor> = entries
            .iter()
            .map(|e| Neighbor {
                id: e.id.clone(),
                distance: squared_l2(&query, &e.vector),
            })
            .collect();
        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn reset(&self) -> Result<()> {
        self.store
            .collections
            .write()
            .unwrap()
            .insert(self.name.clone(), Vec::new());
        info!("Reinitialized collection '{}'", self.name);
        Ok(())
    }
}

/// Embed `texts`, checking that ids, documents and vectors line up.
pub(crate) async fn embed_documents(
    embedder: &dyn Embedder,
    ids: &[NodeId],
    texts: &[String],
) -> Result<Vec<Vec<f32>>> {
    if ids.len() != texts.len() {
        anyhow::bail!(
            "Mismatched insert: {} ids for {} documents",
            ids.len(),
            texts.len()
        );
    }
    let vectors = embedder.embed(texts).await?;
    if vectors.len() != texts.len() {
        anyhow::bail!(
            "Embedder returned {} vectors for {} documents",
            vectors.len(),
            texts.len()
        );
    }
    Ok(vectors)
}

/// Embed a single query text.
pub(crate) async fn embed_query(embedder: &dyn Embedder, text: &str) -> Result<Vec<f32>> {
    embedder
        .embed(&[text.to_string()])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("Embedder returned no vector for query"))
}

/// Squared Euclidean distance. Vectors of different length are compared
/// over their common prefix.
pub(crate) fn squared_l2(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = *x as f64 - *y as f64;
            d * d
        })
        .sum()
}
