//! The taxonomy aggregate: tree, index handle and the insertion decision.

use crate::concept::Concept;
use crate::config::{Thresholds, Timeouts};
use crate::error::{with_timeout, TaxonomyError, TaxonomyResult};
use crate::index::{IndexProvider, VectorIndex};
use crate::node::NodeId;
use crate::sheet_parser;
use crate::store::{TaxonomyRecord, TaxonomyStore};
use crate::tree::ConceptTree;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Collaborators and tuning shared by every taxonomy.
#[derive(Clone)]
pub struct Engine {
    pub store: Arc<dyn TaxonomyStore>,
    pub indexes: Arc<dyn IndexProvider>,
    pub thresholds: Thresholds,
    pub timeouts: Timeouts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InsertOutcome {
    Reject,
    Merge,
    Insert,
}

impl fmt::Display for InsertOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Map a best-match score to an outcome.
pub fn classify(score: f64, thresholds: &Thresholds) -> InsertOutcome {
    if score < thresholds.rejection {
        InsertOutcome::Reject
    } else if score >= thresholds.merge {
        InsertOutcome::Merge
    } else {
        InsertOutcome::Insert
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestMatchingNode {
    pub name: String,
    pub similarity_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertAttemptResult {
    pub taxonomy_id: Uuid,
    pub result: InsertOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_matching_node: Option<BestMatchingNode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inserted_node_id: Option<NodeId>,
}

pub struct Taxonomy {
    id: Uuid,
    tree: ConceptTree,
    index: Arc<dyn VectorIndex>,
    engine: Engine,
}

impl Taxonomy {
    /// Bind a tree to its index collection and bring the index in line
    /// with the tree.
    pub async fn open(
        id: Uuid,
        tree: ConceptTree,
        collection: Option<&str>,
        engine: Engine,
    ) -> TaxonomyResult<Self> {
        let collection = collection
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| id.to_string());
        let index = engine.indexes.open(&collection);
        let taxonomy = Self {
            id,
            tree,
            index,
            engine,
        };
        taxonomy.reconcile_index().await?;
        Ok(taxonomy)
    }

    /// Persist a freshly built tree under a new id.
    pub async fn create(tree: ConceptTree, engine: Engine) -> TaxonomyResult<Self> {
        let taxonomy = Self::open(Uuid::new_v4(), tree, None, engine).await?;
        taxonomy.persist(&taxonomy.tree).await?;
        info!(
            "Created taxonomy {} with {} concepts",
            taxonomy.id,
            taxonomy.len()
        );
        Ok(taxonomy)
    }

    pub async fn load(id: Uuid, engine: Engine) -> TaxonomyResult<Self> {
        let record = with_timeout(
            "taxonomy load",
            engine.timeouts.store(),
            TaxonomyError::Store,
            engine.store.load(id),
        )
        .await?
        .ok_or(TaxonomyError::NotFound(id))?;

        let tree = ConceptTree::from_json(&record.tree)?;
        Self::open(record.id, tree, Some(&record.collection), engine).await
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn tree(&self) -> &ConceptTree {
        &self.tree
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn collection(&self) -> &str {
        self.index.collection()
    }

    pub async fn index_size(&self) -> TaxonomyResult<usize> {
        with_timeout(
            "index size",
            self.engine.timeouts.query(),
            TaxonomyError::Index,
            self.index.size(),
        )
        .await
    }

    async fn reconcile_index(&self) -> TaxonomyResult<()> {
        let size = self.index_size().await?;
        if size == 0 {
            debug!("Initializing collection '{}'", self.collection());
            return self.populate_index().await;
        }
        if size != self.len() {
            warn!(
                "Collection '{}' not in sync with taxonomy {}: {} embeddings vs {} nodes. Resetting and reinitializing.",
                self.collection(),
                self.id,
                size,
                self.len()
            );
            with_timeout(
                "index reset",
                self.engine.timeouts.query(),
                TaxonomyError::Index,
                self.index.reset(),
            )
            .await?;
            return self.populate_index().await;
        }
        Ok(())
    }

    async fn populate_index(&self) -> TaxonomyResult<()> {
        let (ids, docs): (Vec<NodeId>, Vec<String>) = self
            .tree
            .pre_order()
            .map(|n| (n.id.clone(), n.to_doc()))
            .unzip();
        with_timeout(
            "index population",
            self.engine.timeouts.query(),
            TaxonomyError::Index,
            self.index.insert_many(&ids, &docs),
        )
        .await?;
        info!(
            "Indexed {} concepts into collection '{}'",
            ids.len(),
            self.collection()
        );
        Ok(())
    }

    fn record(&self, tree: &ConceptTree) -> TaxonomyResult<TaxonomyRecord> {
        Ok(TaxonomyRecord {
            id: self.id,
            tree: tree.to_json()?,
            collection: self.collection().to_string(),
        })
    }

    async fn persist(&self, tree: &ConceptTree) -> TaxonomyResult<()> {
        let record = self.record(tree)?;
        with_timeout(
            "taxonomy save",
            self.engine.timeouts.store(),
            TaxonomyError::Store,
            self.engine.store.save(&record),
        )
        .await
    }

    /// Decide whether `concept` duplicates, refines, or is unrelated to an
    /// existing node, and apply the decision.
    ///
    /// Mutations are applied to a copy of the tree that replaces the live
    /// tree only once every write has succeeded.
    pub async fn insert(&mut self, concept: &Concept) -> TaxonomyResult<InsertAttemptResult> {
        let mut result = InsertAttemptResult {
            taxonomy_id: self.id,
            result: InsertOutcome::Reject,
            best_matching_node: None,
            inserted_node_id: None,
        };

        if concept.name.trim().is_empty() || concept.definition.trim().is_empty() {
            debug!("Rejecting concept {} with missing name or definition", concept.id);
            return Ok(result);
        }

        let hits = with_timeout(
            "similarity query",
            self.engine.timeouts.query(),
            TaxonomyError::Index,
            self.index.query(&concept.to_doc(), 1),
        )
        .await?;
        let best = hits.into_iter().next().ok_or_else(|| {
            TaxonomyError::ConsistencyViolation(format!(
                "Collection '{}' returned no neighbours for a non-empty taxonomy",
                self.collection()
            ))
        })?;
        let best_node = self.tree.get(&best.id).ok_or_else(|| {
            TaxonomyError::ConsistencyViolation(format!(
                "Best matching node {} not found in taxonomy {}",
                best.id, self.id
            ))
        })?;

        let score = best.score();
        let outcome = classify(score, &self.engine.thresholds);
        result.result = outcome;
        result.best_matching_node = Some(BestMatchingNode {
            name: best_node.name.clone(),
            similarity_score: score,
        });
        info!(
            "Concept '{}' vs best match '{}' (score {:.4}): {}",
            concept.name, best_node.name, score, outcome
        );

        match outcome {
            InsertOutcome::Reject => {}
            InsertOutcome::Merge => {
                let mut next = self.tree.clone();
                if let Some(node) = next.get_mut(&best.id) {
                    node.merge(concept);
                }
                self.persist(&next).await?;
                self.tree = next;
            }
            InsertOutcome::Insert => {
                let mut next = self.tree.clone();
                let new_id = next.insert_as_child(&best.id, concept)?;
                let doc = next
                    .get(&new_id)
                    .map(|n| n.to_doc())
                    .unwrap_or_else(|| concept.to_doc());
                self.persist(&next).await?;

                let indexed = with_timeout(
                    "index insert",
                    self.engine.timeouts.query(),
                    TaxonomyError::Index,
                    self.index.insert(&new_id, &doc),
                )
                .await;
                if let Err(e) = indexed {
                    if let Err(restore) = self.persist(&self.tree).await {
                        error!(
                            "Failed to restore taxonomy {} after index failure: {}",
                            self.id, restore
                        );
                    }
                    return Err(e);
                }
                self.tree = next;
                result.inserted_node_id = Some(new_id);
            }
        }

        Ok(result)
    }

    /// Summary line followed by the indented tree.
    pub async fn display(&self) -> TaxonomyResult<String> {
        let embeddings = self.index_size().await?;
        Ok(format!(
            "Taxonomy(id:'{}', n_nodes:'{}', n_embeddings:'{}', collection:'{}')\n{}",
            self.id,
            self.len(),
            embeddings,
            self.collection(),
            self.tree.render()
        ))
    }

    /// Pre-order export as CSV bytes.
    pub fn export_csv(&self) -> TaxonomyResult<Vec<u8>> {
        sheet_parser::write_csv(&self.tree.to_rows()).map_err(TaxonomyError::Export)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::concept;
    use crate::index::tests::KeywordEmbedder;
    use crate::index::{InMemoryVectorStore, Neighbor};
    use crate::node::NodeStatus;
    use crate::store::InMemoryTaxonomyStore;
    use crate::tree::tests::sample_tree;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Index double: records inserts and answers queries with a scripted hit.
    #[derive(Default)]
    pub(crate) struct ScriptedIndex {
        pub(crate) docs: Mutex<Vec<NodeId>>,
        pub(crate) hit: Mutex<Option<Neighbor>>,
        pub(crate) queries: AtomicUsize,
        pub(crate) resets: AtomicUsize,
        pub(crate) fail_inserts: AtomicBool,
        pub(crate) insert_delay_ms: AtomicU64,
    }

    impl ScriptedIndex {
        pub(crate) fn answer(&self, id: &str, score: f64) {
            *self.hit.lock().unwrap() = Some(Neighbor {
                id: NodeId::from(id),
                distance: 1.0 - score,
            });
        }

        pub(crate) fn len(&self) -> usize {
            self.docs.lock().unwrap().len()
        }
    }

    #[async_trait::async_trait]
    impl VectorIndex for ScriptedIndex {
        fn collection(&self) -> &str {
            "scripted"
        }

        async fn size(&self) -> anyhow::Result<usize> {
            Ok(self.len())
        }

        async fn insert_many(&self, ids: &[NodeId], _texts: &[String]) -> anyhow::Result<()> {
            let delay = self.insert_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            }
            if self.fail_inserts.load(Ordering::SeqCst) {
                anyhow::bail!("index unavailable");
            }
            self.docs.lock().unwrap().extend(ids.iter().cloned());
            Ok(())
        }

        async fn query(&self, _text: &str, _top_k: usize) -> anyhow::Result<Vec<Neighbor>> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            Ok(self.hit.lock().unwrap().iter().cloned().collect())
        }

        async fn reset(&self) -> anyhow::Result<()> {
            self.resets.fetch_add(1, Ordering::SeqCst);
            self.docs.lock().unwrap().clear();
            Ok(())
        }
    }

    pub(crate) struct ScriptedProvider(pub(crate) Arc<ScriptedIndex>);

    impl IndexProvider for ScriptedProvider {
        fn open(&self, _collection: &str) -> Arc<dyn VectorIndex> {
            self.0.clone()
        }
    }

    struct FailingStore;

    #[async_trait::async_trait]
    impl TaxonomyStore for FailingStore {
        async fn load(&self, _id: Uuid) -> anyhow::Result<Option<TaxonomyRecord>> {
            Ok(None)
        }

        async fn save(&self, _record: &TaxonomyRecord) -> anyhow::Result<()> {
            anyhow::bail!("disk full")
        }
    }

    pub(crate) fn engine_with(index: Arc<ScriptedIndex>, store: Arc<dyn TaxonomyStore>) -> Engine {
        Engine {
            store,
            indexes: Arc::new(ScriptedProvider(index)),
            thresholds: Thresholds::default(),
            timeouts: Timeouts::default(),
        }
    }

    async fn scripted() -> (Taxonomy, Arc<ScriptedIndex>, InMemoryTaxonomyStore) {
        let index = Arc::new(ScriptedIndex::default());
        let store = InMemoryTaxonomyStore::new();
        let engine = engine_with(index.clone(), Arc::new(store.clone()));
        let taxonomy = Taxonomy::create(sample_tree(), engine).await.unwrap();
        (taxonomy, index, store)
    }

    #[test]
    fn test_classify_boundaries() {
        let t = Thresholds::default();
        assert_eq!(classify(0.49999, &t), InsertOutcome::Reject);
        assert_eq!(classify(0.5, &t), InsertOutcome::Insert);
        assert_eq!(classify(0.64999, &t), InsertOutcome::Insert);
        assert_eq!(classify(0.65, &t), InsertOutcome::Merge);
        assert_eq!(classify(1.0, &t), InsertOutcome::Merge);
    }

    #[tokio::test]
    async fn test_create_populates_index_and_persists() {
        let (taxonomy, index, store) = scripted().await;
        assert_eq!(index.len(), 4);
        assert_eq!(taxonomy.collection(), "scripted");
        let record = store.load(taxonomy.id()).await.unwrap().unwrap();
        assert_eq!(ConceptTree::from_json(&record.tree).unwrap(), *taxonomy.tree());
    }

    #[tokio::test]
    async fn test_reject_empty_name_skips_lookup() {
        let (mut taxonomy, index, _) = scripted().await;
        index.answer("3", 0.99);
        let result = taxonomy.insert(&concept::sample("", "x")).await.unwrap();
        assert_eq!(result.result, InsertOutcome::Reject);
        assert!(result.best_matching_node.is_none());
        assert_eq!(index.queries.load(Ordering::SeqCst), 0);

        let result = taxonomy.insert(&concept::sample("sealift", "")).await.unwrap();
        assert_eq!(result.result, InsertOutcome::Reject);
        assert!(result.best_matching_node.is_none());
    }

    #[tokio::test]
    async fn test_threshold_boundaries_end_to_end() {
        let cases = [
            (0.49999, InsertOutcome::Reject),
            (0.5, InsertOutcome::Insert),
            (0.64999, InsertOutcome::Insert),
            (0.65, InsertOutcome::Merge),
        ];
        for (score, expected) in cases {
            let (mut taxonomy, index, _) = scripted().await;
            index.answer("3", score);
            let result = taxonomy.insert(&concept::sample("sealift", "Cargo by sea.")).await.unwrap();
            assert_eq!(result.result, expected, "score {}", score);
            let best = result.best_matching_node.unwrap();
            assert_eq!(best.name, "sea");
            assert!((best.similarity_score - score).abs() < 1e-9);
        }
    }

    #[tokio::test]
    async fn test_reject_leaves_everything_untouched() {
        let (mut taxonomy, index, store) = scripted().await;
        let before = store.load(taxonomy.id()).await.unwrap();
        index.answer("3", 0.2);
        taxonomy.insert(&concept::sample("tank", "Armoured vehicle.")).await.unwrap();
        assert_eq!(taxonomy.len(), 4);
        assert_eq!(index.len(), 4);
        assert_eq!(store.load(taxonomy.id()).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_merge_side_effects() {
        let (mut taxonomy, index, store) = scripted().await;
        index.answer("3", 0.9);
        let result = taxonomy
            .insert(&concept::sample("maritime", "Operations on the sea."))
            .await
            .unwrap();
        assert_eq!(result.result, InsertOutcome::Merge);
        assert!(result.inserted_node_id.is_none());
        assert_eq!(taxonomy.len(), 4);
        assert_eq!(index.len(), 4);

        let sea = taxonomy.tree().get(&"3".into()).unwrap();
        assert_eq!(sea.status, NodeStatus::Corroborated);
        assert_eq!(sea.alternate_names, vec!["maritime"]);
        assert_eq!(sea.alternate_definitions, vec!["Operations on the sea."]);

        let stored = store.load(taxonomy.id()).await.unwrap().unwrap();
        let stored_tree = ConceptTree::from_json(&stored.tree).unwrap();
        assert_eq!(stored_tree.get(&"3".into()).unwrap().status, NodeStatus::Corroborated);
    }

    #[tokio::test]
    async fn test_repeated_merge_keeps_duplicates() {
        let (mut taxonomy, index, _) = scripted().await;
        index.answer("3", 0.9);
        let c = concept::sample("maritime", "Operations on the sea.");
        taxonomy.insert(&c).await.unwrap();
        taxonomy.insert(&c).await.unwrap();
        let sea = taxonomy.tree().get(&"3".into()).unwrap();
        assert_eq!(sea.alternate_names, vec!["maritime", "maritime"]);
    }

    #[tokio::test]
    async fn test_insert_side_effects() {
        let (mut taxonomy, index, store) = scripted().await;
        index.answer("3", 0.6);
        let result = taxonomy.insert(&concept::sample("sealift", "Cargo by sea.")).await.unwrap();
        assert_eq!(result.result, InsertOutcome::Insert);
        let new_id = result.inserted_node_id.unwrap();

        assert_eq!(taxonomy.len(), 5);
        assert_eq!(index.len(), 5);
        assert_eq!(taxonomy.tree().parent_of(&new_id).unwrap().name, "sea");
        assert_eq!(taxonomy.tree().get(&new_id).unwrap().status, NodeStatus::Introduced);

        let stored = store.load(taxonomy.id()).await.unwrap().unwrap();
        assert_eq!(ConceptTree::from_json(&stored.tree).unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_unknown_best_match_is_consistency_violation() {
        let (mut taxonomy, index, _) = scripted().await;
        index.answer("ghost", 0.9);
        let result = taxonomy.insert(&concept::sample("sealift", "Cargo by sea.")).await;
        assert!(matches!(result, Err(TaxonomyError::ConsistencyViolation(_))));
    }

    #[tokio::test]
    async fn test_empty_query_result_is_consistency_violation() {
        let (mut taxonomy, _, _) = scripted().await;
        let result = taxonomy.insert(&concept::sample("sealift", "Cargo by sea.")).await;
        assert!(matches!(result, Err(TaxonomyError::ConsistencyViolation(_))));
    }

    #[tokio::test]
    async fn test_failed_save_leaves_tree_and_index_unchanged() {
        let index = Arc::new(ScriptedIndex::default());
        let engine = engine_with(index.clone(), Arc::new(FailingStore));
        let mut taxonomy = Taxonomy::open(Uuid::new_v4(), sample_tree(), None, engine)
            .await
            .unwrap();
        let before = taxonomy.tree().clone();

        index.answer("3", 0.6);
        let result = taxonomy.insert(&concept::sample("sealift", "Cargo by sea.")).await;
        assert!(matches!(result, Err(TaxonomyError::Store(_))));
        assert_eq!(*taxonomy.tree(), before);
        assert_eq!(index.len(), 4);

        index.answer("3", 0.9);
        let result = taxonomy.insert(&concept::sample("maritime", "At sea.")).await;
        assert!(matches!(result, Err(TaxonomyError::Store(_))));
        assert_eq!(*taxonomy.tree(), before);
    }

    #[tokio::test]
    async fn test_failed_index_insert_restores_stored_tree() {
        let (mut taxonomy, index, store) = scripted().await;
        let before = store.load(taxonomy.id()).await.unwrap();
        index.fail_inserts.store(true, Ordering::SeqCst);
        index.answer("3", 0.6);

        let result = taxonomy.insert(&concept::sample("sealift", "Cargo by sea.")).await;
        assert!(matches!(result, Err(TaxonomyError::Index(_))));
        assert_eq!(taxonomy.len(), 4);
        assert_eq!(store.load(taxonomy.id()).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_resync_when_sizes_differ() {
        let index = Arc::new(ScriptedIndex::default());
        index
            .insert_many(&["stale-1".into(), "stale-2".into()], &[String::new(), String::new()])
            .await
            .unwrap();
        let engine = engine_with(index.clone(), Arc::new(InMemoryTaxonomyStore::new()));
        let taxonomy = Taxonomy::open(Uuid::new_v4(), sample_tree(), None, engine)
            .await
            .unwrap();
        assert_eq!(index.resets.load(Ordering::SeqCst), 1);
        assert_eq!(index.len(), taxonomy.len());
        assert!(!index.docs.lock().unwrap().contains(&NodeId::from("stale-1")));
    }

    #[tokio::test]
    async fn test_in_sync_index_left_alone() {
        let (taxonomy, index, _) = scripted().await;
        let engine = taxonomy.engine.clone();
        let reopened = Taxonomy::load(taxonomy.id(), engine).await.unwrap();
        assert_eq!(index.resets.load(Ordering::SeqCst), 0);
        assert_eq!(index.len(), reopened.len());
    }

    #[tokio::test]
    async fn test_load_missing() {
        let index = Arc::new(ScriptedIndex::default());
        let engine = engine_with(index, Arc::new(InMemoryTaxonomyStore::new()));
        let id = Uuid::new_v4();
        assert!(matches!(
            Taxonomy::load(id, engine).await,
            Err(TaxonomyError::NotFound(missing)) if missing == id
        ));
    }

    #[tokio::test]
    async fn test_display() {
        let (taxonomy, _, _) = scripted().await;
        let text = taxonomy.display().await.unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            format!(
                "Taxonomy(id:'{}', n_nodes:'4', n_embeddings:'4', collection:'scripted')",
                taxonomy.id()
            )
        );
        assert_eq!(lines.next().unwrap(), "logistics");
        assert_eq!(lines.next().unwrap(), "├── air");
    }

    #[tokio::test]
    async fn test_semantic_round_trip_with_keyword_embedder() {
        let store = InMemoryVectorStore::new(Arc::new(KeywordEmbedder::new(&[
            "logistics", "air", "sea", "transport", "cargo",
        ])));
        let engine = Engine {
            store: Arc::new(InMemoryTaxonomyStore::new()),
            indexes: Arc::new(store.clone()),
            thresholds: Thresholds::default(),
            timeouts: Timeouts::default(),
        };
        let mut taxonomy = Taxonomy::create(sample_tree(), engine).await.unwrap();
        let index = store.open(&taxonomy.id().to_string());
        assert_eq!(index.size().await.unwrap(), 4);

        // identical text to an existing node: distance 0, merged
        let result = taxonomy
            .insert(&concept::sample("sea", "Definition of sea"))
            .await
            .unwrap();
        assert_eq!(result.result, InsertOutcome::Merge);
        assert_eq!(result.best_matching_node.unwrap().name, "sea");
        assert_eq!(index.size().await.unwrap(), 4);
    }
}
