//! Durable vector index stored in a SQLite file.
//!
//! Embeddings are kept as little-endian `f32` blobs keyed by collection and
//! node id. Queries scan the collection and rank by squared L2 distance, the
//! same metric as the in-process index.

use crate::index::{embed_documents, embed_query, squared_l2, Embedder, IndexProvider, Neighbor, VectorIndex};
use crate::node::NodeId;
use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

#[derive(Clone)]
pub struct SqliteVectorStore {
    embedder: Arc<dyn Embedder>,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteVectorStore {
    /// Open (or create) the index file, creating its directory if needed.
    pub fn open(path: impl AsRef<Path>, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create index directory {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open vector index {}", path.display()))?;
        info!("Vector index at {}", path.display());
        Self::init(conn, embedder)
    }

    #[cfg(test)]
    pub fn open_in_memory(embedder: Arc<dyn Embedder>) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, embedder)
    }

    fn init(conn: Connection, embedder: Arc<dyn Embedder>) -> Result<Self> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;

            CREATE TABLE IF NOT EXISTS embeddings (
                collection TEXT NOT NULL,
                node_id TEXT NOT NULL,
                embedding BLOB NOT NULL,
                PRIMARY KEY (collection, node_id)
            );
            "#,
        )
        .context("Failed to initialize vector index schema")?;
        Ok(Self {
            embedder,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("Vector index connection poisoned"))
    }
}

impl IndexProvider for SqliteVectorStore {
    fn open(&self, collection: &str) -> Arc<dyn VectorIndex> {
        Arc::new(SqliteCollection {
            store: self.clone(),
            name: collection.to_string(),
        })
    }
}

pub struct SqliteCollection {
    store: SqliteVectorStore,
    name: String,
}

#[async_trait::async_trait]
impl VectorIndex for SqliteCollection {
    fn collection(&self) -> &str {
        &self.name
    }

    async fn size(&self) -> Result<usize> {
        let conn = self.store.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM embeddings WHERE collection = ?1",
            params![self.name],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    async fn insert_many(&self, ids: &[NodeId], texts: &[String]) -> Result<()> {
        let vectors = embed_documents(self.store.embedder.as_ref(), ids, texts).await?;

        let mut conn = self.store.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO embeddings (collection, node_id, embedding) \
                 VALUES (?1, ?2, ?3)",
            )?;
            for (id, vector) in ids.iter().zip(&vectors) {
                stmt.execute(params![self.name, id.as_str(), to_blob(vector)])?;
            }
        }
        tx.commit()?;
        debug!("Added {} documents to collection '{}'", ids.len(), self.name);
        Ok(())
    }

    async fn query(&self, text: &str, top_k: usize) -> Result<Vec<Neighbor>> {
        let query = embed_query(self.store.embedder.as_ref(), text).await?;

        let conn = self.store.lock()?;
        let mut stmt =
            conn.prepare("SELECT node_id, embedding FROM embeddings WHERE collection = ?1")?;
        let rows = stmt.query_map(params![self.name], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;

        let mut hits = Vec::new();
        for row in rows {
            let (id, blob) = row?;
            hits.push(Neighbor {
                id: NodeId::from(id),
                distance: squared_l2(&query, &from_blob(&blob)?),
            });
        }
        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn reset(&self) -> Result<()> {
        let conn = self.store.lock()?;
        conn.execute(
            "DELETE FROM embeddings WHERE collection = ?1",
            params![self.name],
        )?;
        info!("Reinitialized collection '{}'", self.name);
        Ok(())
    }
}

fn to_blob(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|x| x.to_le_bytes()).collect()
}

fn from_blob(blob: &[u8]) -> Result<Vec<f32>> {
    if blob.len() % 4 != 0 {
        anyhow::bail!("Corrupt embedding blob of {} bytes", blob.len());
    }
    Ok(blob
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}
