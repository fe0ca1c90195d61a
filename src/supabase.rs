//! Supabase (PostgREST) backed taxonomy store.

use anyhow::{anyhow, Result};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use crate::store::{TaxonomyRecord, TaxonomyStore};

const SCHEMA: &str = "taxonomy";
const TABLE: &str = "taxonomies";

/// Supabase client configuration.
#[derive(Clone)]
pub struct SupabaseTaxonomyStore {
    client: Client,
    base_url: String,
    service_role_key: String,
}

impl SupabaseTaxonomyStore {
    /// Create a new Supabase client from environment variables.
    pub fn from_env() -> Result<Self> {
        let base_url =
            std::env::var("SUPABASE_URL").map_err(|_| anyhow!("SUPABASE_URL not set"))?;
        let service_role_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .map_err(|_| anyhow!("SUPABASE_SERVICE_ROLE_KEY not set"))?;

        Ok(Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            service_role_key,
        })
    }

    fn table_url(&self) -> String {
        format!("{}/rest/v1/{}", self.base_url, TABLE)
    }
}

#[derive(Debug, Deserialize)]
struct TaxonomyRow {
    id: Uuid,
    tree: String,
    collection: Option<String>,
}

#[async_trait::async_trait]
impl TaxonomyStore for SupabaseTaxonomyStore {
    async fn load(&self, id: Uuid) -> Result<Option<TaxonomyRecord>> {
        let url = format!("{}?id=eq.{}&select=id,tree,collection", self.table_url(), id);
        let resp = self
            .client
            .get(&url)
            .header("apikey", &self.service_role_key)
            .header("Authorization", format!("Bearer {}", self.service_role_key))
            .header("Accept-Profile", SCHEMA)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("Supabase GET taxonomy {} failed: {} - {}", id, status, text));
        }

        let rows: Vec<TaxonomyRow> = resp.json().await?;
        Ok(rows.into_iter().next().map(TaxonomyRecord::from))
    }

    /// Upsert: a save replaces the stored tree for the same id.
    async fn save(&self, record: &TaxonomyRecord) -> Result<()> {
        let body = json!({
            "id": record.id,
            "tree": record.tree,
            "collection": record.collection,
        });

        debug!("Upserting taxonomy: {}", record.id);

        let resp = self
            .client
            .post(self.table_url())
            .header("apikey", &self.service_role_key)
            .header("Authorization", format!("Bearer {}", self.service_role_key))
            .header("Content-Type", "application/json")
            .header("Content-Profile", SCHEMA)
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!(
                "Failed to save taxonomy {}: {} - {}",
                record.id,
                status,
                text
            ));
        }

        info!("Saved taxonomy {} to Supabase", record.id);
        Ok(())
    }
}

impl From<TaxonomyRow> for TaxonomyRecord {
    /// Rows written before collections were named fall back to the id.
    fn from(row: TaxonomyRow) -> Self {
        Self {
            collection: row
                .collection
                .filter(|c| !c.is_empty())
                .unwrap_or_else(|| row.id.to_string()),
            id: row.id,
            tree: row.tree,
        }
    }
}
