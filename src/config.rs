//! Engine settings.
//!
//! Settings come from an optional JSON file (`TAXONOMY_SETTINGS_FILE`) and are
//! then overridden by `TAXONOMY_*` environment variables.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Similarity cut-offs used by the insertion decision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Best-match scores below this are rejected.
    pub rejection: f64,
    /// Best-match scores at or above this are merged into the match.
    pub merge: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            rejection: 0.5,
            merge: 0.65,
        }
    }
}

impl Thresholds {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.rejection) || !(0.0..=1.0).contains(&self.merge) {
            anyhow::bail!("Thresholds must lie in [0, 1]: {:?}", self);
        }
        if self.rejection > self.merge {
            anyhow::bail!(
                "Rejection threshold ({}) must not exceed merge threshold ({})",
                self.rejection,
                self.merge
            );
        }
        Ok(())
    }
}

/// Per-collaborator deadlines, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeouts {
    pub query_secs: u64,
    pub llm_secs: u64,
    pub store_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            query_secs: 30,
            llm_secs: 120,
            store_secs: 30,
        }
    }
}

impl Timeouts {
    pub fn query(&self) -> Duration {
        Duration::from_secs(self.query_secs)
    }

    pub fn llm(&self) -> Duration {
        Duration::from_secs(self.llm_secs)
    }

    pub fn store(&self) -> Duration {
        Duration::from_secs(self.store_secs)
    }
}

/// Which persistence backend holds taxonomy blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    File,
    Memory,
    Supabase,
}

impl FromStr for StoreKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "file" => Ok(Self::File),
            "memory" => Ok(Self::Memory),
            "supabase" => Ok(Self::Supabase),
            other => anyhow::bail!("Unknown store kind: {}. Expected file|memory|supabase", other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub thresholds: Thresholds,
    pub timeouts: Timeouts,
    pub ollama_url: String,
    pub embedding_model: String,
    pub definition_model: String,
    pub definition_temperature: f32,
    pub store: StoreKind,
    pub data_dir: PathBuf,
    /// SQLite file holding the vector index.
    pub index_path: PathBuf,
    /// Opened taxonomies kept in memory before idle ones are evicted.
    pub cache_capacity: usize,
    pub bind: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            thresholds: Thresholds::default(),
            timeouts: Timeouts::default(),
            ollama_url: "http://localhost:11434".to_string(),
            embedding_model: "nomic-embed-text:latest".to_string(),
            definition_model: "mistralai/mistral-small-3.2-24b-instruct".to_string(),
            definition_temperature: 0.3,
            store: StoreKind::File,
            data_dir: PathBuf::from("./data/taxonomies"),
            index_path: PathBuf::from("./data/index.sqlite3"),
            cache_capacity: 64,
            bind: "0.0.0.0:5008".to_string(),
        }
    }
}

impl Settings {
    /// Load settings: optional JSON file first, then environment overrides.
    pub fn from_env() -> Result<Self> {
        let mut settings = match std::env::var("TAXONOMY_SETTINGS_FILE") {
            Ok(path) => Self::load_from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        settings.apply_overrides(|key| std::env::var(key).ok())?;
        settings.thresholds.validate()?;
        info!(
            "Settings loaded: thresholds={:?}, store={:?}",
            settings.thresholds, settings.store
        );
        Ok(settings)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings: {:?}", path))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse settings: {:?}", path))
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("TAXONOMY_REJECTION_THRESHOLD") {
            self.thresholds.rejection = parse_var("TAXONOMY_REJECTION_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("TAXONOMY_MERGE_THRESHOLD") {
            self.thresholds.merge = parse_var("TAXONOMY_MERGE_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("TAXONOMY_QUERY_TIMEOUT_SECS") {
            self.timeouts.query_secs = parse_var("TAXONOMY_QUERY_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("TAXONOMY_LLM_TIMEOUT_SECS") {
            self.timeouts.llm_secs = parse_var("TAXONOMY_LLM_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("TAXONOMY_STORE_TIMEOUT_SECS") {
            self.timeouts.store_secs = parse_var("TAXONOMY_STORE_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("TAXONOMY_OLLAMA_URL") {
            self.ollama_url = v;
        }
        if let Some(v) = lookup("TAXONOMY_EMBEDDING_MODEL") {
            self.embedding_model = v;
        }
        if let Some(v) = lookup("TAXONOMY_DEFINITION_MODEL") {
            self.definition_model = v;
        }
        if let Some(v) = lookup("TAXONOMY_DEFINITION_TEMPERATURE") {
            self.definition_temperature = parse_var("TAXONOMY_DEFINITION_TEMPERATURE", &v)?;
        }
        if let Some(v) = lookup("TAXONOMY_STORE") {
            self.store = v.parse()?;
        }
        if let Some(v) = lookup("TAXONOMY_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("TAXONOMY_INDEX_PATH") {
            self.index_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("TAXONOMY_CACHE_CAPACITY") {
            self.cache_capacity = parse_var("TAXONOMY_CACHE_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("TAXONOMY_BIND") {
            self.bind = v;
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid value for {}: {:?} ({})", key, value, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.thresholds.rejection, 0.5);
        assert_eq!(settings.thresholds.merge, 0.65);
        assert_eq!(settings.store, StoreKind::File);
        assert!(settings.thresholds.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("TAXONOMY_REJECTION_THRESHOLD", "0.4"),
            ("TAXONOMY_MERGE_THRESHOLD", "0.8"),
            ("TAXONOMY_STORE", "memory"),
            ("TAXONOMY_LLM_TIMEOUT_SECS", "5"),
            ("TAXONOMY_CACHE_CAPACITY", "8"),
            ("TAXONOMY_INDEX_PATH", "/tmp/index.sqlite3"),
        ]
        .into_iter()
        .collect();

        let mut settings = Settings::default();
        settings
            .apply_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(settings.thresholds.rejection, 0.4);
        assert_eq!(settings.thresholds.merge, 0.8);
        assert_eq!(settings.store, StoreKind::Memory);
        assert_eq!(settings.timeouts.llm(), Duration::from_secs(5));
        assert_eq!(settings.cache_capacity, 8);
        assert_eq!(settings.index_path, PathBuf::from("/tmp/index.sqlite3"));
    }

    #[test]
    fn test_invalid_override() {
        let mut settings = Settings::default();
        let result = settings.apply_overrides(|k| {
            (k == "TAXONOMY_MERGE_THRESHOLD").then(|| "high".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_inverted_thresholds_rejected() {
        let thresholds = Thresholds {
            rejection: 0.7,
            merge: 0.6,
        };
        assert!(thresholds.validate().is_err());
    }

    #[test]
    fn test_partial_settings_file() {
        let settings: Settings =
            serde_json::from_str(r#"{"thresholds": {"rejection": 0.3, "merge": 0.9}}"#).unwrap();
        assert_eq!(settings.thresholds.merge, 0.9);
        assert_eq!(settings.bind, "0.0.0.0:5008");
    }
}
