//! Error kinds surfaced by the taxonomy engine.

use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Errors produced while building, loading or mutating a taxonomy.
#[derive(Debug, Error)]
pub enum TaxonomyError {
    /// A single ingestion row is unusable (e.g. empty term).
    #[error("Validation error: {0}")]
    Validation(String),

    /// The tabular input does not describe a single rooted tree.
    #[error("Structural error: {0}")]
    Structural(String),

    /// The uploaded file is not a supported spreadsheet.
    #[error("Format error: {0}")]
    Format(String),

    /// The vector index and the tree disagree about which nodes exist.
    #[error("Consistency violation: {0}")]
    ConsistencyViolation(String),

    #[error("Taxonomy not found: {0}")]
    NotFound(Uuid),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Vector index error: {0:#}")]
    Index(anyhow::Error),

    #[error("Definition generation error: {0:#}")]
    Definition(anyhow::Error),

    #[error("Taxonomy store error: {0:#}")]
    Store(anyhow::Error),

    #[error("Export error: {0:#}")]
    Export(anyhow::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A detached mutation task panicked or was aborted.
    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type TaxonomyResult<T> = Result<T, TaxonomyError>;

/// Run a collaborator future under a deadline.
///
/// The inner error is wrapped with `wrap`; an elapsed deadline becomes
/// [`TaxonomyError::Timeout`].
pub async fn with_timeout<T, F>(
    operation: &'static str,
    after: Duration,
    wrap: fn(anyhow::Error) -> TaxonomyError,
    fut: F,
) -> TaxonomyResult<T>
where
    F: std::future::Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result.map_err(wrap),
        Err(_) => Err(TaxonomyError::Timeout { operation, after }),
    }
}
