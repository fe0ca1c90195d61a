//! Concepts proposed for insertion, as produced by the extraction pipeline.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A name/definition pair extracted from a document chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Concept {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    pub definition: String,
    pub chunk_id: Uuid,
    pub page_number: u32,
    pub filename: String,
}

impl Concept {
    /// Provenance string recorded on nodes, e.g. `ISO-9000.pdf (p. 12)`.
    pub fn provenance(&self) -> String {
        format!("{} (p. {})", self.filename, self.page_number)
    }

    /// Text embedded for similarity lookups. Must match `ConceptNode::to_doc`.
    pub fn to_doc(&self) -> String {
        crate::node::render_doc(&self.name, &self.definition)
    }
}

#[cfg(test)]
pub(crate) fn sample(name: &str, definition: &str) -> Concept {
    Concept {
        id: Uuid::new_v4(),
        name: name.to_string(),
        definition: definition.to_string(),
        chunk_id: Uuid::new_v4(),
        page_number: 12,
        filename: "STANAG-4107.pdf".to_string(),
    }
}
