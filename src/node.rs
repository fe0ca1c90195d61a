//! A single concept in the taxonomy tree.
//!
//! Nodes are arena records: parent and children are stored as ids and are
//! only ever rewired through [`crate::tree::ConceptTree`].

use crate::concept::Concept;
use crate::definition::NamedDefinition;
use crate::error::{TaxonomyError, TaxonomyResult};
use crate::sheet_parser::Row;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

pub const COL_ID: &str = "ID";
pub const COL_TERM: &str = "Term";
pub const COL_TYPE: &str = "Type";
pub const COL_SOURCE_NAME: &str = "Source name";
pub const COL_RECORD_NUMBER: &str = "Record number";
pub const COL_PREFERRED_NAME: &str = "Preferred name";
pub const COL_ALSO_KNOWN_AS: &str = "Also know as/Alternative";
pub const COL_RELATED_TO: &str = "Term related to";
pub const COL_DEFINITION: &str = "Definition";
pub const COL_ABBREVIATION: &str = "Abbreviation";
pub const COL_PARENT: &str = "Parent name/Broader";
pub const COL_CHILDREN: &str = "Child name/Narrower";
pub const COL_COMMENTS: &str = "Comments";
pub const COL_STATUS: &str = "Status";
pub const COL_ASSOCIATED: &str = "Associated Standards";
pub const COL_ALT_NAMES: &str = "Alternative Names";
pub const COL_ALT_DEFINITIONS: &str = "Alternative Definitions";

/// Export column order.
pub const EXPORT_COLUMNS: [&str; 17] = [
    COL_ID,
    COL_TERM,
    COL_TYPE,
    COL_SOURCE_NAME,
    COL_RECORD_NUMBER,
    COL_PREFERRED_NAME,
    COL_ALSO_KNOWN_AS,
    COL_RELATED_TO,
    COL_DEFINITION,
    COL_ABBREVIATION,
    COL_PARENT,
    COL_CHILDREN,
    COL_COMMENTS,
    COL_STATUS,
    COL_ASSOCIATED,
    COL_ALT_NAMES,
    COL_ALT_DEFINITIONS,
];

/// Separator for list-valued cells.
pub const LIST_SEPARATOR: &str = "; ";

pub const LLM_DEFINITION_MARKER: &str = "(LLM-generated definition)";

/// Canonical embedded text. Changing this invalidates stored embeddings.
pub fn render_doc(name: &str, definition: &str) -> String {
    format!("{}: {}", name, definition)
}

/// Stable node identifier. Usually a UUID, but ids supplied by an
/// ingestion spreadsheet are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Provenance status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NodeStatus {
    /// Present in the ingested spreadsheet.
    Original,
    /// Added from an extracted concept.
    Introduced,
    /// Confirmed by at least one merged concept.
    Corroborated,
    /// No similar concept found in the studied documents.
    #[default]
    NotFound,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::Original => "Original",
            NodeStatus::Introduced => "Introduced",
            NodeStatus::Corroborated => "Corroborated",
            NodeStatus::NotFound => "NotFound",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptNode {
    pub id: NodeId,
    pub name: String,
    pub definition: String,
    #[serde(skip)]
    pub(crate) parent: Option<NodeId>,
    #[serde(skip)]
    pub(crate) children: Vec<NodeId>,
    #[serde(default)]
    pub status: NodeStatus,
    #[serde(default)]
    pub source_name: String,
    #[serde(default)]
    pub preferred_name: String,
    #[serde(default)]
    pub associated_documents: Vec<String>,
    #[serde(default)]
    pub alternate_names: Vec<String>,
    #[serde(default)]
    pub alternate_definitions: Vec<String>,
    /// Ingestion columns carried through untouched.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl ConceptNode {
    fn detached(id: NodeId, name: String, definition: String, status: NodeStatus) -> Self {
        Self {
            id,
            name,
            definition,
            parent: None,
            children: Vec::new(),
            status,
            source_name: String::new(),
            preferred_name: String::new(),
            associated_documents: Vec::new(),
            alternate_names: Vec::new(),
            alternate_definitions: Vec::new(),
            extra: BTreeMap::new(),
        }
    }

    /// Build a detached node from one ingestion row.
    ///
    /// The `Status` column is ignored; ingested nodes are always `Original`.
    pub fn from_row(row: &Row) -> TaxonomyResult<Self> {
        let mut fields = row.clone();
        let mut take = |key: &str| fields.remove(key).unwrap_or_default();

        let name = take(COL_TERM).trim().to_string();
        if name.is_empty() {
            return Err(TaxonomyError::Validation(format!(
                "Row has an empty '{}' column",
                COL_TERM
            )));
        }
        let definition = take(COL_DEFINITION).trim().to_string();
        let id = match take(COL_ID).trim() {
            "" => NodeId::new(),
            provided => NodeId::from_string(provided),
        };

        let mut node = Self::detached(id, name, definition, NodeStatus::Original);
        node.source_name = take(COL_SOURCE_NAME).trim().to_string();
        node.preferred_name = take(COL_PREFERRED_NAME).trim().to_string();
        node.associated_documents = split_list(&take(COL_ASSOCIATED));
        node.alternate_names = split_list(&take(COL_ALT_NAMES));
        node.alternate_definitions = split_list(&take(COL_ALT_DEFINITIONS));
        take(COL_STATUS);

        node.extra = fields;
        Ok(node)
    }

    /// Build a detached node from an extracted concept.
    pub fn from_concept(concept: &Concept) -> Self {
        let mut node = Self::detached(
            NodeId::from_string(concept.id.to_string()),
            concept.name.clone(),
            concept.definition.clone(),
            NodeStatus::Introduced,
        );
        node.source_name = concept.filename.clone();
        node.associated_documents = vec![concept.provenance()];
        node
    }

    /// Absorb a duplicate concept.
    ///
    /// Alternates are appended as-is: merging the same concept twice records
    /// it twice.
    pub fn merge(&mut self, concept: &Concept) {
        self.alternate_definitions.push(concept.definition.clone());
        self.alternate_names.push(concept.name.clone());
        self.associated_documents.push(concept.provenance());
        self.status = NodeStatus::Corroborated;
    }

    pub fn parent(&self) -> Option<&NodeId> {
        self.parent.as_ref()
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn to_doc(&self) -> String {
        render_doc(&self.name, &self.definition)
    }

    pub fn to_named_definition(&self) -> NamedDefinition {
        NamedDefinition {
            name: self.name.clone(),
            definition: self.definition.clone(),
        }
    }

    /// Passthrough column value, empty when absent.
    pub fn extra_value(&self, column: &str) -> &str {
        self.extra.get(column).map(String::as_str).unwrap_or("")
    }

    /// Mark the definition as machine-written in the source name.
    pub(crate) fn mark_generated_definition(&mut self) {
        if self.source_name.is_empty() {
            self.source_name = LLM_DEFINITION_MARKER.to_string();
        } else {
            self.source_name = format!("{} {}", self.source_name, LLM_DEFINITION_MARKER);
        }
    }

    /// Render the export columns in [`EXPORT_COLUMNS`] order.
    ///
    /// Parent and child names come from the live tree and are passed in.
    pub fn to_row(&self, parent_name: Option<&str>, child_names: &[&str]) -> Vec<(&'static str, String)> {
        EXPORT_COLUMNS
            .iter()
            .map(|&column| {
                let value = match column {
                    COL_ID => self.id.to_string(),
                    COL_TERM => self.name.clone(),
                    COL_SOURCE_NAME => self.source_name.clone(),
                    COL_PREFERRED_NAME => self.preferred_name.clone(),
                    COL_DEFINITION => self.definition.clone(),
                    COL_PARENT => parent_name.unwrap_or("").to_string(),
                    COL_CHILDREN => child_names.join(LIST_SEPARATOR),
                    COL_STATUS => self.status.to_string(),
                    COL_ASSOCIATED => self.associated_documents.join(LIST_SEPARATOR),
                    COL_ALT_NAMES => self.alternate_names.join(LIST_SEPARATOR),
                    COL_ALT_DEFINITIONS => self.alternate_definitions.join(LIST_SEPARATOR),
                    other => self.extra_value(other).to_string(),
                };
                (column, value)
            })
            .collect()
    }
}

/// Inverse of joining with [`LIST_SEPARATOR`]. A value that itself contains
/// `"; "` comes back as two entries; a bare `;` is kept.
fn split_list(cell: &str) -> Vec<String> {
    cell.split(LIST_SEPARATOR)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
