//! Builds a taxonomy tree from spreadsheet rows.

use crate::definition::{DefinitionGenerator, NodeContext};
use crate::error::{with_timeout, TaxonomyError, TaxonomyResult};
use crate::node::{ConceptNode, NodeId, COL_CHILDREN, COL_PARENT};
use crate::sheet_parser::Row;
use crate::tree::ConceptTree;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

pub struct TreeBuilder<'a> {
    generator: &'a dyn DefinitionGenerator,
    llm_timeout: Duration,
}

impl<'a> TreeBuilder<'a> {
    pub fn new(generator: &'a dyn DefinitionGenerator, llm_timeout: Duration) -> Self {
        Self {
            generator,
            llm_timeout,
        }
    }

    /// Build the tree and fill in missing definitions.
    pub async fn build(&self, records: &[Row]) -> TaxonomyResult<ConceptTree> {
        let (mut tree, order) = grow_tree(records)?;

        for id in &order {
            let context = match tree.get(id) {
                Some(node) if node.definition.is_empty() => NodeContext::of(&tree, id),
                _ => None,
            };
            let Some(context) = context else { continue };

            info!("Generating definition for partial concept '{}'", context.term);
            let definition = with_timeout(
                "definition generation",
                self.llm_timeout,
                TaxonomyError::Definition,
                self.generator.generate(&context),
            )
            .await?;

            if let Some(node) = tree.get_mut(id) {
                node.definition = definition;
                node.mark_generated_definition();
            }
        }

        Ok(tree)
    }
}

/// Link rows into a tree without touching definitions.
///
/// Returns the tree and node ids in row order. A row's parent is looked up
/// first among terms, then among preferred names.
pub fn grow_tree(records: &[Row]) -> TaxonomyResult<(ConceptTree, Vec<NodeId>)> {
    if records.is_empty() {
        return Err(TaxonomyError::Structural("Taxonomy file has no rows".to_string()));
    }

    let mut nodes = Vec::with_capacity(records.len());
    let mut by_term: HashMap<String, usize> = HashMap::new();
    for record in records {
        let node = ConceptNode::from_row(record)?;
        if by_term.insert(node.name.clone(), nodes.len()).is_some() {
            return Err(TaxonomyError::Structural(format!("Duplicate term: '{}'", node.name)));
        }
        nodes.push(node);
    }

    let mut root: Option<usize> = None;
    let mut links = Vec::new();
    for (i, node) in nodes.iter().enumerate() {
        let parent_name = node.extra_value(COL_PARENT).trim();
        if parent_name.is_empty() {
            if let Some(existing) = root {
                return Err(TaxonomyError::Structural(format!(
                    "More than one root node found ('{}' and '{}')",
                    nodes[existing].name, node.name
                )));
            }
            root = Some(i);
            continue;
        }

        let parent = by_term
            .get(parent_name)
            .map(|&i| &nodes[i])
            .or_else(|| nodes.iter().find(|n| n.preferred_name == parent_name))
            .ok_or_else(|| {
                TaxonomyError::Structural(format!(
                    "Parent node '{}' not found for '{}', or node has multiple parents",
                    parent_name, node.name
                ))
            })?;
        debug!("Linking '{}' under '{}'", node.name, parent.name);
        links.push((node.id.clone(), parent.id.clone()));
    }

    let root = root
        .map(|i| nodes[i].id.clone())
        .ok_or_else(|| {
            TaxonomyError::Structural("No root node found (every row has a parent)".to_string())
        })?;

    let order: Vec<NodeId> = nodes.iter().map(|n| n.id.clone()).collect();
    for node in nodes.iter_mut() {
        node.extra.remove(COL_PARENT);
        node.extra.remove(COL_CHILDREN);
    }

    let tree = ConceptTree::from_links(root, nodes, &links)?;
    Ok((tree, order))
}
