//! Arena-backed concept tree.
//!
//! Nodes live in a flat map keyed by id; structure is carried by each node's
//! parent id and ordered child ids. Exactly one node (the root) has no parent.

use crate::concept::Concept;
use crate::error::{TaxonomyError, TaxonomyResult};
use crate::node::{ConceptNode, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct ConceptTree {
    root: NodeId,
    nodes: HashMap<NodeId, ConceptNode>,
}

impl ConceptTree {
    /// Assemble a tree from detached nodes and `(child, parent)` links.
    ///
    /// Children are attached in link order. Fails if ids repeat, a link
    /// names an unknown node, the root gets a parent, or some node is not
    /// reachable from the root.
    pub fn from_links(
        root: NodeId,
        detached: Vec<ConceptNode>,
        links: &[(NodeId, NodeId)],
    ) -> TaxonomyResult<Self> {
        let mut nodes = HashMap::with_capacity(detached.len());
        for mut node in detached {
            node.parent = None;
            node.children.clear();
            let id = node.id.clone();
            if nodes.insert(id.clone(), node).is_some() {
                return Err(TaxonomyError::Structural(format!("Duplicate node id: {}", id)));
            }
        }
        if !nodes.contains_key(&root) {
            return Err(TaxonomyError::Structural(format!("Root node {} not found", root)));
        }

        for (child, parent) in links {
            if child == &root {
                return Err(TaxonomyError::Structural(format!(
                    "Root node {} cannot have a parent",
                    root
                )));
            }
            if !nodes.contains_key(parent) {
                return Err(TaxonomyError::Structural(format!("Parent node {} not found", parent)));
            }
            match nodes.get_mut(child) {
                Some(node) if node.parent.is_none() => node.parent = Some(parent.clone()),
                Some(_) => {
                    return Err(TaxonomyError::Structural(format!(
                        "Node {} has multiple parents",
                        child
                    )))
                }
                None => {
                    return Err(TaxonomyError::Structural(format!("Child node {} not found", child)))
                }
            }
            if let Some(p) = nodes.get_mut(parent) {
                p.children.push(child.clone());
            }
        }

        let tree = Self { root, nodes };
        let reachable = tree.pre_order().count();
        if reachable != tree.nodes.len() {
            return Err(TaxonomyError::Structural(format!(
                "{} node(s) are not reachable from the root (cyclic parent references)",
                tree.nodes.len() - reachable
            )));
        }
        Ok(tree)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn root_id(&self) -> &NodeId {
        &self.root
    }

    pub fn root(&self) -> &ConceptNode {
        &self.nodes[&self.root]
    }

    pub fn get(&self, id: &NodeId) -> Option<&ConceptNode> {
        self.nodes.get(id)
    }

    pub fn get_mut(&mut self, id: &NodeId) -> Option<&mut ConceptNode> {
        self.nodes.get_mut(id)
    }

    pub fn parent_of(&self, id: &NodeId) -> Option<&ConceptNode> {
        self.nodes.get(id)?.parent().and_then(|p| self.nodes.get(p))
    }

    pub fn children_of(&self, id: &NodeId) -> Vec<&ConceptNode> {
        self.nodes
            .get(id)
            .map(|n| n.children().iter().filter_map(|c| self.nodes.get(c)).collect())
            .unwrap_or_default()
    }

    /// Other children of the node's parent, in order.
    pub fn siblings_of(&self, id: &NodeId) -> Vec<&ConceptNode> {
        match self.nodes.get(id).and_then(|n| n.parent.as_ref()) {
            Some(parent) => self
                .children_of(parent)
                .into_iter()
                .filter(|s| &s.id != id)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Depth-first, parent before children, children in insertion order.
    pub fn pre_order(&self) -> PreOrder<'_> {
        PreOrder {
            tree: self,
            stack: vec![&self.root],
        }
    }

    /// Attach a detached node as the last child of `parent`.
    ///
    /// A node whose id is already taken gets a fresh id.
    pub fn add_child(&mut self, parent: &NodeId, mut node: ConceptNode) -> TaxonomyResult<NodeId> {
        if !self.nodes.contains_key(parent) {
            return Err(TaxonomyError::ConsistencyViolation(format!(
                "Parent node {} not in tree",
                parent
            )));
        }
        if self.nodes.contains_key(&node.id) {
            let fresh = NodeId::new();
            debug!("Node id {} already taken, using {}", node.id, fresh);
            node.id = fresh;
        }
        node.parent = Some(parent.clone());
        node.children.clear();
        let id = node.id.clone();
        self.nodes.insert(id.clone(), node);
        if let Some(p) = self.nodes.get_mut(parent) {
            p.children.push(id.clone());
        }
        Ok(id)
    }

    /// Remove a non-root node and its descendants, returning them as a tree.
    #[allow(dead_code)]
    pub fn detach(&mut self, id: &NodeId) -> TaxonomyResult<ConceptTree> {
        if id == &self.root {
            return Err(TaxonomyError::Structural("Cannot detach the root node".to_string()));
        }
        let parent = self
            .nodes
            .get(id)
            .and_then(|n| n.parent.clone())
            .ok_or_else(|| TaxonomyError::ConsistencyViolation(format!("Node {} not in tree", id)))?;

        let subtree_ids: Vec<NodeId> = PreOrder {
            tree: self,
            stack: vec![id],
        }
        .map(|n| n.id.clone())
        .collect();

        if let Some(p) = self.nodes.get_mut(&parent) {
            p.children.retain(|c| c != id);
        }
        let mut nodes = HashMap::with_capacity(subtree_ids.len());
        for sid in subtree_ids {
            if let Some(node) = self.nodes.remove(&sid) {
                nodes.insert(sid, node);
            }
        }
        if let Some(new_root) = nodes.get_mut(id) {
            new_root.parent = None;
        }
        Ok(ConceptTree {
            root: id.clone(),
            nodes,
        })
    }

    /// Attach a node built from `concept` as the last child of `parent`.
    pub fn insert_as_child(&mut self, parent: &NodeId, concept: &Concept) -> TaxonomyResult<NodeId> {
        self.add_child(parent, ConceptNode::from_concept(concept))
    }

    /// Splice a node built from `concept` between `id` and its parent.
    ///
    /// The new node takes `id`'s place among its former siblings and `id`
    /// becomes its only child. Splicing above the root makes a new root.
    #[allow(dead_code)]
    pub fn insert_as_new_parent(&mut self, id: &NodeId, concept: &Concept) -> TaxonomyResult<NodeId> {
        let old_parent = match self.nodes.get(id) {
            Some(node) => node.parent.clone(),
            None => {
                return Err(TaxonomyError::ConsistencyViolation(format!("Node {} not in tree", id)))
            }
        };

        let mut node = ConceptNode::from_concept(concept);
        if self.nodes.contains_key(&node.id) {
            node.id = NodeId::new();
        }
        let new_id = node.id.clone();
        node.parent = old_parent.clone();
        node.children = vec![id.clone()];

        match &old_parent {
            Some(parent) => {
                if let Some(p) = self.nodes.get_mut(parent) {
                    for child in p.children.iter_mut() {
                        if child == id {
                            *child = new_id.clone();
                        }
                    }
                }
            }
            None => self.root = new_id.clone(),
        }
        if let Some(current) = self.nodes.get_mut(id) {
            current.parent = Some(new_id.clone());
        }
        self.nodes.insert(new_id.clone(), node);
        Ok(new_id)
    }

    /// Export rows in pre-order.
    pub fn to_rows(&self) -> Vec<Vec<(&'static str, String)>> {
        self.pre_order()
            .map(|node| {
                let parent = self.parent_of(&node.id).map(|p| p.name.as_str());
                let children: Vec<&str> = self
                    .children_of(&node.id)
                    .into_iter()
                    .map(|c| c.name.as_str())
                    .collect();
                node.to_row(parent, &children)
            })
            .collect()
    }

    /// Indented rendering of node names, one per line.
    pub fn render(&self) -> String {
        let mut lines = vec![self.root().name.clone()];
        self.render_children(self.root_id(), "", &mut lines);
        lines.join("\n")
    }

    fn render_children(&self, id: &NodeId, prefix: &str, lines: &mut Vec<String>) {
        let children = self.children_of(id);
        let count = children.len();
        for (i, child) in children.into_iter().enumerate() {
            let last = i + 1 == count;
            let branch = if last { "└── " } else { "├── " };
            lines.push(format!("{}{}{}", prefix, branch, child.name));
            let next = format!("{}{}", prefix, if last { "    " } else { "│   " });
            self.render_children(&child.id, &next, lines);
        }
    }

    /// Serialize as a flat pre-order node list with parent ids plus the
    /// root id. Depth does not affect the JSON nesting.
    pub fn to_json(&self) -> TaxonomyResult<String> {
        let flat = FlatTreeRef {
            root: &self.root,
            nodes: self
                .pre_order()
                .map(|node| FlatNodeRef {
                    node,
                    parent_id: node.parent(),
                })
                .collect(),
        };
        Ok(serde_json::to_string(&flat)?)
    }

    pub fn from_json(data: &str) -> TaxonomyResult<Self> {
        let flat: FlatTree = serde_json::from_str(data)?;
        let mut detached = Vec::with_capacity(flat.nodes.len());
        let mut links = Vec::new();
        for FlatNode { node, parent_id } in flat.nodes {
            if let Some(parent) = parent_id {
                links.push((node.id.clone(), parent));
            }
            detached.push(node);
        }
        Self::from_links(flat.root, detached, &links)
    }
}

pub struct PreOrder<'a> {
    tree: &'a ConceptTree,
    stack: Vec<&'a NodeId>,
}

impl<'a> Iterator for PreOrder<'a> {
    type Item = &'a ConceptNode;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.stack.pop()?;
        let node = self.tree.nodes.get(id)?;
        self.stack.extend(node.children.iter().rev());
        Some(node)
    }
}

#[derive(Serialize)]
struct FlatTreeRef<'a> {
    root: &'a NodeId,
    nodes: Vec<FlatNodeRef<'a>>,
}

#[derive(Serialize)]
struct FlatNodeRef<'a> {
    #[serde(flatten)]
    node: &'a ConceptNode,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_id: Option<&'a NodeId>,
}

/// Pre-order listing keeps each parent's children in order when the links
/// are replayed.
#[derive(Deserialize)]
struct FlatTree {
    root: NodeId,
    nodes: Vec<FlatNode>,
}

#[derive(Deserialize)]
struct FlatNode {
    #[serde(flatten)]
    node: ConceptNode,
    #[serde(default)]
    parent_id: Option<NodeId>,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::concept;
    use crate::node::NodeStatus;
    use crate::sheet_parser::Row;

    pub(crate) fn node(id: &str, name: &str) -> ConceptNode {
        let row: Row = [
            ("ID".to_string(), id.to_string()),
            ("Term".to_string(), name.to_string()),
            ("Definition".to_string(), format!("Definition of {}", name)),
        ]
        .into_iter()
        .collect();
        ConceptNode::from_row(&row).unwrap()
    }

    /// logistics
    /// ├── air
    /// │   └── air transport
    /// └── sea
    pub(crate) fn sample_tree() -> ConceptTree {
        ConceptTree::from_links(
            NodeId::from("1"),
            vec![
                node("1", "logistics"),
                node("2", "air"),
                node("3", "sea"),
                node("4", "air transport"),
            ],
            &[
                ("2".into(), "1".into()),
                ("3".into(), "1".into()),
                ("4".into(), "2".into()),
            ],
        )
        .unwrap()
    }

    fn names(tree: &ConceptTree) -> Vec<String> {
        tree.pre_order().map(|n| n.name.clone()).collect()
    }

    #[test]
    fn test_pre_order() {
        let tree = sample_tree();
        assert_eq!(tree.len(), 4);
        assert_eq!(names(&tree), vec!["logistics", "air", "air transport", "sea"]);
        assert!(tree.root().is_root());
        assert_eq!(tree.pre_order().filter(|n| n.is_root()).count(), 1);
    }

    #[test]
    fn test_from_links_duplicate_id() {
        let result = ConceptTree::from_links(
            NodeId::from("1"),
            vec![node("1", "a"), node("1", "b")],
            &[],
        );
        assert!(matches!(result, Err(TaxonomyError::Structural(_))));
    }

    #[test]
    fn test_from_links_cycle() {
        let result = ConceptTree::from_links(
            NodeId::from("1"),
            vec![node("1", "root"), node("2", "a"), node("3", "b")],
            &[("2".into(), "3".into()), ("3".into(), "2".into())],
        );
        assert!(matches!(result, Err(TaxonomyError::Structural(_))));
    }

    #[test]
    fn test_siblings_and_parent() {
        let tree = sample_tree();
        let siblings: Vec<&str> = tree
            .siblings_of(&"2".into())
            .iter()
            .map(|n| n.name.as_str())
            .collect();
        assert_eq!(siblings, vec!["sea"]);
        assert_eq!(tree.parent_of(&"4".into()).unwrap().name, "air");
        assert!(tree.parent_of(&"1".into()).is_none());
        assert!(tree.siblings_of(&"1".into()).is_empty());
    }

    #[test]
    fn test_insert_as_child_appends() {
        let mut tree = sample_tree();
        let c = concept::sample("sealift", "Cargo by sea.");
        let id = tree.insert_as_child(&"3".into(), &c).unwrap();
        assert_eq!(tree.len(), 5);
        let inserted = tree.get(&id).unwrap();
        assert_eq!(inserted.status, NodeStatus::Introduced);
        assert_eq!(inserted.parent(), Some(&NodeId::from("3")));
        assert_eq!(tree.get(&"3".into()).unwrap().children(), &[id]);
    }

    #[test]
    fn test_add_child_reassigns_taken_id() {
        let mut tree = sample_tree();
        let id = tree.add_child(&"1".into(), node("2", "duplicate")).unwrap();
        assert_ne!(id, NodeId::from("2"));
        assert_eq!(tree.len(), 5);
        assert_eq!(tree.get(&"2".into()).unwrap().name, "air");
    }

    #[test]
    fn test_insert_as_new_parent() {
        let mut tree = sample_tree();
        let c = concept::sample("aerial logistics", "Logistics by air.");
        let id = tree.insert_as_new_parent(&"2".into(), &c).unwrap();
        assert_eq!(tree.len(), 5);
        assert_eq!(tree.get(&id).unwrap().children(), &[NodeId::from("2")]);
        assert_eq!(tree.parent_of(&"2".into()).unwrap().id, id);
        assert_eq!(tree.parent_of(&id).unwrap().name, "logistics");
        // keeps the spliced node's position among siblings
        assert_eq!(
            names(&tree),
            vec!["logistics", "aerial logistics", "air", "air transport", "sea"]
        );
    }

    #[test]
    fn test_insert_as_new_parent_of_root() {
        let mut tree = sample_tree();
        let c = concept::sample("support", "Everything that sustains forces.");
        let id = tree.insert_as_new_parent(&"1".into(), &c).unwrap();
        assert_eq!(tree.root_id(), &id);
        assert_eq!(tree.pre_order().count(), 5);
    }

    #[test]
    fn test_detach_subtree() {
        let mut tree = sample_tree();
        let sub = tree.detach(&"2".into()).unwrap();
        assert_eq!(tree.len(), 2);
        assert_eq!(sub.len(), 2);
        assert!(sub.root().is_root());
        assert_eq!(names(&tree), vec!["logistics", "sea"]);
        assert!(tree.detach(&"1".into()).is_err());
    }

    #[test]
    fn test_render() {
        let tree = sample_tree();
        assert_eq!(
            tree.render(),
            "logistics\n├── air\n│   └── air transport\n└── sea"
        );
    }

    #[test]
    fn test_json_preserves_structure_and_attributes() {
        let mut tree = sample_tree();
        let c = concept::sample("sealift", "Cargo by sea.");
        tree.get_mut(&"3".into()).unwrap().merge(&c);
        tree.get_mut(&"4".into())
            .unwrap()
            .extra
            .insert("Comments".to_string(), "check".to_string());

        let json = tree.to_json().unwrap();
        let restored = ConceptTree::from_json(&json).unwrap();
        assert_eq!(restored, tree);
        assert_eq!(names(&restored), names(&tree));
    }

    #[test]
    fn test_deep_chain_survives_json() {
        let mut tree = sample_tree();
        let mut parent = NodeId::from("4");
        for depth in 0..300 {
            parent = tree
                .add_child(&parent, node(&format!("chain-{}", depth), &format!("level {}", depth)))
                .unwrap();
        }
        let restored = ConceptTree::from_json(&tree.to_json().unwrap()).unwrap();
        assert_eq!(restored.len(), 304);
        assert_eq!(restored, tree);
        assert_eq!(restored.parent_of(&parent).unwrap().name, "level 298");
    }

    #[test]
    fn test_json_is_flat() {
        let json = sample_tree().to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["root"], "1");
        let nodes = value["nodes"].as_array().unwrap();
        assert_eq!(nodes.len(), 4);
        assert!(nodes[0].get("parent_id").is_none());
        assert_eq!(nodes[2]["parent_id"], "2");
        assert!(nodes.iter().all(|n| n.get("children").is_none()));
    }

    #[test]
    fn test_to_rows() {
        let tree = sample_tree();
        let rows = tree.to_rows();
        assert_eq!(rows.len(), 4);
        let air = &rows[1];
        let get = |col: &str| air.iter().find(|(c, _)| *c == col).unwrap().1.clone();
        assert_eq!(get("Parent name/Broader"), "logistics");
        assert_eq!(get("Child name/Narrower"), "air transport");
    }
}
