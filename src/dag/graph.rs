// src/dag/graph.rs

use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;

/// Name of the synthetic root node every immediate step hangs off.
pub const ROOT_NODE_NAME: &str = "_root";

#[derive(Debug, Error)]
pub enum DagError {
    #[error("node '{0}' does not exist")]
    UnknownNode(String),

    #[error("node '{0}' already exists")]
    DuplicateNode(String),

    #[error("edge '{from}' -> '{to}' does not exist")]
    MissingEdge { from: String, to: String },
}

/// Internal node structure: forward children and reverse parents.
///
/// A node's degree is the number of not-yet-satisfied parents; the
/// executor decrements it by removing the reverse edge when a parent
/// completes. Forward adjacency is kept so the scheduler can enumerate
/// children on completion.
#[derive(Debug, Default)]
struct DagNode {
    children: Vec<String>,
    parents: Vec<String>,
}

/// Directed acyclic graph keyed by step ID, with a synthetic root.
///
/// Acyclicity is enforced at load time in `config::validate`; the graph
/// itself only maintains adjacency. Adjacency is guarded by a mutex so
/// concurrent workers can remove edges while siblings read degrees.
#[derive(Debug)]
pub struct Dag {
    nodes: Mutex<HashMap<String, DagNode>>,
}

impl Dag {
    /// Create a DAG containing only the root node.
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(ROOT_NODE_NAME.to_string(), DagNode::default());
        Self {
            nodes: Mutex::new(nodes),
        }
    }

    /// Add a node with no edges.
    pub fn add_node(&self, name: &str) -> Result<(), DagError> {
        let mut nodes = self.nodes.lock().unwrap();
        if nodes.contains_key(name) {
            return Err(DagError::DuplicateNode(name.to_string()));
        }
        nodes.insert(name.to_string(), DagNode::default());
        Ok(())
    }

    /// Add an edge `from -> to`, meaning `from` must finish before `to`
    /// may start. Idempotent: adding the same edge twice is a no-op.
    pub fn add_edge(&self, from: &str, to: &str) -> Result<(), DagError> {
        let mut nodes = self.nodes.lock().unwrap();
        if !nodes.contains_key(from) {
            return Err(DagError::UnknownNode(from.to_string()));
        }
        if !nodes.contains_key(to) {
            return Err(DagError::UnknownNode(to.to_string()));
        }

        let from_node = nodes.get_mut(from).unwrap();
        if !from_node.children.iter().any(|c| c == to) {
            from_node.children.push(to.to_string());
        }
        let to_node = nodes.get_mut(to).unwrap();
        if !to_node.parents.iter().any(|p| p == from) {
            to_node.parents.push(from.to_string());
        }
        Ok(())
    }

    /// Remove exactly the reverse-adjacency entry `to <- from`, decrementing
    /// `to`'s degree. Removing the same edge twice is a caller bug and
    /// surfaces as [`DagError::MissingEdge`].
    pub fn remove_edge(&self, from: &str, to: &str) -> Result<(), DagError> {
        let mut nodes = self.nodes.lock().unwrap();
        let to_node = nodes
            .get_mut(to)
            .ok_or_else(|| DagError::UnknownNode(to.to_string()))?;
        let idx = to_node
            .parents
            .iter()
            .position(|p| p == from)
            .ok_or_else(|| DagError::MissingEdge {
                from: from.to_string(),
                to: to.to_string(),
            })?;
        to_node.parents.remove(idx);
        Ok(())
    }

    /// Snapshot of the node's current forward adjacency.
    pub fn children(&self, name: &str) -> Vec<String> {
        let nodes = self.nodes.lock().unwrap();
        nodes
            .get(name)
            .map(|n| n.children.clone())
            .unwrap_or_default()
    }

    /// Number of unmet incoming dependencies for a node.
    pub fn degree(&self, name: &str) -> Result<usize, DagError> {
        let nodes = self.nodes.lock().unwrap();
        nodes
            .get(name)
            .map(|n| n.parents.len())
            .ok_or_else(|| DagError::UnknownNode(name.to_string()))
    }

    /// All node names except the root.
    pub fn node_names(&self) -> Vec<String> {
        let nodes = self.nodes.lock().unwrap();
        nodes
            .keys()
            .filter(|k| k.as_str() != ROOT_NODE_NAME)
            .cloned()
            .collect()
    }
}

impl Default for Dag {
    fn default() -> Self {
        Self::new()
    }
}
