//! DAG Construction
//!
//! A small generic wrapper around `daggy` used for both the SQL model graph
//! and the pipeline task graph. Cycles are rejected when an edge is added, so
//! a constructed graph is always executable.

use daggy::{petgraph::Direction, Dag, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Error types for DAG operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DagError {
    /// Cycle detected when adding edge
    CycleDetected(String),
    /// Node not found
    NodeNotFound(String),
}

impl std::fmt::Display for DagError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DagError::CycleDetected(msg) => write!(f, "Cycle detected: {}", msg),
            DagError::NodeNotFound(msg) => write!(f, "Node not found: {}", msg),
        }
    }
}

impl std::error::Error for DagError {}

/// Node identifier, assigned in insertion order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub usize);

/// Acyclic graph of tasks; an edge `a -> b` means `b` depends on `a`.
#[derive(Debug)]
pub struct TaskGraph<T> {
    /// The underlying daggy DAG
    dag: Dag<T, ()>,
    /// Map from NodeId to daggy NodeIndex
    node_id_to_index: HashMap<NodeId, NodeIndex>,
    /// Map from daggy NodeIndex to NodeId
    index_to_node_id: HashMap<NodeIndex, NodeId>,
    /// Next available node ID
    next_node_id: usize,
}

impl<T> TaskGraph<T> {
    /// Creates a new empty graph
    pub fn new() -> Self {
        TaskGraph {
            dag: Dag::new(),
            node_id_to_index: HashMap::new(),
            index_to_node_id: HashMap::new(),
            next_node_id: 0,
        }
    }

    /// Adds a node and returns its id
    pub fn add_node(&mut self, task: T) -> NodeId {
        let node_id = NodeId(self.next_node_id);
        self.next_node_id += 1;

        let index = self.dag.add_node(task);
        self.node_id_to_index.insert(node_id, index);
        self.index_to_node_id.insert(index, node_id);

        node_id
    }

    /// Adds a dependency: `to` runs after `from`.
    ///
    /// # Errors
    /// Returns `DagError::CycleDetected` if the edge would close a cycle, or
    /// `DagError::NodeNotFound` for unknown ids.
    pub fn add_edge(&mut self, from: NodeId, to: NodeId) -> Result<(), DagError> {
        let from_index = self.index_of(from)?;
        let to_index = self.index_of(to)?;

        match self.dag.add_edge(from_index, to_index, ()) {
            Ok(_) => Ok(()),
            Err(_would_cycle) => Err(DagError::CycleDetected(format!(
                "Adding edge from {:?} to {:?} would create a cycle",
                from, to
            ))),
        }
    }

    fn index_of(&self, node_id: NodeId) -> Result<NodeIndex, DagError> {
        self.node_id_to_index
            .get(&node_id)
            .copied()
            .ok_or_else(|| DagError::NodeNotFound(format!("Node {:?} not found", node_id)))
    }

    /// Gets a node by its ID
    pub fn get_node(&self, node_id: NodeId) -> Option<&T> {
        self.node_id_to_index
            .get(&node_id)
            .and_then(|&index| self.dag.node_weight(index))
    }

    /// All node ids in insertion order
    pub fn node_ids(&self) -> Vec<NodeId> {
        (0..self.next_node_id).map(NodeId).collect()
    }

    /// Direct dependencies of a node, sorted
    pub fn parents(&self, node_id: NodeId) -> Vec<NodeId> {
        self.neighbors(node_id, Direction::Incoming)
    }

    /// Direct dependents of a node, sorted
    pub fn children(&self, node_id: NodeId) -> Vec<NodeId> {
        self.neighbors(node_id, Direction::Outgoing)
    }

    fn neighbors(&self, node_id: NodeId, direction: Direction) -> Vec<NodeId> {
        let Some(&index) = self.node_id_to_index.get(&node_id) else {
            return Vec::new();
        };
        let mut ids: Vec<NodeId> = self
            .dag
            .graph()
            .neighbors_directed(index, direction)
            .filter_map(|neighbor| self.index_to_node_id.get(&neighbor).copied())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Every node reachable from `node_id`, excluding itself
    pub fn descendants(&self, node_id: NodeId) -> BTreeSet<NodeId> {
        let mut seen = BTreeSet::new();
        let mut stack = self.children(node_id);
        while let Some(next) = stack.pop() {
            if seen.insert(next) {
                stack.extend(self.children(next));
            }
        }
        seen
    }

    /// Topological order; among ready nodes the earliest inserted goes first,
    /// so the order is stable across runs.
    pub fn execution_order(&self) -> Vec<NodeId> {
        let mut in_degree: HashMap<NodeId, usize> = self
            .node_ids()
            .into_iter()
            .map(|id| (id, self.parents(id).len()))
            .collect();

        let mut ready: BTreeSet<NodeId> = in_degree
            .iter()
            .filter(|(_, &degree)| degree == 0)
            .map(|(&id, _)| id)
            .collect();

        let mut order = Vec::with_capacity(in_degree.len());
        while let Some(node_id) = ready.pop_first() {
            order.push(node_id);
            for child in self.children(node_id) {
                if let Some(degree) = in_degree.get_mut(&child) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(child);
                    }
                }
            }
        }

        order
    }

    /// Returns the number of nodes in the graph
    pub fn node_count(&self) -> usize {
        self.dag.node_count()
    }

    /// Returns the number of edges in the graph
    pub fn edge_count(&self) -> usize {
        self.dag.edge_count()
    }
}

impl<T> Default for TaskGraph<T> {
    fn default() -> Self {
        Self::new()
    }
}
