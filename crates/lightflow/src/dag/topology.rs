//! Graph structure backing one DAG
//!
//! The topology is immutable once built: validation happens at
//! construction, before any job is enqueued. The scheduler layers its
//! mutable per-run state (node states, pending-parent counters) on top.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

/// Error type for DAG construction and validation
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum DagError {
    /// Node name declared more than once
    #[error("duplicate node name: {0}")]
    DuplicateNode(String),

    /// An edge references a node that was not declared
    #[error("edge {parent} -> {child} references undeclared node {missing}")]
    UnknownNode {
        parent: String,
        child: String,
        missing: String,
    },

    /// An edge connects a node to itself
    #[error("self-edge on node {0}")]
    SelfEdge(String),

    /// The graph contains a cycle; the path names one
    #[error("cycle detected: {}", .0.join(" -> "))]
    CycleDetected(Vec<String>),
}

/// A directed edge annotated with an optional slot label
///
/// A labeled edge carries only the named output slice of the parent; an
/// unlabeled edge carries the parent's whole envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Edge {
    pub parent: String,
    pub child: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot: Option<String>,
}

impl Edge {
    pub fn new(parent: impl Into<String>, child: impl Into<String>) -> Self {
        Self {
            parent: parent.into(),
            child: child.into(),
            slot: None,
        }
    }

    pub fn with_slot(mut self, slot: impl Into<String>) -> Self {
        self.slot = Some(slot.into());
        self
    }
}

/// Scheduling state of one node during a DAG run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Waiting on parents
    Pending,
    /// All parents resolved, not yet dispatched
    Ready,
    /// Task job enqueued, awaiting its completion signal
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl NodeState {
    /// Terminal states require no further scheduling
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Ready => write!(f, "ready"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Validated graph of one DAG
#[derive(Debug, Clone)]
pub struct DagTopology {
    nodes: Vec<String>,
    edges: Vec<Edge>,
    /// Outgoing edge indices per node, in declaration order
    children: HashMap<String, Vec<usize>>,
    /// Incoming edge indices per node, in declaration order
    parents: HashMap<String, Vec<usize>>,
}

impl DagTopology {
    /// Build and validate a topology from declared nodes and edges
    ///
    /// Rejects duplicate node names, edges with undeclared endpoints,
    /// self-edges, and cycles (naming one offending cycle).
    pub fn build(nodes: Vec<String>, edges: Vec<Edge>) -> Result<Self, DagError> {
        let mut seen = HashSet::new();
        for node in &nodes {
            if !seen.insert(node.clone()) {
                return Err(DagError::DuplicateNode(node.clone()));
            }
        }

        let mut children: HashMap<String, Vec<usize>> =
            nodes.iter().map(|n| (n.clone(), Vec::new())).collect();
        let mut parents: HashMap<String, Vec<usize>> =
            nodes.iter().map(|n| (n.clone(), Vec::new())).collect();

        for (idx, edge) in edges.iter().enumerate() {
            for endpoint in [&edge.parent, &edge.child] {
                if !seen.contains(endpoint) {
                    return Err(DagError::UnknownNode {
                        parent: edge.parent.clone(),
                        child: edge.child.clone(),
                        missing: endpoint.clone(),
                    });
                }
            }
            if edge.parent == edge.child {
                return Err(DagError::SelfEdge(edge.parent.clone()));
            }
            children
                .get_mut(&edge.parent)
                .expect("validated endpoint")
                .push(idx);
            parents
                .get_mut(&edge.child)
                .expect("validated endpoint")
                .push(idx);
        }

        let topology = Self {
            nodes,
            edges,
            children,
            parents,
        };
        topology.check_acyclic()?;
        Ok(topology)
    }

    /// Node names in declaration order
    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    /// All edges in declaration order
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Whether the node is declared
    pub fn contains(&self, node: &str) -> bool {
        self.children.contains_key(node)
    }

    /// Number of incoming edges
    pub fn in_degree(&self, node: &str) -> usize {
        self.parents.get(node).map_or(0, Vec::len)
    }

    /// Outgoing edges of a node, in declaration order
    pub fn children(&self, node: &str) -> impl Iterator<Item = &Edge> {
        self.children
            .get(node)
            .into_iter()
            .flatten()
            .map(|&i| &self.edges[i])
    }

    /// Incoming edges of a node, in declaration order
    pub fn parents(&self, node: &str) -> impl Iterator<Item = &Edge> {
        self.parents
            .get(node)
            .into_iter()
            .flatten()
            .map(|&i| &self.edges[i])
    }

    /// Nodes with no incoming edges
    pub fn roots(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| self.in_degree(n) == 0)
            .map(String::as_str)
            .collect()
    }

    /// Nodes with no outgoing edges
    pub fn leaves(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| self.children.get(n.as_str()).is_none_or(Vec::is_empty))
            .map(String::as_str)
            .collect()
    }

    /// Compute the full skip set for a skip decision
    ///
    /// `seeds` are the nodes a task's routing marked as skipped;
    /// `already_skipped` are nodes skipped earlier in the run. A descendant
    /// joins the skip set when it no longer has any live (non-skipped)
    /// parent; a descendant with at least one live parent still runs.
    pub fn propagate_skips(
        &self,
        seeds: &[String],
        already_skipped: &HashSet<String>,
    ) -> HashSet<String> {
        let mut skipped: HashSet<String> = seeds
            .iter()
            .filter(|s| self.contains(s))
            .cloned()
            .collect();

        let mut queue: VecDeque<String> = skipped
            .iter()
            .flat_map(|n| self.children(n).map(|e| e.child.clone()))
            .collect();

        while let Some(node) = queue.pop_front() {
            if skipped.contains(&node) {
                continue;
            }
            let dead = self
                .parents(&node)
                .all(|e| skipped.contains(&e.parent) || already_skipped.contains(&e.parent));
            if dead {
                skipped.insert(node.clone());
                for edge in self.children(&node) {
                    queue.push_back(edge.child.clone());
                }
            }
        }

        skipped
    }

    /// Kahn-style traversal; any leftover node sits on a cycle
    fn check_acyclic(&self) -> Result<(), DagError> {
        let mut in_deg: HashMap<&str, usize> = self
            .nodes
            .iter()
            .map(|n| (n.as_str(), self.in_degree(n)))
            .collect();

        let mut queue: VecDeque<&str> = in_deg
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(&n, _)| n)
            .collect();

        let mut visited = 0usize;
        while let Some(node) = queue.pop_front() {
            visited += 1;
            for edge in self.children(node) {
                let deg = in_deg
                    .get_mut(edge.child.as_str())
                    .expect("validated endpoint");
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(edge.child.as_str());
                }
            }
        }

        if visited == self.nodes.len() {
            return Ok(());
        }

        // Every residual node kept a residual parent, so walking parents
        // must revisit a node; that revisit closes one concrete cycle.
        let residual: HashSet<&str> = in_deg
            .iter()
            .filter(|(_, &d)| d > 0)
            .map(|(&n, _)| n)
            .collect();
        let start = self
            .nodes
            .iter()
            .map(String::as_str)
            .find(|n| residual.contains(n))
            .expect("nonempty residual");

        let mut path = vec![start];
        let mut on_path: HashMap<&str, usize> = HashMap::from([(start, 0)]);
        let mut current = start;
        loop {
            let prev = self
                .parents(current)
                .map(|e| e.parent.as_str())
                .find(|p| residual.contains(p))
                .expect("residual node has residual parent");
            if let Some(&at) = on_path.get(prev) {
                // Parent-walk collected the cycle reversed
                let mut cycle: Vec<String> =
                    path[at..].iter().rev().map(|n| n.to_string()).collect();
                cycle.push(prev.to_string());
                cycle.rotate_right(1);
                return Err(DagError::CycleDetected(cycle));
            }
            on_path.insert(prev, path.len());
            path.push(prev);
            current = prev;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn diamond() -> DagTopology {
        DagTopology::build(
            names(&["a", "b", "c", "d"]),
            vec![
                Edge::new("a", "b"),
                Edge::new("a", "c"),
                Edge::new("b", "d"),
                Edge::new("c", "d"),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_derived_views() {
        let dag = diamond();
        assert_eq!(dag.roots(), vec!["a"]);
        assert_eq!(dag.leaves(), vec!["d"]);
        assert_eq!(dag.in_degree("d"), 2);
        assert_eq!(dag.in_degree("a"), 0);

        let children: Vec<_> = dag.children("a").map(|e| e.child.as_str()).collect();
        assert_eq!(children, vec!["b", "c"]);
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let err = DagTopology::build(names(&["a", "a"]), vec![]).unwrap_err();
        assert_eq!(err, DagError::DuplicateNode("a".to_string()));
    }

    #[test]
    fn test_unknown_endpoint_rejected() {
        let err = DagTopology::build(names(&["a"]), vec![Edge::new("a", "ghost")]).unwrap_err();
        assert!(matches!(err, DagError::UnknownNode { missing, .. } if missing == "ghost"));
    }

    #[test]
    fn test_self_edge_rejected() {
        let err = DagTopology::build(names(&["a"]), vec![Edge::new("a", "a")]).unwrap_err();
        assert_eq!(err, DagError::SelfEdge("a".to_string()));
    }

    #[test]
    fn test_cycle_rejected_with_path() {
        let err = DagTopology::build(
            names(&["a", "b", "c"]),
            vec![
                Edge::new("a", "b"),
                Edge::new("b", "c"),
                Edge::new("c", "a"),
            ],
        )
        .unwrap_err();

        match err {
            DagError::CycleDetected(path) => {
                // Path closes on itself
                assert_eq!(path.first(), path.last());
                assert!(path.len() >= 3);
            }
            other => panic!("expected CycleDetected, got {other:?}"),
        }
    }

    #[test]
    fn test_two_node_cycle() {
        let err = DagTopology::build(
            names(&["a", "b"]),
            vec![Edge::new("a", "b"), Edge::new("b", "a")],
        )
        .unwrap_err();
        assert!(matches!(err, DagError::CycleDetected(_)));
    }

    #[test]
    fn test_skip_propagation_linear() {
        // a -> b -> c, a -> d: skipping b takes c with it, d survives
        let dag = DagTopology::build(
            names(&["a", "b", "c", "d"]),
            vec![
                Edge::new("a", "b"),
                Edge::new("b", "c"),
                Edge::new("a", "d"),
            ],
        )
        .unwrap();

        let skipped = dag.propagate_skips(&["b".to_string()], &HashSet::new());
        assert!(skipped.contains("b"));
        assert!(skipped.contains("c"));
        assert!(!skipped.contains("d"));
    }

    #[test]
    fn test_skip_stops_at_live_parent() {
        // d has parents b and c; skipping only b leaves d runnable
        let dag = diamond();
        let skipped = dag.propagate_skips(&["b".to_string()], &HashSet::new());
        assert!(skipped.contains("b"));
        assert!(!skipped.contains("d"));
    }

    #[test]
    fn test_skip_joins_with_prior_skips() {
        // If c was already skipped, skipping b leaves d with no live parent
        let dag = diamond();
        let prior: HashSet<String> = ["c".to_string()].into();
        let skipped = dag.propagate_skips(&["b".to_string()], &prior);
        assert!(skipped.contains("d"));
    }
}
