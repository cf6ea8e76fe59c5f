use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use waypoint_core::error::{Result, WaypointError};

use super::edge::Edge;
use super::node::{Node, NodeKind};

/// Pathway configuration as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathwayConfig {
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    /// Explicit entry node id; overrides `isStart`.
    #[serde(default)]
    pub entry_point: Option<String>,
}

/// A structural problem that does not prevent the pathway from running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathwayWarning {
    /// Action nodes should have exactly one outgoing edge.
    ActionEdgeCount { node_id: String, count: usize },
    /// An action node's only edge points back at itself.
    ActionSelfLoop { node_id: String },
    /// An action node has a self-edge next to real exits; the self-edge is never taken.
    ActionSelfEdge { node_id: String },
    /// Several nodes share a name, so name resolution picks the first.
    DuplicateName { name: String, node_ids: Vec<String> },
    /// No path from the entry node reaches this node.
    Unreachable { node_id: String },
}

impl std::fmt::Display for PathwayWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ActionEdgeCount { node_id, count } => write!(
                f,
                "action node '{}' has {} outgoing edges (expected 1)",
                node_id, count
            ),
            Self::ActionSelfLoop { node_id } => {
                write!(f, "action node '{}' only loops back to itself", node_id)
            }
            Self::ActionSelfEdge { node_id } => write!(
                f,
                "action node '{}' has an edge back to itself that is never followed",
                node_id
            ),
            Self::DuplicateName { name, node_ids } => write!(
                f,
                "name '{}' is shared by nodes {}",
                name,
                node_ids.join(", ")
            ),
            Self::Unreachable { node_id } => {
                write!(f, "node '{}' is unreachable from the entry node", node_id)
            }
        }
    }
}

/// Immutable, validated pathway.
///
/// Node order from the configuration is preserved; resolution tie-breaks
/// depend on it.
#[derive(Debug, Clone)]
pub struct PathwayGraph {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    index: HashMap<String, usize>,
    outgoing: HashMap<String, Vec<usize>>,
    entry: String,
}

impl PathwayGraph {
    /// Validate a configuration and build the graph indices.
    pub fn from_config(config: PathwayConfig) -> Result<Self> {
        let PathwayConfig {
            nodes,
            edges,
            entry_point,
        } = config;

        if nodes.is_empty() {
            return Err(WaypointError::Pathway("pathway has no nodes".into()));
        }

        let mut index = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            if index.insert(node.id.clone(), i).is_some() {
                return Err(WaypointError::Pathway(format!(
                    "duplicate node id '{}'",
                    node.id
                )));
            }
            if node.kind == NodeKind::Action && node.action.is_none() {
                return Err(WaypointError::Pathway(format!(
                    "action node '{}' has no action descriptor",
                    node.id
                )));
            }
        }

        let mut outgoing: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, edge) in edges.iter().enumerate() {
            for end in [&edge.source, &edge.target] {
                if !index.contains_key(end) {
                    return Err(WaypointError::Pathway(format!(
                        "edge {} -> {} references unknown node '{}'",
                        edge.source, edge.target, end
                    )));
                }
            }
            outgoing.entry(edge.source.clone()).or_default().push(i);
        }

        let entry = match entry_point {
            Some(id) if index.contains_key(&id) => id,
            Some(id) => {
                return Err(WaypointError::Pathway(format!(
                    "entry point '{}' is not a node",
                    id
                )))
            }
            None => nodes
                .iter()
                .find(|n| n.is_start)
                .or_else(|| nodes.iter().find(|n| n.kind == NodeKind::Conversation))
                .unwrap_or(&nodes[0])
                .id
                .clone(),
        };

        let graph = Self {
            nodes,
            edges,
            index,
            outgoing,
            entry,
        };

        for warning in graph.lint() {
            warn!(warning = %warning, "Pathway lint");
        }
        debug!(
            nodes = graph.nodes.len(),
            edges = graph.edges.len(),
            entry = %graph.entry,
            "Pathway loaded"
        );
        Ok(graph)
    }

    /// Parse and validate pathway JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: PathwayConfig = serde_json::from_str(json)?;
        Self::from_config(config)
    }

    /// Load a pathway from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Nodes in configuration order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Outgoing edges of a node, in configuration order.
    pub fn outgoing(&self, id: &str) -> Vec<&Edge> {
        self.outgoing
            .get(id)
            .map(|idx| idx.iter().map(|&i| &self.edges[i]).collect())
            .unwrap_or_default()
    }

    pub fn entry_node(&self) -> &str {
        &self.entry
    }

    /// Structural warnings. Never fatal.
    pub fn lint(&self) -> Vec<PathwayWarning> {
        let mut warnings = Vec::new();

        for node in self.nodes.iter().filter(|n| n.kind == NodeKind::Action) {
            let out = self.outgoing(&node.id);
            if out.len() != 1 {
                warnings.push(PathwayWarning::ActionEdgeCount {
                    node_id: node.id.clone(),
                    count: out.len(),
                });
            }
            let loops = out.iter().filter(|e| e.is_self_loop()).count();
            if loops > 0 && loops == out.len() {
                warnings.push(PathwayWarning::ActionSelfLoop {
                    node_id: node.id.clone(),
                });
            } else if loops > 0 {
                warnings.push(PathwayWarning::ActionSelfEdge {
                    node_id: node.id.clone(),
                });
            }
        }

        let mut by_name: Vec<(String, Vec<String>)> = Vec::new();
        for node in &self.nodes {
            let key = node.name.trim().to_lowercase();
            match by_name.iter_mut().find(|(name, _)| *name == key) {
                Some((_, ids)) => ids.push(node.id.clone()),
                None => by_name.push((key, vec![node.id.clone()])),
            }
        }
        for (name, node_ids) in by_name {
            if node_ids.len() > 1 {
                warnings.push(PathwayWarning::DuplicateName { name, node_ids });
            }
        }

        let reachable = self.reachable_from(&self.entry);
        for node in &self.nodes {
            if !reachable.contains(node.id.as_str()) {
                warnings.push(PathwayWarning::Unreachable {
                    node_id: node.id.clone(),
                });
            }
        }

        warnings
    }

    fn reachable_from<'a>(&'a self, start: &'a str) -> HashSet<&'a str> {
        let mut seen = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);
        while let Some(id) = queue.pop_front() {
            for edge in self.outgoing(id) {
                if seen.insert(edge.target.as_str()) {
                    queue.push_back(edge.target.as_str());
                }
            }
        }
        seen
    }
}
