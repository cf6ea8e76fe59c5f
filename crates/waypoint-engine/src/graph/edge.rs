use serde::{Deserialize, Serialize};

/// A directed connection between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    /// Source node id.
    pub source: String,
    /// Target node id.
    pub target: String,
    /// Human-readable label describing when to take this edge.
    #[serde(default)]
    pub condition: String,
}

impl Edge {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        condition: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            condition: condition.into(),
        }
    }

    pub fn is_self_loop(&self) -> bool {
        self.source == self.target
    }
}
