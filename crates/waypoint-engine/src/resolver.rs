use serde::Serialize;
use tracing::debug;

use waypoint_core::config::ResolverConfig;
use waypoint_core::error::{Result, WaypointError};

use crate::graph::PathwayGraph;

/// Which step of the matching chain produced a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    Exact,
    Similarity,
    Substring,
}

impl MatchStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Similarity => "similarity",
            Self::Substring => "substring",
        }
    }
}

impl std::fmt::Display for MatchStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved transition target.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolution {
    pub node_id: String,
    pub strategy: MatchStrategy,
    /// Similarity between the requested name and the chosen node's name.
    pub score: f64,
}

/// Similarity ratio of two strings: twice the longest common character
/// subsequence over the combined length. 1.0 for identical strings.
pub fn similarity(a: &str, b: &str) -> f64 {
    similar::TextDiff::from_chars(a, b).ratio() as f64
}

/// Maps a free-text node name from the intelligence to a node id.
///
/// The chain is ordered and the first step that matches wins: exact name
/// (case-insensitive), best similarity ratio at or above the threshold, then
/// substring containment in either direction. Ties go to the earlier node.
#[derive(Debug, Clone)]
pub struct TransitionResolver {
    threshold: f64,
}

impl Default for TransitionResolver {
    fn default() -> Self {
        Self::new(&ResolverConfig::default())
    }
}

impl TransitionResolver {
    pub fn new(config: &ResolverConfig) -> Self {
        Self {
            threshold: config.similarity_threshold,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Resolve `target` requested while at node `from`.
    pub fn resolve(&self, graph: &PathwayGraph, target: &str, from: &str) -> Result<Resolution> {
        let wanted = target.trim().to_lowercase();
        let unresolved = || WaypointError::UnresolvedTarget {
            target: target.to_string(),
            from: from.to_string(),
        };
        if wanted.is_empty() {
            return Err(unresolved());
        }

        let names: Vec<(&str, String)> = graph
            .nodes()
            .iter()
            .map(|n| (n.id.as_str(), n.name.trim().to_lowercase()))
            .filter(|(_, name)| !name.is_empty())
            .collect();

        if let Some((id, _)) = names.iter().find(|(_, name)| *name == wanted) {
            return Ok(self.resolved(id, MatchStrategy::Exact, 1.0, target));
        }

        let mut best: Option<(&str, f64)> = None;
        for (id, name) in &names {
            let score = similarity(&wanted, name);
            if best.map_or(true, |(_, top)| score > top) {
                best = Some((*id, score));
            }
        }
        if let Some((id, score)) = best {
            if score >= self.threshold {
                return Ok(self.resolved(id, MatchStrategy::Similarity, score, target));
            }
        }

        if let Some((id, name)) = names
            .iter()
            .find(|(_, name)| name.contains(wanted.as_str()) || wanted.contains(name.as_str()))
        {
            let score = similarity(&wanted, name);
            return Ok(self.resolved(id, MatchStrategy::Substring, score, target));
        }

        debug!(target = %target, from = %from, "No node matched transition target");
        Err(unresolved())
    }

    fn resolved(&self, id: &str, strategy: MatchStrategy, score: f64, target: &str) -> Resolution {
        debug!(target = %target, node_id = %id, strategy = %strategy, score, "Resolved transition target");
        Resolution {
            node_id: id.to_string(),
            strategy,
            score,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use waypoint_test_utils::fixtures;

    fn booking() -> PathwayGraph {
        PathwayGraph::from_config(serde_json::from_value(fixtures::booking_pathway()).unwrap())
            .unwrap()
    }

    #[test]
    fn test_exact_match_any_case() {
        let g = booking();
        let r = TransitionResolver::default();
        for target in ["Billing Questions", "billing questions", "  BILLING QUESTIONS "] {
            let res = r.resolve(&g, target, "welcome").unwrap();
            assert_eq!(res.node_id, "billing");
            assert_eq!(res.strategy, MatchStrategy::Exact);
        }
    }

    #[test]
    fn test_abbreviation_resolves_by_similarity() {
        let res = TransitionResolver::default()
            .resolve(&booking(), "sched appt", "welcome")
            .unwrap();
        assert_eq!(res.node_id, "schedule");
        assert_eq!(res.strategy, MatchStrategy::Similarity);
        assert!(res.score >= 0.6 && res.score < 0.7, "score {}", res.score);
    }

    #[test]
    fn test_substring_after_low_similarity() {
        let res = TransitionResolver::default()
            .resolve(&booking(), "billing", "welcome")
            .unwrap();
        assert_eq!(res.node_id, "billing");
        assert_eq!(res.strategy, MatchStrategy::Substring);
    }

    #[test]
    fn test_unrelated_target_fails() {
        let err = TransitionResolver::default()
            .resolve(&booking(), "xylophone", "welcome")
            .unwrap_err();
        match err {
            WaypointError::UnresolvedTarget { target, from } => {
                assert_eq!(target, "xylophone");
                assert_eq!(from, "welcome");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_empty_target_never_matches() {
        let r = TransitionResolver::default();
        assert!(r.resolve(&booking(), "", "welcome").is_err());
        assert!(r.resolve(&booking(), "   ", "welcome").is_err());
    }

    #[test]
    fn test_similarity_tie_goes_to_first_node() {
        let g = PathwayGraph::from_config(
            serde_json::from_value(json!({
                "nodes": [
                    {"id": "one", "name": "Sales A", "type": "conversation"},
                    {"id": "two", "name": "Sales B", "type": "conversation"}
                ]
            }))
            .unwrap(),
        )
        .unwrap();
        let res = TransitionResolver::default().resolve(&g, "sales c", "one").unwrap();
        assert_eq!(res.strategy, MatchStrategy::Similarity);
        assert_eq!(res.node_id, "one");
    }

    #[test]
    fn test_threshold_is_configurable() {
        let strict = TransitionResolver::new(&ResolverConfig {
            similarity_threshold: 0.9,
        });
        assert!(strict.resolve(&booking(), "sched appt", "welcome").is_err());
    }

    #[test]
    fn test_similarity_ratio() {
        assert_eq!(similarity("abc", "abc"), 1.0);
        assert_eq!(similarity("abc", "xyz"), 0.0);
        let s = similarity("sched appt", "schedule appointment");
        assert!((s - 2.0 / 3.0).abs() < 1e-3, "ratio {}", s);
    }
}
