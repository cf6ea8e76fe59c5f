use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use waypoint_core::error::{Result, WaypointError};
use waypoint_core::types::{ActionStatus, CallId, ChatMessage};

use crate::graph::{NodeKind, PathwayGraph};
use crate::resolver::MatchStrategy;

/// Data gathered during a call, keyed by name.
///
/// Seeded from the host's call variables, extended by the host while the
/// call runs, and by action results (`<node_id>.status`, `<node_id>.result`).
/// Action parameter templates and node instructions read from it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectedData {
    data: HashMap<String, serde_json::Value>,
}

impl CollectedData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(data: HashMap<String, serde_json::Value>) -> Self {
        Self { data }
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.data.insert(key.into(), value);
    }

    pub fn set_str(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.data
            .insert(key.into(), serde_json::Value::String(value.into()));
    }

    /// Merge another map into this one (overwrites on conflict).
    pub fn merge(&mut self, other: HashMap<String, serde_json::Value>) {
        self.data.extend(other);
    }

    /// Record an action node's outcome under `<node_id>.status` and `<node_id>.result`.
    pub fn record_action(&mut self, node_id: &str, status: ActionStatus, data: serde_json::Value) {
        let status = match status {
            ActionStatus::Success => "success",
            ActionStatus::Error => "error",
        };
        self.set_str(format!("{}.status", node_id), status);
        self.set(format!("{}.result", node_id), data);
    }

    pub fn data(&self) -> &HashMap<String, serde_json::Value> {
        &self.data
    }

    pub fn into_map(self) -> HashMap<String, serde_json::Value> {
        self.data
    }
}

/// Per-node runtime state for a conversation node.
#[derive(Debug, Clone, Default)]
pub struct ConversationExecutor {
    pub visits: u32,
    pub greeted: bool,
    pub turns: u32,
}

/// Per-node runtime state for a condition node.
#[derive(Debug, Clone, Default)]
pub struct ConditionExecutor {
    pub visits: u32,
    /// Intelligence turns run, including the one on entry.
    pub evaluations: u32,
}

/// Per-node runtime state for an action node.
#[derive(Debug, Clone, Default)]
pub struct ActionExecutor {
    pub visits: u32,
    pub attempts: u32,
    pub last_status: Option<ActionStatus>,
}

/// Per-node runtime state for a terminal node.
#[derive(Debug, Clone, Default)]
pub struct TerminalExecutor {
    pub visits: u32,
}

/// Runtime state for one node within one call, by node kind.
///
/// Created on first arrival and kept for the rest of the call so a revisit
/// sees what happened last time.
#[derive(Debug, Clone)]
pub enum NodeExecutor {
    Conversation(ConversationExecutor),
    Condition(ConditionExecutor),
    Action(ActionExecutor),
    Terminal(TerminalExecutor),
}

impl NodeExecutor {
    pub fn for_kind(kind: NodeKind) -> Self {
        match kind {
            NodeKind::Conversation => Self::Conversation(ConversationExecutor::default()),
            NodeKind::Condition => Self::Condition(ConditionExecutor::default()),
            NodeKind::Action => Self::Action(ActionExecutor::default()),
            NodeKind::Terminal => Self::Terminal(TerminalExecutor::default()),
        }
    }

    pub fn visits(&self) -> u32 {
        match self {
            Self::Conversation(e) => e.visits,
            Self::Condition(e) => e.visits,
            Self::Action(e) => e.visits,
            Self::Terminal(e) => e.visits,
        }
    }

    fn record_visit(&mut self) {
        match self {
            Self::Conversation(e) => e.visits += 1,
            Self::Condition(e) => e.visits += 1,
            Self::Action(e) => e.visits += 1,
            Self::Terminal(e) => e.visits += 1,
        }
    }
}

/// A resolved transition waiting for the current utterance to finish.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingTransition {
    pub from: String,
    pub to: String,
    pub strategy: MatchStrategy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Active,
    Ended,
}

/// Everything the engine knows about one live call.
///
/// Owned by exactly one `CallSession`; never shared between calls.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub call_id: CallId,
    current_node_id: String,
    executors: HashMap<String, NodeExecutor>,
    pub collected: CollectedData,
    pub pending: Option<PendingTransition>,
    pub phase: SessionPhase,
    /// Node ids in arrival order, including revisits.
    pub history: Vec<String>,
    /// Conversation so far, as sent to the intelligence.
    pub transcript: Vec<ChatMessage>,
    pub ended_reason: Option<String>,
}

impl SessionState {
    /// A fresh session positioned at the graph's entry node.
    pub fn new(call_id: CallId, graph: &PathwayGraph) -> Self {
        Self {
            call_id,
            current_node_id: graph.entry_node().to_string(),
            executors: HashMap::new(),
            collected: CollectedData::new(),
            pending: None,
            phase: SessionPhase::Active,
            history: Vec::new(),
            transcript: Vec::new(),
            ended_reason: None,
        }
    }

    pub fn current_node_id(&self) -> &str {
        &self.current_node_id
    }

    pub fn is_ended(&self) -> bool {
        self.phase == SessionPhase::Ended
    }

    /// Move to `node_id`, creating or reusing its executor and recording the visit.
    pub fn enter(&mut self, graph: &PathwayGraph, node_id: &str) -> Result<&mut NodeExecutor> {
        let node = graph
            .node(node_id)
            .ok_or_else(|| WaypointError::NodeNotFound(node_id.to_string()))?;
        self.current_node_id = node.id.clone();
        self.history.push(node.id.clone());
        let executor = self
            .executors
            .entry(node.id.clone())
            .or_insert_with(|| NodeExecutor::for_kind(node.kind));
        executor.record_visit();
        Ok(executor)
    }

    pub fn executor(&self, node_id: &str) -> Option<&NodeExecutor> {
        self.executors.get(node_id)
    }

    pub fn executor_mut(&mut self, node_id: &str) -> Option<&mut NodeExecutor> {
        self.executors.get_mut(node_id)
    }

    pub fn end(&mut self, reason: impl Into<String>) {
        self.phase = SessionPhase::Ended;
        self.pending = None;
        self.ended_reason.get_or_insert_with(|| reason.into());
    }

    /// Append to the transcript, dropping the oldest messages beyond `max`.
    pub fn push_transcript(&mut self, message: ChatMessage, max: usize) {
        self.transcript.push(message);
        if self.transcript.len() > max {
            let excess = self.transcript.len() - max;
            self.transcript.drain(..excess);
        }
    }
}
