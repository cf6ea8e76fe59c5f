use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use waypoint_core::types::ActionRequest;

/// What a node does when the session arrives at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// Free conversation guided by the node prompt.
    Conversation,
    /// Runs one intelligence turn on entry to pick an outgoing edge.
    Condition,
    /// Invokes an external integration, then follows its single edge.
    Action,
    /// Says goodbye and ends the call.
    Terminal,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conversation => "conversation",
            Self::Condition => "condition",
            Self::Action => "action",
            Self::Terminal => "terminal",
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node in the pathway.
///
/// Names are shown to the controlling intelligence and used to resolve
/// transition requests. They are not required to be unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier for this node.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    /// Instruction text for the intelligence while this node is active.
    #[serde(default)]
    pub prompt: String,
    /// Spoken on the first arrival.
    #[serde(default)]
    pub greeting: Option<String>,
    /// Integration call made by action nodes. `parameters` may hold `{{key}}`
    /// placeholders filled from collected data.
    #[serde(default)]
    pub action: Option<ActionRequest>,
    #[serde(default, rename = "isStart", alias = "is_start")]
    pub is_start: bool,
}

impl Node {
    /// Create a new node with minimal configuration.
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            prompt: String::new(),
            greeting: None,
            action: None,
            is_start: false,
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    pub fn with_greeting(mut self, greeting: impl Into<String>) -> Self {
        self.greeting = Some(greeting.into());
        self
    }

    pub fn with_action(mut self, action: ActionRequest) -> Self {
        self.action = Some(action);
        self
    }

    /// Flag this node as the pathway's start node.
    pub fn start(mut self) -> Self {
        self.is_start = true;
        self
    }

    /// The greeting, if one is configured and not blank.
    pub fn greeting(&self) -> Option<&str> {
        self.greeting
            .as_deref()
            .map(str::trim)
            .filter(|g| !g.is_empty())
    }

    /// Build the instructions for this node by injecting collected call data.
    pub fn build_prompt(&self, collected: &HashMap<String, serde_json::Value>) -> String {
        let mut prompt = String::new();

        if !collected.is_empty() {
            let mut keys: Vec<&String> = collected.keys().collect();
            keys.sort();
            prompt.push_str("## Collected Data\n\n");
            for key in keys {
                let display = match &collected[key] {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                prompt.push_str(&format!("**{}**: {}\n", key, display));
            }
            prompt.push_str("\n---\n\n");
        }

        prompt.push_str(self.prompt.trim());
        prompt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_node_builder() {
        let node = Node::new("n1", "Intake", NodeKind::Conversation)
            .with_prompt("Ask for the caller's name.")
            .with_greeting("Hi there!")
            .start();

        assert_eq!(node.id, "n1");
        assert_eq!(node.kind, NodeKind::Conversation);
        assert_eq!(node.greeting(), Some("Hi there!"));
        assert!(node.is_start);
    }

    #[test]
    fn test_deserialize_config_shape() {
        let node: Node = serde_json::from_value(json!({
            "id": "book",
            "name": "Book Slot",
            "type": "action",
            "prompt": "Create the event.",
            "action": {"integration": "calendar", "operation": "create_event",
                       "parameters": {"start": "{{slot}}"}}
        }))
        .unwrap();

        assert_eq!(node.kind, NodeKind::Action);
        assert!(!node.is_start);
        let action = node.action.unwrap();
        assert_eq!(action.integration, "calendar");
        assert_eq!(action.parameters["start"], "{{slot}}");
    }

    #[test]
    fn test_blank_greeting_is_none() {
        let node = Node::new("n", "N", NodeKind::Conversation).with_greeting("   ");
        assert_eq!(node.greeting(), None);
    }

    #[test]
    fn test_build_prompt_with_collected_data() {
        let node = Node::new("n", "N", NodeKind::Conversation).with_prompt("Confirm the booking.");
        let mut data = HashMap::new();
        data.insert("slot".into(), json!("Tuesday 3pm"));
        data.insert("party_size".into(), json!(2));

        let prompt = node.build_prompt(&data);
        assert!(prompt.contains("**slot**: Tuesday 3pm"));
        assert!(prompt.contains("**party_size**: 2"));
        assert!(prompt.ends_with("Confirm the booking."));
    }

    #[test]
    fn test_build_prompt_no_data() {
        let node = Node::new("n", "N", NodeKind::Conversation).with_prompt("Chat.");
        assert_eq!(node.build_prompt(&HashMap::new()), "Chat.");
    }
}
