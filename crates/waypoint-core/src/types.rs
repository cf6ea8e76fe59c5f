use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Correlation id for one call. Every log line and metrics event carries it.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CallId(pub String);

impl CallId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A chat message in the conversation transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            text: text.into(),
            timestamp: Some(Utc::now()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            timestamp: Some(Utc::now()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
            timestamp: Some(Utc::now()),
        }
    }
}

/// Stop reason from the LLM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
}

/// A streaming delta from the controlling intelligence.
#[derive(Debug, Clone)]
pub enum StreamDelta {
    /// A chunk of reply text.
    TextDelta(String),

    /// Start of a tool use block.
    ToolUseStart {
        index: usize,
        id: String,
        name: String,
    },

    /// A chunk of tool use input JSON.
    ToolInputDelta { index: usize, delta: String },

    /// The response is complete.
    Stop(StopReason),
}

/// Tool definition offered to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Which part of the conversation an utterance belongs to. Drives small
/// speed and timing nudges in voice adaptation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeechStage {
    Greeting,
    Acknowledgment,
    Conversation,
    Explanation,
    Clarification,
    ActionResult,
    Apology,
    Goodbye,
}

impl SpeechStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Greeting => "greeting",
            Self::Acknowledgment => "acknowledgment",
            Self::Conversation => "conversation",
            Self::Explanation => "explanation",
            Self::Clarification => "clarification",
            Self::ActionResult => "action_result",
            Self::Apology => "apology",
            Self::Goodbye => "goodbye",
        }
    }
}

impl std::fmt::Display for SpeechStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery parameters handed to the speech synthesizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceSettings {
    /// Speed multiplier, 1.0 is the voice's natural rate.
    pub speed: f64,
    /// Emotion name to intensity in [0, 1]. Ordered for stable output.
    pub emotions: BTreeMap<String, f64>,
    pub interruptions_enabled: bool,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            speed: 1.0,
            emotions: BTreeMap::new(),
            interruptions_enabled: true,
        }
    }
}

/// One chunk of synthesized audio.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub data: Vec<u8>,
}

/// Bearer token recovered from a credential blob. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AccessToken(***)")
    }
}

/// An external operation to run against an integration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub integration: String,
    pub operation: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Success,
    Error,
}

/// Structured result of an action invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub status: ActionStatus,
    pub message: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl ActionOutcome {
    pub fn success(message: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            status: ActionStatus::Success,
            message: message.into(),
            data,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ActionStatus::Error,
            message: message.into(),
            data: serde_json::Value::Null,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ActionStatus::Success
    }
}

/// Lifecycle event broadcast to all subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A call session started on its entry node.
    SessionStarted { call_id: CallId, node_id: String },
    /// The session entered a node.
    NodeEntered {
        call_id: CallId,
        node_id: String,
        via_transition: bool,
    },
    /// A transition request was resolved and applied.
    TransitionApplied {
        call_id: CallId,
        from: String,
        to: String,
        strategy: String,
    },
    /// A transition request could not be resolved.
    TransitionRejected {
        call_id: CallId,
        from: String,
        target: String,
    },
    /// An action node finished its external call.
    ActionCompleted {
        call_id: CallId,
        node_id: String,
        status: ActionStatus,
    },
    /// An utterance was spoken to the caller.
    UtteranceSpoken {
        call_id: CallId,
        node_id: String,
        stage: SpeechStage,
        text: String,
    },
    /// The session ended.
    SessionEnded { call_id: CallId, reason: String },
}
