use thiserror::Error;

#[derive(Debug, Error)]
pub enum WaypointError {
    // Pathway errors
    #[error("Invalid pathway: {0}")]
    Pathway(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Could not resolve transition target '{target}' from node {from}")]
    UnresolvedTarget { target: String, from: String },

    // Action errors
    #[error("No usable credential for integration {integration} after {attempts} strategies")]
    Credential { integration: String, attempts: usize },

    #[error("Action failed: {integration}.{operation}: {message}")]
    Action {
        integration: String,
        operation: String,
        message: String,
    },

    // Collaborator errors
    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    #[error("LLM streaming error: {0}")]
    LlmStream(String),

    #[error("Speech synthesis failed: {0}")]
    Synthesis(String),

    #[error("Call conduit error: {0}")]
    Conduit(String),

    #[error("Metrics sink error: {0}")]
    Metrics(String),

    // Session errors
    #[error("Session ended: {0}")]
    SessionEnded(String),

    #[error("Call cancelled")]
    Cancelled,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, WaypointError>;
