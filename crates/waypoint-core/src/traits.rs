use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::config::ModelConfig;
use crate::error::Result;
use crate::types::*;

/// Controlling intelligence. Streams a reply and optional tool calls.
pub trait LlmClient: Send + Sync + 'static {
    /// Send a chat request and receive a stream of deltas.
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
        tools: &[ToolDefinition],
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>>;
}

/// Text-to-speech backend.
pub trait SpeechSynthesizer: Send + Sync + 'static {
    /// Synthesize text with the given delivery settings into a stream of audio chunks.
    fn synthesize(
        &self,
        text: &str,
        settings: &VoiceSettings,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<AudioChunk>>>>;
}

/// The live call leg audio is written to.
pub trait CallConduit: Send + Sync + 'static {
    /// Push one chunk of audio to the caller.
    fn send_audio(&self, call_id: &CallId, chunk: AudioChunk) -> BoxFuture<'_, Result<()>>;

    /// Release the call (hang up on our side).
    fn release(&self, call_id: &CallId) -> BoxFuture<'_, Result<()>>;
}

/// External integration layer (calendar, CRM, ...).
pub trait ActionBackend: Send + Sync + 'static {
    /// Run one operation. Called at most once per action attempt.
    fn execute_action(
        &self,
        request: &ActionRequest,
        token: &AccessToken,
    ) -> BoxFuture<'_, Result<ActionOutcome>>;
}

/// Source of stored credential blobs, keyed by integration name.
pub trait CredentialSource: Send + Sync + 'static {
    fn credential_blob(&self, integration: &str) -> BoxFuture<'_, Result<Option<String>>>;
}

/// External sink for per-utterance metrics events.
pub trait MetricsSink: Send + Sync + 'static {
    fn emit(&self, event: serde_json::Value) -> BoxFuture<'_, Result<()>>;
}
