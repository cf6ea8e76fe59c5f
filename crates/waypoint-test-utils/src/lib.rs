//! Mocks and fixtures shared by Waypoint crate tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};

use waypoint_core::config::ModelConfig;
use waypoint_core::error::{Result, WaypointError};
use waypoint_core::traits::*;
use waypoint_core::types::*;

/// One canned response from the scripted intelligence.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Stream the text, then optionally call `request_transition`.
    Respond {
        text: String,
        transition: Option<String>,
    },
    /// Fail the request outright.
    Fail(String),
    /// Stream some text, then break the stream with an error.
    Broken { text: String, error: String },
}

impl ScriptedReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Respond {
            text: text.into(),
            transition: None,
        }
    }

    pub fn transition(text: impl Into<String>, target: impl Into<String>) -> Self {
        Self::Respond {
            text: text.into(),
            transition: Some(target.into()),
        }
    }

    fn into_deltas(self) -> Result<Vec<Result<StreamDelta>>> {
        match self {
            Self::Fail(message) => Err(WaypointError::LlmRequest(message)),
            Self::Broken { text, error } => Ok(vec![
                Ok(StreamDelta::TextDelta(text)),
                Err(WaypointError::LlmStream(error)),
            ]),
            Self::Respond { text, transition } => {
                let mut deltas = Vec::new();
                // Split text across two deltas to exercise accumulation.
                let (a, b) = split_mid(&text);
                for part in [a, b] {
                    if !part.is_empty() {
                        deltas.push(Ok(StreamDelta::TextDelta(part.to_string())));
                    }
                }
                let stop = if let Some(target) = transition {
                    deltas.push(Ok(StreamDelta::ToolUseStart {
                        index: 1,
                        id: "call_1".into(),
                        name: "request_transition".into(),
                    }));
                    let input = serde_json::json!({ "target_node_name": target }).to_string();
                    let (x, y) = split_mid(&input);
                    deltas.push(Ok(StreamDelta::ToolInputDelta { index: 1, delta: x.to_string() }));
                    deltas.push(Ok(StreamDelta::ToolInputDelta { index: 1, delta: y.to_string() }));
                    StopReason::ToolUse
                } else {
                    StopReason::EndTurn
                };
                deltas.push(Ok(StreamDelta::Stop(stop)));
                Ok(deltas)
            }
        }
    }
}

fn split_mid(s: &str) -> (&str, &str) {
    let mid = s.char_indices().nth(s.chars().count() / 2).map_or(0, |(i, _)| i);
    s.split_at(mid)
}

/// LLM that plays back queued replies and records every request.
#[derive(Default)]
pub struct ScriptedLlm {
    replies: Mutex<VecDeque<ScriptedReply>>,
    requests: Mutex<Vec<(Vec<ChatMessage>, Vec<ToolDefinition>)>>,
}

impl ScriptedLlm {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, reply: ScriptedReply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    /// Messages and tools of every request made so far.
    pub fn requests(&self) -> Vec<(Vec<ChatMessage>, Vec<ToolDefinition>)> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl LlmClient for ScriptedLlm {
    fn chat_stream(
        &self,
        _config: &ModelConfig,
        messages: Vec<ChatMessage>,
        tools: &[ToolDefinition],
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        self.requests
            .lock()
            .unwrap()
            .push((messages, tools.to_vec()));
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| ScriptedReply::text(""));
        Box::pin(async move {
            let deltas = reply.into_deltas()?;
            Ok(Box::pin(stream::iter(deltas)) as BoxStream<'_, Result<StreamDelta>>)
        })
    }
}

/// Synthesizer that emits one chunk per word and records what it was asked to say.
#[derive(Default)]
pub struct RecordingSynthesizer {
    spoken: Mutex<Vec<(String, VoiceSettings)>>,
    fail: AtomicBool,
}

impl RecordingSynthesizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following synthesis fail.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn spoken(&self) -> Vec<(String, VoiceSettings)> {
        self.spoken.lock().unwrap().clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.spoken().into_iter().map(|(t, _)| t).collect()
    }
}

impl SpeechSynthesizer for RecordingSynthesizer {
    fn synthesize(
        &self,
        text: &str,
        settings: &VoiceSettings,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<AudioChunk>>>> {
        let text = text.to_string();
        let settings = settings.clone();
        Box::pin(async move {
            if self.fail.load(Ordering::SeqCst) {
                return Err(WaypointError::Synthesis("synthesizer offline".into()));
            }
            let chunks: Vec<Result<AudioChunk>> = text
                .split_whitespace()
                .map(|w| Ok(AudioChunk { data: w.as_bytes().to_vec() }))
                .collect();
            self.spoken.lock().unwrap().push((text, settings));
            Ok(Box::pin(stream::iter(chunks)) as BoxStream<'_, Result<AudioChunk>>)
        })
    }
}

/// Conduit that counts audio and records releases.
#[derive(Default)]
pub struct RecordingConduit {
    chunks: Mutex<Vec<AudioChunk>>,
    released: Mutex<Vec<CallId>>,
    fail_release: AtomicBool,
}

impl RecordingConduit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_release() -> Self {
        let conduit = Self::default();
        conduit.fail_release.store(true, Ordering::SeqCst);
        conduit
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.lock().unwrap().len()
    }

    pub fn released(&self) -> Vec<CallId> {
        self.released.lock().unwrap().clone()
    }
}

impl CallConduit for RecordingConduit {
    fn send_audio(&self, _call_id: &CallId, chunk: AudioChunk) -> BoxFuture<'_, Result<()>> {
        self.chunks.lock().unwrap().push(chunk);
        Box::pin(async { Ok(()) })
    }

    fn release(&self, call_id: &CallId) -> BoxFuture<'_, Result<()>> {
        let call_id = call_id.clone();
        Box::pin(async move {
            if self.fail_release.load(Ordering::SeqCst) {
                return Err(WaypointError::Conduit("carrier rejected hangup".into()));
            }
            self.released.lock().unwrap().push(call_id);
            Ok(())
        })
    }
}

/// Integration backend with a fixed answer.
pub struct MockActionBackend {
    result: std::result::Result<serde_json::Value, String>,
    calls: Mutex<Vec<(ActionRequest, String)>>,
}

impl MockActionBackend {
    pub fn succeeding(data: serde_json::Value) -> Self {
        Self {
            result: Ok(data),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            result: Err(message.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Requests received, with the exposed token each was sent with.
    pub fn calls(&self) -> Vec<(ActionRequest, String)> {
        self.calls.lock().unwrap().clone()
    }
}

impl ActionBackend for MockActionBackend {
    fn execute_action(
        &self,
        request: &ActionRequest,
        token: &AccessToken,
    ) -> BoxFuture<'_, Result<ActionOutcome>> {
        self.calls
            .lock()
            .unwrap()
            .push((request.clone(), token.expose().to_string()));
        let outcome = match &self.result {
            Ok(data) => Ok(ActionOutcome::success("Event created", data.clone())),
            Err(message) => Err(WaypointError::Action {
                integration: request.integration.clone(),
                operation: request.operation.clone(),
                message: message.clone(),
            }),
        };
        Box::pin(async move { outcome })
    }
}

/// Metrics sink that keeps every event, optionally failing or stalling.
#[derive(Default)]
pub struct RecordingMetricsSink {
    events: Mutex<Vec<serde_json::Value>>,
    fail: AtomicBool,
    delay: Option<Duration>,
}

impl RecordingMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let sink = Self::default();
        sink.fail.store(true, Ordering::SeqCst);
        sink
    }

    /// Sink that sleeps for `delay` before accepting each event.
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<serde_json::Value> {
        self.events.lock().unwrap().clone()
    }
}

impl MetricsSink for RecordingMetricsSink {
    fn emit(&self, event: serde_json::Value) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(WaypointError::Metrics("sink unavailable".into()));
            }
            self.events.lock().unwrap().push(event);
            Ok(())
        })
    }
}

/// Pathway fixtures as raw configuration JSON.
pub mod fixtures {
    use serde_json::{json, Value};

    /// A(start) -> B, both conversation nodes.
    pub fn two_node_pathway() -> Value {
        json!({
            "nodes": [
                {"id": "a", "name": "A", "type": "conversation", "prompt": "Greet the caller.",
                 "greeting": "Hello, thanks for calling!", "isStart": true},
                {"id": "b", "name": "B", "type": "conversation", "prompt": "Help with B."}
            ],
            "edges": [
                {"source": "a", "target": "b", "condition": "caller wants B"}
            ]
        })
    }

    /// Front desk that can book an appointment (action) and hang up (terminal).
    pub fn booking_pathway() -> Value {
        json!({
            "nodes": [
                {"id": "welcome", "name": "Welcome", "type": "conversation",
                 "prompt": "Welcome the caller and find out what they need.",
                 "greeting": "Hi! This is the front desk. How can I help?", "isStart": true},
                {"id": "schedule", "name": "Schedule Appointment", "type": "conversation",
                 "prompt": "Collect the preferred date and time."},
                {"id": "billing", "name": "Billing Questions", "type": "conversation",
                 "prompt": "Answer billing questions.",
                 "greeting": "Sure, I can help with billing."},
                {"id": "route", "name": "Route Caller", "type": "condition",
                 "prompt": "Decide whether the caller is done."},
                {"id": "book", "name": "Book Slot", "type": "action",
                 "prompt": "Create the calendar event.",
                 "action": {"integration": "calendar", "operation": "create_event",
                            "parameters": {"summary": "Appointment for {{caller_name}}",
                                           "start": "{{slot}}"}}},
                {"id": "goodbye", "name": "Goodbye", "type": "terminal", "prompt": ""}
            ],
            "edges": [
                {"source": "welcome", "target": "schedule", "condition": "wants an appointment"},
                {"source": "welcome", "target": "billing", "condition": "billing question"},
                {"source": "schedule", "target": "book", "condition": "date and time confirmed"},
                {"source": "billing", "target": "route", "condition": "question answered"},
                {"source": "route", "target": "goodbye", "condition": "caller is done"},
                {"source": "route", "target": "welcome", "condition": "caller needs more"},
                {"source": "book", "target": "goodbye", "condition": "booked"}
            ]
        })
    }

    /// An action node whose only edge loops back to itself.
    pub fn self_loop_action_pathway() -> Value {
        json!({
            "nodes": [
                {"id": "start", "name": "Start", "type": "conversation", "prompt": "Chat.", "isStart": true},
                {"id": "sync", "name": "Sync CRM", "type": "action", "prompt": "Sync.",
                 "action": {"integration": "crm", "operation": "upsert", "parameters": {}}}
            ],
            "edges": [
                {"source": "start", "target": "sync", "condition": "ready"},
                {"source": "sync", "target": "sync", "condition": "again"}
            ]
        })
    }
}
