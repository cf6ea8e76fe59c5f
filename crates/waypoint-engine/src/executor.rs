use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use waypoint_actions::ActionGateway;
use waypoint_core::config::EngineConfig;
use waypoint_core::error::{Result, WaypointError};
use waypoint_core::event::EventBus;
use waypoint_core::traits::{CallConduit, LlmClient, SpeechSynthesizer};
use waypoint_core::types::{
    CallId, ChatMessage, EngineEvent, SpeechStage, StreamDelta, ToolDefinition,
};
use waypoint_voice::{AdaptationDecision, VoiceAdaptationEngine};

use crate::graph::{Node, NodeKind, PathwayGraph};
use crate::machine::{self, Effect, MachineContext, SessionEvent, TransitionReply};
use crate::metrics::{MetricsEmitter, StageTimer, StageTiming, UtteranceMetrics};
use crate::resolver::TransitionResolver;
use crate::session::SessionState;

/// Name of the single tool offered to the intelligence.
pub const TRANSITION_TOOL: &str = "request_transition";

/// Collaborators shared by every call.
#[derive(Clone)]
pub struct CallServices {
    pub llm: Arc<dyn LlmClient>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub conduit: Arc<dyn CallConduit>,
    pub gateway: Arc<ActionGateway>,
    pub metrics: Arc<MetricsEmitter>,
    pub event_bus: Arc<EventBus>,
}

/// An utterance that reached the caller.
#[derive(Debug, Clone)]
pub struct SpokenUtterance {
    pub node_id: String,
    pub stage: SpeechStage,
    pub text: String,
    pub decision: AdaptationDecision,
}

/// Accumulates a streamed tool call.
#[derive(Debug, Default)]
struct ToolCallAccumulator {
    name: String,
    input_json: String,
}

/// Result of one intelligence turn.
#[derive(Debug, Default)]
struct TurnOutput {
    text: String,
    transition: Option<String>,
}

enum Work {
    Effect(Effect),
    Event(SessionEvent),
}

/// Drives one call through the pathway.
///
/// Feeds events to the state machine and carries out the resulting effects
/// against the collaborators: intelligence turns, adapted speech, action
/// invocations, metrics, and conduit release. Turn methods take `&mut self`,
/// so operations on one call never interleave. Collaborator failures become
/// spoken apologies or log lines; nothing here returns an error to the host.
pub struct CallSession {
    config: Arc<EngineConfig>,
    graph: Arc<PathwayGraph>,
    resolver: TransitionResolver,
    state: SessionState,
    voice: VoiceAdaptationEngine,
    services: CallServices,
    cancel: CancellationToken,
    /// Timing of the last intelligence turn, reported with the next utterance.
    reasoning: Option<StageTiming>,
}

impl CallSession {
    pub fn new(
        call_id: CallId,
        graph: Arc<PathwayGraph>,
        config: Arc<EngineConfig>,
        services: CallServices,
    ) -> Self {
        let state = SessionState::new(call_id, &graph);
        Self {
            resolver: TransitionResolver::new(&config.resolver),
            voice: VoiceAdaptationEngine::new(config.voice.clone()),
            config,
            graph,
            state,
            services,
            cancel: CancellationToken::new(),
            reasoning: None,
        }
    }

    /// Seed collected data with the host's call variables.
    pub fn with_collected(mut self, data: HashMap<String, serde_json::Value>) -> Self {
        self.state.collected.merge(data);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn call_id(&self) -> &CallId {
        &self.state.call_id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn current_node_id(&self) -> &str {
        self.state.current_node_id()
    }

    pub fn is_ended(&self) -> bool {
        self.state.is_ended()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Record a value learned by the host (e.g. from speech understanding).
    pub fn collect(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.state.collected.set(key, value);
    }

    /// Enter the entry node and run its behavior.
    pub async fn start(&mut self) -> Vec<SpokenUtterance> {
        let effects = self.step(SessionEvent::Start);
        self.run(effects).await
    }

    /// Handle one caller utterance and return everything spoken in response.
    pub async fn handle_user_utterance(&mut self, text: &str) -> Vec<SpokenUtterance> {
        if self.state.is_ended() {
            debug!(call_id = %self.state.call_id, "Ignoring utterance after session end");
            return Vec::new();
        }
        let effects = self.step(SessionEvent::UserUtterance(text.to_string()));
        self.run(effects).await
    }

    /// Move to a node by name, as the intelligence's `request_transition` tool would.
    ///
    /// Nothing is in flight here, so an accepted transition applies at once.
    /// Returns the acknowledgement or clarification text.
    pub async fn request_transition(&mut self, target: &str) -> String {
        let (reply, mut effects) = self.resolve_transition(target);
        effects.extend(self.step(SessionEvent::UtteranceRendered));
        self.run(effects).await;
        reply.message().to_string()
    }

    /// End the call without a goodbye. In-flight work is abandoned.
    pub async fn hangup(&mut self) {
        self.cancel.cancel();
        let effects = self.step(SessionEvent::Hangup);
        self.run(effects).await;
    }

    fn step(&mut self, event: SessionEvent) -> Vec<Effect> {
        let ctx = MachineContext {
            graph: &self.graph,
            resolver: &self.resolver,
            config: &self.config.session,
        };
        machine::step(&mut self.state, &ctx, event)
    }

    fn resolve_transition(&mut self, target: &str) -> (TransitionReply, Vec<Effect>) {
        let ctx = MachineContext {
            graph: &self.graph,
            resolver: &self.resolver,
            config: &self.config.session,
        };
        machine::request_transition(&mut self.state, &ctx, target)
    }

    async fn run(&mut self, effects: Vec<Effect>) -> Vec<SpokenUtterance> {
        let mut queue: VecDeque<Work> = effects.into_iter().map(Work::Effect).collect();
        let mut spoken = Vec::new();

        while let Some(work) = queue.pop_front() {
            let effect = match work {
                Work::Event(event) => {
                    let effects = self.step(event);
                    push_front(&mut queue, effects.into_iter().map(Work::Effect).collect());
                    continue;
                }
                Work::Effect(effect) => effect,
            };

            if self.cancel.is_cancelled() && does_io(&effect) {
                debug!(call_id = %self.state.call_id, "Call cancelled, dropping pending work");
                continue;
            }

            match effect {
                Effect::Speak {
                    node_id,
                    text,
                    stage,
                } => {
                    spoken.extend(self.speak(&node_id, &text, stage).await);
                }
                Effect::Converse { node_id, user_text } => {
                    let follow = self.converse(&node_id, user_text.is_none()).await;
                    push_front(&mut queue, follow);
                }
                Effect::RunAction { node_id, request } => {
                    let gateway = self.services.gateway.clone();
                    let report = tokio::select! {
                        report = gateway.invoke(&request, self.state.collected.data()) => report,
                        _ = self.cancel.cancelled() => continue,
                    };
                    info!(
                        call_id = %self.state.call_id,
                        node_id = %node_id,
                        status = ?report.outcome.status,
                        strategy = ?report.credential_strategy,
                        "Action finished"
                    );
                    queue.push_front(Work::Event(SessionEvent::ActionFinished(report.outcome)));
                }
                Effect::SayGoodbye { node_id } => {
                    let text = self.goodbye_text(&node_id).await;
                    spoken.extend(self.speak(&node_id, &text, SpeechStage::Goodbye).await);
                }
                Effect::ReleaseConduit => {
                    if let Err(e) = self.services.conduit.release(&self.state.call_id).await {
                        warn!(call_id = %self.state.call_id, error = %e, "Failed to release call conduit");
                    }
                }
                Effect::Publish(event) => self.services.event_bus.publish(event),
                Effect::EndSession { reason } => {
                    info!(call_id = %self.state.call_id, reason = %reason, "Session ended");
                    self.services.event_bus.publish(EngineEvent::SessionEnded {
                        call_id: self.state.call_id.clone(),
                        reason,
                    });
                    self.cancel.cancel();
                }
            }
        }
        spoken
    }

    /// Run one intelligence turn at `node_id` and return the follow-up work:
    /// the reply, any clarification, then the pending transition.
    async fn converse(&mut self, node_id: &str, on_entry: bool) -> Vec<Work> {
        let Some(node) = self.graph.node(node_id).cloned() else {
            return Vec::new();
        };

        let mut messages = vec![ChatMessage::system(node_instructions(&self.graph, &node, &self.state))];
        messages.extend(self.state.transcript.iter().cloned());
        if on_entry {
            messages.push(ChatMessage::system("Choose the next step now."));
        }

        let output = match self.run_turn(messages, &[transition_tool()]).await {
            Ok(output) => output,
            Err(WaypointError::Cancelled) => return Vec::new(),
            Err(e) => {
                error!(call_id = %self.state.call_id, node_id = %node_id, error = %e, "Intelligence turn failed");
                return vec![Work::Effect(Effect::Speak {
                    node_id: node_id.to_string(),
                    text: self.config.session.apology_template.clone(),
                    stage: SpeechStage::Apology,
                })];
            }
        };

        let mut follow = vec![Work::Effect(Effect::Speak {
            node_id: node_id.to_string(),
            text: output.text,
            stage: SpeechStage::Conversation,
        })];
        if let Some(target) = output.transition {
            let (reply, effects) = self.resolve_transition(&target);
            debug!(call_id = %self.state.call_id, target = %target, reply = %reply.message(), "Transition tool result");
            follow.extend(effects.into_iter().map(Work::Effect));
        }
        follow.push(Work::Event(SessionEvent::UtteranceRendered));
        follow
    }

    /// Stream one completion, collecting text and a `request_transition` call.
    async fn run_turn(
        &mut self,
        messages: Vec<ChatMessage>,
        tools: &[ToolDefinition],
    ) -> Result<TurnOutput> {
        let llm = self.services.llm.clone();
        let cancel = self.cancel.clone();
        let mut timer = StageTimer::start();

        let mut stream = tokio::select! {
            result = llm.chat_stream(&self.config.model, messages, tools) => result?,
            _ = cancel.cancelled() => return Err(WaypointError::Cancelled),
        };

        let mut text = String::new();
        let mut tool_calls: Vec<ToolCallAccumulator> = Vec::new();
        loop {
            let delta = tokio::select! {
                delta = stream.next() => delta,
                _ = cancel.cancelled() => return Err(WaypointError::Cancelled),
            };
            let Some(delta) = delta else { break };
            let delta = delta.map_err(|e| match e {
                WaypointError::LlmStream(_) => e,
                other => WaypointError::LlmStream(other.to_string()),
            })?;
            match delta {
                StreamDelta::TextDelta(chunk) => {
                    timer.mark_first();
                    text.push_str(&chunk);
                }
                StreamDelta::ToolUseStart { index, name, .. } => {
                    timer.mark_first();
                    while tool_calls.len() <= index {
                        tool_calls.push(ToolCallAccumulator::default());
                    }
                    tool_calls[index].name = name;
                }
                StreamDelta::ToolInputDelta { index, delta } => {
                    if let Some(tc) = tool_calls.get_mut(index) {
                        tc.input_json.push_str(&delta);
                    }
                }
                StreamDelta::Stop(_) => {}
            }
        }
        self.reasoning = Some(timer.finish());

        let mut transition = None;
        for tc in tool_calls.iter().filter(|tc| !tc.name.is_empty()) {
            if tc.name != TRANSITION_TOOL {
                warn!(call_id = %self.state.call_id, tool = %tc.name, "Ignoring unknown tool call");
                continue;
            }
            let input: serde_json::Value =
                serde_json::from_str(&tc.input_json).unwrap_or(serde_json::Value::Null);
            match input.get("target_node_name").and_then(|v| v.as_str()) {
                Some(target) if transition.is_none() => transition = Some(target.to_string()),
                Some(target) => {
                    warn!(call_id = %self.state.call_id, target = %target, "Ignoring extra transition request")
                }
                None => warn!(call_id = %self.state.call_id, input = %tc.input_json, "Malformed transition request"),
            }
        }

        Ok(TurnOutput {
            text: text.trim().to_string(),
            transition,
        })
    }

    /// Goodbye for a terminal node: generated from the conversation when the
    /// node has a prompt, else its greeting, else the configured template.
    /// Anything shorter than `min_goodbye_chars` falls back to the template.
    async fn goodbye_text(&mut self, node_id: &str) -> String {
        let template = self.config.session.goodbye_template.clone();
        let Some(node) = self.graph.node(node_id).cloned() else {
            return template;
        };

        let candidate = if !node.prompt.trim().is_empty() {
            let mut messages = vec![ChatMessage::system(format!(
                "{}\n\nThe call is ending. Say a short, warm goodbye to the caller.",
                node.prompt.trim()
            ))];
            messages.extend(self.state.transcript.iter().cloned());
            match self.run_turn(messages, &[]).await {
                Ok(output) => Some(output.text),
                Err(e) => {
                    warn!(call_id = %self.state.call_id, error = %e, "Goodbye generation failed");
                    None
                }
            }
        } else {
            node.greeting().map(str::to_string)
        };

        match candidate {
            Some(text) if text.trim().chars().count() >= self.config.session.min_goodbye_chars => text,
            Some(text) => {
                warn!(call_id = %self.state.call_id, goodbye = %text, "Degenerate goodbye, using template");
                template
            }
            None => template,
        }
    }

    /// Adapt, pause, synthesize and stream one utterance, then record metrics.
    async fn speak(&mut self, node_id: &str, text: &str, stage: SpeechStage) -> Option<SpokenUtterance> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }

        let decision = self.voice.adapt(text, stage);
        let delay = decision.timing.as_duration();
        let cancel = self.cancel.clone();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => return None,
        }

        let synthesizer = self.services.synthesizer.clone();
        let conduit = self.services.conduit.clone();
        let call_id = self.state.call_id.clone();
        let mut timer = StageTimer::start();
        let streamed: Result<()> = tokio::select! {
            result = async {
                let mut audio = synthesizer.synthesize(text, &decision.voice).await?;
                while let Some(chunk) = audio.next().await {
                    let chunk = chunk?;
                    timer.mark_first();
                    conduit.send_audio(&call_id, chunk).await?;
                }
                Ok::<(), WaypointError>(())
            } => result,
            _ = cancel.cancelled() => Err(WaypointError::Cancelled),
        };
        if let Err(e) = streamed {
            if !matches!(e, WaypointError::Cancelled) {
                error!(call_id = %call_id, node_id = %node_id, stage = %stage, error = %e, "Speech synthesis failed");
            }
            return None;
        }

        self.state.push_transcript(
            ChatMessage::assistant(text),
            self.config.session.max_transcript_messages,
        );
        self.services.event_bus.publish(EngineEvent::UtteranceSpoken {
            call_id: call_id.clone(),
            node_id: node_id.to_string(),
            stage,
            text: text.to_string(),
        });

        let metrics = UtteranceMetrics::new(call_id, node_id, stage, &decision.voice)
            .with_pre_speech_delay(delay)
            .with_synthesis(timer.finish())
            .with_reasoning(self.reasoning.take());
        self.services.metrics.record(metrics);

        Some(SpokenUtterance {
            node_id: node_id.to_string(),
            stage,
            text: text.to_string(),
            decision,
        })
    }
}

fn push_front(queue: &mut VecDeque<Work>, work: Vec<Work>) {
    for item in work.into_iter().rev() {
        queue.push_front(item);
    }
}

fn does_io(effect: &Effect) -> bool {
    matches!(
        effect,
        Effect::Speak { .. } | Effect::Converse { .. } | Effect::RunAction { .. } | Effect::SayGoodbye { .. }
    )
}

/// Tool definition for `request_transition`.
pub fn transition_tool() -> ToolDefinition {
    ToolDefinition {
        name: TRANSITION_TOOL.to_string(),
        description: "Move the conversation to another step of the call flow. \
                      Use the exact step name from the list of next steps."
            .to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "target_node_name": {
                    "type": "string",
                    "description": "Name of the step to move to"
                }
            },
            "required": ["target_node_name"]
        }),
    }
}

/// System instructions for the intelligence while `node` is active.
pub fn node_instructions(graph: &PathwayGraph, node: &Node, state: &SessionState) -> String {
    let mut prompt = node.build_prompt(state.collected.data());

    let options: Vec<String> = graph
        .outgoing(&node.id)
        .into_iter()
        .filter_map(|edge| {
            graph.node(&edge.target).map(|target| {
                if edge.condition.trim().is_empty() {
                    format!("- {}", target.name)
                } else {
                    format!("- {}: {}", target.name, edge.condition.trim())
                }
            })
        })
        .collect();

    if !options.is_empty() {
        prompt.push_str("\n\n## Next Steps\n\n");
        prompt.push_str(&options.join("\n"));
        prompt.push_str(&format!(
            "\n\nWhen the caller is ready for one of these, call {} with its name.",
            TRANSITION_TOOL
        ));
    }
    if node.kind == NodeKind::Condition {
        prompt.push_str("\n\nPick the next step that fits the conversation so far.");
    }
    prompt
}
