//! The per-call state machine.
//!
//! `step` is a pure transition function: it mutates `SessionState` and returns
//! the effects the driver must carry out, in order. It never awaits and never
//! talks to a collaborator, which keeps node dispatch testable without mocks.
//! `CallSession` interprets the effects and feeds results back in as events.

use tracing::{error, info, warn};

use waypoint_core::config::SessionConfig;
use waypoint_core::types::{
    ActionOutcome, ActionRequest, ActionStatus, ChatMessage, EngineEvent, SpeechStage,
};

use crate::graph::{Node, NodeKind, PathwayGraph};
use crate::resolver::TransitionResolver;
use crate::session::{NodeExecutor, PendingTransition, SessionState};

/// Everything `step` reads but never changes.
#[derive(Clone, Copy)]
pub struct MachineContext<'a> {
    pub graph: &'a PathwayGraph,
    pub resolver: &'a TransitionResolver,
    pub config: &'a SessionConfig,
}

/// Inputs to the state machine.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Begin the call on the entry node.
    Start,
    /// The caller said something.
    UserUtterance(String),
    /// The intelligence asked to move to a node by name.
    TransitionRequested { target: String },
    /// The utterance in flight has finished rendering.
    UtteranceRendered,
    /// The current action node's integration call returned.
    ActionFinished(ActionOutcome),
    /// The caller or host hung up.
    Hangup,
}

/// Work for the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Say fixed text to the caller.
    Speak {
        node_id: String,
        text: String,
        stage: SpeechStage,
    },
    /// Run one intelligence turn for the node, optionally answering the caller.
    Converse {
        node_id: String,
        user_text: Option<String>,
    },
    /// Invoke the node's integration and report back with `ActionFinished`.
    RunAction {
        node_id: String,
        request: ActionRequest,
    },
    /// Produce and speak the terminal node's goodbye.
    SayGoodbye { node_id: String },
    /// Hand the call back to the carrier.
    ReleaseConduit,
    Publish(EngineEvent),
    EndSession { reason: String },
}

/// Answer to a `request_transition` call.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionReply {
    /// Resolved; the move happens once the current utterance finishes.
    Accepted { node_id: String, message: String },
    /// Not resolved; nothing changed.
    Rejected { message: String },
}

impl TransitionReply {
    /// Text returned to the intelligence as the tool result.
    pub fn message(&self) -> &str {
        match self {
            Self::Accepted { message, .. } | Self::Rejected { message } => message,
        }
    }
}

/// Apply one event.
pub fn step(state: &mut SessionState, ctx: &MachineContext<'_>, event: SessionEvent) -> Vec<Effect> {
    if state.is_ended() {
        return Vec::new();
    }

    match event {
        SessionEvent::Start => {
            if !state.history.is_empty() {
                warn!(call_id = %state.call_id, "Session already started");
                return Vec::new();
            }
            let entry = ctx.graph.entry_node().to_string();
            let mut effects = vec![Effect::Publish(EngineEvent::SessionStarted {
                call_id: state.call_id.clone(),
                node_id: entry.clone(),
            })];
            effects.extend(enter(state, ctx, &entry, false));
            effects
        }
        SessionEvent::UserUtterance(text) => on_user_utterance(state, ctx, text),
        SessionEvent::TransitionRequested { target } => request_transition(state, ctx, &target).1,
        SessionEvent::UtteranceRendered => apply_pending(state, ctx),
        SessionEvent::ActionFinished(outcome) => on_action_finished(state, ctx, outcome),
        SessionEvent::Hangup => {
            state.end("hangup");
            vec![Effect::EndSession {
                reason: "hangup".into(),
            }]
        }
    }
}

/// Resolve a transition requested by the intelligence.
///
/// On success the target is stored as pending and applied on the next
/// `UtteranceRendered`. On failure the current node is kept and a
/// clarification listing the outgoing options is returned and spoken.
pub fn request_transition(
    state: &mut SessionState,
    ctx: &MachineContext<'_>,
    target: &str,
) -> (TransitionReply, Vec<Effect>) {
    let from = state.current_node_id().to_string();
    let kind = ctx.graph.node(&from).map(|n| n.kind);

    if state.is_ended() || matches!(kind, Some(NodeKind::Action | NodeKind::Terminal) | None) {
        warn!(call_id = %state.call_id, node_id = %from, target = %target, "Transition requested where none is allowed");
        let reply = TransitionReply::Rejected {
            message: "A transition is not possible from here.".into(),
        };
        return (reply, Vec::new());
    }

    match ctx.resolver.resolve(ctx.graph, target, &from) {
        Ok(resolution) => {
            let name = ctx
                .graph
                .node(&resolution.node_id)
                .map(|n| n.name.clone())
                .unwrap_or_else(|| resolution.node_id.clone());
            info!(
                call_id = %state.call_id,
                from = %from,
                to = %resolution.node_id,
                strategy = %resolution.strategy,
                "Transition pending"
            );
            state.pending = Some(PendingTransition {
                from,
                to: resolution.node_id.clone(),
                strategy: resolution.strategy,
            });
            let reply = TransitionReply::Accepted {
                node_id: resolution.node_id,
                message: format!("Moving to {}.", name),
            };
            (reply, Vec::new())
        }
        Err(e) => {
            warn!(call_id = %state.call_id, error = %e, "Transition rejected");
            let message = clarification(ctx, &from);
            let effects = vec![
                Effect::Publish(EngineEvent::TransitionRejected {
                    call_id: state.call_id.clone(),
                    from: from.clone(),
                    target: target.to_string(),
                }),
                Effect::Speak {
                    node_id: from,
                    text: message.clone(),
                    stage: SpeechStage::Clarification,
                },
            ];
            (TransitionReply::Rejected { message }, effects)
        }
    }
}

fn on_user_utterance(state: &mut SessionState, ctx: &MachineContext<'_>, text: String) -> Vec<Effect> {
    let node_id = state.current_node_id().to_string();
    let Some(node) = ctx.graph.node(&node_id) else {
        return Vec::new();
    };
    state.push_transcript(ChatMessage::user(text.clone()), ctx.config.max_transcript_messages);

    match state.executor_mut(&node_id) {
        Some(NodeExecutor::Conversation(e)) => e.turns += 1,
        Some(NodeExecutor::Condition(e)) => e.evaluations += 1,
        Some(NodeExecutor::Action(e)) if e.last_status == Some(ActionStatus::Error) => {
            // Caller is answering the apology; try the integration again.
            e.attempts += 1;
            if let Some(request) = node.action.clone() {
                return vec![Effect::RunAction { node_id, request }];
            }
        }
        Some(NodeExecutor::Terminal(_)) => return Vec::new(),
        _ => {}
    }

    vec![Effect::Converse {
        node_id,
        user_text: Some(text),
    }]
}

fn apply_pending(state: &mut SessionState, ctx: &MachineContext<'_>) -> Vec<Effect> {
    let Some(pending) = state.pending.take() else {
        return Vec::new();
    };
    if pending.from != state.current_node_id() {
        warn!(
            call_id = %state.call_id,
            from = %pending.from,
            current = %state.current_node_id(),
            "Dropping stale pending transition"
        );
        return Vec::new();
    }

    let mut effects = vec![Effect::Publish(EngineEvent::TransitionApplied {
        call_id: state.call_id.clone(),
        from: pending.from,
        to: pending.to.clone(),
        strategy: pending.strategy.to_string(),
    })];
    effects.extend(enter(state, ctx, &pending.to, true));
    effects
}

fn on_action_finished(
    state: &mut SessionState,
    ctx: &MachineContext<'_>,
    outcome: ActionOutcome,
) -> Vec<Effect> {
    let node_id = state.current_node_id().to_string();
    match state.executor_mut(&node_id) {
        Some(NodeExecutor::Action(e)) => e.last_status = Some(outcome.status),
        _ => {
            warn!(call_id = %state.call_id, node_id = %node_id, "Action result arrived outside an action node");
            return Vec::new();
        }
    }
    state
        .collected
        .record_action(&node_id, outcome.status, outcome.data.clone());

    let mut effects = vec![Effect::Publish(EngineEvent::ActionCompleted {
        call_id: state.call_id.clone(),
        node_id: node_id.clone(),
        status: outcome.status,
    })];

    if !outcome.is_success() {
        warn!(call_id = %state.call_id, node_id = %node_id, message = %outcome.message, "Action failed, staying on node");
        effects.push(Effect::Speak {
            node_id,
            text: ctx.config.apology_template.clone(),
            stage: SpeechStage::Apology,
        });
        return effects;
    }

    effects.push(Effect::Speak {
        node_id: node_id.clone(),
        text: ctx.config.action_success_template.clone(),
        stage: SpeechStage::ActionResult,
    });

    let outgoing = ctx.graph.outgoing(&node_id);
    if outgoing.is_empty() {
        warn!(call_id = %state.call_id, node_id = %node_id, "Action node has no outgoing edge");
        return effects;
    }
    let exits: Vec<_> = outgoing.iter().filter(|e| e.target != node_id).collect();
    let Some(edge) = exits.first() else {
        error!(call_id = %state.call_id, node_id = %node_id, "Action node edges only loop to itself, not transitioning");
        return effects;
    };
    if exits.len() > 1 {
        warn!(
            call_id = %state.call_id,
            node_id = %node_id,
            edges = exits.len(),
            "Action node has several outgoing edges, taking the first"
        );
    }

    let target = edge.target.clone();
    effects.push(Effect::Publish(EngineEvent::TransitionApplied {
        call_id: state.call_id.clone(),
        from: node_id,
        to: target.clone(),
        strategy: "auto".into(),
    }));
    effects.extend(enter(state, ctx, &target, true));
    effects
}

/// Arrive at a node and produce its entry behavior.
fn enter(state: &mut SessionState, ctx: &MachineContext<'_>, node_id: &str, via_transition: bool) -> Vec<Effect> {
    let Some(node) = ctx.graph.node(node_id) else {
        error!(call_id = %state.call_id, node_id = %node_id, "Transition to unknown node ignored");
        return Vec::new();
    };
    let call_id = state.call_id.clone();
    let executor = match state.enter(ctx.graph, node_id) {
        Ok(executor) => executor,
        Err(e) => {
            error!(call_id = %call_id, error = %e, "Could not enter node");
            return Vec::new();
        }
    };

    let mut effects = vec![Effect::Publish(EngineEvent::NodeEntered {
        call_id: call_id.clone(),
        node_id: node.id.clone(),
        via_transition,
    })];

    match executor {
        NodeExecutor::Conversation(e) => match node.greeting() {
            Some(greeting) if !e.greeted => {
                e.greeted = true;
                effects.push(speak(node, greeting.to_string(), SpeechStage::Greeting));
            }
            _ if via_transition => {
                effects.push(speak(node, acknowledgment(ctx, node), SpeechStage::Acknowledgment));
            }
            _ => {}
        },
        NodeExecutor::Condition(e) => {
            e.evaluations += 1;
            effects.push(Effect::Converse {
                node_id: node.id.clone(),
                user_text: None,
            });
        }
        NodeExecutor::Action(e) => match node.action.clone() {
            Some(request) => {
                e.attempts += 1;
                effects.push(Effect::RunAction {
                    node_id: node.id.clone(),
                    request,
                });
            }
            None => {
                error!(call_id = %call_id, node_id = %node.id, "Action node without action descriptor");
                effects.push(speak(node, ctx.config.apology_template.clone(), SpeechStage::Apology));
            }
        },
        NodeExecutor::Terminal(_) => {}
    }

    if node.kind == NodeKind::Terminal {
        state.end("terminal");
        effects.extend([
            Effect::SayGoodbye {
                node_id: node.id.clone(),
            },
            Effect::ReleaseConduit,
            Effect::EndSession {
                reason: "terminal".into(),
            },
        ]);
    }
    effects
}

fn speak(node: &Node, text: String, stage: SpeechStage) -> Effect {
    Effect::Speak {
        node_id: node.id.clone(),
        text,
        stage,
    }
}

fn acknowledgment(ctx: &MachineContext<'_>, node: &Node) -> String {
    ctx.config.acknowledgment_template.replace("{node}", &node.name)
}

fn clarification(ctx: &MachineContext<'_>, from: &str) -> String {
    let options: Vec<&str> = ctx
        .graph
        .outgoing(from)
        .into_iter()
        .filter_map(|e| ctx.graph.node(&e.target))
        .map(|n| n.name.as_str())
        .collect();
    if options.is_empty() {
        ctx.config.clarification_template.clone()
    } else {
        format!(
            "{} I can help with: {}.",
            ctx.config.clarification_template,
            options.join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use waypoint_core::types::CallId;
    use waypoint_test_utils::fixtures;

    struct Fixture {
        graph: PathwayGraph,
        resolver: TransitionResolver,
        config: SessionConfig,
    }

    impl Fixture {
        fn new(pathway: serde_json::Value) -> Self {
            Self {
                graph: PathwayGraph::from_config(serde_json::from_value(pathway).unwrap()).unwrap(),
                resolver: TransitionResolver::default(),
                config: SessionConfig::default(),
            }
        }

        fn ctx(&self) -> MachineContext<'_> {
            MachineContext {
                graph: &self.graph,
                resolver: &self.resolver,
                config: &self.config,
            }
        }

        fn started(&self) -> (SessionState, Vec<Effect>) {
            let mut state = SessionState::new(CallId::new(), &self.graph);
            let effects = step(&mut state, &self.ctx(), SessionEvent::Start);
            (state, effects)
        }
    }

    fn spoken(effects: &[Effect]) -> Vec<(SpeechStage, String)> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Speak { stage, text, .. } => Some((*stage, text.clone())),
                _ => None,
            })
            .collect()
    }

    fn transition(state: &mut SessionState, ctx: &MachineContext<'_>, target: &str) -> Vec<Effect> {
        let mut effects = step(state, ctx, SessionEvent::TransitionRequested { target: target.into() });
        effects.extend(step(state, ctx, SessionEvent::UtteranceRendered));
        effects
    }

    #[test]
    fn test_start_delivers_entry_greeting() {
        let f = Fixture::new(fixtures::two_node_pathway());
        let (state, effects) = f.started();
        assert_eq!(state.current_node_id(), "a");
        assert_eq!(
            spoken(&effects),
            vec![(SpeechStage::Greeting, "Hello, thanks for calling!".to_string())]
        );
        assert!(matches!(effects[0], Effect::Publish(EngineEvent::SessionStarted { .. })));
    }

    #[test]
    fn test_exact_transition_to_greetingless_node_acknowledges() {
        let f = Fixture::new(fixtures::two_node_pathway());
        let (mut state, _) = f.started();
        let ctx = f.ctx();

        let (reply, effects) = request_transition(&mut state, &ctx, "B");
        assert!(matches!(reply, TransitionReply::Accepted { ref node_id, .. } if node_id == "b"));
        assert!(effects.is_empty());
        // Not applied until the reply finishes rendering.
        assert_eq!(state.current_node_id(), "a");

        let effects = step(&mut state, &ctx, SessionEvent::UtteranceRendered);
        assert_eq!(state.current_node_id(), "b");
        assert_eq!(
            spoken(&effects),
            vec![(SpeechStage::Acknowledgment, "Okay, let's talk about B.".to_string())]
        );
    }

    #[test]
    fn test_unresolved_transition_clarifies_and_stays() {
        let f = Fixture::new(fixtures::booking_pathway());
        let (mut state, _) = f.started();
        let ctx = f.ctx();

        let (reply, effects) = request_transition(&mut state, &ctx, "xylophone");
        assert!(matches!(reply, TransitionReply::Rejected { .. }));
        assert!(reply.message().contains("Schedule Appointment, Billing Questions"));
        assert_eq!(state.current_node_id(), "welcome");
        assert!(state.pending.is_none());
        let said = spoken(&effects);
        assert_eq!(said.len(), 1);
        assert_eq!(said[0].0, SpeechStage::Clarification);

        assert!(step(&mut state, &ctx, SessionEvent::UtteranceRendered).is_empty());
        assert_eq!(state.current_node_id(), "welcome");
    }

    #[test]
    fn test_revisit_acknowledges_instead_of_regreeting() {
        let f = Fixture::new(fixtures::booking_pathway());
        let (mut state, _) = f.started();
        let ctx = f.ctx();

        let to_billing = transition(&mut state, &ctx, "Billing Questions");
        assert_eq!(spoken(&to_billing)[0].0, SpeechStage::Greeting);

        // billing -> route runs an intelligence turn; route -> welcome returns.
        let to_route = transition(&mut state, &ctx, "Route Caller");
        assert!(to_route.iter().any(|e| matches!(e, Effect::Converse { user_text: None, .. })));
        let back = transition(&mut state, &ctx, "Welcome");
        assert_eq!(state.current_node_id(), "welcome");
        let said = spoken(&back);
        assert_eq!(said, vec![(SpeechStage::Acknowledgment, "Okay, let's talk about Welcome.".to_string())]);

        let again = transition(&mut state, &ctx, "Billing Questions");
        assert_eq!(spoken(&again)[0].0, SpeechStage::Acknowledgment);
    }

    #[test]
    fn test_user_utterance_asks_intelligence() {
        let f = Fixture::new(fixtures::two_node_pathway());
        let (mut state, _) = f.started();
        let effects = step(&mut state, &f.ctx(), SessionEvent::UserUtterance("hi".into()));
        assert_eq!(
            effects,
            vec![Effect::Converse {
                node_id: "a".into(),
                user_text: Some("hi".into())
            }]
        );
        assert_eq!(state.transcript.len(), 1);
    }

    fn walk_to_booking(f: &Fixture) -> (SessionState, Vec<Effect>) {
        let (mut state, _) = f.started();
        let ctx = f.ctx();
        transition(&mut state, &ctx, "sched appt");
        assert_eq!(state.current_node_id(), "schedule");
        let effects = transition(&mut state, &ctx, "Book Slot");
        (state, effects)
    }

    #[test]
    fn test_action_success_auto_transitions_to_terminal() {
        let f = Fixture::new(fixtures::booking_pathway());
        let (mut state, effects) = walk_to_booking(&f);
        assert_eq!(state.current_node_id(), "book");
        assert!(effects.iter().any(|e| matches!(e, Effect::RunAction { node_id, .. } if node_id == "book")));

        let outcome = ActionOutcome::success("Event created", json!({"event_id": "evt_1"}));
        let effects = step(&mut state, &f.ctx(), SessionEvent::ActionFinished(outcome));

        assert_eq!(state.current_node_id(), "goodbye");
        assert!(state.is_ended());
        assert_eq!(state.collected.get_str("book.status"), Some("success"));
        assert_eq!(state.collected.get("book.result").unwrap()["event_id"], "evt_1");

        let tail: Vec<&Effect> = effects
            .iter()
            .filter(|e| !matches!(e, Effect::Publish(_)))
            .collect();
        assert!(matches!(tail[0], Effect::Speak { stage: SpeechStage::ActionResult, .. }));
        assert!(matches!(tail[1], Effect::SayGoodbye { node_id } if node_id == "goodbye"));
        assert_eq!(tail[2], &Effect::ReleaseConduit);
        assert!(matches!(tail[3], Effect::EndSession { .. }));

        // Ended sessions ignore further input.
        assert!(step(&mut state, &f.ctx(), SessionEvent::UserUtterance("hello?".into())).is_empty());
    }

    #[test]
    fn test_action_failure_apologizes_and_stays() {
        let f = Fixture::new(fixtures::booking_pathway());
        let (mut state, _) = walk_to_booking(&f);
        let ctx = f.ctx();

        let effects = step(&mut state, &ctx, SessionEvent::ActionFinished(ActionOutcome::error("403")));
        assert_eq!(state.current_node_id(), "book");
        assert_eq!(spoken(&effects)[0].0, SpeechStage::Apology);
        assert_eq!(state.collected.get_str("book.status"), Some("error"));

        // The next caller turn retries the integration.
        let retry = step(&mut state, &ctx, SessionEvent::UserUtterance("try again".into()));
        assert!(matches!(&retry[0], Effect::RunAction { node_id, .. } if node_id == "book"));
        match state.executor("book") {
            Some(NodeExecutor::Action(e)) => {
                assert_eq!(e.attempts, 2);
                assert_eq!(e.last_status, Some(ActionStatus::Error));
            }
            other => panic!("unexpected executor {other:?}"),
        }
    }

    #[test]
    fn test_action_self_loop_never_transitions() {
        let f = Fixture::new(fixtures::self_loop_action_pathway());
        let (mut state, _) = f.started();
        let ctx = f.ctx();
        transition(&mut state, &ctx, "Sync CRM");
        assert_eq!(state.current_node_id(), "sync");

        let effects = step(&mut state, &ctx, SessionEvent::ActionFinished(ActionOutcome::success("ok", json!({}))));
        assert_eq!(state.current_node_id(), "sync");
        assert!(!effects.iter().any(|e| matches!(e, Effect::RunAction { .. })));
        assert!(!effects
            .iter()
            .any(|e| matches!(e, Effect::Publish(EngineEvent::TransitionApplied { .. }))));
        assert_eq!(state.history, vec!["start", "sync"]);
    }

    #[test]
    fn test_action_skips_self_edge_for_real_exit() {
        let f = Fixture::new(json!({
            "nodes": [
                {"id": "start", "name": "Start", "type": "conversation", "prompt": "Chat.", "isStart": true},
                {"id": "sync", "name": "Sync CRM", "type": "action", "prompt": "Sync.",
                 "action": {"integration": "crm", "operation": "upsert", "parameters": {}}},
                {"id": "end", "name": "End", "type": "terminal", "prompt": ""}
            ],
            "edges": [
                {"source": "start", "target": "sync", "condition": "ready"},
                {"source": "sync", "target": "sync", "condition": "again"},
                {"source": "sync", "target": "end", "condition": "done"}
            ]
        }));
        let (mut state, _) = f.started();
        let ctx = f.ctx();
        transition(&mut state, &ctx, "Sync CRM");
        assert_eq!(state.current_node_id(), "sync");

        let effects = step(&mut state, &ctx, SessionEvent::ActionFinished(ActionOutcome::success("ok", json!({}))));
        assert_eq!(state.current_node_id(), "end");
        assert!(state.is_ended());
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Publish(EngineEvent::TransitionApplied { to, .. }) if to == "end"
        )));
        assert_eq!(state.history, vec!["start", "sync", "end"]);
    }

    #[test]
    fn test_transition_rejected_at_action_node() {
        let f = Fixture::new(fixtures::booking_pathway());
        let (mut state, _) = walk_to_booking(&f);
        let (reply, effects) = request_transition(&mut state, &f.ctx(), "Welcome");
        assert!(matches!(reply, TransitionReply::Rejected { .. }));
        assert!(effects.is_empty());
        assert!(state.pending.is_none());
    }

    #[test]
    fn test_hangup_ends_once() {
        let f = Fixture::new(fixtures::two_node_pathway());
        let (mut state, _) = f.started();
        let ctx = f.ctx();
        let effects = step(&mut state, &ctx, SessionEvent::Hangup);
        assert_eq!(effects, vec![Effect::EndSession { reason: "hangup".into() }]);
        assert!(state.is_ended());
        assert!(step(&mut state, &ctx, SessionEvent::Hangup).is_empty());
    }

    #[test]
    fn test_start_is_idempotent() {
        let f = Fixture::new(fixtures::two_node_pathway());
        let (mut state, _) = f.started();
        assert!(step(&mut state, &f.ctx(), SessionEvent::Start).is_empty());
        assert_eq!(state.history, vec!["a"]);
    }
}
