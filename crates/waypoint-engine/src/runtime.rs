use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use waypoint_core::config::EngineConfig;
use waypoint_core::error::{Result, WaypointError};
use waypoint_core::types::CallId;

use crate::executor::{CallServices, CallSession};
use crate::graph::PathwayGraph;

/// Input from the hosting telephony layer.
#[derive(Debug, Clone)]
pub enum CallInput {
    /// A transcribed caller utterance.
    Utterance(String),
    /// A value extracted by the host, made available to templates and prompts.
    Collect {
        key: String,
        value: serde_json::Value,
    },
}

/// What a finished call looked like.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub call_id: CallId,
    pub final_node_id: String,
    pub visited: Vec<String>,
    /// Utterances that reached the caller.
    pub utterances: usize,
    pub collected: HashMap<String, serde_json::Value>,
    pub ended_reason: Option<String>,
}

/// Host-side handle to a running call.
pub struct CallHandle {
    call_id: CallId,
    inbox: mpsc::Sender<CallInput>,
    cancel: CancellationToken,
    task: JoinHandle<SessionSummary>,
}

impl CallHandle {
    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    /// Queue a caller utterance. Fails once the call has ended.
    pub async fn say(&self, text: impl Into<String>) -> Result<()> {
        self.send(CallInput::Utterance(text.into())).await
    }

    pub async fn collect(&self, key: impl Into<String>, value: serde_json::Value) -> Result<()> {
        self.send(CallInput::Collect {
            key: key.into(),
            value,
        })
        .await
    }

    async fn send(&self, input: CallInput) -> Result<()> {
        self.inbox
            .send(input)
            .await
            .map_err(|_| WaypointError::SessionEnded(self.call_id.to_string()))
    }

    /// Hang up now, abandoning in-flight reasoning, synthesis and queued input.
    pub fn hangup(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop accepting input, let queued input finish, and wait for the call to end.
    pub async fn finish(self) -> Result<SessionSummary> {
        drop(self.inbox);
        self.task
            .await
            .map_err(|e| WaypointError::SessionEnded(format!("call task failed: {}", e)))
    }
}

/// Spawns one task per call.
///
/// Calls share the collaborators and an `Arc<PathwayGraph>`; each task owns
/// its own `CallSession`, so state, voice history and cancellation are per call.
#[derive(Clone)]
pub struct CallRuntime {
    config: Arc<EngineConfig>,
    services: CallServices,
}

impl CallRuntime {
    pub fn new(config: Arc<EngineConfig>, services: CallServices) -> Self {
        Self { config, services }
    }

    /// Start a call on `graph`, seeded with the host's call variables.
    pub fn spawn(
        &self,
        call_id: CallId,
        graph: Arc<PathwayGraph>,
        variables: HashMap<String, serde_json::Value>,
    ) -> CallHandle {
        let (tx, rx) = mpsc::channel(self.config.session.inbox_capacity);
        let cancel = CancellationToken::new();
        let session = CallSession::new(
            call_id.clone(),
            graph,
            self.config.clone(),
            self.services.clone(),
        )
        .with_collected(variables)
        .with_cancellation(cancel.clone());

        info!(call_id = %call_id, "Spawning call");
        let task = tokio::spawn(run_call(session, rx));
        CallHandle {
            call_id,
            inbox: tx,
            cancel,
            task,
        }
    }
}

async fn run_call(mut session: CallSession, mut inbox: mpsc::Receiver<CallInput>) -> SessionSummary {
    let cancel = session.cancellation_token();
    let mut utterances = session.start().await.len();

    while !session.is_ended() {
        let input = tokio::select! {
            input = inbox.recv() => input,
            _ = cancel.cancelled() => None,
        };
        match input {
            Some(CallInput::Utterance(text)) => {
                utterances += session.handle_user_utterance(&text).await.len();
            }
            Some(CallInput::Collect { key, value }) => session.collect(key, value),
            None => break,
        }
    }

    if !session.is_ended() {
        debug!(call_id = %session.call_id(), "Inbox closed or call cancelled, hanging up");
        session.hangup().await;
    }

    let state = session.state();
    SessionSummary {
        call_id: state.call_id.clone(),
        final_node_id: state.current_node_id().to_string(),
        visited: state.history.clone(),
        utterances,
        collected: state.collected.data().clone(),
        ended_reason: state.ended_reason.clone(),
    }
}
