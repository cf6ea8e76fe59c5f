use std::sync::Arc;

use waypoint_actions::{ActionGateway, StaticCredentialSource};
use waypoint_core::config::{EngineConfig, MetricsConfig};
use waypoint_core::event::EventBus;
use waypoint_core::types::CallId;
use waypoint_test_utils::{
    MockActionBackend, RecordingConduit, RecordingMetricsSink, RecordingSynthesizer, ScriptedLlm,
    ScriptedReply,
};

use crate::executor::{CallServices, CallSession};
use crate::graph::PathwayGraph;
use crate::metrics::MetricsEmitter;

/// Mocks behind one set of `CallServices`, kept for assertions.
pub struct Harness {
    pub llm: Arc<ScriptedLlm>,
    pub synthesizer: Arc<RecordingSynthesizer>,
    pub conduit: Arc<RecordingConduit>,
    pub backend: Arc<MockActionBackend>,
    pub sink: Arc<RecordingMetricsSink>,
    pub event_bus: Arc<EventBus>,
    pub metrics: Arc<MetricsEmitter>,
    pub config: Arc<EngineConfig>,
}

impl Harness {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self::with_parts(
            replies,
            RecordingConduit::new(),
            MockActionBackend::succeeding(serde_json::json!({"event_id": "evt_1"})),
            RecordingMetricsSink::new(),
        )
    }

    pub fn with_parts(
        replies: Vec<ScriptedReply>,
        conduit: RecordingConduit,
        backend: MockActionBackend,
        sink: RecordingMetricsSink,
    ) -> Self {
        let mut config = EngineConfig::default();
        config.metrics = MetricsConfig {
            enabled: true,
            sink_url: None,
            emit_timeout_ms: 200,
        };
        let sink = Arc::new(sink);
        let metrics = Arc::new(MetricsEmitter::new(&config.metrics, sink.clone()));
        Self {
            llm: Arc::new(ScriptedLlm::new(replies)),
            synthesizer: Arc::new(RecordingSynthesizer::new()),
            conduit: Arc::new(conduit),
            backend: Arc::new(backend),
            sink,
            event_bus: Arc::new(EventBus::default()),
            metrics,
            config: Arc::new(config),
        }
    }

    pub fn services(&self) -> CallServices {
        let credentials = StaticCredentialSource::new()
            .with("calendar", r#"{"access_token":"cal-token"}"#)
            .with("crm", r#"{"access_token":"crm-token"}"#);
        CallServices {
            llm: self.llm.clone(),
            synthesizer: self.synthesizer.clone(),
            conduit: self.conduit.clone(),
            gateway: Arc::new(ActionGateway::new(
                &self.config.actions,
                self.backend.clone(),
                Arc::new(credentials),
            )),
            metrics: self.metrics.clone(),
            event_bus: self.event_bus.clone(),
        }
    }

    pub fn session(&self, pathway: serde_json::Value) -> CallSession {
        CallSession::new(CallId::new(), graph(pathway), self.config.clone(), self.services())
    }
}

pub fn graph(pathway: serde_json::Value) -> Arc<PathwayGraph> {
    Arc::new(PathwayGraph::from_config(serde_json::from_value(pathway).unwrap()).unwrap())
}
