use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use serde_json::json;

use waypoint_actions::{seal_envelope, ActionGateway, StaticCredentialSource};
use waypoint_core::config::EngineConfig;
use waypoint_core::event::EventBus;
use waypoint_core::types::{CallId, EngineEvent};
use waypoint_engine::{CallRuntime, CallServices, MetricsEmitter, PathwayGraph};
use waypoint_test_utils::{
    fixtures, MockActionBackend, RecordingConduit, RecordingMetricsSink, RecordingSynthesizer,
    ScriptedLlm, ScriptedReply,
};

const SECRET: &str = "integration-secret";

fn write_pathway(value: &serde_json::Value) -> tempfile::NamedTempFile {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(value.to_string().as_bytes())
        .expect("write pathway");
    tmp
}

#[tokio::test]
async fn test_booking_call_end_to_end() {
    let pathway_file = write_pathway(&fixtures::booking_pathway());
    let graph = Arc::new(PathwayGraph::load(pathway_file.path()).expect("load pathway"));

    let mut config = EngineConfig::default();
    config.actions.credential_key = Some(SECRET.to_string());
    let config = Arc::new(config);

    let llm = Arc::new(ScriptedLlm::new(vec![
        ScriptedReply::transition("Happy to book that for you.", "sched appt"),
        ScriptedReply::transition("Perfect, booking Tuesday at three.", "Book Slot"),
    ]));
    let synthesizer = Arc::new(RecordingSynthesizer::new());
    let conduit = Arc::new(RecordingConduit::new());
    let backend = Arc::new(MockActionBackend::succeeding(json!({"event_id": "evt_42"})));
    let sink = Arc::new(RecordingMetricsSink::new());
    let event_bus = Arc::new(EventBus::default());
    let mut events = event_bus.subscribe();

    let blob = seal_envelope(SECRET, r#"{"access_token":"cal-live-token"}"#).expect("seal");
    let credentials = StaticCredentialSource::new().with("calendar", blob);

    let metrics = Arc::new(MetricsEmitter::new(&config.metrics, sink.clone()));
    let services = CallServices {
        llm: llm.clone(),
        synthesizer: synthesizer.clone(),
        conduit: conduit.clone(),
        gateway: Arc::new(ActionGateway::new(
            &config.actions,
            backend.clone(),
            Arc::new(credentials),
        )),
        metrics: metrics.clone(),
        event_bus: event_bus.clone(),
    };
    let runtime = CallRuntime::new(config.clone(), services);

    let mut variables = HashMap::new();
    variables.insert("caller_name".to_string(), json!("Ada Lovelace"));
    let call = runtime.spawn(CallId::from_str("call-e2e"), graph, variables);

    call.say("Hi, I'd like to make an appointment").await.unwrap();
    call.collect("slot", json!("2024-06-04T15:00:00Z")).await.unwrap();
    call.say("Tuesday at three works").await.unwrap();
    let summary = call.finish().await.expect("call task");

    assert_eq!(summary.final_node_id, "goodbye");
    assert_eq!(summary.ended_reason.as_deref(), Some("terminal"));
    assert_eq!(
        summary.visited,
        vec!["welcome", "schedule", "book", "goodbye"]
    );
    assert_eq!(summary.collected["book.status"], "success");
    assert_eq!(summary.collected["book.result"]["event_id"], "evt_42");

    let calls = backend.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1, "cal-live-token");
    assert_eq!(calls[0].0.parameters["summary"], "Appointment for Ada Lovelace");

    let texts = synthesizer.texts();
    assert_eq!(texts.first().map(String::as_str), Some("Hi! This is the front desk. How can I help?"));
    assert_eq!(texts.last().map(String::as_str), Some("Thank you for calling. Goodbye!"));
    assert_eq!(conduit.released(), vec![CallId::from_str("call-e2e")]);

    // One metrics event per spoken utterance.
    metrics.flush().await;
    assert_eq!(sink.events().len(), texts.len());
    assert_eq!(summary.utterances, texts.len());

    let mut strategies = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::TransitionApplied { strategy, .. } = event {
            strategies.push(strategy);
        }
    }
    assert_eq!(strategies, vec!["similarity", "exact", "auto"]);
}

#[tokio::test]
async fn test_unresolvable_request_keeps_call_on_node() {
    let graph = Arc::new(
        PathwayGraph::from_config(serde_json::from_value(fixtures::two_node_pathway()).unwrap())
            .unwrap(),
    );
    let config = Arc::new(EngineConfig::default());
    let synthesizer = Arc::new(RecordingSynthesizer::new());
    let services = CallServices {
        llm: Arc::new(ScriptedLlm::new(vec![ScriptedReply::transition(
            "Let me see.",
            "zzz",
        )])),
        synthesizer: synthesizer.clone(),
        conduit: Arc::new(RecordingConduit::new()),
        gateway: Arc::new(ActionGateway::new(
            &config.actions,
            Arc::new(MockActionBackend::succeeding(json!({}))),
            Arc::new(StaticCredentialSource::new()),
        )),
        metrics: Arc::new(MetricsEmitter::new(
            &config.metrics,
            Arc::new(RecordingMetricsSink::new()),
        )),
        event_bus: Arc::new(EventBus::default()),
    };

    let call = CallRuntime::new(config.clone(), services).spawn(CallId::new(), graph, HashMap::new());
    call.say("take me somewhere else").await.unwrap();
    let summary = call.finish().await.unwrap();

    assert_eq!(summary.final_node_id, "a");
    assert_eq!(summary.visited, vec!["a"]);
    let last = synthesizer.texts().pop().unwrap();
    assert!(last.starts_with(&config.session.clarification_template));
    assert!(last.contains("B"));
}
