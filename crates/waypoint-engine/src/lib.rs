//! Waypoint engine: runs phone calls through a pathway.
//!
//! A `PathwayGraph` describes the call flow. Each call gets a `CallSession`
//! that owns its `SessionState` and drives the pure state machine in
//! [`machine`]: conversation nodes talk, condition nodes pick a branch,
//! action nodes call integrations through the `ActionGateway`, terminal
//! nodes say goodbye and release the line. Transition requests from the
//! controlling intelligence are resolved by the `TransitionResolver`.
//! `CallRuntime` runs each session on its own task.

pub mod executor;
pub mod graph;
pub mod machine;
pub mod metrics;
pub mod resolver;
pub mod runtime;
pub mod session;

#[cfg(test)]
mod test_support;

pub use executor::{
    node_instructions, transition_tool, CallServices, CallSession, SpokenUtterance,
    TRANSITION_TOOL,
};
pub use graph::{Edge, Node, NodeKind, PathwayConfig, PathwayGraph, PathwayWarning};
pub use machine::{Effect, MachineContext, SessionEvent, TransitionReply};
pub use metrics::{
    HttpMetricsSink, MetricsEmitter, StageTimer, StageTiming, TracingMetricsSink,
    UtteranceMetrics,
};
pub use resolver::{similarity, MatchStrategy, Resolution, TransitionResolver};
pub use runtime::{CallHandle, CallInput, CallRuntime, SessionSummary};
pub use session::{CollectedData, NodeExecutor, SessionPhase, SessionState};
