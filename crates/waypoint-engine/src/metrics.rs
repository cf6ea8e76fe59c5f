use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use waypoint_core::config::MetricsConfig;
use waypoint_core::error::{Result, WaypointError};
use waypoint_core::traits::MetricsSink;
use waypoint_core::types::{CallId, SpeechStage, VoiceSettings};

/// Measures one pipeline stage: time to first output and total duration.
#[derive(Debug, Clone)]
pub struct StageTimer {
    started: Instant,
    first: Option<Duration>,
}

impl StageTimer {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
            first: None,
        }
    }

    /// Record first output. Later calls are ignored.
    pub fn mark_first(&mut self) {
        if self.first.is_none() {
            self.first = Some(self.started.elapsed());
        }
    }

    pub fn finish(self) -> StageTiming {
        let total = self.started.elapsed();
        StageTiming {
            first_ms: self.first.unwrap_or(total).as_millis() as u64,
            total_ms: total.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageTiming {
    pub first_ms: u64,
    pub total_ms: u64,
}

/// Adaptation applied to an utterance, as reported in metrics.
#[derive(Debug, Clone, Serialize)]
pub struct AdaptationSummary {
    pub speed: f64,
    pub emotions: BTreeMap<String, f64>,
    pub interruptions_enabled: bool,
}

impl From<&VoiceSettings> for AdaptationSummary {
    fn from(voice: &VoiceSettings) -> Self {
        Self {
            speed: voice.speed,
            emotions: voice.emotions.clone(),
            interruptions_enabled: voice.interruptions_enabled,
        }
    }
}

/// Latency breakdown for one spoken utterance.
#[derive(Debug, Clone, Serialize)]
pub struct UtteranceMetrics {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub call_id: CallId,
    pub stage: SpeechStage,
    pub node_id: String,
    pub pre_speech_delay_ms: u64,
    pub synthesis_ttfb_ms: u64,
    pub synthesis_total_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_ttft_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_total_ms: Option<u64>,
    pub adaptation: AdaptationSummary,
    pub timestamp: DateTime<Utc>,
}

impl UtteranceMetrics {
    pub const KIND: &'static str = "utterance_metrics";

    pub fn new(
        call_id: CallId,
        node_id: impl Into<String>,
        stage: SpeechStage,
        voice: &VoiceSettings,
    ) -> Self {
        Self {
            kind: Self::KIND,
            call_id,
            stage,
            node_id: node_id.into(),
            pre_speech_delay_ms: 0,
            synthesis_ttfb_ms: 0,
            synthesis_total_ms: 0,
            reasoning_ttft_ms: None,
            reasoning_total_ms: None,
            adaptation: voice.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_synthesis(mut self, timing: StageTiming) -> Self {
        self.synthesis_ttfb_ms = timing.first_ms;
        self.synthesis_total_ms = timing.total_ms;
        self
    }

    pub fn with_reasoning(mut self, timing: Option<StageTiming>) -> Self {
        if let Some(timing) = timing {
            self.reasoning_ttft_ms = Some(timing.first_ms);
            self.reasoning_total_ms = Some(timing.total_ms);
        }
        self
    }

    pub fn with_pre_speech_delay(mut self, delay: Duration) -> Self {
        self.pre_speech_delay_ms = delay.as_millis() as u64;
        self
    }
}

/// Forwards utterance metrics to a sink without ever failing or stalling the call.
///
/// `record` hands each event to a background task and returns at once; the
/// sink only ever sees the event after the utterance has moved on.
pub struct MetricsEmitter {
    sink: Arc<dyn MetricsSink>,
    enabled: bool,
    timeout: Duration,
    tasks: TaskTracker,
}

impl MetricsEmitter {
    pub fn new(config: &MetricsConfig, sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            sink,
            enabled: config.enabled,
            timeout: Duration::from_millis(config.emit_timeout_ms),
            tasks: TaskTracker::new(),
        }
    }

    /// HTTP sink when `sink_url` is set, log lines otherwise.
    pub fn from_config(config: &MetricsConfig) -> Result<Self> {
        let sink: Arc<dyn MetricsSink> = match &config.sink_url {
            Some(url) => Arc::new(HttpMetricsSink::new(url.clone())?),
            None => Arc::new(TracingMetricsSink),
        };
        Ok(Self::new(config, sink))
    }

    /// Queue one event for delivery on a background task.
    pub fn record(&self, metrics: UtteranceMetrics) {
        if !self.enabled {
            return;
        }
        let sink = self.sink.clone();
        let timeout = self.timeout;
        self.tasks.spawn(async move {
            deliver(sink.as_ref(), timeout, &metrics).await;
        });
    }

    /// Send one event and wait for the sink, bounded by the timeout.
    /// Failures and timeouts are logged and dropped.
    pub async fn emit(&self, metrics: &UtteranceMetrics) {
        if !self.enabled {
            return;
        }
        deliver(self.sink.as_ref(), self.timeout, metrics).await;
    }

    /// Wait until every queued event has been delivered or timed out.
    pub async fn flush(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    /// Events still being delivered.
    pub fn pending(&self) -> usize {
        self.tasks.len()
    }
}

async fn deliver(sink: &dyn MetricsSink, timeout: Duration, metrics: &UtteranceMetrics) {
    let event = match serde_json::to_value(metrics) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "Failed to serialize utterance metrics");
            return;
        }
    };
    match tokio::time::timeout(timeout, sink.emit(event)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(call_id = %metrics.call_id, error = %e, "Metrics sink failed"),
        Err(_) => warn!(
            call_id = %metrics.call_id,
            timeout_ms = timeout.as_millis() as u64,
            "Metrics sink timed out"
        ),
    }
}

/// Writes each event as a structured log line.
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn emit(&self, event: serde_json::Value) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            info!(target: "waypoint::metrics", event = %event, "Utterance metrics");
            Ok(())
        })
    }
}

/// POSTs each event as JSON to a collector endpoint.
pub struct HttpMetricsSink {
    client: reqwest::Client,
    url: String,
}

impl HttpMetricsSink {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| WaypointError::Metrics(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl MetricsSink for HttpMetricsSink {
    fn emit(&self, event: serde_json::Value) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let response = self
                .client
                .post(&self.url)
                .json(&event)
                .send()
                .await
                .map_err(|e| WaypointError::Metrics(e.to_string()))?;
            if !response.status().is_success() {
                return Err(WaypointError::Metrics(format!(
                    "collector returned {}",
                    response.status()
                )));
            }
            Ok(())
        })
    }
}
