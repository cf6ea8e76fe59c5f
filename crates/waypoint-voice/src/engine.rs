use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use waypoint_core::config::VoiceConfig;
use waypoint_core::types::{SpeechStage, VoiceSettings};

use crate::analysis::{analyze_text, clamp_unit, MessageAnalysis};

pub const MIN_SPEED: f64 = 0.85;
pub const MAX_SPEED: f64 = 1.15;
pub const MIN_DELAY_SECS: f64 = 0.01;
pub const MAX_DELAY_SECS: f64 = 0.10;
const BASE_DELAY_SECS: f64 = 0.02;

/// Interruptions are allowed once urgency + energy reaches this.
const INTERRUPTION_THRESHOLD: f64 = 0.6;

/// Pause inserted before an utterance starts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NaturalTiming {
    pub pre_speech_delay_secs: f64,
}

impl NaturalTiming {
    pub fn as_duration(&self) -> Duration {
        Duration::from_secs_f64(self.pre_speech_delay_secs)
    }
}

/// Everything voice adaptation decided for one utterance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptationDecision {
    /// Analysis after smoothing; this is what settings were derived from.
    pub analysis: MessageAnalysis,
    pub voice: VoiceSettings,
    pub timing: NaturalTiming,
    /// True when the update fell inside the minimum interval and used smoothed values.
    pub rate_limited: bool,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    sentiment: f64,
    energy: f64,
}

/// Per-call adaptation state: rolling sentiment/energy history plus a rate limiter.
pub struct VoiceAdaptationEngine {
    config: VoiceConfig,
    history: VecDeque<Sample>,
    last_update: Option<Instant>,
}

impl VoiceAdaptationEngine {
    pub fn new(config: VoiceConfig) -> Self {
        let capacity = config.history_size;
        Self {
            config,
            history: VecDeque::with_capacity(capacity),
            last_update: None,
        }
    }

    /// Adapt an utterance about to be spoken now.
    pub fn adapt(&mut self, text: &str, stage: SpeechStage) -> AdaptationDecision {
        self.adapt_at(text, stage, Instant::now())
    }

    /// Adapt an utterance as of `now`. Exposed so callers can drive the rate limiter
    /// with their own clock.
    pub fn adapt_at(&mut self, text: &str, stage: SpeechStage, now: Instant) -> AdaptationDecision {
        let raw = analyze_text(text);
        let min_interval = Duration::from_millis(self.config.min_update_interval_ms);
        let rate_limited = self
            .last_update
            .is_some_and(|last| now.saturating_duration_since(last) < min_interval);

        let mut analysis = raw.clone();
        if let Some(smoothed) = self.smoothed() {
            if rate_limited {
                analysis.sentiment = smoothed.sentiment;
                analysis.energy = smoothed.energy;
            } else {
                let w = self.config.history_influence;
                analysis.sentiment = (1.0 - w) * raw.sentiment + w * smoothed.sentiment;
                analysis.energy = (1.0 - w) * raw.energy + w * smoothed.energy;
            }
        }
        analysis.sentiment = analysis.sentiment.clamp(-1.0, 1.0);
        analysis.energy = clamp_unit(analysis.energy);

        if !rate_limited {
            self.last_update = Some(now);
        }
        self.record(Sample {
            sentiment: raw.sentiment,
            energy: raw.energy,
        });

        let voice = voice_settings(&analysis, stage);
        let timing = natural_timing(&analysis, stage);

        debug!(
            stage = %stage,
            sentiment = analysis.sentiment,
            energy = analysis.energy,
            speed = voice.speed,
            delay_secs = timing.pre_speech_delay_secs,
            rate_limited,
            "Voice adaptation computed"
        );

        AdaptationDecision {
            analysis,
            voice,
            timing,
            rate_limited,
        }
    }

    /// Number of samples currently held.
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    fn record(&mut self, sample: Sample) {
        self.history.push_back(sample);
        while self.history.len() > self.config.history_size {
            self.history.pop_front();
        }
    }

    /// Average of the most recent `smoothing_window` samples.
    fn smoothed(&self) -> Option<Sample> {
        if self.history.is_empty() {
            return None;
        }
        let window = self.config.smoothing_window.min(self.history.len());
        let recent = self.history.iter().rev().take(window);
        let (s, e) = recent.fold((0.0, 0.0), |(s, e), sample| {
            (s + sample.sentiment, e + sample.energy)
        });
        Some(Sample {
            sentiment: s / window as f64,
            energy: e / window as f64,
        })
    }
}

fn stage_speed_nudge(stage: SpeechStage) -> f64 {
    match stage {
        SpeechStage::Greeting => 0.03,
        SpeechStage::Acknowledgment => 0.02,
        SpeechStage::Explanation => -0.05,
        SpeechStage::Clarification => -0.03,
        SpeechStage::Apology => -0.04,
        SpeechStage::Goodbye => -0.02,
        SpeechStage::Conversation | SpeechStage::ActionResult => 0.0,
    }
}

fn stage_delay_nudge(stage: SpeechStage) -> f64 {
    match stage {
        SpeechStage::Greeting | SpeechStage::Acknowledgment => -0.005,
        SpeechStage::Explanation | SpeechStage::Apology | SpeechStage::Goodbye => 0.01,
        SpeechStage::Clarification => 0.005,
        SpeechStage::Conversation | SpeechStage::ActionResult => 0.0,
    }
}

fn voice_settings(analysis: &MessageAnalysis, stage: SpeechStage) -> VoiceSettings {
    let speed = 1.0 + (analysis.energy - 0.5) * 0.12 + analysis.urgency * 0.08
        - analysis.complexity * 0.1
        + stage_speed_nudge(stage);

    let interruptions_enabled = stage != SpeechStage::Goodbye
        && analysis.urgency + analysis.energy >= INTERRUPTION_THRESHOLD;

    VoiceSettings {
        speed: round2(speed.clamp(MIN_SPEED, MAX_SPEED)),
        emotions: emotion_map(analysis),
        interruptions_enabled,
    }
}

fn emotion_map(analysis: &MessageAnalysis) -> BTreeMap<String, f64> {
    let mut emotions = BTreeMap::new();
    let sentiment = analysis.sentiment;
    let energy = analysis.energy;

    if sentiment > 0.2 {
        emotions.insert("positivity".to_string(), round2(sentiment));
        if energy > 0.6 {
            emotions.insert("excitement".to_string(), round2(energy));
        }
    } else if sentiment < -0.2 {
        emotions.insert("empathy".to_string(), round2(-sentiment));
        if energy > 0.6 {
            emotions.insert("concern".to_string(), round2(energy));
        }
    } else {
        emotions.insert("calm".to_string(), round2((1.0 - energy).max(0.3)));
    }

    if analysis.has_question {
        emotions.insert("curiosity".to_string(), 0.5);
    }
    emotions
}

fn natural_timing(analysis: &MessageAnalysis, stage: SpeechStage) -> NaturalTiming {
    let delay = BASE_DELAY_SECS + analysis.complexity * 0.03 + (-analysis.sentiment).max(0.0) * 0.02
        - analysis.urgency * 0.02
        + stage_delay_nudge(stage);
    NaturalTiming {
        pre_speech_delay_secs: delay.clamp(MIN_DELAY_SECS, MAX_DELAY_SECS),
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> VoiceAdaptationEngine {
        VoiceAdaptationEngine::new(VoiceConfig::default())
    }

    const ALL_STAGES: [SpeechStage; 8] = [
        SpeechStage::Greeting,
        SpeechStage::Acknowledgment,
        SpeechStage::Conversation,
        SpeechStage::Explanation,
        SpeechStage::Clarification,
        SpeechStage::ActionResult,
        SpeechStage::Apology,
        SpeechStage::Goodbye,
    ];

    #[test]
    fn test_outputs_stay_in_bounds_for_any_text() {
        let long = "a very long rambling sentence with many clauses, asides; and more ".repeat(20);
        let texts = [
            "",
            "   ",
            "!!!!!!!!!!!!",
            "URGENT EMERGENCY HELP NOW ASAP!!!",
            "This is terrible, awful, the worst; I hate it (really) - broken, wrong, bad.",
            long.as_str(),
            "great wonderful perfect thanks",
            "?",
        ];
        let mut engine = engine();
        let start = Instant::now();
        for (i, text) in texts.iter().enumerate() {
            for (j, stage) in ALL_STAGES.iter().enumerate() {
                let now = start + Duration::from_millis((i * 10 + j) as u64 * 137);
                let d = engine.adapt_at(text, *stage, now);
                assert!(
                    (MIN_DELAY_SECS..=MAX_DELAY_SECS).contains(&d.timing.pre_speech_delay_secs),
                    "delay out of range for {:?}",
                    text
                );
                assert!(
                    (MIN_SPEED..=MAX_SPEED).contains(&d.voice.speed),
                    "speed out of range for {:?}",
                    text
                );
            }
        }
    }

    #[test]
    fn test_high_urgency_sequence_keeps_delay_minimal() {
        let mut engine = engine();
        let start = Instant::now();
        for i in 0..10 {
            // Every other update lands inside the rate-limit window.
            let now = start + Duration::from_millis(i * 300);
            let d = engine.adapt_at("URGENT! I need help RIGHT NOW!!!", SpeechStage::Conversation, now);
            assert!(d.analysis.urgency > 0.99);
            assert!(d.analysis.energy > 0.8);
            let delay = d.timing.pre_speech_delay_secs;
            assert!((0.01..=0.02).contains(&delay), "delay {} at step {}", delay, i);
            assert!(d.voice.interruptions_enabled);
        }
    }

    #[test]
    fn test_rate_limited_update_uses_smoothed_history() {
        let mut engine = engine();
        let start = Instant::now();

        let first = engine.adapt_at("This is great, thanks!", SpeechStage::Conversation, start);
        assert!(!first.rate_limited);
        assert!(first.analysis.sentiment > 0.9);

        let second = engine.adapt_at(
            "This is terrible",
            SpeechStage::Conversation,
            start + Duration::from_millis(100),
        );
        assert!(second.rate_limited);
        // Smoothed over the single positive sample, not the raw negative one.
        assert!(second.analysis.sentiment > 0.9);
        assert_eq!(engine.history_len(), 2);
    }

    #[test]
    fn test_history_influence_blends_outside_rate_limit() {
        let mut engine = engine();
        let start = Instant::now();
        engine.adapt_at("great", SpeechStage::Conversation, start);
        let d = engine.adapt_at("terrible", SpeechStage::Conversation, start + Duration::from_secs(2));
        assert!(!d.rate_limited);
        // 0.7 * -1.0 + 0.3 * 1.0
        assert!((d.analysis.sentiment + 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut engine = engine();
        let start = Instant::now();
        for i in 0..25 {
            engine.adapt_at("hello", SpeechStage::Conversation, start + Duration::from_secs(i));
        }
        assert_eq!(engine.history_len(), VoiceConfig::default().history_size);
    }

    #[test]
    fn test_goodbye_never_allows_interruptions() {
        let mut engine = engine();
        let d = engine.adapt("HELP NOW!!! URGENT!!!", SpeechStage::Goodbye);
        assert!(!d.voice.interruptions_enabled);
    }

    #[test]
    fn test_calm_text_disallows_interruptions() {
        let mut engine = engine();
        let d = engine.adapt("I would like to book a table for two.", SpeechStage::Conversation);
        assert!(!d.voice.interruptions_enabled);
        assert!(d.voice.emotions.contains_key("calm"));
    }

    #[test]
    fn test_stage_nudges_speed() {
        let text = "Your appointment is booked for Tuesday";
        let greeting = engine().adapt(text, SpeechStage::Greeting);
        let explanation = engine().adapt(text, SpeechStage::Explanation);
        assert!(greeting.voice.speed > explanation.voice.speed);
        assert!(greeting.timing.pre_speech_delay_secs < explanation.timing.pre_speech_delay_secs);
    }

    #[test]
    fn test_emotion_map_is_deterministic() {
        let a = engine().adapt("Is that great news?", SpeechStage::Conversation);
        let b = engine().adapt("Is that great news?", SpeechStage::Conversation);
        assert_eq!(a.voice.emotions, b.voice.emotions);
        assert!(a.voice.emotions.contains_key("positivity"));
        assert_eq!(a.voice.emotions.get("curiosity"), Some(&0.5));
    }
}
