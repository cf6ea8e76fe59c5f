//! Voice adaptation: per-utterance speech timing and prosody hints.
//!
//! Every utterance the engine speaks is first run through a
//! `VoiceAdaptationEngine`, which scores the text with cheap lexical
//! heuristics (`MessageAnalysis`), smooths the emotional signal against a
//! short rolling history, and derives `VoiceSettings` (speed, emotion hints,
//! whether the caller may barge in) plus a `NaturalTiming` pre-speech delay.
//!
//! One engine per call. History and rate limiting are never shared.

pub mod analysis;
pub mod engine;

pub use analysis::{analyze_text, MessageAnalysis};
pub use engine::{AdaptationDecision, NaturalTiming, VoiceAdaptationEngine};
pub use waypoint_core::types::VoiceSettings;
