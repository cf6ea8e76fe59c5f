use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, WaypointError};

/// Top-level Waypoint configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub voice: VoiceConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub actions: ActionsConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Controlling intelligence settings, passed through to the `LlmClient`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model_id")]
    pub model_id: String,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model_id: default_model_id(),
            api_key: None,
            base_url: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

fn default_provider() -> String { "openai".to_string() }
fn default_model_id() -> String { "gpt-4o-mini".to_string() }
fn default_max_tokens() -> u32 { 512 }
fn default_temperature() -> f32 { 0.3 }

/// Transition target resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Minimum similarity ratio for a fuzzy name match.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
        }
    }
}

fn default_similarity_threshold() -> f64 { 0.6 }

/// Voice adaptation tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    /// Number of sentiment/energy samples kept per call.
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    /// How many of the most recent samples form the smoothed average.
    #[serde(default = "default_smoothing_window")]
    pub smoothing_window: usize,
    /// Updates closer together than this are rate-limited to the smoothed values.
    #[serde(default = "default_min_update_interval_ms")]
    pub min_update_interval_ms: u64,
    /// Weight of smoothed history when blending with the current utterance.
    #[serde(default = "default_history_influence")]
    pub history_influence: f64,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            history_size: default_history_size(),
            smoothing_window: default_smoothing_window(),
            min_update_interval_ms: default_min_update_interval_ms(),
            history_influence: default_history_influence(),
        }
    }
}

fn default_history_size() -> usize { 10 }
fn default_smoothing_window() -> usize { 5 }
fn default_min_update_interval_ms() -> u64 { 500 }
fn default_history_influence() -> f64 { 0.3 }

/// Per-call behavior and spoken fallback templates.
///
/// Templates accept `{node}` (target node name) where noted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Spoken when a transition lands on a node with nothing new to greet with. Uses `{node}`.
    #[serde(default = "default_acknowledgment_template")]
    pub acknowledgment_template: String,
    /// Spoken when a transition target cannot be resolved.
    #[serde(default = "default_clarification_template")]
    pub clarification_template: String,
    /// Spoken after an action succeeds.
    #[serde(default = "default_action_success_template")]
    pub action_success_template: String,
    /// Spoken when an action or any node side effect fails.
    #[serde(default = "default_apology_template")]
    pub apology_template: String,
    /// Static goodbye when no generated goodbye is available.
    #[serde(default = "default_goodbye_template")]
    pub goodbye_template: String,
    /// Generated goodbyes shorter than this (after trimming) are discarded.
    #[serde(default = "default_min_goodbye_chars")]
    pub min_goodbye_chars: usize,
    /// Transcript messages kept for the intelligence's context.
    #[serde(default = "default_max_transcript_messages")]
    pub max_transcript_messages: usize,
    /// Capacity of a call task's input queue.
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            acknowledgment_template: default_acknowledgment_template(),
            clarification_template: default_clarification_template(),
            action_success_template: default_action_success_template(),
            apology_template: default_apology_template(),
            goodbye_template: default_goodbye_template(),
            min_goodbye_chars: default_min_goodbye_chars(),
            max_transcript_messages: default_max_transcript_messages(),
            inbox_capacity: default_inbox_capacity(),
        }
    }
}

fn default_acknowledgment_template() -> String { "Okay, let's talk about {node}.".to_string() }
fn default_clarification_template() -> String {
    "Sorry, I'm not sure where to go with that.".to_string()
}
fn default_action_success_template() -> String { "All done, that went through.".to_string() }
fn default_apology_template() -> String {
    "I'm sorry, I wasn't able to complete that just now.".to_string()
}
fn default_goodbye_template() -> String { "Thank you for calling. Goodbye!".to_string() }
fn default_min_goodbye_chars() -> usize { 8 }
fn default_max_transcript_messages() -> usize { 40 }
fn default_inbox_capacity() -> usize { 32 }

/// Action gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionsConfig {
    /// Current credential encryption secret. Never written back out.
    #[serde(default, skip_serializing)]
    pub credential_key: Option<String>,
    /// Previous secret, tried last for blobs written before a key rotation.
    #[serde(default, skip_serializing)]
    pub legacy_credential_key: Option<String>,
    /// Base URL of the integration layer for the HTTP backend.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_action_timeout")]
    pub timeout_secs: u64,
}

impl Default for ActionsConfig {
    fn default() -> Self {
        Self {
            credential_key: None,
            legacy_credential_key: None,
            base_url: None,
            timeout_secs: default_action_timeout(),
        }
    }
}

fn default_action_timeout() -> u64 { 30 }

/// Per-utterance metrics forwarding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    /// POST target for the HTTP sink. Logged through tracing when unset.
    #[serde(default)]
    pub sink_url: Option<String>,
    /// Forwarding gives up after this long.
    #[serde(default = "default_emit_timeout_ms")]
    pub emit_timeout_ms: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            sink_url: None,
            emit_timeout_ms: default_emit_timeout_ms(),
        }
    }
}

fn default_metrics_enabled() -> bool { true }
fn default_emit_timeout_ms() -> u64 { 2000 }

impl EngineConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| WaypointError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| WaypointError::Config(e.to_string()))?;
        config.validate()?;
        debug!(
            path = %path.display(),
            model = %config.model.model_id,
            metrics_enabled = config.metrics.enabled,
            "Engine config loaded"
        );
        Ok(config)
    }

    /// Reject values the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        let threshold = self.resolver.similarity_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(WaypointError::Config(format!(
                "resolver.similarity_threshold must be within [0, 1], got {}",
                threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.voice.history_influence) {
            return Err(WaypointError::Config(format!(
                "voice.history_influence must be within [0, 1], got {}",
                self.voice.history_influence
            )));
        }
        if self.voice.history_size == 0 || self.voice.smoothing_window == 0 {
            return Err(WaypointError::Config(
                "voice.history_size and voice.smoothing_window must be positive".into(),
            ));
        }
        if self.session.inbox_capacity == 0 {
            return Err(WaypointError::Config(
                "session.inbox_capacity must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    warn!(var = %var_name, "Config references an unset environment variable");
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_WAYPOINT_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_WAYPOINT_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_WAYPOINT_VAR");
    }

    #[test]
    fn test_secrets_not_serialized() {
        let config: EngineConfig = toml::from_str(
            r#"
            [model]
            api_key = "sk-live-123"

            [actions]
            credential_key = "primary-secret"
            legacy_credential_key = "old-secret"
            base_url = "https://integrations.example.com"
            "#,
        )
        .unwrap();
        assert_eq!(config.actions.credential_key.as_deref(), Some("primary-secret"));

        let printed = toml::to_string_pretty(&config).unwrap();
        assert!(!printed.contains("sk-live-123"));
        assert!(!printed.contains("primary-secret"));
        assert!(!printed.contains("old-secret"));
        assert!(printed.contains("https://integrations.example.com"));
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_WAYPOINT_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_WAYPOINT_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.resolver.similarity_threshold, 0.6);
        assert_eq!(config.voice.history_size, 10);
        assert_eq!(config.voice.smoothing_window, 5);
        assert_eq!(config.voice.min_update_interval_ms, 500);
        assert!(config.metrics.enabled);
        assert!(config.actions.credential_key.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let toml_str = r#"
[voice]
history_influence = 0.5

[session]
goodbye_template = "Bye now."
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.voice.history_influence, 0.5);
        assert_eq!(config.voice.history_size, 10);
        assert_eq!(config.session.goodbye_template, "Bye now.");
        assert_eq!(config.session.min_goodbye_chars, 8);
    }

    #[test]
    fn test_validate_rejects_bad_threshold() {
        let mut config = EngineConfig::default();
        config.resolver.similarity_threshold = 1.5;
        assert!(matches!(config.validate(), Err(WaypointError::Config(_))));
    }
}
