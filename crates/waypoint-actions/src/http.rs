use std::time::Duration;

use futures::future::BoxFuture;
use tracing::debug;

use reqwest::StatusCode;

use waypoint_core::config::ActionsConfig;
use waypoint_core::error::{Result, WaypointError};
use waypoint_core::traits::ActionBackend;
use waypoint_core::types::{AccessToken, ActionOutcome, ActionRequest, ActionStatus};

/// Calls an HTTP integration layer at `{base_url}/integrations/{integration}/{operation}`.
///
/// The body is the rendered parameter object; the bearer token is the resolved
/// credential. A JSON response carrying `status` is taken as the outcome as-is,
/// any other 2xx body becomes `data` of a success.
pub struct HttpActionBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpActionBackend {
    pub fn new(base_url: impl Into<String>, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent("Waypoint/0.3")
            .build()
            .map_err(|e| WaypointError::Config(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Build the backend from `[actions]`. Fails when `base_url` is unset.
    pub fn from_config(config: &ActionsConfig) -> Result<Self> {
        let base_url = config.base_url.as_deref().ok_or_else(|| {
            WaypointError::Config("actions.base_url is required for the HTTP backend".into())
        })?;
        Self::new(base_url, config.timeout_secs)
    }

    fn endpoint(&self, request: &ActionRequest) -> String {
        format!(
            "{}/integrations/{}/{}",
            self.base_url, request.integration, request.operation
        )
    }
}

impl ActionBackend for HttpActionBackend {
    fn execute_action(
        &self,
        request: &ActionRequest,
        token: &AccessToken,
    ) -> BoxFuture<'_, Result<ActionOutcome>> {
        let url = self.endpoint(request);
        let body = request.parameters.clone();
        let token = token.clone();
        let integration = request.integration.clone();
        let operation = request.operation.clone();

        Box::pin(async move {
            let fail = |message: String| WaypointError::Action {
                integration: integration.clone(),
                operation: operation.clone(),
                message,
            };

            debug!(url = %url, "Posting action request");
            let resp = self
                .client
                .post(&url)
                .bearer_auth(token.expose())
                .json(&body)
                .send()
                .await
                .map_err(|e| fail(format!("Request failed: {}", e)))?;

            let status = resp.status();
            let text = resp
                .text()
                .await
                .map_err(|e| fail(format!("Failed to read response: {}", e)))?;
            Ok(outcome_from_response(status, &text))
        })
    }
}

/// Map an integration response to an outcome.
///
/// Non-2xx is an error carrying the body's `message` when present. A 2xx JSON
/// body with a `status` field is taken as the outcome as-is; any other body
/// becomes `data` of a success.
fn outcome_from_response(status: StatusCode, text: &str) -> ActionOutcome {
    let json: serde_json::Value = serde_json::from_str(text)
        .unwrap_or_else(|_| serde_json::Value::String(text.to_string()));

    if !status.is_success() {
        let message = json
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
        return ActionOutcome::error(message);
    }

    if let Some(outcome_status) = json.get("status").and_then(|s| s.as_str()) {
        let status = if outcome_status.eq_ignore_ascii_case("success") {
            ActionStatus::Success
        } else {
            ActionStatus::Error
        };
        return ActionOutcome {
            status,
            message: json
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or_default()
                .to_string(),
            data: json.get("data").cloned().unwrap_or(serde_json::Value::Null),
        };
    }

    ActionOutcome::success("", json)
}
