use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use waypoint_core::config::ActionsConfig;
use waypoint_core::error::WaypointError;
use waypoint_core::traits::{ActionBackend, CredentialSource};
use waypoint_core::types::{ActionOutcome, ActionRequest};

use crate::credentials::{CredentialError, CredentialResolver, CredentialStrategy};
use crate::template::render_parameters;

/// What happened during one action invocation.
#[derive(Debug, Clone)]
pub struct ActionReport {
    pub outcome: ActionOutcome,
    /// The strategy that produced the token, if any did.
    pub credential_strategy: Option<CredentialStrategy>,
    /// Strategies tried in order.
    pub credential_attempts: Vec<CredentialStrategy>,
}

impl ActionReport {
    fn failed(outcome: ActionOutcome, attempts: Vec<CredentialStrategy>) -> Self {
        Self {
            outcome,
            credential_strategy: None,
            credential_attempts: attempts,
        }
    }
}

/// Runs external side-effecting integrations.
///
/// Every failure (missing blob, undecodable credentials, backend error,
/// timeout) comes back as an `ActionOutcome` with `status: error`; the
/// gateway never returns `Err` to the conversation. There is no retry: a
/// caller that wants another attempt invokes again.
pub struct ActionGateway {
    backend: Arc<dyn ActionBackend>,
    credentials: Arc<dyn CredentialSource>,
    resolver: CredentialResolver,
    timeout: Duration,
}

impl ActionGateway {
    pub fn new(
        config: &ActionsConfig,
        backend: Arc<dyn ActionBackend>,
        credentials: Arc<dyn CredentialSource>,
    ) -> Self {
        Self {
            backend,
            credentials,
            resolver: CredentialResolver::new(
                config.credential_key.as_deref(),
                config.legacy_credential_key.as_deref(),
            ),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// Render the request's parameter template against collected call data, fetch the
    /// integration's stored credential blob, and execute.
    pub async fn invoke(
        &self,
        template: &ActionRequest,
        collected: &HashMap<String, serde_json::Value>,
    ) -> ActionReport {
        let (parameters, missing) = render_parameters(&template.parameters, collected);
        if !missing.is_empty() {
            warn!(
                integration = %template.integration,
                operation = %template.operation,
                missing = ?missing,
                "Action parameters reference data not collected yet"
            );
        }

        let blob = match self.credentials.credential_blob(&template.integration).await {
            Ok(Some(blob)) => blob,
            Ok(None) => {
                let err = WaypointError::Credential {
                    integration: template.integration.clone(),
                    attempts: 0,
                };
                warn!(integration = %template.integration, "No stored credential for integration");
                return ActionReport::failed(ActionOutcome::error(err.to_string()), vec![]);
            }
            Err(e) => {
                error!(integration = %template.integration, error = %e, "Credential lookup failed");
                return ActionReport::failed(ActionOutcome::error(e.to_string()), vec![]);
            }
        };

        let request = ActionRequest {
            integration: template.integration.clone(),
            operation: template.operation.clone(),
            parameters,
        };
        self.execute(&request, &blob).await
    }

    /// Resolve credentials from `blob` and run the operation once.
    pub async fn execute(&self, request: &ActionRequest, blob: &str) -> ActionReport {
        let resolved = match self.resolver.resolve(blob) {
            Ok(resolved) => resolved,
            Err(CredentialError::Exhausted { attempts }) => {
                let err = WaypointError::Credential {
                    integration: request.integration.clone(),
                    attempts: attempts.len(),
                };
                error!(integration = %request.integration, error = %err, "Credential resolution failed");
                return ActionReport::failed(ActionOutcome::error(err.to_string()), attempts);
            }
            Err(e) => {
                error!(integration = %request.integration, error = %e, "Credential resolution failed");
                return ActionReport::failed(ActionOutcome::error(e.to_string()), vec![]);
            }
        };

        info!(
            integration = %request.integration,
            operation = %request.operation,
            strategy = ?resolved.strategy,
            "Executing action"
        );

        let call = self.backend.execute_action(request, &resolved.token);
        let outcome = match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                error!(integration = %request.integration, operation = %request.operation, error = %e, "Action failed");
                ActionOutcome::error(e.to_string())
            }
            Err(_) => {
                let err = WaypointError::Action {
                    integration: request.integration.clone(),
                    operation: request.operation.clone(),
                    message: format!("timed out after {}s", self.timeout.as_secs()),
                };
                error!(error = %err, "Action timed out");
                ActionOutcome::error(err.to_string())
            }
        };

        ActionReport {
            outcome,
            credential_strategy: Some(resolved.strategy),
            credential_attempts: resolved.attempts,
        }
    }
}
