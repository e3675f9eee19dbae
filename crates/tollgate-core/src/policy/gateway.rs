//! Gateway between the harness and a policy engine.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use super::{EvaluationRequest, PolicyEngine, PolicyError, PolicyIssue, PolicyMatchResult};
use crate::metrics::METRICS;

/// Wraps a [`PolicyEngine`] with an optional evaluation time limit.
///
/// An engine that overruns the limit yields `PolicyError::Timeout`; the
/// gateway never substitutes a match result of its own.
#[derive(Clone)]
pub struct PolicyGateway {
    engine: Arc<dyn PolicyEngine>,
    timeout: Option<Duration>,
}

impl PolicyGateway {
    pub fn new(engine: Arc<dyn PolicyEngine>) -> Self {
        Self {
            engine,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub async fn evaluate(
        &self,
        request: &EvaluationRequest,
    ) -> Result<PolicyMatchResult, PolicyError> {
        let Some(limit) = self.timeout else {
            return self.engine.evaluate(request).await;
        };
        match tokio::time::timeout(limit, self.engine.evaluate(request)).await {
            Ok(result) => result,
            Err(_) => {
                let limit_ms = limit.as_millis() as u64;
                METRICS.inc_evaluation_timeouts();
                warn!(action = %request.action, limit_ms, "policy evaluation timed out");
                Err(PolicyError::Timeout { limit_ms })
            }
        }
    }

    pub fn validate(&self, policy_text: &str, schema_text: &str) -> Vec<PolicyIssue> {
        self.engine.validate(policy_text, schema_text)
    }
}
