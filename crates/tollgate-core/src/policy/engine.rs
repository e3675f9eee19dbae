//! Built-in policy engine over the JSON rule-set format.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, warn};

use super::rules::{compile, CompiledRuleSet, RuleSet};
use super::schema::PolicySchema;
use super::{
    EvaluationRequest, PolicyEngine, PolicyError, PolicyIssue, PolicyMatchResult,
};

struct Compiled {
    schema: PolicySchema,
    rules: CompiledRuleSet,
}

/// Evaluates [`RuleSet`] documents.
///
/// Compiled sets are cached by bundle digest, so repeated evaluations of
/// the same policy text only parse it once.
#[derive(Default)]
pub struct RuleSetEngine {
    cache: Mutex<HashMap<String, Arc<Compiled>>>,
}

impl RuleSetEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and compile, collecting every issue.
    fn build(policy_text: &str, schema_text: &str) -> (Option<Compiled>, Vec<PolicyIssue>) {
        let schema = match PolicySchema::parse(schema_text) {
            Ok(schema) => schema,
            Err(issue) => return (None, vec![issue]),
        };
        let rule_set = match RuleSet::parse(policy_text) {
            Ok(set) => set,
            Err(issue) => return (None, vec![issue]),
        };
        let (rules, issues) = compile(&rule_set, &schema);
        if issues.iter().any(PolicyIssue::is_error) {
            return (None, issues);
        }
        (Some(Compiled { schema, rules }), issues)
    }

    fn compiled(&self, request: &EvaluationRequest) -> Result<Arc<Compiled>, PolicyError> {
        let digest = request.policy.digest();
        if let Some(hit) = self.cached(digest) {
            return Ok(hit);
        }

        let (compiled, issues) =
            Self::build(request.policy.policy_text(), request.policy.schema_text());
        let compiled = match compiled {
            Some(c) => Arc::new(c),
            None => return Err(PolicyError::from_issues(issues)),
        };
        for issue in &issues {
            warn!(policy_digest = %digest, issue = %issue, "policy warning");
        }
        debug!(
            policy_digest = %digest,
            rules = compiled.rules.len(),
            "policy set compiled"
        );

        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(digest.to_string(), compiled.clone());
        }
        Ok(compiled)
    }

    fn cached(&self, digest: &str) -> Option<Arc<Compiled>> {
        // A poisoned cache only costs a recompile.
        self.cache.lock().ok()?.get(digest).cloned()
    }
}

#[async_trait]
impl PolicyEngine for RuleSetEngine {
    async fn evaluate(&self, request: &EvaluationRequest) -> Result<PolicyMatchResult, PolicyError> {
        let compiled = self.compiled(request)?;
        compiled
            .schema
            .check(&request.action, &request.resource.entity_type)
            .map_err(PolicyError::SchemaMismatch)?;
        if !compiled.schema.declares_entity(&request.principal.entity_type) {
            return Err(PolicyError::SchemaMismatch(format!(
                "entity type {} is not declared in the schema",
                request.principal.entity_type
            )));
        }
        Ok(compiled.rules.evaluate(request))
    }

    fn validate(&self, policy_text: &str, schema_text: &str) -> Vec<PolicyIssue> {
        Self::build(policy_text, schema_text).1
    }
}
