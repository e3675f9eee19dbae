//! JSON rule-set format and its compiled form.
//!
//! ```json
//! {
//!   "rules": [
//!     {
//!       "effect": "forbid",
//!       "annotations": { "id": "big-transfer", "reason": "needs sign-off", "escalate": "finance" },
//!       "actions": ["Transfer"],
//!       "when": [{ "fact": "context.parameters.amount", "op": "gt", "value": 10000 }]
//!     },
//!     { "effect": "permit", "annotations": { "id": "allow-all" } }
//!   ]
//! }
//! ```
//!
//! A rule matches when its scope (principal, actions, resource type) covers
//! the request, every `when` condition holds and no `unless` condition holds.
//! A condition over a fact that is not present is false, except `absent`.

use std::collections::{BTreeMap, HashSet};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::schema::PolicySchema;
use super::{
    Entity, EvaluationRequest, MatchedPolicy, PolicyIssue, PolicyMatchResult, ANNOTATION_ESCALATE,
    ANNOTATION_ID,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    Permit,
    Forbid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Contains,
    Like,
    Matches,
    Exists,
    Absent,
}

/// A test over one dotted fact path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// `principal.*`, `resource.*` or `context.*`
    pub fact: String,
    pub op: Operator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub effect: Effect,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Restrict to one agent id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal: Option<String>,
    /// Restrict to these actions. Empty matches every action.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub when: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unless: Vec<Condition>,
}

/// Top-level policy document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl RuleSet {
    /// Parse a policy document. Blank text is an empty rule set.
    pub fn parse(text: &str) -> Result<Self, PolicyIssue> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(text)
            .map_err(|e| PolicyIssue::syntax(None, format!("invalid policy document: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Compiled form
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Root {
    Principal,
    Resource,
    Context,
}

#[derive(Debug, Clone)]
struct FactPath {
    root: Root,
    segments: Vec<String>,
}

impl FactPath {
    fn parse(path: &str) -> Result<Self, String> {
        let mut parts = path.split('.');
        let root = match parts.next() {
            Some("principal") => Root::Principal,
            Some("resource") => Root::Resource,
            Some("context") => Root::Context,
            _ => {
                return Err(format!(
                    "fact {path} must start with principal, resource or context"
                ))
            }
        };
        let segments: Vec<String> = parts.map(str::to_string).collect();
        if segments.is_empty() || segments.iter().any(|s| s.is_empty()) {
            return Err(format!("fact {path} has an empty path segment"));
        }
        Ok(Self { root, segments })
    }

    fn lookup<'a>(&self, request: &'a EvaluationRequest) -> Option<Fact<'a>> {
        let (first, rest) = self.segments.split_first()?;
        let mut current: &Value = match self.root {
            Root::Context => request.context.get(first)?,
            Root::Principal => return entity_lookup(&request.principal, first, rest),
            Root::Resource => return entity_lookup(&request.resource, first, rest),
        };
        for segment in rest {
            current = step_into(current, segment)?;
        }
        Some(Fact::Value(current))
    }
}

/// A present fact. Entity ids and types are strings held outside the fact map.
enum Fact<'a> {
    Str(&'a str),
    Value(&'a Value),
}

impl Fact<'_> {
    fn to_value(&self) -> Value {
        match self {
            Fact::Str(s) => Value::String(s.to_string()),
            Fact::Value(v) => (*v).clone(),
        }
    }

    fn as_str(&self) -> Option<&str> {
        match self {
            Fact::Str(s) => Some(s),
            Fact::Value(v) => v.as_str(),
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Fact::Str(_) => None,
            Fact::Value(v) => v.as_f64(),
        }
    }
}

fn entity_lookup<'a>(entity: &'a Entity, first: &str, rest: &[String]) -> Option<Fact<'a>> {
    if rest.is_empty() {
        match first {
            "id" => return Some(Fact::Str(&entity.id)),
            "type" => return Some(Fact::Str(&entity.entity_type)),
            _ => {}
        }
    }
    let mut current = entity.facts.get(first)?;
    for segment in rest {
        current = step_into(current, segment)?;
    }
    Some(Fact::Value(current))
}

fn step_into<'a>(value: &'a Value, segment: &str) -> Option<&'a Value> {
    match value {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    }
}

#[derive(Debug, Clone)]
enum Test {
    Eq(Value),
    Ne(Value),
    Gt(f64),
    Gte(f64),
    Lt(f64),
    Lte(f64),
    In(Vec<Value>),
    Contains(Value),
    Pattern(Regex),
    Exists,
    Absent,
}

#[derive(Debug, Clone)]
struct CompiledCondition {
    path: FactPath,
    test: Test,
}

impl CompiledCondition {
    fn compile(condition: &Condition) -> Result<Self, String> {
        let path = FactPath::parse(&condition.fact)?;
        let op = condition.op;
        let value = condition.value.clone();
        let number = |v: Option<Value>| -> Result<f64, String> {
            v.as_ref()
                .and_then(Value::as_f64)
                .ok_or_else(|| format!("operator {op:?} on {} needs a numeric value", condition.fact))
        };
        let required = |v: Option<Value>| -> Result<Value, String> {
            v.ok_or_else(|| format!("operator {op:?} on {} needs a value", condition.fact))
        };
        let pattern = |v: Option<Value>| -> Result<String, String> {
            match v {
                Some(Value::String(s)) => Ok(s),
                _ => Err(format!(
                    "operator {op:?} on {} needs a string value",
                    condition.fact
                )),
            }
        };

        let test = match op {
            Operator::Eq => Test::Eq(required(value)?),
            Operator::Ne => Test::Ne(required(value)?),
            Operator::Gt => Test::Gt(number(value)?),
            Operator::Gte => Test::Gte(number(value)?),
            Operator::Lt => Test::Lt(number(value)?),
            Operator::Lte => Test::Lte(number(value)?),
            Operator::In => match value {
                Some(Value::Array(items)) => Test::In(items),
                _ => {
                    return Err(format!(
                        "operator In on {} needs an array value",
                        condition.fact
                    ))
                }
            },
            Operator::Contains => Test::Contains(required(value)?),
            Operator::Like => {
                let glob = pattern(value)?;
                Test::Pattern(glob_to_regex(&glob).map_err(|e| e.to_string())?)
            }
            Operator::Matches => {
                let re = pattern(value)?;
                Test::Pattern(
                    Regex::new(&re).map_err(|e| format!("invalid regex for {}: {e}", condition.fact))?,
                )
            }
            Operator::Exists | Operator::Absent => {
                if value.is_some() {
                    return Err(format!(
                        "operator {op:?} on {} takes no value",
                        condition.fact
                    ));
                }
                if op == Operator::Exists {
                    Test::Exists
                } else {
                    Test::Absent
                }
            }
        };
        Ok(Self { path, test })
    }

    fn holds(&self, request: &EvaluationRequest) -> bool {
        let fact = self.path.lookup(request);
        let fact = match (&self.test, fact) {
            (Test::Absent, f) => return f.is_none(),
            (Test::Exists, f) => return f.is_some(),
            (_, None) => return false,
            (_, Some(f)) => f,
        };
        match &self.test {
            Test::Eq(v) => values_equal(&fact.to_value(), v),
            Test::Ne(v) => !values_equal(&fact.to_value(), v),
            Test::Gt(n) => fact.as_f64().is_some_and(|f| f > *n),
            Test::Gte(n) => fact.as_f64().is_some_and(|f| f >= *n),
            Test::Lt(n) => fact.as_f64().is_some_and(|f| f < *n),
            Test::Lte(n) => fact.as_f64().is_some_and(|f| f <= *n),
            Test::In(items) => {
                let v = fact.to_value();
                items.iter().any(|i| values_equal(&v, i))
            }
            Test::Contains(needle) => match fact.to_value() {
                Value::Array(items) => items.iter().any(|i| values_equal(i, needle)),
                Value::String(s) => needle.as_str().is_some_and(|n| s.contains(n)),
                Value::Object(map) => needle.as_str().is_some_and(|k| map.contains_key(k)),
                _ => false,
            },
            Test::Pattern(re) => fact.as_str().is_some_and(|s| re.is_match(s)),
            Test::Exists | Test::Absent => false,
        }
    }
}

/// Numbers compare by value so `1` equals `1.0`.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// `*` matches any run of characters; everything else is literal.
fn glob_to_regex(glob: &str) -> Result<Regex, regex::Error> {
    let body = glob
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^(?s:{body})$"))
}

#[derive(Debug, Clone)]
struct CompiledRule {
    matched: MatchedPolicy,
    effect: Effect,
    principal: Option<String>,
    actions: Vec<String>,
    resource_type: Option<String>,
    when: Vec<CompiledCondition>,
    unless: Vec<CompiledCondition>,
}

impl CompiledRule {
    fn in_scope(&self, request: &EvaluationRequest) -> bool {
        self.principal
            .as_deref()
            .map(|p| p == request.principal.id)
            .unwrap_or(true)
            && (self.actions.is_empty() || self.actions.iter().any(|a| *a == request.action))
            && self
                .resource_type
                .as_deref()
                .map(|r| r == request.resource.entity_type)
                .unwrap_or(true)
    }

    fn matches(&self, request: &EvaluationRequest) -> bool {
        self.in_scope(request)
            && self.when.iter().all(|c| c.holds(request))
            && !self.unless.iter().any(|c| c.holds(request))
    }
}

/// Rules ready for evaluation, in document order.
#[derive(Debug, Clone, Default)]
pub struct CompiledRuleSet {
    rules: Vec<CompiledRule>,
}

impl CompiledRuleSet {
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Every matching rule, forbids and permits kept in document order.
    pub fn evaluate(&self, request: &EvaluationRequest) -> PolicyMatchResult {
        let mut result = PolicyMatchResult::default();
        for rule in self.rules.iter().filter(|r| r.matches(request)) {
            match rule.effect {
                Effect::Forbid => result.forbids.push(rule.matched.clone()),
                Effect::Permit => result.permits.push(rule.matched.clone()),
            }
        }
        result
    }
}

/// Compile `rule_set` against `schema`.
///
/// Returns the compiled set together with every issue found. Callers must
/// reject the set if any issue is an error; warnings (duplicate ids) leave
/// the set usable.
pub fn compile(rule_set: &RuleSet, schema: &PolicySchema) -> (CompiledRuleSet, Vec<PolicyIssue>) {
    let mut issues = Vec::new();
    let mut seen = HashSet::new();
    let mut rules = Vec::with_capacity(rule_set.rules.len());

    for (index, rule) in rule_set.rules.iter().enumerate() {
        let id = match rule.annotations.get(ANNOTATION_ID) {
            Some(id) if !id.trim().is_empty() => id.clone(),
            _ => {
                issues.push(PolicyIssue::syntax(
                    None,
                    format!("rule #{index} is missing the required id annotation"),
                ));
                continue;
            }
        };
        let pid = Some(id.as_str());
        let before = issues.len();

        if !seen.insert(id.clone()) {
            issues.push(PolicyIssue::warning(pid, format!("duplicate policy id {id}")));
        }
        if rule.effect == Effect::Permit && rule.annotations.contains_key(ANNOTATION_ESCALATE) {
            issues.push(PolicyIssue::syntax(
                pid,
                "escalate annotation is only valid on forbid rules",
            ));
        }
        for action in &rule.actions {
            if !schema.declares_action(action) {
                issues.push(PolicyIssue::schema(
                    pid,
                    format!("action {action} is not declared in the schema"),
                ));
            }
        }
        if let Some(rt) = &rule.resource_type {
            if !schema.declares_entity(rt) {
                issues.push(PolicyIssue::schema(
                    pid,
                    format!("entity type {rt} is not declared in the schema"),
                ));
            } else {
                for action in &rule.actions {
                    if let Err(message) = schema.check(action, rt) {
                        if schema.declares_action(action) {
                            issues.push(PolicyIssue::schema(pid, message));
                        }
                    }
                }
            }
        }

        let mut compile_all = |conditions: &[Condition]| -> Vec<CompiledCondition> {
            conditions
                .iter()
                .filter_map(|c| match CompiledCondition::compile(c) {
                    Ok(compiled) => Some(compiled),
                    Err(message) => {
                        issues.push(PolicyIssue::syntax(pid, message));
                        None
                    }
                })
                .collect()
        };
        let when = compile_all(&rule.when);
        let unless = compile_all(&rule.unless);

        let has_errors = issues[before..].iter().any(PolicyIssue::is_error);
        if has_errors {
            continue;
        }

        let mut matched = MatchedPolicy::new(id.clone());
        matched.annotations = rule.annotations.clone();
        rules.push(CompiledRule {
            matched,
            effect: rule.effect,
            principal: rule.principal.clone(),
            actions: rule.actions.clone(),
            resource_type: rule.resource_type.clone(),
            when,
            unless,
        });
    }

    (CompiledRuleSet { rules }, issues)
}
