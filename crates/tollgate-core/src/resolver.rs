//! Match result → disposition.
//!
//! Precedence, first applicable wins:
//!
//! | forbids matched              | permits | decision |
//! |------------------------------|---------|----------|
//! | any without `escalate`       | any     | Deny     |
//! | all carry `escalate`         | any     | Escalate |
//! | none                         | ≥ 1     | Allow    |
//! | none                         | none    | Deny (default-deny) |

use tollgate_state::{Decision, Disposition, PolicyMetadata};

use crate::policy::{MatchedPolicy, PolicyMatchResult};

pub const REASON_PERMITTED: &str = "permitted";
pub const REASON_DEFAULT_DENY: &str = "no policy matched (default-deny)";

fn describe(policy: &PolicyMetadata) -> String {
    if policy.description.trim().is_empty() {
        policy.id.clone()
    } else {
        format!("{}: {}", policy.id, policy.description)
    }
}

fn metadata(policies: &[&MatchedPolicy]) -> Vec<PolicyMetadata> {
    policies.iter().map(|p| p.metadata()).collect()
}

/// Resolve a match result. Pure; never fails.
pub fn resolve(result: &PolicyMatchResult) -> Disposition {
    let (soft, hard): (Vec<&MatchedPolicy>, Vec<&MatchedPolicy>) =
        result.forbids.iter().partition(|p| p.is_escalating());

    if !hard.is_empty() {
        let hard = metadata(&hard);
        let reason = format!(
            "denied by {}",
            hard.iter().map(describe).collect::<Vec<_>>().join("; ")
        );
        let mut policies = hard;
        policies.extend(metadata(&soft));
        return Disposition {
            decision: Decision::Deny,
            reason,
            policies,
        };
    }

    if let Some(first) = soft.first() {
        let first = first.metadata();
        let reason = if first.description.trim().is_empty() {
            format!("escalation required by policy {}", first.id)
        } else {
            first.description
        };
        return Disposition {
            decision: Decision::Escalate,
            reason,
            policies: metadata(&soft),
        };
    }

    if !result.permits.is_empty() {
        return Disposition {
            decision: Decision::Allow,
            reason: REASON_PERMITTED.to_string(),
            policies: result.permits.iter().map(MatchedPolicy::metadata).collect(),
        };
    }

    Disposition {
        decision: Decision::Deny,
        reason: REASON_DEFAULT_DENY.to_string(),
        policies: Vec::new(),
    }
}
