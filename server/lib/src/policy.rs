//! The policy gate is consulted every time a stage advances. It can let the flow
//! continue, deny it, or insist on an extra stage before the plan continues.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::prelude::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Deny(String),
    /// Run the named stage before continuing with the plan.
    RequireStage(String),
}

pub trait PolicyGate: Send + Sync {
    /// Must be pure. `kind` is the kind of the stage that just advanced.
    fn evaluate(&self, ctx: &FlowContext, kind: StageKind) -> PolicyDecision;
}

/// Has the named stage already run for this session because a policy demanded it.
pub fn required_stage_passed(ctx: &FlowContext, name: &str) -> bool {
    ctx.get(CTX_REQUIRED_STAGES_PASSED)
        .and_then(|v| v.as_array())
        .map(|passed| passed.iter().any(|p| p.as_str() == Some(name)))
        .unwrap_or(false)
}

pub(crate) fn record_required_stage(ctx: &mut FlowContext, name: &str) {
    let entry = ctx
        .entry(CTX_REQUIRED_STAGES_PASSED.to_string())
        .or_insert_with(|| serde_json::Value::Array(Vec::new()));
    match entry {
        serde_json::Value::Array(passed) => {
            if !passed.iter().any(|p| p.as_str() == Some(name)) {
                passed.push(name.into());
            }
        }
        other => *other = serde_json::Value::Array(vec![name.into()]),
    }
}

#[derive(Debug, Default, Clone)]
pub struct AllowAll;

impl PolicyGate for AllowAll {
    fn evaluate(&self, _ctx: &FlowContext, _kind: StageKind) -> PolicyDecision {
        PolicyDecision::Allow
    }
}

fn default_risk_key() -> String {
    CTX_RISK.to_string()
}

/// Escalate on the risk signal carried in the flow context. Some other part of
/// the deployment is expected to place that signal there.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RiskPolicy {
    #[serde(default = "default_risk_key")]
    pub risk_key: String,
    /// Values of the risk signal that require the extra stage.
    #[serde(default)]
    pub elevated: Vec<String>,
    /// Values of the risk signal that end the flow.
    #[serde(default)]
    pub denied: Vec<String>,
    /// The stage demanded for elevated risk, normally a captcha.
    pub require_stage: String,
}

impl PolicyGate for RiskPolicy {
    fn evaluate(&self, ctx: &FlowContext, kind: StageKind) -> PolicyDecision {
        let Some(risk) = ctx.get(&self.risk_key).and_then(|v| v.as_str()) else {
            return PolicyDecision::Allow;
        };

        if self.denied.iter().any(|d| d == risk) {
            return PolicyDecision::Deny(format!("risk level {} is not permitted", risk));
        }

        let captcha_passed = ctx
            .get(CTX_CAPTCHA_PASSED)
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        // Once the demanded stage has run, or a captcha has been solved, the
        // elevated risk is answered.
        let answered = captcha_passed
            || kind == StageKind::Captcha
            || required_stage_passed(ctx, &self.require_stage);

        if self.elevated.iter().any(|e| e == risk) && !answered {
            PolicyDecision::RequireStage(self.require_stage.clone())
        } else {
            PolicyDecision::Allow
        }
    }
}

/// Consult several gates in order. The first decision that is not `Allow` wins.
#[derive(Default, Clone)]
pub struct PolicyChain {
    gates: Vec<Arc<dyn PolicyGate>>,
}

impl PolicyChain {
    pub fn new(gates: Vec<Arc<dyn PolicyGate>>) -> Self {
        PolicyChain { gates }
    }
}

impl PolicyGate for PolicyChain {
    fn evaluate(&self, ctx: &FlowContext, kind: StageKind) -> PolicyDecision {
        self.gates
            .iter()
            .map(|g| g.evaluate(ctx, kind))
            .find(|d| *d != PolicyDecision::Allow)
            .unwrap_or(PolicyDecision::Allow)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{
        record_required_stage, required_stage_passed, AllowAll, PolicyChain, PolicyDecision,
        PolicyGate, RiskPolicy,
    };
    use crate::prelude::*;

    fn risk_policy() -> RiskPolicy {
        RiskPolicy {
            risk_key: CTX_RISK.to_string(),
            elevated: vec!["elevated".to_string()],
            denied: vec!["blocked".to_string()],
            require_stage: "default-captcha".to_string(),
        }
    }

    #[test]
    fn test_policy_risk_decisions() {
        let policy = risk_policy();
        let mut ctx = FlowContext::new();

        assert_eq!(
            policy.evaluate(&ctx, StageKind::Identification),
            PolicyDecision::Allow
        );

        ctx.insert(CTX_RISK.to_string(), "elevated".into());
        assert_eq!(
            policy.evaluate(&ctx, StageKind::Identification),
            PolicyDecision::RequireStage("default-captcha".to_string())
        );
        assert_eq!(
            policy.evaluate(&ctx, StageKind::Captcha),
            PolicyDecision::Allow
        );

        ctx.insert(CTX_CAPTCHA_PASSED.to_string(), true.into());
        assert_eq!(
            policy.evaluate(&ctx, StageKind::Password),
            PolicyDecision::Allow
        );

        ctx.insert(CTX_RISK.to_string(), "blocked".into());
        assert!(matches!(
            policy.evaluate(&ctx, StageKind::Password),
            PolicyDecision::Deny(_)
        ));
    }

    #[test]
    fn test_policy_risk_answered_by_required_stage() {
        let mut policy = risk_policy();
        policy.require_stage = "default-password".to_string();
        let mut ctx = FlowContext::new();
        ctx.insert(CTX_RISK.to_string(), "elevated".into());

        assert_eq!(
            policy.evaluate(&ctx, StageKind::Password),
            PolicyDecision::RequireStage("default-password".to_string())
        );

        record_required_stage(&mut ctx, "default-password");
        record_required_stage(&mut ctx, "default-password");
        assert!(required_stage_passed(&ctx, "default-password"));
        assert!(!required_stage_passed(&ctx, "default-captcha"));
        assert_eq!(
            ctx.get(CTX_REQUIRED_STAGES_PASSED)
                .and_then(|v| v.as_array())
                .map(|a| a.len()),
            Some(1)
        );
        assert_eq!(
            policy.evaluate(&ctx, StageKind::Password),
            PolicyDecision::Allow
        );
    }

    #[test]
    fn test_policy_chain_first_objection_wins() {
        let chain = PolicyChain::new(vec![Arc::new(AllowAll), Arc::new(risk_policy())]);
        let mut ctx = FlowContext::new();
        assert_eq!(chain.evaluate(&ctx, StageKind::Password), PolicyDecision::Allow);

        ctx.insert(CTX_RISK.to_string(), "blocked".into());
        assert!(matches!(
            chain.evaluate(&ctx, StageKind::Password),
            PolicyDecision::Deny(_)
        ));
    }
}
