use super::{FlowContext, PolicyStageConfig, StageOutcome};
use crate::prelude::*;

pub(super) fn validate(cfg: &PolicyStageConfig, ctx: &FlowContext) -> StageOutcome {
    if cfg.deny_when.matches(ctx) {
        security_info!(key = %cfg.deny_when.key, "policy stage denied the flow");
        StageOutcome::Deny(cfg.message.clone())
    } else {
        StageOutcome::Advance(FlowContext::new())
    }
}
