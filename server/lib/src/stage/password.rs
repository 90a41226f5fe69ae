use super::{FlowContext, StageEnv, StageInput, StageOutcome};
use crate::prelude::*;

pub(super) fn validate(input: &StageInput, ctx: &FlowContext, env: &StageEnv<'_>) -> StageOutcome {
    let Some(username) = ctx.get(CTX_PENDING_USER).and_then(|v| v.as_str()) else {
        // Nothing before us identified a user, the flow is misconfigured.
        security_error!("password stage reached without an identified user");
        return StageOutcome::Deny(BAD_IDENTIFIER_MSG.to_string());
    };

    let Some(password) = input.field(FIELD_PASSWORD) else {
        return StageOutcome::Retry(BAD_INPUT_MSG.to_string());
    };

    match env.directory.verify_password(username, password) {
        Ok(true) => {
            security_info!(%username, "password accepted");
            let mut updates = FlowContext::new();
            updates.insert(CTX_PASSWORD_VERIFIED.to_string(), true.into());
            updates.insert(CTX_AUTHENTICATED_USER.to_string(), username.into());
            StageOutcome::Advance(updates)
        }
        Ok(false) => {
            security_info!(%username, "password rejected");
            StageOutcome::Retry(BAD_PASSWORD_MSG.to_string())
        }
        Err(e) => {
            admin_error!(?e, "user directory failed to verify password");
            StageOutcome::Retry(BAD_PASSWORD_MSG.to_string())
        }
    }
}
