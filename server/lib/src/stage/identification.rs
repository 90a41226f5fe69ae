use super::{FlowContext, IdentificationConfig, StageEnv, StageInput, StageOutcome};
use crate::prelude::*;

pub(super) fn validate(
    cfg: &IdentificationConfig,
    input: &StageInput,
    env: &StageEnv<'_>,
) -> StageOutcome {
    match input {
        StageInput::Identity(identity) => {
            if !cfg.sources.iter().any(|s| s == &identity.source) {
                security_info!(source = %identity.source, "source is not offered by this stage");
                return StageOutcome::Retry(BAD_SOURCE_MSG.to_string());
            }
            super::source_login::identity_updates(identity)
        }
        StageInput::Submission(_) => {
            let Some(identifier) = input.field(FIELD_IDENTIFIER) else {
                return StageOutcome::Retry(BAD_INPUT_MSG.to_string());
            };

            let mut updates = FlowContext::new();
            match env.directory.lookup(identifier, &cfg.user_fields) {
                Some(username) => {
                    security_info!(%username, "identified user");
                    updates.insert(CTX_PENDING_USER.to_string(), username.into());
                }
                None if cfg.pretend_user_exists => {
                    // Carry on as if the user existed, the password stage will fail later.
                    security_info!("unknown identifier, pretending the user exists");
                    updates.insert(CTX_PENDING_USER.to_string(), identifier.into());
                    updates.insert(CTX_PENDING_USER_UNKNOWN.to_string(), true.into());
                }
                None => {
                    security_info!("unknown identifier");
                    return StageOutcome::Retry(BAD_IDENTIFIER_MSG.to_string());
                }
            }
            StageOutcome::Advance(updates)
        }
    }
}
