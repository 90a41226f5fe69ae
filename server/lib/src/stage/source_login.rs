use super::{FlowContext, SourceLoginConfig, StageInput, StageOutcome};
use crate::prelude::*;

pub(super) fn validate(cfg: &SourceLoginConfig, input: &StageInput) -> StageOutcome {
    match input {
        StageInput::Identity(identity) if identity.source == cfg.source => {
            identity_updates(identity)
        }
        StageInput::Identity(identity) => {
            security_info!(expected = %cfg.source, got = %identity.source, "identity from unexpected source");
            StageOutcome::Retry(BAD_SOURCE_MSG.to_string())
        }
        StageInput::Submission(_) => StageOutcome::Retry(BAD_INPUT_MSG.to_string()),
    }
}

/// The context an asserted identity contributes.
pub(super) fn identity_updates(identity: &Identity) -> StageOutcome {
    let Some(subject) = identity.subject() else {
        security_info!(source = %identity.source, "identity carried no subject");
        return StageOutcome::Retry(BAD_SOURCE_MSG.to_string());
    };

    let claims = identity
        .claims
        .iter()
        .map(|(k, v)| (k.clone(), serde_json::Value::from(v.as_str())))
        .collect::<serde_json::Map<_, _>>();

    let mut updates = FlowContext::new();
    updates.insert(CTX_SOURCE.to_string(), identity.source.as_str().into());
    updates.insert(CTX_SOURCE_CLAIMS.to_string(), serde_json::Value::Object(claims));
    updates.insert(CTX_SOURCE_AUTHENTICATED.to_string(), true.into());
    updates.insert(
        CTX_AUTHENTICATED_USER.to_string(),
        format!("{}:{}", identity.source, subject).into(),
    );
    StageOutcome::Advance(updates)
}
