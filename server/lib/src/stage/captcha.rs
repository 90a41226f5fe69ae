use std::collections::BTreeMap;

use async_trait::async_trait;

use super::{CaptchaConfig, FlowContext, StageEnv, StageInput, StageOutcome};
use crate::prelude::*;

#[derive(Debug, Clone, PartialEq)]
pub struct CaptchaVerdict {
    pub success: bool,
    /// Providers that score their verdicts report it here.
    pub score: Option<f64>,
}

/// Checks a token produced by a captcha widget. How the token is scored is a
/// matter for the provider.
#[async_trait]
pub trait CaptchaVerifier: Send + Sync {
    async fn verify(&self, token: &str, public_key: &str) -> Result<CaptchaVerdict, OperationError>;
}

/// A verifier with a fixed table of token verdicts. Any token not in the table
/// fails.
#[derive(Debug, Default)]
pub struct StaticCaptchaVerifier {
    verdicts: BTreeMap<String, CaptchaVerdict>,
}

impl StaticCaptchaVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: &str, success: bool, score: Option<f64>) -> Self {
        self.verdicts
            .insert(token.to_string(), CaptchaVerdict { success, score });
        self
    }
}

#[async_trait]
impl CaptchaVerifier for StaticCaptchaVerifier {
    async fn verify(&self, token: &str, _public_key: &str) -> Result<CaptchaVerdict, OperationError> {
        Ok(self
            .verdicts
            .get(token)
            .cloned()
            .unwrap_or(CaptchaVerdict {
                success: false,
                score: None,
            }))
    }
}

fn verdict_is_acceptable(cfg: &CaptchaConfig, verdict: &CaptchaVerdict) -> bool {
    verdict.success
        && verdict
            .score
            .map(|s| s >= cfg.score_min_threshold && s <= cfg.score_max_threshold)
            .unwrap_or(true)
}

pub(super) async fn validate(
    cfg: &CaptchaConfig,
    input: &StageInput,
    env: &StageEnv<'_>,
) -> StageOutcome {
    let invalid = |reason: &str| {
        if cfg.error_on_invalid_score {
            StageOutcome::Deny(reason.to_string())
        } else {
            StageOutcome::Retry(reason.to_string())
        }
    };

    let Some(token) = input.field(FIELD_CAPTCHA_TOKEN) else {
        return invalid(BAD_CAPTCHA_MSG);
    };

    let verdict = match tokio::time::timeout(
        env.collaborator_timeout,
        env.captcha.verify(token, &cfg.public_key),
    )
    .await
    {
        Ok(Ok(verdict)) => verdict,
        Ok(Err(e)) => {
            // The verifier being unavailable is not the user's fault.
            admin_warn!(?e, "captcha verifier failed");
            return StageOutcome::Retry(BAD_CAPTCHA_MSG.to_string());
        }
        Err(_) => {
            admin_warn!("captcha verifier timed out");
            return StageOutcome::Retry(BAD_CAPTCHA_MSG.to_string());
        }
    };

    if verdict_is_acceptable(cfg, &verdict) {
        let mut updates = FlowContext::new();
        updates.insert(CTX_CAPTCHA_PASSED.to_string(), true.into());
        if let Some(score) = verdict.score {
            updates.insert(CTX_CAPTCHA_SCORE.to_string(), score.into());
        }
        StageOutcome::Advance(updates)
    } else {
        security_info!(?verdict, "captcha verdict rejected");
        invalid(BAD_CAPTCHA_MSG)
    }
}

#[cfg(test)]
mod tests {
    use super::{validate, verdict_is_acceptable, CaptchaVerdict, StaticCaptchaVerifier};
    use crate::directory::StaticUserDirectory;
    use crate::prelude::*;
    use crate::stage::{CaptchaConfig, StageEnv, StageInput, StageOutcome};

    fn config(error_on_invalid_score: bool) -> CaptchaConfig {
        CaptchaConfig {
            public_key: "site-key".to_string(),
            score_min_threshold: 0.5,
            score_max_threshold: 1.0,
            error_on_invalid_score,
        }
    }

    #[test]
    fn test_captcha_score_thresholds() {
        let cfg = config(false);
        let ok = |success, score| verdict_is_acceptable(&cfg, &CaptchaVerdict { success, score });
        assert!(ok(true, None));
        assert!(ok(true, Some(0.5)));
        assert!(ok(true, Some(1.0)));
        assert!(!ok(true, Some(0.49)));
        assert!(!ok(false, Some(0.9)));
    }

    #[tokio::test]
    async fn test_captcha_invalid_score_behaviour() {
        sketching::test_init();
        let directory = StaticUserDirectory::default();
        let captcha = StaticCaptchaVerifier::new()
            .with_token("good", true, Some(0.9))
            .with_token("bot", true, Some(0.1));
        let env = StageEnv {
            directory: &directory,
            captcha: &captcha,
            collaborator_timeout: Duration::from_secs(1),
        };

        let input = |token: &str| {
            StageInput::Submission(StageSubmission::default().with(FIELD_CAPTCHA_TOKEN, token))
        };

        match validate(&config(false), &input("good"), &env).await {
            StageOutcome::Advance(ctx) => {
                assert_eq!(
                    ctx.get(CTX_CAPTCHA_PASSED),
                    Some(&serde_json::Value::Bool(true))
                );
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        assert!(matches!(
            validate(&config(false), &input("bot"), &env).await,
            StageOutcome::Retry(_)
        ));
        assert!(matches!(
            validate(&config(true), &input("bot"), &env).await,
            StageOutcome::Deny(_)
        ));
        // A missing token is treated the same as a bad one.
        assert!(matches!(
            validate(&config(true), &StageInput::Submission(StageSubmission::default()), &env)
                .await,
            StageOutcome::Deny(_)
        ));
    }
}
