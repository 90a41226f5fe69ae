use gatehouse_proto::v1::{CaptchaChallenge, StageChallenge};

use super::{StageConfig, StageEnv, StageInput, StageOutcome};
use crate::prelude::*;

/// A runnable stage. When the configured stage links another stage, the linked
/// handler is carried inside this one and runs after it within the same step,
/// only contributing to the context if every part of the chain advances.
#[derive(Debug, Clone, PartialEq)]
pub struct StageHandler {
    name: String,
    config: StageConfig,
    linked: Option<Box<StageHandler>>,
}

impl StageHandler {
    pub(crate) fn new(name: String, config: StageConfig, linked: Option<StageHandler>) -> Self {
        StageHandler {
            name,
            config,
            linked: linked.map(Box::new),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> StageKind {
        self.config.kind()
    }

    pub fn linked(&self) -> Option<&StageHandler> {
        self.linked.as_deref()
    }

    fn chain(&self) -> impl Iterator<Item = &StageHandler> {
        std::iter::successors(Some(self), |h| h.linked())
    }

    /// Stages that need nothing from the user are run by the executor as soon
    /// as they become current.
    pub fn is_interactive(&self) -> bool {
        !matches!(self.config, StageConfig::Policy(_))
    }

    /// Can the user complete this step through the named source.
    pub fn accepts_source(&self, slug: &str) -> bool {
        match &self.config {
            StageConfig::Identification(cfg) => cfg.sources.iter().any(|s| s == slug),
            StageConfig::SourceLogin(cfg) => cfg.source == slug,
            _ => false,
        }
    }

    /// Describe what the client needs to present for this step, including any
    /// fused stages.
    pub fn challenge(&self) -> StageChallenge {
        let mut challenge = StageChallenge {
            stage: self.name.clone(),
            kind: self.kind(),
            help_text: None,
            fields: Vec::new(),
            captcha: None,
            sources: Vec::new(),
        };

        for h in self.chain() {
            match &h.config {
                StageConfig::Identification(cfg) => {
                    challenge.fields.push(FIELD_IDENTIFIER.to_string());
                    challenge.sources.extend(cfg.sources.iter().cloned());
                    if challenge.help_text.is_none() {
                        challenge.help_text.clone_from(&cfg.help_text);
                    }
                }
                StageConfig::Password(cfg) => {
                    challenge.fields.push(FIELD_PASSWORD.to_string());
                    if challenge.help_text.is_none() {
                        challenge.help_text.clone_from(&cfg.help_text);
                    }
                }
                StageConfig::Captcha(cfg) => {
                    challenge.fields.push(FIELD_CAPTCHA_TOKEN.to_string());
                    challenge.captcha = Some(CaptchaChallenge {
                        public_key: cfg.public_key.clone(),
                    });
                }
                StageConfig::SourceLogin(cfg) => {
                    challenge.sources.push(cfg.source.clone());
                }
                StageConfig::Policy(_) => {}
            }
        }

        challenge
    }

    /// Run this step. Linked stages only run for direct submissions, an identity
    /// asserted by a source has already been verified by that source.
    pub async fn validate(
        &self,
        input: &StageInput,
        ctx: &FlowContext,
        env: &StageEnv<'_>,
    ) -> StageOutcome {
        let mut updates = FlowContext::new();
        let mut next = Some(self);

        while let Some(h) = next {
            // Later parts of a fused chain see what earlier parts established.
            let mut view = ctx.clone();
            view.extend(updates.iter().map(|(k, v)| (k.clone(), v.clone())));

            match h.validate_one(input, &view, env).await {
                StageOutcome::Advance(u) => updates.extend(u),
                other => {
                    flow_trace!(stage = %h.name, "stage did not advance");
                    return other;
                }
            }

            next = match input {
                StageInput::Submission(_) => h.linked(),
                StageInput::Identity(_) => None,
            };
        }

        StageOutcome::Advance(updates)
    }

    async fn validate_one(
        &self,
        input: &StageInput,
        ctx: &FlowContext,
        env: &StageEnv<'_>,
    ) -> StageOutcome {
        match &self.config {
            StageConfig::Identification(cfg) => super::identification::validate(cfg, input, env),
            StageConfig::Password(_) => super::password::validate(input, ctx, env),
            StageConfig::Captcha(cfg) => super::captcha::validate(cfg, input, env).await,
            StageConfig::SourceLogin(cfg) => super::source_login::validate(cfg, input),
            StageConfig::Policy(cfg) => super::policy::validate(cfg, ctx),
        }
    }
}
