//! Stages are the individual verification steps a flow is assembled from. The
//! configuration of each stage lives in a [`StageRef`], which the registry turns
//! into a runnable [`StageHandler`]. A stage may name a `linked_stage`, in which
//! case the linked stage is fused into it and runs as part of the same step.

use std::collections::BTreeMap;
use std::time::Duration;

use gatehouse_proto::v1::{Identity, StageKind, StageSubmission, UserField};
use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_CAPTCHA_SCORE_MAX, DEFAULT_CAPTCHA_SCORE_MIN};
use crate::directory::UserDirectory;
use crate::registry::BranchPredicate;

mod captcha;
mod handler;
mod identification;
mod password;
mod policy;
mod source_login;

pub use self::captcha::{CaptchaVerdict, CaptchaVerifier, StaticCaptchaVerifier};
pub use self::handler::StageHandler;

/// Values accumulated by the stages of a flow. Stages only communicate through this.
pub type FlowContext = BTreeMap<String, serde_json::Value>;

/// Configuration of a single named stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StageRef {
    pub name: String,
    /// Another stage that is fused into this one.
    #[serde(default)]
    pub linked_stage: Option<String>,
    pub config: StageConfig,
}

impl StageRef {
    pub fn kind(&self) -> StageKind {
        self.config.kind()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StageConfig {
    Identification(IdentificationConfig),
    Password(PasswordConfig),
    Captcha(CaptchaConfig),
    SourceLogin(SourceLoginConfig),
    Policy(PolicyStageConfig),
}

impl StageConfig {
    pub fn kind(&self) -> StageKind {
        match self {
            StageConfig::Identification(_) => StageKind::Identification,
            StageConfig::Password(_) => StageKind::Password,
            StageConfig::Captcha(_) => StageKind::Captcha,
            StageConfig::SourceLogin(_) => StageKind::SourceLogin,
            StageConfig::Policy(_) => StageKind::Policy,
        }
    }
}

fn default_user_fields() -> Vec<UserField> {
    vec![UserField::Username, UserField::Email]
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct IdentificationConfig {
    #[serde(default = "default_user_fields")]
    pub user_fields: Vec<UserField>,
    /// Advance even when the identifier does not match a user, so that the
    /// response does not reveal which accounts exist.
    #[serde(default)]
    pub pretend_user_exists: bool,
    /// Source slugs offered as an alternative to entering an identifier.
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub help_text: Option<String>,
}

impl Default for IdentificationConfig {
    fn default() -> Self {
        IdentificationConfig {
            user_fields: default_user_fields(),
            pretend_user_exists: false,
            sources: Vec::new(),
            help_text: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PasswordConfig {
    #[serde(default)]
    pub help_text: Option<String>,
}

fn default_score_min() -> f64 {
    DEFAULT_CAPTCHA_SCORE_MIN
}

fn default_score_max() -> f64 {
    DEFAULT_CAPTCHA_SCORE_MAX
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CaptchaConfig {
    pub public_key: String,
    #[serde(default = "default_score_min")]
    pub score_min_threshold: f64,
    #[serde(default = "default_score_max")]
    pub score_max_threshold: f64,
    /// When set, a failed verification denies the flow instead of asking again.
    #[serde(default)]
    pub error_on_invalid_score: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SourceLoginConfig {
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PolicyStageConfig {
    pub deny_when: BranchPredicate,
    pub message: String,
}

/// What a stage is given to validate.
#[derive(Debug, Clone)]
pub enum StageInput {
    Submission(StageSubmission),
    /// An identity asserted by an external source after a callback.
    Identity(Identity),
}

impl StageInput {
    pub(crate) fn field(&self, name: &str) -> Option<&str> {
        match self {
            StageInput::Submission(sub) => sub
                .fields
                .get(name)
                .map(|s| s.as_str())
                .filter(|s| !s.is_empty()),
            StageInput::Identity(_) => None,
        }
    }
}

impl From<StageSubmission> for StageInput {
    fn from(sub: StageSubmission) -> Self {
        StageInput::Submission(sub)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    /// The stage is satisfied. Carries the values to merge into the context.
    Advance(FlowContext),
    Retry(String),
    Deny(String),
}

/// The collaborators available to stage handlers while they run.
pub struct StageEnv<'a> {
    pub directory: &'a dyn UserDirectory,
    pub captcha: &'a dyn CaptchaVerifier,
    /// Upper bound on a single call to an external collaborator.
    pub collaborator_timeout: Duration,
}
