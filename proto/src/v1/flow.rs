use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::FIELD_PASSWORD;

/// The kinds of stage a flow can be built from.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Identification,
    Password,
    Captcha,
    SourceLogin,
    Policy,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageKind::Identification => write!(f, "identification"),
            StageKind::Password => write!(f, "password"),
            StageKind::Captcha => write!(f, "captcha"),
            StageKind::SourceLogin => write!(f, "sourcelogin"),
            StageKind::Policy => write!(f, "policy"),
        }
    }
}

/// Which identifiers an identification stage will match a user by.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum UserField {
    Username,
    Email,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct CaptchaChallenge {
    /// The site key the client widget needs to render the challenge.
    pub public_key: String,
}

/// Describes what the client must present for the current stage.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct StageChallenge {
    pub stage: String,
    pub kind: StageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help_text: Option<String>,
    /// Submission fields the client is expected to send.
    pub fields: Vec<String>,
    /// Present when a captcha has been fused into this stage, or the stage
    /// is itself a captcha.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captcha: Option<CaptchaChallenge>,
    /// External sources the user may pick instead of filling in the fields.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FlowState {
    /// Present the challenge for the next stage.
    Challenge(StageChallenge),
    /// The last submission was not accepted, show the same challenge again.
    Retry {
        challenge: StageChallenge,
        reason: String,
    },
    /// The flow has failed. The client must start a new login.
    Denied(String),
    /// Every stage is satisfied.
    Success { claims: BTreeMap<String, String> },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct FlowResponse {
    pub sessionid: Uuid,
    pub state: FlowState,
}

/// The values a client submits for the current stage.
#[derive(Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct StageSubmission {
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl StageSubmission {
    pub fn with(mut self, k: &str, v: &str) -> Self {
        self.fields.insert(k.to_string(), v.to_string());
        self
    }
}

impl fmt::Debug for StageSubmission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut m = f.debug_map();
        for (k, v) in self.fields.iter() {
            if k == FIELD_PASSWORD {
                m.entry(k, &"<redacted>");
            } else {
                m.entry(k, v);
            }
        }
        m.finish()
    }
}
