use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use url::Url;

/// The two request shapes a source slug answers to.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceRequestKind {
    /// Send the user agent to the provider.
    Redirect,
    /// The provider has sent the user agent back to us.
    Callback,
}

/// Where to send the user agent to begin an external login.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RedirectTarget {
    pub url: Url,
    /// Opaque correlation value the provider must echo back.
    pub state: String,
}

/// An identity asserted by an external source.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Identity {
    pub source: String,
    pub claims: BTreeMap<String, String>,
}

impl Identity {
    /// The stable subject of the identity, if the source supplied one.
    pub fn subject(&self) -> Option<&str> {
        self.claims.get("sub").map(|s| s.as_str())
    }
}
