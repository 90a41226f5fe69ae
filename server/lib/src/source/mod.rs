//! External identity sources. A source is anything that can send the user agent
//! somewhere to log in and later turn the callback into an [`Identity`]. The
//! engine never speaks a provider protocol itself, it only sees the [`Source`]
//! trait, and dispatches to sources by slug through a [`SourceTable`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use gatehouse_proto::v1::SourceRequestKind;

use crate::prelude::*;
use crate::utils::split_state;

mod oauth;

pub use self::oauth::{IdentityExchange, OAuthRedirectSource, OAuthSourceConfig, StaticIdentityExchange};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    SourceUnavailable,
    /// The callback did not match an outstanding redirect, or was malformed.
    InvalidPayload,
    ProviderRejected(String),
    Timeout,
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceError::SourceUnavailable => write!(f, "source unavailable"),
            SourceError::InvalidPayload => write!(f, "invalid callback payload"),
            SourceError::ProviderRejected(reason) => write!(f, "provider rejected: {}", reason),
            SourceError::Timeout => write!(f, "source timed out"),
        }
    }
}

impl From<SourceError> for OperationError {
    fn from(e: SourceError) -> Self {
        match e {
            SourceError::SourceUnavailable | SourceError::ProviderRejected(_) => {
                OperationError::SourceUnavailable
            }
            SourceError::InvalidPayload => OperationError::InvalidRequestState,
            SourceError::Timeout => OperationError::Timeout,
        }
    }
}

/// The parameters of a callback request.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SourcePayload {
    pub params: BTreeMap<String, String>,
}

impl fmt::Debug for SourcePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut m = f.debug_map();
        for (k, v) in self.params.iter() {
            if k == QUERY_CODE {
                m.entry(k, &"<redacted>");
            } else {
                m.entry(k, v);
            }
        }
        m.finish()
    }
}

impl From<BTreeMap<String, String>> for SourcePayload {
    fn from(params: BTreeMap<String, String>) -> Self {
        SourcePayload { params }
    }
}

impl SourcePayload {
    pub fn get(&self, k: &str) -> Option<&str> {
        self.params.get(k).map(|s| s.as_str())
    }

    /// The session a callback belongs to, recovered from the prefix of `state`.
    pub fn session_id(&self) -> Result<Uuid, OperationError> {
        let state = self
            .get(QUERY_STATE)
            .ok_or(OperationError::SR0002CallbackStateMissing)?;
        split_state(state)
            .map(|(sid, _)| sid)
            .ok_or(OperationError::SR0002CallbackStateMissing)
    }
}

#[async_trait]
pub trait Source: Send + Sync {
    fn slug(&self) -> &str;

    /// Where to send the user agent. While a redirect is outstanding for the
    /// session, repeated calls return the same target.
    async fn begin_login(&self, session_id: Uuid) -> Result<RedirectTarget, SourceError>;

    /// Consume the outstanding redirect for the session and produce the identity
    /// the provider asserted.
    async fn complete_callback(
        &self,
        session_id: Uuid,
        payload: &SourcePayload,
    ) -> Result<Identity, SourceError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceReply {
    Redirect(RedirectTarget),
    Identity(Identity),
}

/// Capability table of sources keyed by slug, fixed after startup.
#[derive(Default)]
pub struct SourceTable {
    sources: BTreeMap<String, Arc<dyn Source>>,
}

impl SourceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, source: Arc<dyn Source>) -> Result<(), OperationError> {
        let slug = source.slug().to_string();
        if self.sources.contains_key(&slug) {
            return Err(OperationError::InvalidConfiguration(format!(
                "source {} is defined more than once",
                slug
            )));
        }
        self.sources.insert(slug, source);
        Ok(())
    }

    pub fn get(&self, slug: &str) -> Result<&Arc<dyn Source>, OperationError> {
        self.sources
            .get(slug)
            .ok_or_else(|| OperationError::SourceNotFound(slug.to_string()))
    }

    pub fn slugs(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(|s| s.as_str())
    }

    /// Route a request for `slug` to the capability its kind selects, bounded by
    /// `timeout`.
    pub async fn dispatch(
        &self,
        slug: &str,
        kind: SourceRequestKind,
        session_id: Uuid,
        payload: &SourcePayload,
        timeout: Duration,
    ) -> Result<Result<SourceReply, SourceError>, OperationError> {
        let source = self.get(slug)?;

        let fut = async {
            match kind {
                SourceRequestKind::Redirect => source
                    .begin_login(session_id)
                    .await
                    .map(SourceReply::Redirect),
                SourceRequestKind::Callback => source
                    .complete_callback(session_id, payload)
                    .await
                    .map(SourceReply::Identity),
            }
        };

        let reply = match tokio::time::timeout(timeout, fut).await {
            Ok(reply) => reply,
            Err(_) => Err(SourceError::Timeout),
        };

        if let Err(e) = &reply {
            source_warn!(%slug, ?kind, %session_id, %e, "source request failed");
        }
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::SourcePayload;
    use crate::prelude::*;

    #[test]
    fn test_source_payload_session_id() {
        let sid = Uuid::new_v4();
        let mut params = BTreeMap::new();
        params.insert(QUERY_STATE.to_string(), format!("{}.abc", sid));
        params.insert(QUERY_CODE.to_string(), "secret-code".to_string());
        let payload = SourcePayload::from(params);

        assert_eq!(payload.session_id(), Ok(sid));
        assert!(!format!("{:?}", payload).contains("secret-code"));

        assert_eq!(
            SourcePayload::default().session_id(),
            Err(OperationError::SR0002CallbackStateMissing)
        );
    }
}
