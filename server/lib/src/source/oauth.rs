use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use concread::bptree::BptreeMap;
use serde::{Deserialize, Serialize};

use super::{Source, SourceError, SourcePayload};
use crate::prelude::*;
use crate::utils::{nonce_from_random, state_for_session};

/// Turns an authorisation code into the claims of the user it was issued for.
/// This is where a concrete provider protocol plugs in.
#[async_trait]
pub trait IdentityExchange: Send + Sync {
    async fn exchange(&self, code: &str) -> Result<BTreeMap<String, String>, SourceError>;
}

/// A fixed table of codes and the claims they exchange for. Useful for
/// development servers and tests.
#[derive(Debug, Default, Clone)]
pub struct StaticIdentityExchange {
    codes: BTreeMap<String, BTreeMap<String, String>>,
}

impl StaticIdentityExchange {
    pub fn new(codes: BTreeMap<String, BTreeMap<String, String>>) -> Self {
        StaticIdentityExchange { codes }
    }
}

#[async_trait]
impl IdentityExchange for StaticIdentityExchange {
    async fn exchange(&self, code: &str) -> Result<BTreeMap<String, String>, SourceError> {
        self.codes
            .get(code)
            .cloned()
            .ok_or_else(|| SourceError::ProviderRejected("unknown code".to_string()))
    }
}

fn default_scopes() -> Vec<String> {
    vec!["openid".to_string()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OAuthSourceConfig {
    pub slug: String,
    pub client_id: String,
    pub authorization_url: Url,
    /// Our callback endpoint for this source.
    pub redirect_uri: Url,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone)]
struct Outstanding {
    state: String,
    issued: Instant,
}

/// A source that follows the oauth authorisation code shape: redirect with a
/// `state`, receive `code` and `state` back.
pub struct OAuthRedirectSource {
    config: OAuthSourceConfig,
    exchange: Arc<dyn IdentityExchange>,
    outstanding: BptreeMap<Uuid, Outstanding>,
    outstanding_ttl: Duration,
}

impl fmt::Debug for OAuthRedirectSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthRedirectSource")
            .field("slug", &self.config.slug)
            .field("client_id", &self.config.client_id)
            .field("authorization_url", &self.config.authorization_url)
            .finish()
    }
}

impl OAuthRedirectSource {
    pub fn new(config: OAuthSourceConfig, exchange: Arc<dyn IdentityExchange>) -> Self {
        OAuthRedirectSource {
            config,
            exchange,
            outstanding: BptreeMap::new(),
            outstanding_ttl: Duration::from_secs(DEFAULT_SESSION_TTL),
        }
    }

    fn authorization_target(&self, state: &str) -> RedirectTarget {
        let mut url = self.config.authorization_url.clone();
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", self.config.redirect_uri.as_str())
            .append_pair("scope", &self.config.scopes.join(" "))
            .append_pair(QUERY_STATE, state);
        RedirectTarget {
            url,
            state: state.to_string(),
        }
    }
}

#[async_trait]
impl Source for OAuthRedirectSource {
    fn slug(&self) -> &str {
        &self.config.slug
    }

    async fn begin_login(&self, session_id: Uuid) -> Result<RedirectTarget, SourceError> {
        let now = Instant::now();
        let mut outstanding_write = self.outstanding.write();

        let state = match outstanding_write.get(&session_id) {
            Some(o) if now.duration_since(o.issued) < self.outstanding_ttl => o.state.clone(),
            _ => {
                let state = state_for_session(session_id, &nonce_from_random());
                outstanding_write.insert(
                    session_id,
                    Outstanding {
                        state: state.clone(),
                        issued: now,
                    },
                );
                state
            }
        };

        // Abandoned logins never call back, drop their state once it is stale.
        let stale: Vec<Uuid> = outstanding_write
            .iter()
            .filter(|(_, o)| now.duration_since(o.issued) >= self.outstanding_ttl)
            .map(|(k, _)| *k)
            .collect();
        for k in stale.iter() {
            outstanding_write.remove(k);
        }
        outstanding_write.commit();

        source_info!(slug = %self.config.slug, %session_id, "redirecting to source");
        Ok(self.authorization_target(&state))
    }

    async fn complete_callback(
        &self,
        session_id: Uuid,
        payload: &SourcePayload,
    ) -> Result<Identity, SourceError> {
        let Some(state) = payload.get(QUERY_STATE) else {
            return Err(SourceError::InvalidPayload);
        };

        {
            let mut outstanding_write = self.outstanding.write();
            match outstanding_write.get(&session_id) {
                Some(o) if o.state == state => {}
                _ => {
                    security_info!(slug = %self.config.slug, %session_id, "callback does not match an outstanding redirect");
                    return Err(SourceError::InvalidPayload);
                }
            }
            // Each redirect can be answered once.
            outstanding_write.remove(&session_id);
            outstanding_write.commit();
        }

        if let Some(error) = payload.get(QUERY_ERROR) {
            let detail = payload
                .get("error_description")
                .map(|d| format!("{}: {}", error, d))
                .unwrap_or_else(|| error.to_string());
            return Err(SourceError::ProviderRejected(detail));
        }

        let code = payload.get(QUERY_CODE).ok_or(SourceError::InvalidPayload)?;
        let claims = self.exchange.exchange(code).await?;

        Ok(Identity {
            source: self.config.slug.clone(),
            claims,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use super::{OAuthRedirectSource, OAuthSourceConfig, StaticIdentityExchange};
    use crate::prelude::*;
    use crate::source::{Source, SourceError, SourcePayload};

    fn source() -> OAuthRedirectSource {
        let mut claims = BTreeMap::new();
        claims.insert("sub".to_string(), "12345".to_string());
        let mut codes = BTreeMap::new();
        codes.insert("good-code".to_string(), claims);

        OAuthRedirectSource::new(
            OAuthSourceConfig {
                slug: "github".to_string(),
                client_id: "gatehouse".to_string(),
                authorization_url: Url::parse("https://provider.example.com/authorize")
                    .expect("invalid url"),
                redirect_uri: Url::parse("https://idm.example.com/callback/github")
                    .expect("invalid url"),
                scopes: vec!["openid".to_string(), "email".to_string()],
            },
            Arc::new(StaticIdentityExchange::new(codes)),
        )
    }

    fn payload(pairs: &[(&str, &str)]) -> SourcePayload {
        SourcePayload::from(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        )
    }

    #[tokio::test]
    async fn test_oauth_begin_login_is_idempotent() {
        sketching::test_init();
        let source = source();
        let sid = Uuid::new_v4();

        let a = source.begin_login(sid).await.expect("begin failed");
        let b = source.begin_login(sid).await.expect("begin failed");
        assert_eq!(a, b);
        assert!(a.state.starts_with(&sid.to_string()));

        let query: BTreeMap<_, _> = a.url.query_pairs().into_owned().collect();
        assert_eq!(query.get("client_id").map(|s| s.as_str()), Some("gatehouse"));
        assert_eq!(query.get("scope").map(|s| s.as_str()), Some("openid email"));
        assert_eq!(query.get(QUERY_STATE), Some(&a.state));

        // Another session gets its own state.
        let c = source.begin_login(Uuid::new_v4()).await.expect("begin failed");
        assert_ne!(a.state, c.state);
    }

    #[tokio::test]
    async fn test_oauth_callback_consumes_state() {
        sketching::test_init();
        let source = source();
        let sid = Uuid::new_v4();
        let target = source.begin_login(sid).await.expect("begin failed");

        let cb = payload(&[(QUERY_STATE, &target.state), (QUERY_CODE, "good-code")]);
        let identity = source
            .complete_callback(sid, &cb)
            .await
            .expect("callback failed");
        assert_eq!(identity.source, "github");
        assert_eq!(identity.subject(), Some("12345"));

        // Replaying the same callback is refused.
        assert_eq!(
            source.complete_callback(sid, &cb).await,
            Err(SourceError::InvalidPayload)
        );
    }

    #[tokio::test]
    async fn test_oauth_callback_rejections() {
        sketching::test_init();
        let source = source();
        let sid = Uuid::new_v4();

        // No redirect was ever issued.
        let cb = payload(&[(QUERY_STATE, "whatever"), (QUERY_CODE, "good-code")]);
        assert_eq!(
            source.complete_callback(sid, &cb).await,
            Err(SourceError::InvalidPayload)
        );

        let target = source.begin_login(sid).await.expect("begin failed");

        // A forged state does not burn the outstanding redirect.
        let forged = payload(&[(QUERY_STATE, "forged"), (QUERY_CODE, "good-code")]);
        assert_eq!(
            source.complete_callback(sid, &forged).await,
            Err(SourceError::InvalidPayload)
        );

        let denied = payload(&[(QUERY_STATE, &target.state), (QUERY_ERROR, "access_denied")]);
        assert_eq!(
            source.complete_callback(sid, &denied).await,
            Err(SourceError::ProviderRejected("access_denied".to_string()))
        );

        let target = source.begin_login(sid).await.expect("begin failed");
        let bad_code = payload(&[(QUERY_STATE, &target.state), (QUERY_CODE, "bad-code")]);
        assert!(matches!(
            source.complete_callback(sid, &bad_code).await,
            Err(SourceError::ProviderRejected(_))
        ));
    }
}
