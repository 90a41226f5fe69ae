//! Fixtures shared by the unit tests of this crate.

#![allow(clippy::expect_used)]

use std::collections::BTreeMap;
use std::sync::Arc;

use argon2::{Algorithm, Argon2, Params, Version};
use async_trait::async_trait;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

use crate::audit::AuditEvent;
use crate::directory::{hash_password_with, StaticUserDirectory, UserRecord};
use crate::executor::{Collaborators, ExecutorConfig, FlowExecutor};
use crate::policy::{AllowAll, PolicyGate};
use crate::prelude::*;
use crate::registry::{BranchPredicate, FlowBinding, FlowDefinition, RegistryConfig, StageRegistry};
use crate::session::InMemorySessionStore;
use crate::source::{
    OAuthRedirectSource, OAuthSourceConfig, Source, SourceError, SourcePayload, SourceTable,
    StaticIdentityExchange,
};
use crate::stage::{
    CaptchaConfig, CaptchaVerifier, IdentificationConfig, PasswordConfig, PolicyStageConfig,
    StageConfig, StageRef, StaticCaptchaVerifier,
};

pub(crate) const TEST_CT: u64 = 1_700_000_000;
pub(crate) const ALICE_PASSWORD: &str = "correct horse battery";
pub(crate) const TOKEN_SOLVED: &str = "solved";
pub(crate) const TOKEN_BOT: &str = "bot";
pub(crate) const SLOW_SOURCE: &str = "slow";
pub(crate) const UNKNOWN_USER_MSG: &str = "unknown accounts may not log in";

/// Hash with the cheapest parameters argon2 accepts, tests hash a lot.
pub(crate) fn test_hash(password: &str) -> String {
    let params = Params::new(1024, 1, 1, None).expect("invalid argon2 params");
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    hash_password_with(&argon2, password).expect("failed to hash password")
}

pub(crate) fn identification_stage(name: &str) -> StageRef {
    StageRef {
        name: name.to_string(),
        linked_stage: None,
        config: StageConfig::Identification(IdentificationConfig::default()),
    }
}

pub(crate) fn password_stage(name: &str) -> StageRef {
    StageRef {
        name: name.to_string(),
        linked_stage: None,
        config: StageConfig::Password(PasswordConfig::default()),
    }
}

pub(crate) fn captcha_stage(name: &str, error_on_invalid_score: bool) -> StageRef {
    StageRef {
        name: name.to_string(),
        linked_stage: None,
        config: StageConfig::Captcha(CaptchaConfig {
            public_key: "site-key".to_string(),
            score_min_threshold: DEFAULT_CAPTCHA_SCORE_MIN,
            score_max_threshold: DEFAULT_CAPTCHA_SCORE_MAX,
            error_on_invalid_score,
        }),
    }
}

pub(crate) fn flow(slug: &str, bindings: Vec<FlowBinding>) -> FlowDefinition {
    FlowDefinition {
        slug: slug.to_string(),
        title: None,
        version: 1,
        bindings,
        max_retries: DEFAULT_MAX_RETRIES,
        session_ttl: DEFAULT_SESSION_TTL,
    }
}

/// The stages and flows the executor tests run against.
///
/// * `default-login`: identification with a fused captcha, then password.
/// * `source-login`: identification offering sources, password skipped once a
///   source vouched for the user.
/// * `risk-login`: identification without captcha, then password.
/// * `policy-login`: identification that hides unknown users, a policy stage
///   rejecting them, then password.
pub(crate) fn default_registry(error_on_invalid_score: bool) -> StageRegistry {
    let mut default_ident = identification_stage("default-identification");
    default_ident.linked_stage = Some("default-captcha".to_string());

    let source_ident = StageRef {
        name: "source-identification".to_string(),
        linked_stage: None,
        config: StageConfig::Identification(IdentificationConfig {
            sources: vec!["github".to_string(), SLOW_SOURCE.to_string()],
            ..Default::default()
        }),
    };

    let pretend_ident = StageRef {
        name: "pretend-identification".to_string(),
        linked_stage: None,
        config: StageConfig::Identification(IdentificationConfig {
            pretend_user_exists: true,
            ..Default::default()
        }),
    };

    let unknown_user_policy = StageRef {
        name: "unknown-user-policy".to_string(),
        linked_stage: None,
        config: StageConfig::Policy(PolicyStageConfig {
            deny_when: BranchPredicate {
                key: CTX_PENDING_USER_UNKNOWN.to_string(),
                equals: true.into(),
            },
            message: UNKNOWN_USER_MSG.to_string(),
        }),
    };

    let stages = vec![
        default_ident,
        captcha_stage("default-captcha", error_on_invalid_score),
        password_stage("default-password"),
        identification_stage("plain-identification"),
        source_ident,
        pretend_ident,
        captcha_stage("risk-captcha", error_on_invalid_score),
        unknown_user_policy,
    ];

    let flows = vec![
        flow(
            "default-login",
            vec![
                FlowBinding::new("default-identification"),
                FlowBinding::new("default-password"),
            ],
        ),
        flow(
            "source-login",
            vec![
                FlowBinding::new("source-identification"),
                FlowBinding::optional(
                    "default-password",
                    BranchPredicate {
                        key: CTX_SOURCE_AUTHENTICATED.to_string(),
                        equals: true.into(),
                    },
                ),
            ],
        ),
        flow(
            "risk-login",
            vec![
                FlowBinding::new("plain-identification"),
                FlowBinding::new("default-password"),
            ],
        ),
        flow(
            "policy-login",
            vec![
                FlowBinding::new("pretend-identification"),
                FlowBinding::new("unknown-user-policy"),
                FlowBinding::new("default-password"),
            ],
        ),
    ];

    StageRegistry::try_from(RegistryConfig { stages, flows }).expect("invalid test registry")
}

pub(crate) fn test_directory() -> StaticUserDirectory {
    StaticUserDirectory::new(vec![UserRecord {
        username: "alice".to_string(),
        email: Some("alice@example.com".to_string()),
        password_hash: test_hash(ALICE_PASSWORD),
    }])
    .expect("invalid test directory")
}

pub(crate) fn test_captcha() -> StaticCaptchaVerifier {
    StaticCaptchaVerifier::new()
        .with_token(TOKEN_SOLVED, true, Some(0.9))
        .with_token(TOKEN_BOT, true, Some(0.1))
}

/// A source that never answers in time.
struct SlowSource;

#[async_trait]
impl Source for SlowSource {
    fn slug(&self) -> &str {
        SLOW_SOURCE
    }

    async fn begin_login(&self, _session_id: Uuid) -> Result<RedirectTarget, SourceError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Err(SourceError::SourceUnavailable)
    }

    async fn complete_callback(
        &self,
        _session_id: Uuid,
        _payload: &SourcePayload,
    ) -> Result<Identity, SourceError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Err(SourceError::SourceUnavailable)
    }
}

pub(crate) fn test_sources() -> SourceTable {
    let mut claims = BTreeMap::new();
    claims.insert("sub".to_string(), "12345".to_string());
    let mut codes = BTreeMap::new();
    codes.insert("good-code".to_string(), claims);

    let github = OAuthRedirectSource::new(
        OAuthSourceConfig {
            slug: "github".to_string(),
            client_id: "gatehouse".to_string(),
            authorization_url: Url::parse("https://provider.example.com/authorize")
                .expect("invalid url"),
            redirect_uri: Url::parse("https://idm.example.com/callback/github")
                .expect("invalid url"),
            scopes: vec!["openid".to_string()],
        },
        Arc::new(StaticIdentityExchange::new(codes)),
    );

    let mut table = SourceTable::new();
    {
        table.insert(Arc::new(github)).expect("duplicate source");
        table.insert(Arc::new(SlowSource)).expect("duplicate source");
    }
    table
}

pub(crate) struct TestEnv {
    pub executor: Arc<FlowExecutor>,
    pub store: Arc<InMemorySessionStore>,
    pub audit_rx: UnboundedReceiver<AuditEvent>,
}

pub(crate) fn setup(error_on_invalid_score: bool) -> TestEnv {
    setup_with(
        default_registry(error_on_invalid_score),
        Arc::new(test_captcha()),
        Arc::new(AllowAll),
    )
}

pub(crate) fn setup_with(
    registry: StageRegistry,
    captcha: Arc<dyn CaptchaVerifier>,
    policy: Arc<dyn PolicyGate>,
) -> TestEnv {
    let store = Arc::new(InMemorySessionStore::new());
    let (audit_tx, audit_rx) = unbounded_channel();

    let collab = Collaborators {
        store: store.clone(),
        sources: Arc::new(test_sources()),
        directory: Arc::new(test_directory()),
        captcha,
        policy,
    };

    let config = ExecutorConfig {
        collaborator_timeout: Duration::from_millis(200),
        session_retention: Duration::from_secs(DEFAULT_SESSION_RETENTION),
    };

    let executor = FlowExecutor::new(Arc::new(registry), collab, audit_tx, config)
        .expect("failed to build executor");

    TestEnv {
        executor: Arc::new(executor),
        store,
        audit_rx,
    }
}
