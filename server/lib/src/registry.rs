//! The registry holds the immutable stage and flow configuration of the server.
//! It is built once from configuration and never changes afterwards, a new
//! configuration means a new registry.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::prelude::*;
use crate::stage::{StageConfig, StageHandler, StageRef};

/// A condition over the flow context. Used to skip optional bindings and by
/// policy stages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BranchPredicate {
    pub key: String,
    pub equals: serde_json::Value,
}

impl BranchPredicate {
    pub fn matches(&self, ctx: &FlowContext) -> bool {
        ctx.get(&self.key) == Some(&self.equals)
    }
}

fn default_mandatory() -> bool {
    true
}

/// Places a named stage into a flow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FlowBinding {
    pub stage: String,
    #[serde(default = "default_mandatory")]
    pub mandatory: bool,
    /// Skip this binding when the predicate holds at the time it would run.
    #[serde(default)]
    pub skip_if: Option<BranchPredicate>,
}

impl FlowBinding {
    pub fn new(stage: &str) -> Self {
        FlowBinding {
            stage: stage.to_string(),
            mandatory: true,
            skip_if: None,
        }
    }

    pub fn optional(stage: &str, skip_if: BranchPredicate) -> Self {
        FlowBinding {
            stage: stage.to_string(),
            mandatory: false,
            skip_if: Some(skip_if),
        }
    }
}

fn default_version() -> u64 {
    1
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_session_ttl() -> u64 {
    DEFAULT_SESSION_TTL
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FlowDefinition {
    pub slug: String,
    #[serde(default)]
    pub title: Option<String>,
    /// Bump this whenever the bindings change. Sessions remember the version
    /// they were started with.
    #[serde(default = "default_version")]
    pub version: u64,
    pub bindings: Vec<FlowBinding>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Seconds.
    #[serde(default = "default_session_ttl")]
    pub session_ttl: u64,
}

#[derive(Debug, Clone, Default)]
pub struct RegistryConfig {
    pub stages: Vec<StageRef>,
    pub flows: Vec<FlowDefinition>,
}

#[derive(Debug, Default)]
pub struct StageRegistry {
    stages: BTreeMap<String, StageRef>,
    flows: BTreeMap<String, FlowDefinition>,
}

impl TryFrom<RegistryConfig> for StageRegistry {
    type Error = OperationError;

    fn try_from(cfg: RegistryConfig) -> Result<Self, Self::Error> {
        let mut stages = BTreeMap::new();
        for stage in cfg.stages {
            let name = stage.name.clone();
            if stages.insert(name.clone(), stage).is_some() {
                admin_error!(%name, "stage defined more than once");
                return Err(OperationError::InvalidConfiguration(format!(
                    "stage {} is defined more than once",
                    name
                )));
            }
        }

        let mut flows = BTreeMap::new();
        for flow in cfg.flows {
            let slug = flow.slug.clone();
            if flows.insert(slug.clone(), flow).is_some() {
                admin_error!(%slug, "flow defined more than once");
                return Err(OperationError::InvalidConfiguration(format!(
                    "flow {} is defined more than once",
                    slug
                )));
            }
        }

        admin_info!(stages = stages.len(), flows = flows.len(), "stage registry loaded");
        Ok(StageRegistry { stages, flows })
    }
}

impl StageRegistry {
    pub fn load(&self, slug: &str) -> Result<&FlowDefinition, OperationError> {
        self.flows
            .get(slug)
            .ok_or_else(|| OperationError::FlowNotFound(slug.to_string()))
    }

    pub fn stage(&self, name: &str) -> Result<&StageRef, OperationError> {
        self.stages
            .get(name)
            .ok_or_else(|| OperationError::StageNotFound(name.to_string()))
    }

    pub fn flows(&self) -> impl Iterator<Item = &FlowDefinition> {
        self.flows.values()
    }

    pub fn stages(&self) -> impl Iterator<Item = &StageRef> {
        self.stages.values()
    }

    /// Walk the `linked_stage` references from `root`. The result starts with
    /// `root` itself. Fails if a reference is dangling, loops back on itself, or
    /// names a kind of stage that can not be fused.
    pub fn link_chain<'a>(&'a self, root: &'a StageRef) -> Result<Vec<&'a StageRef>, OperationError> {
        let mut visited = BTreeSet::new();
        visited.insert(root.name.as_str());

        let mut chain = vec![root];
        let mut cursor = root.linked_stage.as_deref();

        while let Some(name) = cursor {
            if !visited.insert(name) {
                admin_error!(root = %root.name, %name, "cyclic stage link");
                return Err(OperationError::InvalidFlowDefinition(format!(
                    "stage {} is linked in a cycle through {}",
                    root.name, name
                )));
            }

            let linked = self.stages.get(name).ok_or_else(|| {
                admin_error!(root = %root.name, %name, "linked stage does not exist");
                OperationError::InvalidFlowDefinition(format!(
                    "stage {} links to missing stage {}",
                    root.name, name
                ))
            })?;

            if !matches!(
                linked.config,
                StageConfig::Captcha(_) | StageConfig::Password(_)
            ) {
                return Err(OperationError::InvalidFlowDefinition(format!(
                    "stage {} can not be fused, only captcha and password stages may be linked",
                    linked.name
                )));
            }

            chain.push(linked);
            cursor = linked.linked_stage.as_deref();
        }

        Ok(chain)
    }

    /// Build the runnable handler for a stage, with its linked stages fused in.
    pub fn resolve(&self, stage: &StageRef) -> Result<StageHandler, OperationError> {
        let chain = self.link_chain(stage)?;

        chain
            .into_iter()
            .rev()
            .fold(None, |linked, s| {
                Some(StageHandler::new(s.name.clone(), s.config.clone(), linked))
            })
            .ok_or_else(|| OperationError::InvalidFlowDefinition(stage.name.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::{BranchPredicate, RegistryConfig, StageRegistry};
    use crate::prelude::*;
    use crate::stage::{
        CaptchaConfig, IdentificationConfig, PasswordConfig, StageConfig, StageRef,
    };
    use crate::testkit::{captcha_stage, default_registry};

    #[test]
    fn test_registry_load_and_lookup() {
        sketching::test_init();
        let registry = default_registry(false);

        assert!(registry.load("default-login").is_ok());
        assert_eq!(
            registry.load("missing").map(|_| ()),
            Err(OperationError::FlowNotFound("missing".to_string()))
        );
        assert_eq!(
            registry.stage("missing").map(|_| ()),
            Err(OperationError::StageNotFound("missing".to_string()))
        );
    }

    #[test]
    fn test_registry_resolve_fused() {
        sketching::test_init();
        let registry = default_registry(false);
        let ident = registry
            .stage("default-identification")
            .expect("missing stage");

        let handler = registry.resolve(ident).expect("failed to resolve");
        assert_eq!(handler.kind(), StageKind::Identification);
        let linked = handler.linked().expect("captcha was not fused");
        assert_eq!(linked.kind(), StageKind::Captcha);
        assert!(linked.linked().is_none());

        let challenge = handler.challenge();
        assert_eq!(
            challenge.fields,
            vec![FIELD_IDENTIFIER.to_string(), FIELD_CAPTCHA_TOKEN.to_string()]
        );
        assert!(challenge.captcha.is_some());
    }

    #[test]
    fn test_registry_resolve_rejects_cycle() {
        sketching::test_init();
        let mut a = captcha_stage("captcha-a", false);
        a.linked_stage = Some("captcha-b".to_string());
        let mut b = captcha_stage("captcha-b", false);
        b.linked_stage = Some("captcha-a".to_string());

        let registry = StageRegistry::try_from(RegistryConfig {
            stages: vec![a, b],
            flows: Vec::new(),
        })
        .expect("failed to build registry");

        let a = registry.stage("captcha-a").expect("missing stage");
        assert_eq!(
            registry.resolve(a).map(|_| ()),
            Err(OperationError::InvalidFlowDefinition(String::new()))
        );
    }

    #[test]
    fn test_registry_resolve_rejects_bad_links() {
        sketching::test_init();
        let dangling = StageRef {
            name: "ident".to_string(),
            linked_stage: Some("nowhere".to_string()),
            config: StageConfig::Identification(IdentificationConfig::default()),
        };
        let links_ident = StageRef {
            name: "password".to_string(),
            linked_stage: Some("ident".to_string()),
            config: StageConfig::Password(PasswordConfig::default()),
        };

        let registry = StageRegistry::try_from(RegistryConfig {
            stages: vec![dangling, links_ident],
            flows: Vec::new(),
        })
        .expect("failed to build registry");

        for name in ["ident", "password"] {
            let s = registry.stage(name).expect("missing stage");
            assert_eq!(
                registry.resolve(s).map(|_| ()),
                Err(OperationError::InvalidFlowDefinition(String::new()))
            );
        }
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        sketching::test_init();
        let r = StageRegistry::try_from(RegistryConfig {
            stages: vec![
                captcha_stage("dup", false),
                StageRef {
                    name: "dup".to_string(),
                    linked_stage: None,
                    config: StageConfig::Captcha(CaptchaConfig {
                        public_key: "other".to_string(),
                        score_min_threshold: 0.0,
                        score_max_threshold: 1.0,
                        error_on_invalid_score: true,
                    }),
                },
            ],
            flows: Vec::new(),
        });
        assert!(r.is_err());
    }

    #[test]
    fn test_branch_predicate() {
        let p = BranchPredicate {
            key: "risk".to_string(),
            equals: "high".into(),
        };
        let mut ctx = FlowContext::new();
        assert!(!p.matches(&ctx));
        ctx.insert("risk".to_string(), "low".into());
        assert!(!p.matches(&ctx));
        ctx.insert("risk".to_string(), "high".into());
        assert!(p.matches(&ctx));
    }
}
