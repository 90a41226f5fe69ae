//! The planner compiles a flow definition into an [`ExecutionPlan`]. Compilation is
//! pure, so plans are cached per flow slug and definition version.

use std::collections::BTreeMap;
use std::sync::Arc;

use concread::hashmap::HashMap;

use crate::prelude::*;
use crate::registry::{BranchPredicate, FlowDefinition, StageRegistry};
use crate::stage::StageHandler;

#[derive(Debug, Clone, PartialEq)]
pub struct PlanStep {
    pub name: String,
    pub handler: StageHandler,
    pub mandatory: bool,
    pub skip_if: Option<BranchPredicate>,
}

impl PlanStep {
    fn is_skipped(&self, ctx: &FlowContext) -> bool {
        !self.mandatory && self.skip_if.as_ref().is_some_and(|p| p.matches(ctx))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionPlan {
    pub flow_id: String,
    pub version: u64,
    pub steps: Vec<PlanStep>,
    pub max_retries: u32,
    pub session_ttl: Duration,
}

impl ExecutionPlan {
    pub fn step(&self, idx: usize) -> Option<&PlanStep> {
        self.steps.get(idx)
    }

    /// The first index at or after `from` whose step is not skipped under `ctx`.
    /// Returns `steps.len()` when nothing remains.
    pub fn next_index(&self, from: usize, ctx: &FlowContext) -> usize {
        self.steps
            .iter()
            .enumerate()
            .skip(from)
            .find(|(_, step)| !step.is_skipped(ctx))
            .map(|(i, _)| i)
            .unwrap_or(self.steps.len())
    }
}

#[instrument(level = "debug", skip_all, fields(flow = %def.slug, version = def.version))]
pub fn compile(def: &FlowDefinition, registry: &StageRegistry) -> Result<ExecutionPlan, OperationError> {
    if def.bindings.is_empty() {
        return Err(OperationError::InvalidFlowDefinition(format!(
            "flow {} has no stages",
            def.slug
        )));
    }

    // Check every binding and its links before building anything, and note which
    // stages are fused into others.
    let mut fused_into: BTreeMap<&str, &str> = BTreeMap::new();
    let mut bound = Vec::with_capacity(def.bindings.len());
    for binding in def.bindings.iter() {
        let stage = registry.stage(&binding.stage).map_err(|_| {
            admin_error!(stage = %binding.stage, "flow binds an unknown stage");
            OperationError::InvalidFlowDefinition(format!(
                "flow {} binds unknown stage {}",
                def.slug, binding.stage
            ))
        })?;

        if binding.mandatory && binding.skip_if.is_some() {
            return Err(OperationError::InvalidFlowDefinition(format!(
                "binding of {} is mandatory and can not carry a skip predicate",
                binding.stage
            )));
        }

        let chain = registry.link_chain(stage)?;
        for linked in chain.iter().skip(1) {
            fused_into.insert(linked.name.as_str(), stage.name.as_str());
        }
        bound.push((binding, stage));
    }

    let mut steps = Vec::with_capacity(bound.len());
    for (binding, stage) in bound {
        if let Some(host) = fused_into.get(stage.name.as_str()) {
            return Err(OperationError::InvalidFlowDefinition(format!(
                "stage {} is fused into {} and can not be bound on its own",
                stage.name, host
            )));
        }

        steps.push(PlanStep {
            name: stage.name.clone(),
            handler: registry.resolve(stage)?,
            mandatory: binding.mandatory,
            skip_if: binding.skip_if.clone(),
        });
    }

    flow_trace!(steps = steps.len(), "compiled flow");

    Ok(ExecutionPlan {
        flow_id: def.slug.clone(),
        version: def.version,
        steps,
        max_retries: def.max_retries,
        session_ttl: Duration::from_secs(def.session_ttl),
    })
}

/// Compiled plans keyed by flow slug and definition version.
pub struct PlanCache {
    plans: HashMap<(String, u64), Arc<ExecutionPlan>>,
}

impl Default for PlanCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PlanCache {
    pub fn new() -> Self {
        PlanCache {
            plans: HashMap::new(),
        }
    }

    pub fn get_or_compile(
        &self,
        def: &FlowDefinition,
        registry: &StageRegistry,
    ) -> Result<Arc<ExecutionPlan>, OperationError> {
        let key = (def.slug.clone(), def.version);
        if let Some(plan) = self.plans.read().get(&key) {
            return Ok(plan.clone());
        }

        let plan = Arc::new(compile(def, registry)?);
        let mut plans_write = self.plans.write();
        plans_write.insert(key, plan.clone());
        plans_write.commit();
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{compile, PlanCache};
    use crate::prelude::*;
    use crate::registry::{BranchPredicate, FlowBinding, FlowDefinition, RegistryConfig, StageRegistry};
    use crate::testkit::{captcha_stage, default_registry, flow, identification_stage, password_stage};

    #[test]
    fn test_planner_compile_is_deterministic() {
        sketching::test_init();
        let registry = default_registry(false);
        let def = registry.load("default-login").expect("missing flow");

        let a = compile(def, &registry).expect("compile failed");
        let b = compile(def, &registry).expect("compile failed");
        assert_eq!(a, b);

        // The fused captcha is not a step of its own.
        assert_eq!(a.steps.len(), 2);
        assert_eq!(a.steps[0].handler.kind(), StageKind::Identification);
        assert_eq!(a.steps[1].handler.kind(), StageKind::Password);
        assert_eq!(a.max_retries, 3);
    }

    #[test]
    fn test_planner_rejects_cycles() {
        sketching::test_init();
        let mut a = captcha_stage("captcha-a", false);
        a.linked_stage = Some("captcha-b".to_string());
        let mut b = captcha_stage("captcha-b", false);
        b.linked_stage = Some("captcha-a".to_string());
        let mut ident = identification_stage("ident");
        ident.linked_stage = Some("captcha-a".to_string());

        let registry = StageRegistry::try_from(RegistryConfig {
            stages: vec![a, b, ident],
            flows: vec![flow("cyclic", vec![FlowBinding::new("ident")])],
        })
        .expect("failed to build registry");

        let def = registry.load("cyclic").expect("missing flow");
        assert_eq!(
            compile(def, &registry).map(|_| ()),
            Err(OperationError::InvalidFlowDefinition(String::new()))
        );
    }

    #[test]
    fn test_planner_rejects_bad_bindings() {
        sketching::test_init();
        let mut ident = identification_stage("ident");
        ident.linked_stage = Some("captcha".to_string());

        let registry = StageRegistry::try_from(RegistryConfig {
            stages: vec![ident, captcha_stage("captcha", false), password_stage("password")],
            flows: vec![
                flow("empty", Vec::new()),
                flow("unknown", vec![FlowBinding::new("nope")]),
                flow(
                    "mandatory-skip",
                    vec![FlowBinding {
                        stage: "password".to_string(),
                        mandatory: true,
                        skip_if: Some(BranchPredicate {
                            key: "x".to_string(),
                            equals: true.into(),
                        }),
                    }],
                ),
                flow(
                    "fused-twice",
                    vec![FlowBinding::new("ident"), FlowBinding::new("captcha")],
                ),
            ],
        })
        .expect("failed to build registry");

        for slug in ["empty", "unknown", "mandatory-skip", "fused-twice"] {
            let def = registry.load(slug).expect("missing flow");
            assert_eq!(
                compile(def, &registry).map(|_| ()),
                Err(OperationError::InvalidFlowDefinition(String::new())),
                "{} should not compile",
                slug
            );
        }
    }

    #[test]
    fn test_planner_next_index_skips_optional() {
        sketching::test_init();
        let registry = StageRegistry::try_from(RegistryConfig {
            stages: vec![identification_stage("ident"), password_stage("password")],
            flows: vec![flow(
                "skippable",
                vec![
                    FlowBinding::new("ident"),
                    FlowBinding::optional(
                        "password",
                        BranchPredicate {
                            key: CTX_SOURCE_AUTHENTICATED.to_string(),
                            equals: true.into(),
                        },
                    ),
                ],
            )],
        })
        .expect("failed to build registry");

        let plan = compile(registry.load("skippable").expect("missing flow"), &registry)
            .expect("compile failed");

        let mut ctx = FlowContext::new();
        assert_eq!(plan.next_index(1, &ctx), 1);
        ctx.insert(CTX_SOURCE_AUTHENTICATED.to_string(), true.into());
        assert_eq!(plan.next_index(1, &ctx), 2);
        assert_eq!(plan.next_index(0, &ctx), 0);
    }

    #[test]
    fn test_planner_cache_keys_on_version() {
        sketching::test_init();
        let registry = default_registry(false);
        let cache = PlanCache::new();
        let def = registry.load("default-login").expect("missing flow");

        let a = cache.get_or_compile(def, &registry).expect("compile failed");
        let b = cache.get_or_compile(def, &registry).expect("compile failed");
        assert!(Arc::ptr_eq(&a, &b));

        let bumped = FlowDefinition {
            version: def.version + 1,
            ..def.clone()
        };
        let c = cache.get_or_compile(&bumped, &registry).expect("compile failed");
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(c.version, def.version + 1);
    }
}
