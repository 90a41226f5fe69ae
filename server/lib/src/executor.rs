//! The executor drives a single login session through its compiled plan. Each
//! operation loads the session, works out the next state in memory, and persists
//! it with a conditional save before anything is returned to the caller. No
//! session state is cached between calls.

use std::collections::BTreeMap;
use std::sync::Arc;

use gatehouse_proto::v1::SourceRequestKind;
use tokio::sync::mpsc::UnboundedSender as Sender;

use crate::audit::{AuditEvent, DenyCause};
use crate::directory::UserDirectory;
use crate::planner::{ExecutionPlan, PlanCache};
use crate::policy::{record_required_stage, required_stage_passed, PolicyDecision, PolicyGate};
use crate::prelude::*;
use crate::registry::StageRegistry;
use crate::session::{FlowSession, FlowStatus, SessionStore};
use crate::source::{SourcePayload, SourceReply, SourceTable};
use crate::stage::{CaptchaVerifier, StageConfig, StageEnv, StageHandler};

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Upper bound on each call to a source or the captcha verifier.
    pub collaborator_timeout: Duration,
    /// How long finished and expired sessions are kept before deletion.
    pub session_retention: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            collaborator_timeout: Duration::from_secs(DEFAULT_COLLABORATOR_TIMEOUT),
            session_retention: Duration::from_secs(DEFAULT_SESSION_RETENTION),
        }
    }
}

/// Everything outside the engine that the executor talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn SessionStore>,
    pub sources: Arc<SourceTable>,
    pub directory: Arc<dyn UserDirectory>,
    pub captcha: Arc<dyn CaptchaVerifier>,
    pub policy: Arc<dyn PolicyGate>,
}

/// The session as persisted after an operation, and what to tell the client.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowResult {
    pub session: FlowSession,
    pub state: FlowState,
}

impl FlowResult {
    pub fn response(&self) -> FlowResponse {
        FlowResponse {
            sessionid: self.session.session_id,
            state: self.state.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SourceLoginStart {
    Redirect(RedirectTarget),
    /// The source could not be reached. The session is unchanged.
    Retry {
        challenge: StageChallenge,
        reason: String,
    },
}

// The outcome of driving a session, before it is persisted.
struct Transition {
    state: FlowState,
    audit: Option<AuditEvent>,
}

impl From<FlowState> for Transition {
    fn from(state: FlowState) -> Self {
        Transition { state, audit: None }
    }
}

pub struct FlowExecutor {
    registry: Arc<StageRegistry>,
    plans: PlanCache,
    store: Arc<dyn SessionStore>,
    sources: Arc<SourceTable>,
    directory: Arc<dyn UserDirectory>,
    captcha: Arc<dyn CaptchaVerifier>,
    policy: Arc<dyn PolicyGate>,
    audit_tx: Sender<AuditEvent>,
    config: ExecutorConfig,
}

impl FlowExecutor {
    /// Every flow is compiled up front, so a bad definition stops the server from
    /// starting rather than failing a user's login later.
    pub fn new(
        registry: Arc<StageRegistry>,
        collab: Collaborators,
        audit_tx: Sender<AuditEvent>,
        config: ExecutorConfig,
    ) -> Result<Self, OperationError> {
        let plans = PlanCache::new();
        for def in registry.flows() {
            plans.get_or_compile(def, &registry)?;
        }

        for stage in registry.stages() {
            let referenced: Vec<&String> = match &stage.config {
                StageConfig::Identification(cfg) => cfg.sources.iter().collect(),
                StageConfig::SourceLogin(cfg) => vec![&cfg.source],
                _ => Vec::new(),
            };
            for slug in referenced {
                collab.sources.get(slug).map_err(|_| {
                    admin_error!(stage = %stage.name, %slug, "stage refers to an unknown source");
                    OperationError::InvalidConfiguration(format!(
                        "stage {} refers to unknown source {}",
                        stage.name, slug
                    ))
                })?;
            }
        }

        Ok(FlowExecutor {
            registry,
            plans,
            store: collab.store,
            sources: collab.sources,
            directory: collab.directory,
            captcha: collab.captcha,
            policy: collab.policy,
            audit_tx,
            config,
        })
    }

    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    fn env(&self) -> StageEnv<'_> {
        StageEnv {
            directory: self.directory.as_ref(),
            captcha: self.captcha.as_ref(),
            collaborator_timeout: self.config.collaborator_timeout,
        }
    }

    fn plan_for(&self, flow_id: &str) -> Result<Arc<ExecutionPlan>, OperationError> {
        let def = self.registry.load(flow_id)?;
        self.plans.get_or_compile(def, &self.registry)
    }

    /// The handler for the step the session is waiting on. Stages demanded by
    /// policy go before the plan.
    fn current_handler(
        &self,
        plan: &ExecutionPlan,
        session: &FlowSession,
    ) -> Result<(String, StageHandler), OperationError> {
        if let Some(name) = session.pending_stages.first() {
            let stage = self.registry.stage(name).map_err(|_| {
                admin_error!(%name, "pending stage is no longer registered");
                OperationError::FL0003PendingStageMissing
            })?;
            return Ok((name.clone(), self.registry.resolve(stage)?));
        }

        plan.step(session.current_stage_index)
            .map(|step| (step.name.clone(), step.handler.clone()))
            .ok_or_else(|| {
                admin_error!(
                    index = session.current_stage_index,
                    "session index is past the end of the plan"
                );
                OperationError::InvalidSessionState("no current stage".to_string())
            })
    }

    /// Load a session that is allowed to make progress, with its plan.
    fn load_active(
        &self,
        session_id: Uuid,
        ct: Duration,
    ) -> Result<(FlowSession, Arc<ExecutionPlan>), OperationError> {
        let session = self.store.load(session_id)?;

        if session.status.is_terminal() {
            security_info!(%session_id, status = ?session.status, "refusing to continue a finished flow");
            return Err(OperationError::InvalidState);
        }

        if session.is_expired_at(ct) {
            security_info!(%session_id, "flow session has expired");
            return Err(OperationError::SessionExpired);
        }

        let plan = self.plan_for(&session.flow_id)?;
        if plan.version != session.plan_version {
            flow_warn!(
                %session_id,
                session_version = session.plan_version,
                plan_version = plan.version,
                "flow definition changed under the session"
            );
            return Err(OperationError::FL0001PlanVersionMismatch);
        }

        Ok((session, plan))
    }

    /// Persist the session against the version it was loaded at, then release
    /// any audit event. Nothing is audited for a write that lost.
    fn commit(
        &self,
        mut session: FlowSession,
        expected_version: u64,
        transition: Transition,
        ct: Duration,
    ) -> Result<FlowResult, OperationError> {
        session.version = expected_version + 1;
        session.updated_at = odt_from_duration(ct);
        self.store.save(&session, expected_version)?;

        if let Some(event) = transition.audit {
            if self.audit_tx.send(event).is_err() {
                admin_error!("Unable to submit audit event to queue");
            }
        }

        Ok(FlowResult {
            session,
            state: transition.state,
        })
    }

    fn deny(
        &self,
        session: &mut FlowSession,
        stage: &str,
        cause: DenyCause,
        reason: String,
        ct: Duration,
    ) -> Transition {
        security_info!(session_id = %session.session_id, %stage, ?cause, %reason, "flow denied");
        session.status = FlowStatus::Failed;

        let user = session
            .context
            .get(CTX_AUTHENTICATED_USER)
            .or_else(|| session.context.get(CTX_PENDING_USER))
            .and_then(|v| v.as_str())
            .map(str::to_string);

        Transition {
            state: FlowState::Denied(reason.clone()),
            audit: Some(AuditEvent::FlowDenied {
                session_id: session.session_id,
                flow: session.flow_id.clone(),
                stage: stage.to_string(),
                cause,
                reason,
                user,
                time: odt_from_duration(ct),
            }),
        }
    }

    fn retry(
        &self,
        plan: &ExecutionPlan,
        session: &mut FlowSession,
        stage: &str,
        handler: &StageHandler,
        reason: String,
        ct: Duration,
    ) -> Transition {
        session.retry_count += 1;
        if session.retry_count > plan.max_retries {
            return self.deny(
                session,
                stage,
                DenyCause::RetriesExhausted,
                RETRIES_EXHAUSTED_MSG.to_string(),
                ct,
            );
        }

        flow_info!(
            session_id = %session.session_id,
            %stage,
            retry_count = session.retry_count,
            %reason,
            "stage requested retry"
        );
        FlowState::Retry {
            challenge: handler.challenge(),
            reason,
        }
        .into()
    }

    fn claims(ctx: &FlowContext) -> BTreeMap<String, String> {
        let mut claims = BTreeMap::new();

        let pending_known = !ctx
            .get(CTX_PENDING_USER_UNKNOWN)
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let username = ctx
            .get(CTX_AUTHENTICATED_USER)
            .and_then(|v| v.as_str())
            .or_else(|| {
                ctx.get(CTX_PENDING_USER)
                    .and_then(|v| v.as_str())
                    .filter(|_| pending_known)
            });
        if let Some(username) = username {
            claims.insert("username".to_string(), username.to_string());
        }

        if let Some(source) = ctx.get(CTX_SOURCE).and_then(|v| v.as_str()) {
            claims.insert("source".to_string(), source.to_string());
        }
        if let Some(serde_json::Value::Object(sc)) = ctx.get(CTX_SOURCE_CLAIMS) {
            for (k, v) in sc.iter() {
                if let Some(v) = v.as_str() {
                    claims.insert(format!("source.{}", k), v.to_string());
                }
            }
        }
        claims
    }

    /// Run the current step with `input`, then keep going through any steps that
    /// need no input from the user.
    async fn drive(
        &self,
        plan: &ExecutionPlan,
        session: &mut FlowSession,
        input: StageInput,
        ct: Duration,
    ) -> Result<Transition, OperationError> {
        let env = self.env();
        let mut input = input;

        loop {
            let (stage, handler) = self.current_handler(plan, session)?;
            flow_trace!(session_id = %session.session_id, %stage, "validating stage");

            let updates = match handler.validate(&input, &session.context, &env).await {
                StageOutcome::Advance(updates) => updates,
                StageOutcome::Retry(reason) => {
                    return Ok(self.retry(plan, session, &stage, &handler, reason, ct))
                }
                StageOutcome::Deny(reason) => {
                    return Ok(self.deny(session, &stage, DenyCause::Stage, reason, ct))
                }
            };

            session.context.extend(updates);
            let from_pending = session.pending_stages.first() == Some(&stage);
            if from_pending {
                record_required_stage(&mut session.context, &stage);
            }

            // The gate decides before the session moves, a veto leaves the index
            // where it was.
            let required = match self.policy.evaluate(&session.context, handler.kind()) {
                PolicyDecision::Allow => None,
                PolicyDecision::Deny(reason) => {
                    return Ok(self.deny(session, &stage, DenyCause::Policy, reason, ct));
                }
                PolicyDecision::RequireStage(name) => {
                    if self.registry.stage(&name).is_err() {
                        // Fail closed, a policy that can not be satisfied denies.
                        admin_error!(%name, "policy demanded an unknown stage");
                        return Ok(self.deny(
                            session,
                            &stage,
                            DenyCause::Policy,
                            "a required verification is unavailable".to_string(),
                            ct,
                        ));
                    }
                    Some(name)
                }
            };

            session.retry_count = 0;
            if from_pending {
                session.pending_stages.remove(0);
            } else {
                session.current_stage_index += 1;
            }

            if let Some(name) = required {
                // Each required stage runs at most once per session.
                if required_stage_passed(&session.context, &name) {
                    flow_trace!(session_id = %session.session_id, required = %name, "required stage already satisfied");
                } else if !session.pending_stages.contains(&name) {
                    security_info!(session_id = %session.session_id, required = %name, "policy requires an additional stage");
                    session.pending_stages.push(name);
                }
            }

            session.current_stage_index = plan.next_index(session.current_stage_index, &session.context);

            if session.pending_stages.is_empty() && session.current_stage_index >= plan.steps.len() {
                session.status = FlowStatus::Completed;
                security_access!(session_id = %session.session_id, flow = %session.flow_id, "flow completed");
                return Ok(FlowState::Success {
                    claims: Self::claims(&session.context),
                }
                .into());
            }

            let (_, next) = self.current_handler(plan, session)?;
            if next.is_interactive() {
                return Ok(FlowState::Challenge(next.challenge()).into());
            }
            input = StageInput::Submission(StageSubmission::default());
        }
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn start(&self, flow_slug: &str, ct: Duration) -> Result<FlowResult, OperationError> {
        self.start_with_context(flow_slug, FlowContext::new(), ct)
            .await
    }

    /// Start a flow with values already present in the context, such as a risk
    /// signal computed from the request.
    #[instrument(level = "debug", skip(self, initial))]
    pub async fn start_with_context(
        &self,
        flow_slug: &str,
        initial: FlowContext,
        ct: Duration,
    ) -> Result<FlowResult, OperationError> {
        let plan = self.plan_for(flow_slug)?;

        let mut session = FlowSession::new(&plan.flow_id, plan.version, plan.session_ttl, ct);
        session.context = initial;
        session.current_stage_index = plan.next_index(0, &session.context);

        let transition = if session.current_stage_index >= plan.steps.len() {
            session.status = FlowStatus::Completed;
            FlowState::Success {
                claims: Self::claims(&session.context),
            }
            .into()
        } else {
            let (_, handler) = self.current_handler(&plan, &session)?;
            if handler.is_interactive() {
                FlowState::Challenge(handler.challenge()).into()
            } else {
                self.drive(
                    &plan,
                    &mut session,
                    StageInput::Submission(StageSubmission::default()),
                    ct,
                )
                .await?
            }
        };

        self.store.insert(&session).map_err(|e| {
            if e == OperationError::Conflict {
                OperationError::FL0002SessionIdCollision
            } else {
                e
            }
        })?;

        security_info!(session_id = %session.session_id, flow = %flow_slug, "flow session started");

        if let Some(event) = transition.audit {
            if self.audit_tx.send(event).is_err() {
                admin_error!("Unable to submit audit event to queue");
            }
        }

        Ok(FlowResult {
            session,
            state: transition.state,
        })
    }

    #[instrument(level = "debug", skip(self, input))]
    pub async fn submit(
        &self,
        session_id: Uuid,
        input: StageInput,
        ct: Duration,
    ) -> Result<FlowResult, OperationError> {
        let (mut session, plan) = self.load_active(session_id, ct)?;
        let expected_version = session.version;

        let transition = self.drive(&plan, &mut session, input, ct).await?;
        self.commit(session, expected_version, transition, ct)
    }

    /// Submit, and when a concurrent request wins the race re-run the input only
    /// if the session is still waiting on the step the input was meant for. If the
    /// winner moved the session on, its state is returned and the input dropped.
    #[instrument(level = "debug", skip(self, input))]
    pub async fn submit_retrying(
        &self,
        session_id: Uuid,
        input: &StageInput,
        ct: Duration,
        attempts: usize,
    ) -> Result<FlowResult, OperationError> {
        let observed = self.store.load(session_id)?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.submit(session_id, input.clone(), ct).await {
                Err(OperationError::Conflict) if attempt < attempts => {
                    let current = self.resume(session_id, ct)?;
                    if !current.session.same_step(&observed) {
                        flow_info!(%session_id, "a concurrent submission moved the session on");
                        return Ok(current);
                    }
                    flow_warn!(%session_id, attempt, "session changed underneath submission, retrying");
                }
                other => return other,
            }
        }
    }

    /// What the client should be shown for a session as it is stored. Nothing is
    /// modified.
    #[instrument(level = "debug", skip(self))]
    pub fn resume(&self, session_id: Uuid, ct: Duration) -> Result<FlowResult, OperationError> {
        let session = self.store.load(session_id)?;

        let state = match session.status {
            FlowStatus::Completed => FlowState::Success {
                claims: Self::claims(&session.context),
            },
            FlowStatus::Failed => FlowState::Denied(FLOW_FAILED_MSG.to_string()),
            FlowStatus::Expired => return Err(OperationError::SessionExpired),
            FlowStatus::InProgress => {
                if session.is_expired_at(ct) {
                    return Err(OperationError::SessionExpired);
                }
                let plan = self.plan_for(&session.flow_id)?;
                if plan.version != session.plan_version {
                    return Err(OperationError::FL0001PlanVersionMismatch);
                }
                let (_, handler) = self.current_handler(&plan, &session)?;
                FlowState::Challenge(handler.challenge())
            }
        };

        Ok(FlowResult { session, state })
    }

    /// Find where to send the user agent for an external login. The session is
    /// not modified.
    #[instrument(level = "debug", skip(self))]
    pub async fn begin_source_login(
        &self,
        session_id: Uuid,
        source_slug: &str,
        ct: Duration,
    ) -> Result<SourceLoginStart, OperationError> {
        self.sources.get(source_slug)?;
        let (session, plan) = self.load_active(session_id, ct)?;

        let (_, handler) = self.current_handler(&plan, &session)?;
        if !handler.accepts_source(source_slug) {
            security_info!(%session_id, %source_slug, "source is not offered at this stage");
            return Err(OperationError::SR0001SourceNotPermittedHere);
        }

        let reply = self
            .sources
            .dispatch(
                source_slug,
                SourceRequestKind::Redirect,
                session_id,
                &SourcePayload::default(),
                self.config.collaborator_timeout,
            )
            .await?;

        match reply {
            Ok(SourceReply::Redirect(target)) => Ok(SourceLoginStart::Redirect(target)),
            Ok(SourceReply::Identity(_)) | Err(_) => Ok(SourceLoginStart::Retry {
                challenge: handler.challenge(),
                reason: BAD_SOURCE_MSG.to_string(),
            }),
        }
    }

    /// Resume the session a source callback belongs to. Any failure of the
    /// source counts as a retry of the current stage and contributes nothing to
    /// the context.
    #[instrument(level = "debug", skip(self, payload))]
    pub async fn complete_source_callback(
        &self,
        source_slug: &str,
        payload: &SourcePayload,
        ct: Duration,
    ) -> Result<FlowResult, OperationError> {
        self.sources.get(source_slug)?;
        let session_id = payload.session_id()?;
        let (mut session, plan) = self.load_active(session_id, ct)?;
        let expected_version = session.version;

        let (stage, handler) = self.current_handler(&plan, &session)?;
        if !handler.accepts_source(source_slug) {
            security_info!(%session_id, %source_slug, "callback for a source not offered at this stage");
            return Err(OperationError::SR0001SourceNotPermittedHere);
        }

        let reply = self
            .sources
            .dispatch(
                source_slug,
                SourceRequestKind::Callback,
                session_id,
                payload,
                self.config.collaborator_timeout,
            )
            .await?;

        let transition = match reply {
            Ok(SourceReply::Identity(identity)) => {
                self.drive(&plan, &mut session, StageInput::Identity(identity), ct)
                    .await?
            }
            Ok(SourceReply::Redirect(_)) | Err(_) => self.retry(
                &plan,
                &mut session,
                &stage,
                &handler,
                BAD_SOURCE_MSG.to_string(),
                ct,
            ),
        };

        self.commit(session, expected_version, transition, ct)
    }

    /// Expire sessions that outlived their ttl and delete those past retention.
    /// Returns how many were expired and deleted.
    #[instrument(level = "debug", skip(self))]
    pub fn expire_sessions(&self, ct: Duration) -> Result<(usize, usize), OperationError> {
        let expired = self.store.mark_expired(ct)?;
        let deleted = self
            .store
            .delete_expired(ct.saturating_sub(self.config.session_retention))?;
        if expired > 0 || deleted > 0 {
            admin_info!(expired, deleted, "swept flow sessions");
        }
        Ok((expired, deleted))
    }
}
