//! These contain the server "core". This is able to start the server to a running
//! state: it builds the flow executor from the configuration, then launches the
//! http listener, the interval sweeper and the audit consumer as tasks.
//!
//! Generally, this is the "entry point" where the server begins to run, and
//! the entry point for all client traffic which is then directed to the
//! flow executor.

#![deny(warnings)]
#![warn(unused_extern_crates)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::unreachable)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::needless_pass_by_value)]
#![deny(clippy::trivially_copy_pass_by_ref)]

#[macro_use]
extern crate tracing;

pub mod config;
mod https;
mod interval;

use std::fmt;
use std::sync::Arc;

use gatehoused_lib::audit::AuditEvent;
use gatehoused_lib::directory::StaticUserDirectory;
use gatehoused_lib::executor::{Collaborators, ExecutorConfig, FlowExecutor};
use gatehoused_lib::policy::{AllowAll, PolicyGate};
use gatehoused_lib::prelude::*;
use gatehoused_lib::registry::StageRegistry;
use gatehoused_lib::session::{InMemorySessionStore, SessionStore, SqliteSessionStore};
use gatehoused_lib::source::{OAuthRedirectSource, SourceTable, StaticIdentityExchange};
use gatehoused_lib::stage::StaticCaptchaVerifier;
use tokio::sync::broadcast;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::config::Configuration;
use crate::https::ServerState;
use crate::interval::IntervalActor;

#[derive(Clone, Debug)]
pub enum CoreAction {
    Shutdown,
}

pub(crate) enum TaskName {
    AuditdActor,
    HttpsServer,
    IntervalActor,
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TaskName::AuditdActor => "AuditdActor",
            TaskName::HttpsServer => "HttpsServer",
            TaskName::IntervalActor => "IntervalActor",
        })
    }
}

pub struct CoreHandle {
    clean_shutdown: bool,
    tx: broadcast::Sender<CoreAction>,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl CoreHandle {
    pub async fn shutdown(&mut self) {
        if self.tx.send(CoreAction::Shutdown).is_err() {
            eprintln!("No receivers acked shutdown request. Treating as unclean.");
            return;
        }

        // Wait on the handles.
        while let Some(handle) = self.handles.pop() {
            if handle.await.is_err() {
                eprintln!("A task failed to join");
            }
        }

        self.clean_shutdown = true;
    }
}

impl Drop for CoreHandle {
    fn drop(&mut self) {
        if !self.clean_shutdown {
            eprintln!("⚠️  UNCLEAN SHUTDOWN OCCURRED ⚠️ ");
        }
    }
}

// === internal setup helpers

fn setup_session_store(config: &Configuration) -> Result<Arc<dyn SessionStore>, OperationError> {
    match &config.db_path {
        Some(path) => {
            admin_info!(%path, "using sqlite session store");
            Ok(Arc::new(SqliteSessionStore::open(path)?))
        }
        None => {
            admin_warn!("no db_path set, sessions will not survive a restart");
            Ok(Arc::new(InMemorySessionStore::new()))
        }
    }
}

fn setup_sources(config: &Configuration) -> Result<SourceTable, OperationError> {
    let mut table = SourceTable::new();
    for source in config.sources.iter() {
        let exchange = Arc::new(StaticIdentityExchange::new(source.codes.clone()));
        table.insert(Arc::new(OAuthRedirectSource::new(source.oauth(), exchange)))?;
    }
    Ok(table)
}

/// Build the executor and everything it talks to from the configuration. The
/// receiver yields the audit events the executor emits.
pub fn setup_executor(
    config: &Configuration,
) -> Result<(FlowExecutor, UnboundedReceiver<AuditEvent>), OperationError> {
    let registry = StageRegistry::try_from(config.registry.clone())?;

    let captcha = config
        .captcha
        .tokens
        .iter()
        .fold(StaticCaptchaVerifier::new(), |v, t| {
            v.with_token(&t.token, t.success, t.score)
        });

    let policy: Arc<dyn PolicyGate> = match &config.risk_policy {
        Some(risk) => {
            registry.stage(&risk.require_stage).map_err(|e| {
                admin_error!(stage = %risk.require_stage, "risk policy requires an unknown stage");
                e
            })?;
            Arc::new(risk.clone())
        }
        None => Arc::new(AllowAll),
    };

    let collab = Collaborators {
        store: setup_session_store(config)?,
        sources: Arc::new(setup_sources(config)?),
        directory: Arc::new(StaticUserDirectory::new(config.users.clone())?),
        captcha: Arc::new(captcha),
        policy,
    };

    let (audit_tx, audit_rx): (UnboundedSender<AuditEvent>, _) = unbounded_channel();

    let executor = FlowExecutor::new(
        Arc::new(registry),
        collab,
        audit_tx,
        ExecutorConfig {
            collaborator_timeout: config.source_timeout,
            session_retention: config.session_retention,
        },
    )?;

    Ok((executor, audit_rx))
}

pub async fn create_server_core(
    config: Configuration,
    config_test: bool,
) -> Result<CoreHandle, ()> {
    let (broadcast_tx, mut broadcast_rx) = broadcast::channel(4);

    info!(
        "Starting gatehouse with configuration: {} {}",
        if config_test { "TEST" } else { "" },
        config
    );

    let (executor, mut audit_rx) = match setup_executor(&config) {
        Ok(t) => t,
        Err(e) => {
            error!("Unable to setup the flow executor -> {:?}", e);
            return Err(());
        }
    };

    if config_test {
        admin_info!("this config rocks! 🪨 ");
        return Ok(CoreHandle {
            clean_shutdown: true,
            tx: broadcast_tx,
            handles: Vec::new(),
        });
    }

    let executor = Arc::new(executor);

    let auditd_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                Ok(action) = broadcast_rx.recv() => {
                    match action {
                        CoreAction::Shutdown => break,
                    }
                }
                audit_event = audit_rx.recv() => {
                    let Some(audit_event) = audit_event else {
                        // All senders are gone, nothing more will arrive.
                        break;
                    };
                    match serde_json::to_string(&audit_event) {
                        Ok(audit_event) => {
                            warn!(%audit_event);
                        }
                        Err(e) => {
                            error!(err=?e, "Unable to process audit event to json.");
                            warn!(?audit_event, json=false);
                        }
                    }
                }
            }
        }
        info!("Stopped {}", TaskName::AuditdActor);
    });

    let interval_handle = IntervalActor::start(
        executor.clone(),
        config.sweep_interval,
        broadcast_tx.subscribe(),
    );

    let state = ServerState { executor };

    let https_handle =
        https::create_https_server(&config.address, state, broadcast_tx.subscribe()).await?;
    admin_info!("ready to rock! 🪨 flows available at: {}", config.origin);

    Ok(CoreHandle {
        clean_shutdown: false,
        tx: broadcast_tx,
        handles: vec![interval_handle, auditd_handle, https_handle],
    })
}
