//! This contains scheduled tasks/interval tasks that are run inside of the server on a schedule
//! as background operations.

use std::sync::Arc;

use gatehoused_lib::executor::FlowExecutor;
use gatehoused_lib::prelude::*;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};

use crate::CoreAction;

pub(crate) struct IntervalActor;

impl IntervalActor {
    /// Expire sessions past their ttl, and delete them once retention lapses.
    pub fn start(
        executor: Arc<FlowExecutor>,
        frequency: Duration,
        mut rx: broadcast::Receiver<CoreAction>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut inter = interval(frequency);
            inter.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    Ok(action) = rx.recv() => {
                        match action {
                            CoreAction::Shutdown => break,
                        }
                    }
                    _ = inter.tick() => {
                        if let Err(e) = executor.expire_sessions(duration_from_epoch_now()) {
                            admin_error!(?e, "session sweep failed");
                        }
                    }
                }
            }

            info!("Stopped {}", super::TaskName::IntervalActor);
        })
    }
}
