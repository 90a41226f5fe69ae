use crate::prelude::*;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Why a flow was denied.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum DenyCause {
    /// A stage handler refused the submission outright.
    Stage,
    /// The policy gate vetoed an advance.
    Policy,
    /// The stage was retried more often than the flow allows.
    RetriesExhausted,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum AuditEvent {
    FlowDenied {
        session_id: Uuid,
        flow: String,
        stage: String,
        cause: DenyCause,
        reason: String,
        /// The user the flow was acting for, if one had been identified.
        user: Option<String>,
        #[serde(with = "time::serde::timestamp")]
        time: OffsetDateTime,
    },
}
