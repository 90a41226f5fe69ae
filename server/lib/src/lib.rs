//! The Gatehouse server library. This implements the authentication flow engine: the
//! stage registry, the flow planner, the executor that drives a login session through
//! its plan, the session stores, and the seams to external sources and risk policy.

#![deny(warnings)]
#![recursion_limit = "512"]
#![warn(unused_extern_crates)]
// Enable some groups of clippy lints.
#![deny(clippy::suspicious)]
#![deny(clippy::perf)]
// Specific lints to enforce.
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::needless_pass_by_value)]
#![deny(clippy::trivially_copy_pass_by_ref)]
#![deny(clippy::manual_let_else)]
#![allow(clippy::unreachable)]

#[macro_use]
extern crate tracing;

pub mod audit;
pub mod constants;
pub mod directory;
pub mod executor;
pub mod planner;
pub mod policy;
pub mod registry;
pub mod session;
pub mod source;
pub mod stage;
pub mod time;
pub(crate) mod utils;

#[cfg(test)]
pub(crate) mod testkit;

/// A prelude of imports that should be imported by all other Gatehouse modules to
/// help make imports cleaner.
pub mod prelude {
    pub use gatehouse_proto::constants::*;
    pub use gatehouse_proto::internal::OperationError;
    pub use gatehouse_proto::v1::{
        FlowResponse, FlowState, Identity, RedirectTarget, StageChallenge, StageKind,
        StageSubmission,
    };
    pub use sketching::{
        admin_debug, admin_error, admin_info, admin_warn, flow_error, flow_info, flow_trace,
        flow_warn, request_error, request_info, request_trace, request_warn, security_access,
        security_critical, security_debug, security_error, security_info, source_error,
        source_info, source_warn, tagged_event, EventTag,
    };
    pub use std::time::Duration;
    pub use time::OffsetDateTime;
    pub use url::Url;
    pub use uuid::Uuid;

    pub use crate::constants::*;
    pub use crate::stage::{FlowContext, StageInput, StageOutcome};
    pub use crate::time::*;
}
