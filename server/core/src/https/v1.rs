//! The flow endpoints. Each handler is a thin adapter between http and the
//! [`FlowExecutor`](gatehoused_lib::executor::FlowExecutor).

use std::collections::BTreeMap;

use axum::extract::{Form, Path, Query, State};
use axum::response::{IntoResponse, Redirect, Response};
use axum::Json;
use gatehoused_lib::executor::{FlowResult, SourceLoginStart};
use gatehoused_lib::prelude::*;
use gatehoused_lib::source::SourcePayload;
use serde::Deserialize;

use super::errors::WebError;
use super::ServerState;

/// How many attempts a submission gets when it keeps losing races to concurrent
/// requests on the same session.
const CONFLICT_RETRY_LIMIT: usize = 3;

pub async fn status() -> impl IntoResponse {
    "true"
}

#[instrument(level = "debug", skip(state))]
pub async fn flow_start(
    State(state): State<ServerState>,
    Path(flow_slug): Path<String>,
) -> Result<Json<FlowResponse>, WebError> {
    let res = state
        .executor
        .start(&flow_slug, duration_from_epoch_now())
        .await?;
    request_info!(session_id = %res.session.session_id, %flow_slug, "flow started");
    Ok(Json(res.response()))
}

#[instrument(level = "debug", skip(state))]
pub async fn flow_resume(
    State(state): State<ServerState>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<FlowResponse>, WebError> {
    let res = state
        .executor
        .resume(session_id, duration_from_epoch_now())?;
    Ok(Json(res.response()))
}

#[instrument(level = "debug", skip(state, submission))]
pub async fn flow_submit(
    State(state): State<ServerState>,
    Path(session_id): Path<Uuid>,
    Json(submission): Json<StageSubmission>,
) -> Result<Json<FlowResponse>, WebError> {
    request_trace!(?submission, "stage submission");

    let res: FlowResult = state
        .executor
        .submit_retrying(
            session_id,
            &StageInput::Submission(submission),
            duration_from_epoch_now(),
            CONFLICT_RETRY_LIMIT,
        )
        .await?;

    Ok(Json(res.response()))
}

#[derive(Debug, Deserialize)]
pub struct SourceLoginQuery {
    pub session: Uuid,
}

#[instrument(level = "debug", skip(state))]
pub async fn source_login(
    State(state): State<ServerState>,
    Path(source_slug): Path<String>,
    Query(query): Query<SourceLoginQuery>,
) -> Result<Response, WebError> {
    let start = state
        .executor
        .begin_source_login(query.session, &source_slug, duration_from_epoch_now())
        .await?;

    match start {
        SourceLoginStart::Redirect(target) => {
            request_info!(session_id = %query.session, %source_slug, "redirecting to source");
            Ok(Redirect::to(target.url.as_str()).into_response())
        }
        SourceLoginStart::Retry { challenge, reason } => Ok(Json(FlowResponse {
            sessionid: query.session,
            state: FlowState::Retry { challenge, reason },
        })
        .into_response()),
    }
}

async fn source_callback(
    state: &ServerState,
    source_slug: &str,
    params: BTreeMap<String, String>,
) -> Result<Json<FlowResponse>, WebError> {
    let payload = SourcePayload::from(params);
    request_trace!(?payload, %source_slug, "source callback");

    // Callbacks are not retried on conflict, the outstanding redirect has
    // been consumed by the first attempt.
    let res = state
        .executor
        .complete_source_callback(source_slug, &payload, duration_from_epoch_now())
        .await?;
    Ok(Json(res.response()))
}

#[instrument(level = "debug", skip(state, params))]
pub async fn source_callback_get(
    State(state): State<ServerState>,
    Path(source_slug): Path<String>,
    Query(params): Query<BTreeMap<String, String>>,
) -> Result<Json<FlowResponse>, WebError> {
    source_callback(&state, &source_slug, params).await
}

#[instrument(level = "debug", skip(state, params))]
pub async fn source_callback_post(
    State(state): State<ServerState>,
    Path(source_slug): Path<String>,
    Form(params): Form<BTreeMap<String, String>>,
) -> Result<Json<FlowResponse>, WebError> {
    source_callback(&state, &source_slug, params).await
}
