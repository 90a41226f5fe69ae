mod errors;
mod trace;
mod v1;


use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use gatehoused_lib::executor::FlowExecutor;
use gatehoused_lib::prelude::*;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;

use crate::CoreAction;

#[derive(Clone)]
pub struct ServerState {
    pub executor: Arc<FlowExecutor>,
}

pub(crate) fn build_router(state: ServerState) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(trace::MakeSpanGatehoused::default())
        .on_response(trace::OnResponseGatehoused::default());

    Router::new()
        .route("/status", get(v1::status))
        .route("/v1/flow/:flow_slug", post(v1::flow_start))
        .route(
            "/v1/flow/session/:session_id",
            get(v1::flow_resume).post(v1::flow_submit),
        )
        .route("/login/:source_slug", get(v1::source_login))
        .route(
            "/callback/:source_slug",
            get(v1::source_callback_get).post(v1::source_callback_post),
        )
        .layer(trace_layer)
        .with_state(state)
}

pub(crate) async fn create_https_server(
    address: &str,
    state: ServerState,
    mut rx: broadcast::Receiver<CoreAction>,
) -> Result<tokio::task::JoinHandle<()>, ()> {
    let addr = SocketAddr::from_str(address).map_err(|err| {
        error!(
            "Failed to parse address ({:?}) from config: {:?}",
            address, err
        );
    })?;

    let listener = TcpListener::bind(addr).await.map_err(|err| {
        error!("Failed to bind {}: {:?}", addr, err);
    })?;

    admin_info!("Starting the web server on {}", addr);

    let app = build_router(state);

    Ok(tokio::spawn(async move {
        let res = axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move {
                // Any action, or a closed channel, stops the listener.
                let _ = rx.recv().await;
            })
            .await;
        if let Err(err) = res {
            error!(?err, "Web server stopped unexpectedly");
        }
        info!("Stopped {}", crate::TaskName::HttpsServer);
    }))
}
