//! Request spans for the http server, created at "INFO" so every event inside a handler has a
//! span to attach to.

use axum::http::Request;
use tracing::{Level, Span};

#[derive(Debug, Clone, Default)]
pub(crate) struct MakeSpanGatehoused {}

impl<B> tower_http::trace::MakeSpan<B> for MakeSpanGatehoused {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        tracing::span!(
            Level::INFO,
            "request",
            method = %request.method(),
            uri = %request.uri(),
            version = ?request.version(),
            status_code = tracing::field::Empty, // filled in later
            latency = tracing::field::Empty, // filled in later
        )
    }
}

#[derive(Clone, Debug, Default)]
pub(crate) struct OnResponseGatehoused {}

impl<B> tower_http::trace::OnResponse<B> for OnResponseGatehoused {
    fn on_response(
        self,
        response: &axum::response::Response<B>,
        latency: std::time::Duration,
        span: &Span,
    ) {
        span.record("latency", latency.as_millis());
        span.record("status_code", response.status().as_u16());
    }
}
