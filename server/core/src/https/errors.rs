//! Where we hide the error handling widgets
//!

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use gatehouse_proto::internal::OperationError;

/// The web app's top level error type, this takes an `OperationError` and converts it into a HTTP response.
#[derive(Debug)]
pub enum WebError {
    /// Something went wrong when doing things.
    OperationError(OperationError),
}

impl From<OperationError> for WebError {
    fn from(inner: OperationError) -> Self {
        WebError::OperationError(inner)
    }
}

impl WebError {
    pub(crate) fn status_code(&self) -> StatusCode {
        match self {
            WebError::OperationError(inner) => match inner {
                OperationError::FlowNotFound(_)
                | OperationError::SessionNotFound
                | OperationError::SourceNotFound(_) => StatusCode::NOT_FOUND,
                OperationError::InvalidState
                | OperationError::EmptyRequest
                | OperationError::InvalidRequestState
                | OperationError::FL0001PlanVersionMismatch
                | OperationError::SR0001SourceNotPermittedHere
                | OperationError::SR0002CallbackStateMissing => StatusCode::BAD_REQUEST,
                OperationError::Conflict => StatusCode::CONFLICT,
                OperationError::SessionExpired => StatusCode::UNAUTHORIZED,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match self {
            WebError::OperationError(inner) => (
                status,
                serde_json::to_string(&inner).unwrap_or_else(|_err| format!("{:?}", inner)),
            )
                .into_response(),
        }
    }
}
