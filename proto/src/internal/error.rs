use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "lowercase")]
pub enum OperationError {
    // Lookup failures. These are terminal for the request.
    FlowNotFound(String),
    SessionNotFound,
    SourceNotFound(String),
    StageNotFound(String),

    // Session lifecycle.
    SessionExpired,
    InvalidState,
    InvalidSessionState(String),
    Conflict,

    // Raised while compiling a flow, never while executing a plan.
    InvalidFlowDefinition(String),

    // Third party collaborators. The executor translates these into retry
    // outcomes, they only surface directly from the source dispatcher.
    SourceUnavailable,
    Timeout,

    // Request shape.
    EmptyRequest,
    InvalidRequestState,

    // Infrastructure.
    Backend,
    SqliteError,
    SerdeJsonError,
    FsError,
    QueueDisconnected,
    CryptographyError,
    InvalidConfiguration(String),

    // Coded errors.
    FL0001PlanVersionMismatch,
    FL0002SessionIdCollision,
    FL0003PendingStageMissing,
    SR0001SourceNotPermittedHere,
    SR0002CallbackStateMissing,
}

impl PartialEq for OperationError {
    fn eq(&self, other: &Self) -> bool {
        // Only the variant matters, the payload is for humans.
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

impl Eq for OperationError {}

impl Display for OperationError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        let mut output = format!("{:?}", self)
            .split("::")
            .last()
            .unwrap_or("")
            .to_string();

        if let Some(msg) = self.message() {
            output += &format!(" - {}", msg);
        };
        f.write_str(&output)
    }
}

impl OperationError {
    /// Return the message associated with the error if there is one.
    pub fn message(&self) -> Option<String> {
        match self {
            Self::FlowNotFound(_) => None,
            Self::SessionNotFound => None,
            Self::SourceNotFound(_) => None,
            Self::StageNotFound(_) => None,
            Self::SessionExpired => None,
            Self::InvalidState => {
                Some("The flow session has already finished, start a new login.".into())
            }
            Self::InvalidSessionState(_) => None,
            Self::Conflict => Some(
                "The flow session was modified concurrently, reload it and try again.".into(),
            ),
            Self::InvalidFlowDefinition(_) => None,
            Self::SourceUnavailable => None,
            Self::Timeout => None,
            Self::EmptyRequest => None,
            Self::InvalidRequestState => None,
            Self::Backend => None,
            Self::SqliteError => None,
            Self::SerdeJsonError => None,
            Self::FsError => None,
            Self::QueueDisconnected => None,
            Self::CryptographyError => None,
            Self::InvalidConfiguration(_) => None,
            Self::FL0001PlanVersionMismatch => Some(
                "The flow definition changed while this session was in progress.".into(),
            ),
            Self::FL0002SessionIdCollision => {
                Some("A flow session with this identifier already exists.".into())
            }
            Self::FL0003PendingStageMissing => {
                Some("A stage required by policy is no longer registered.".into())
            }
            Self::SR0001SourceNotPermittedHere => {
                Some("This source can not be used at the current stage of the flow.".into())
            }
            Self::SR0002CallbackStateMissing => {
                Some("The callback did not carry a state parameter.".into())
            }
        }
    }

    /// True for the family of errors that mean "the thing you asked for does not exist".
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::FlowNotFound(_)
                | Self::SessionNotFound
                | Self::SourceNotFound(_)
                | Self::StageNotFound(_)
        )
    }
}

#[test]
fn test_operationerror_as_nice_string() {
    assert_eq!(
        OperationError::SessionExpired.to_string(),
        "SessionExpired".to_string()
    );
    assert_eq!(
        OperationError::Conflict.to_string(),
        "Conflict - The flow session was modified concurrently, reload it and try again."
            .to_string()
    );
    assert_eq!(
        OperationError::InvalidFlowDefinition("cycle".to_string()).to_string(),
        "InvalidFlowDefinition(\"cycle\")".to_string()
    );
    assert_eq!(
        OperationError::FlowNotFound("a".to_string()),
        OperationError::FlowNotFound("b".to_string())
    );
    assert!(OperationError::SessionNotFound.is_not_found());
    assert!(!OperationError::Conflict.is_not_found());
}
