//! Error types for flow parsing and execution

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FlowError {
    /// Flow text could not be decoded; the flow is skipped
    #[error("Malformed flow '{name}': {reason}")]
    Malformed { name: String, reason: String },

    #[error("Recursion detected: flow '{name}' is already running (depth {depth})")]
    RecursionDetected { name: String, depth: usize },

    #[error("Unknown flow: {0}")]
    UnknownFlow(String),

    #[error("Command failed: {0}")]
    CommandFailed(String),

    #[error("Timeout after {timeout_ms} ms waiting for {what}")]
    Timeout {
        what: String,
        timeout_ms: u64,
        last_response: Option<String>,
    },

    #[error("Cancelled")]
    Cancelled,

    #[error("Run deadline exceeded")]
    DeadlineExceeded,

    #[error("Browser error: {0}")]
    Browser(String),
}

impl FlowError {
    /// Attach the flow name to a decode error
    pub fn for_flow(self, flow: &str) -> Self {
        match self {
            FlowError::Malformed { reason, .. } => FlowError::Malformed {
                name: flow.to_string(),
                reason,
            },
            other => other,
        }
    }
}

impl From<flowscout_common::Error> for FlowError {
    fn from(err: flowscout_common::Error) -> Self {
        match err {
            flowscout_common::Error::Browser(msg) => FlowError::Browser(msg),
            flowscout_common::Error::Timeout { seconds } => FlowError::Timeout {
                what: "browser".to_string(),
                timeout_ms: seconds.saturating_mul(1000),
                last_response: None,
            },
            other => FlowError::CommandFailed(other.to_string()),
        }
    }
}

pub type FlowResult<T> = Result<T, FlowError>;
