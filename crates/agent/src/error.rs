//! Agent error types

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentError {
    /// A browser tool failed; reported back to the model as an error result
    #[error("Tool '{tool}' failed: {reason}")]
    ToolExecution { tool: String, reason: String },

    #[error("Model call failed: {0}")]
    Model(String),

    #[error("cancelled")]
    Cancelled,
}

pub type AgentResult<T> = std::result::Result<T, AgentError>;
