use std::time::Duration;

use mesh_core::{CommandId, ResponseFrame};

/// Failures raised on the agent while serving a command or holding the
/// socket. Command-level variants are always turned into a response frame.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Local API answered with an error; the message is forwarded as is.
    #[error("{0}")]
    LocalApi(String),
    #[error("local API call timed out after {0:?}")]
    LocalTimeout(Duration),
    #[error("failed to prepare model {model}: {reason}")]
    Precondition { model: String, reason: String },
    #[error("{0}")]
    Busy(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("token rejected by coordinator")]
    Unauthorized,
}

impl AgentError {
    /// Error response for `command_id`. `Busy` carries the BUSY code.
    pub fn into_response(self, command_id: CommandId) -> ResponseFrame {
        match self {
            Self::Busy(message) => ResponseFrame::busy(command_id, message),
            other => ResponseFrame::error(command_id, other.to_string()),
        }
    }
}
