use std::time::Duration;

use crate::ids::CommandId;

/// Outcome of a relayed command that did not produce a result.
///
/// Protocol failures (not connected, timeout, disconnect) are raised by the
/// coordinator itself; `Busy` and `AgentError` originate on the agent and
/// arrive inside a response frame.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("recipient not connected: {0}")]
    NotConnected(String),
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("agent disconnected while the command was outstanding")]
    Disconnected,
    #[error("agent busy: {0}")]
    Busy(String),
    #[error("{0}")]
    AgentError(String),
    #[error("command id already pending: {0}")]
    DuplicateCommandId(CommandId),
    #[error("failed to send command: {0}")]
    SendFailed(String),
}

impl CommandError {
    /// Stable string code carried in HTTP bodies and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotConnected(_) => "NOT_CONNECTED",
            Self::Timeout(_) => "TIMEOUT",
            Self::Disconnected => "DISCONNECTED",
            Self::Busy(_) => "BUSY",
            Self::AgentError(_) => "AGENT_ERROR",
            Self::DuplicateCommandId(_) => "DUPLICATE_COMMAND_ID",
            Self::SendFailed(_) => "SEND_FAILED",
        }
    }

    /// HTTP status used by the control surface for single-recipient calls.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotConnected(_) => 404,
            Self::Timeout(_) => 504,
            Self::Disconnected | Self::SendFailed(_) => 503,
            Self::Busy(_) | Self::DuplicateCommandId(_) => 409,
            Self::AgentError(_) => 502,
        }
    }

    /// Failures raised by the relay itself rather than reported by the agent.
    pub fn is_protocol_failure(&self) -> bool {
        matches!(
            self,
            Self::NotConnected(_) | Self::Timeout(_) | Self::Disconnected | Self::SendFailed(_)
        )
    }
}
