//! Shared vocabulary of the command relay: ids, wire frames and the error
//! taxonomy used by both the coordinator and the agent.

pub mod errors;
pub mod ids;
pub mod protocol;

pub use errors::CommandError;
pub use ids::{CommandId, ConnectionId, RecipientId};
pub use protocol::{Command, CommandFrame, Frame, FrameError, Method, ResponseFrame};
