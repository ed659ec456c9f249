//! Coordinator side of the command relay.
//!
//! Agents hold one authenticated WebSocket each; callers submit commands
//! over HTTP (or in-process through [`Dispatcher`]) and wait for the
//! agent's correlated response.

pub mod auth;
pub mod connection;
pub mod correlator;
pub mod dispatch;
pub mod registry;
pub mod server;

pub use auth::{AuthError, Identity, InsecureVerifier, JwtVerifier, TokenVerifier};
pub use connection::{AgentConnection, CloseReason, Role};
pub use correlator::{Correlator, PendingHandle};
pub use dispatch::{Dispatched, Dispatcher};
pub use registry::{AgentSummary, ConnectionRegistry};
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
