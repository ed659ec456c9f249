//! Relay agent: holds one outbound socket to the coordinator, executes the
//! commands it receives against the host's local HTTP API and reconnects
//! with exponential backoff.

pub mod config;
pub mod errors;
pub mod executor;
pub mod local_api;
pub mod model;
pub mod network;
pub mod reconnect;
pub mod runner;
pub mod session;
pub mod state_lock;

pub use config::AgentConfig;
pub use errors::AgentError;
pub use executor::{CommandHandler, Executor};
pub use local_api::LocalApi;
pub use model::{HttpModelBackend, ModelBackend, ModelLifecycle};
pub use network::spawn_connectivity_probe;
pub use reconnect::{backoff_delay, Action, ConnState, Reconnector};
pub use runner::{AgentRunner, AgentStatus};
pub use session::{run_session, SessionEnd};
pub use state_lock::{StateGuard, StateLock};
