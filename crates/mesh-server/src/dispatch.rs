//! Command relay: routes caller commands to agent sockets and agent
//! responses back to the waiting callers.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use mesh_core::protocol::preview;
use mesh_core::{
    Command, CommandError, CommandFrame, CommandId, Frame, RecipientId,
};
use serde_json::Value;

use crate::connection::{AgentConnection, CloseReason};
use crate::correlator::Correlator;
use crate::registry::ConnectionRegistry;

/// Result of relaying one command, with the id it was sent under.
#[derive(Debug)]
pub struct Dispatched {
    /// `None` when the command never left the coordinator.
    pub command_id: Option<CommandId>,
    pub result: Result<Value, CommandError>,
}

impl Dispatched {
    fn rejected(error: CommandError) -> Self {
        Self {
            command_id: None,
            result: Err(error),
        }
    }
}

/// Coordinator-side relay shared by the WebSocket tasks and HTTP handlers.
pub struct Dispatcher {
    registry: ConnectionRegistry,
    correlator: Arc<Correlator>,
}

impl Dispatcher {
    pub fn new(correlator: Arc<Correlator>) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            correlator,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    /// Register a freshly authenticated connection.
    pub fn attach(&self, connection: Arc<AgentConnection>) {
        tracing::info!(
            recipient_id = %connection.recipient,
            connection_id = %connection.id,
            role = ?connection.role,
            "agent connected"
        );
        if let Some(evicted) = self.registry.register(connection) {
            let cancelled = self
                .correlator
                .cancel_all_for(&evicted.recipient, &evicted.id);
            if cancelled > 0 {
                tracing::info!(
                    recipient_id = %evicted.recipient,
                    cancelled,
                    "failed commands pending on superseded connection"
                );
            }
        }
    }

    /// Tear down a connection whose socket has ended.
    pub fn detach(&self, connection: &AgentConnection) {
        let removed = self.registry.unregister(&connection.recipient, &connection.id);
        let cancelled = self
            .correlator
            .cancel_all_for(&connection.recipient, &connection.id);
        tracing::info!(
            recipient_id = %connection.recipient,
            connection_id = %connection.id,
            removed,
            cancelled,
            reason = ?connection.close_reason(),
            "agent disconnected"
        );
    }

    /// Handle one inbound text frame from an agent.
    pub fn handle_inbound(&self, connection: &AgentConnection, text: &str) {
        match Frame::parse(text) {
            Ok(Frame::Ping) => {
                let _ = connection.send_frame(&Frame::Pong);
            }
            Ok(Frame::Pong) => {}
            Ok(Frame::Response(response)) => {
                let _ = self.correlator.resolve(&connection.recipient, response);
            }
            Ok(Frame::Command(cmd)) => {
                tracing::warn!(
                    recipient_id = %connection.recipient,
                    command_id = %cmd.command_id,
                    "agent sent a command frame, ignoring"
                );
            }
            Err(e) => {
                tracing::warn!(
                    recipient_id = %connection.recipient,
                    error = %e,
                    frame = preview(text, 100),
                    "dropping malformed frame"
                );
            }
        }
    }

    /// Relay a command to one recipient and wait for its result.
    pub async fn send_command(
        &self,
        recipient: &RecipientId,
        command: Command,
    ) -> Result<Value, CommandError> {
        self.dispatch(recipient, command, None).await.result
    }

    /// Like [`send_command`](Self::send_command), optionally under a
    /// caller-chosen command id.
    pub async fn dispatch(
        &self,
        recipient: &RecipientId,
        command: Command,
        command_id: Option<CommandId>,
    ) -> Dispatched {
        let Some(connection) = self.registry.lookup(recipient) else {
            return Dispatched::rejected(CommandError::NotConnected(recipient.to_string()));
        };
        self.dispatch_to(connection, &command, command_id).await
    }

    /// Relay a command to every connected recipient.
    ///
    /// The target set is snapshotted at call time; each entry completes
    /// independently.
    pub async fn broadcast_command(
        &self,
        command: Command,
    ) -> BTreeMap<RecipientId, Result<Value, CommandError>> {
        let targets = self.registry.broadcast_targets();
        tracing::info!(targets = targets.len(), method = %command.method, url = %command.url, "broadcasting command");

        let sends = targets.into_iter().map(|(recipient, connection)| {
            let command = &command;
            async move {
                let dispatched = self.dispatch_to(connection, command, None).await;
                (recipient, dispatched.result)
            }
        });
        join_all(sends).await.into_iter().collect()
    }

    /// Relay a command to a randomly chosen provider.
    pub async fn send_to_any_provider(
        &self,
        command: Command,
    ) -> Result<(RecipientId, Dispatched), CommandError> {
        let connection = self
            .registry
            .random_provider()
            .ok_or_else(|| CommandError::NotConnected("no provider connected".into()))?;
        let recipient = connection.recipient.clone();
        let dispatched = self.dispatch_to(connection, &command, None).await;
        Ok((recipient, dispatched))
    }

    /// Close all sockets and fail everything still pending.
    pub fn shutdown(&self) {
        let closed = self.registry.close_all(CloseReason::Shutdown);
        let cancelled = self.correlator.cancel_everything();
        tracing::info!(closed, cancelled, "relay shut down");
    }

    async fn dispatch_to(
        &self,
        connection: Arc<AgentConnection>,
        command: &Command,
        command_id: Option<CommandId>,
    ) -> Dispatched {
        let handle = match self.correlator.issue(
            connection.recipient.clone(),
            connection.id.clone(),
            command_id,
        ) {
            Ok(handle) => handle,
            Err(e) => return Dispatched::rejected(e),
        };
        let id = handle.id().clone();

        // An eviction that ran before the entry existed could not cancel it.
        if connection.is_closed() {
            return Dispatched {
                command_id: Some(id),
                result: Err(CommandError::Disconnected),
            };
        }

        let frame = Frame::Command(CommandFrame::new(id.clone(), command));
        if let Err(e) = connection.send_frame(&frame) {
            tracing::warn!(command_id = %id, recipient_id = %connection.recipient, error = %e, "failed to queue command");
            return Dispatched {
                command_id: Some(id),
                result: Err(e),
            };
        }

        tracing::info!(
            command_id = %id,
            recipient_id = %connection.recipient,
            method = %command.method,
            url = %command.url,
            "command sent"
        );

        let result = handle.wait().await;
        if let Err(ref e) = result {
            tracing::info!(command_id = %id, recipient_id = %connection.recipient, code = e.code(), "command failed");
        }
        Dispatched {
            command_id: Some(id),
            result,
        }
    }
}
