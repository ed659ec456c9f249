use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use mesh_core::{ConnectionId, RecipientId};
use rand::seq::SliceRandom;
use serde::Serialize;

use crate::connection::{AgentConnection, CloseReason, Role};

/// Snapshot of one registered connection, as listed by `GET /agents`.
#[derive(Clone, Debug, Serialize)]
pub struct AgentSummary {
    pub recipient_id: RecipientId,
    pub connection_id: ConnectionId,
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_base_url: Option<String>,
    pub connected_at: DateTime<Utc>,
}

/// Live connections, at most one per recipient.
pub struct ConnectionRegistry {
    connections: DashMap<RecipientId, Arc<AgentConnection>>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Install `connection` as the live socket for its recipient.
    ///
    /// A previous connection for the same recipient is closed with
    /// [`CloseReason::Superseded`] and returned so its pending commands can
    /// be failed.
    pub fn register(&self, connection: Arc<AgentConnection>) -> Option<Arc<AgentConnection>> {
        let recipient = connection.recipient.clone();
        let previous = self.connections.insert(recipient.clone(), connection);
        if let Some(ref old) = previous {
            tracing::info!(
                recipient_id = %recipient,
                old_connection = %old.id,
                "superseding existing connection"
            );
            old.close(CloseReason::Superseded);
        }
        previous
    }

    /// Remove the entry for `recipient` only if it is still `connection`.
    ///
    /// Returns `false` when a newer connection already replaced it.
    pub fn unregister(&self, recipient: &RecipientId, connection: &ConnectionId) -> bool {
        self.connections
            .remove_if(recipient, |_, current| &current.id == connection)
            .is_some()
    }

    pub fn lookup(&self, recipient: &RecipientId) -> Option<Arc<AgentConnection>> {
        self.connections.get(recipient).map(|c| Arc::clone(c.value()))
    }

    pub fn is_connected(&self, recipient: &RecipientId) -> bool {
        self.connections.contains_key(recipient)
    }

    /// Snapshot of every live connection at the time of the call, sorted by
    /// recipient id. Registration order is not tracked; a superseding
    /// connection keeps its recipient's slot.
    pub fn broadcast_targets(&self) -> Vec<(RecipientId, Arc<AgentConnection>)> {
        let mut targets: Vec<(RecipientId, Arc<AgentConnection>)> = self
            .connections
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();
        targets.sort_by(|a, b| a.0.cmp(&b.0));
        targets
    }

    /// Connected providers.
    pub fn providers(&self) -> Vec<Arc<AgentConnection>> {
        self.connections
            .iter()
            .filter(|entry| entry.value().role == Role::Provider)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// A uniformly random connected provider.
    pub fn random_provider(&self) -> Option<Arc<AgentConnection>> {
        let providers = self.providers();
        providers.choose(&mut rand::thread_rng()).cloned()
    }

    /// A random provider that advertised an HTTP endpoint.
    pub fn random_provider_endpoint(&self) -> Option<(RecipientId, String)> {
        let with_endpoint: Vec<(RecipientId, String)> = self
            .providers()
            .into_iter()
            .filter_map(|c| c.http_base_url.clone().map(|url| (c.recipient.clone(), url)))
            .collect();
        with_endpoint.choose(&mut rand::thread_rng()).cloned()
    }

    pub fn list(&self) -> Vec<AgentSummary> {
        let mut agents: Vec<AgentSummary> = self
            .connections
            .iter()
            .map(|entry| {
                let c = entry.value();
                AgentSummary {
                    recipient_id: c.recipient.clone(),
                    connection_id: c.id.clone(),
                    role: c.role,
                    http_base_url: c.http_base_url.clone(),
                    connected_at: c.connected_at,
                }
            })
            .collect();
        agents.sort_by(|a, b| a.recipient_id.cmp(&b.recipient_id));
        agents
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Close every connection with `reason`. Entries are removed by their
    /// socket tasks as they wind down.
    pub fn close_all(&self, reason: CloseReason) -> usize {
        let targets = self.broadcast_targets();
        for (_, connection) in &targets {
            connection.close(reason);
        }
        targets.len()
    }
}

/// Validate and normalize an advertised provider endpoint.
///
/// Only `http://` and `https://` URLs are accepted; a trailing `/` is
/// trimmed.
pub fn normalize_base_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        return None;
    }
    let normalized = trimmed.trim_end_matches('/');
    let host = normalized.split_once("://").map_or("", |(_, rest)| rest);
    (!host.is_empty()).then(|| normalized.to_string())
}
