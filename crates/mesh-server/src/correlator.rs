//! Pending-result table matching agent responses to waiting callers.
//!
//! Every relayed command gets an entry keyed by its [`CommandId`]. The entry
//! is completed exactly once: by the agent's response, by its deadline, by
//! the owning connection going away, or removed when the caller stops
//! waiting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mesh_core::{CommandError, CommandId, ConnectionId, RecipientId, ResponseFrame};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

type Outcome = Result<Value, CommandError>;

struct PendingEntry {
    seq: u64,
    recipient: RecipientId,
    connection: ConnectionId,
    created_at: Instant,
    resolver: oneshot::Sender<Outcome>,
}

/// Shared pending-result table.
pub struct Correlator {
    pending: Mutex<HashMap<CommandId, PendingEntry>>,
    next_seq: AtomicU64,
    default_timeout: Duration,
}

impl Correlator {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(1),
            default_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Register a pending result for a command about to be sent.
    ///
    /// A caller-supplied id that is already outstanding is rejected.
    pub fn issue(
        self: &Arc<Self>,
        recipient: RecipientId,
        connection: ConnectionId,
        requested: Option<CommandId>,
    ) -> Result<PendingHandle, CommandError> {
        self.issue_with_timeout(recipient, connection, requested, self.default_timeout)
    }

    pub fn issue_with_timeout(
        self: &Arc<Self>,
        recipient: RecipientId,
        connection: ConnectionId,
        requested: Option<CommandId>,
        timeout: Duration,
    ) -> Result<PendingHandle, CommandError> {
        let (tx, rx) = oneshot::channel();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let created_at = Instant::now();

        let id = {
            let mut pending = self.pending.lock();
            let id = match requested {
                Some(id) if pending.contains_key(&id) => {
                    return Err(CommandError::DuplicateCommandId(id));
                }
                Some(id) => id,
                None => loop {
                    let candidate = CommandId::new();
                    if !pending.contains_key(&candidate) {
                        break candidate;
                    }
                },
            };
            let _ = pending.insert(
                id.clone(),
                PendingEntry {
                    seq,
                    recipient,
                    connection,
                    created_at,
                    resolver: tx,
                },
            );
            id
        };

        Ok(PendingHandle {
            id,
            seq,
            deadline: created_at + timeout,
            timeout,
            rx,
            correlator: Arc::clone(self),
        })
    }

    /// Complete a pending result from an agent response.
    ///
    /// Responses for unknown ids, already-completed ids, or ids issued to a
    /// different recipient are dropped and `false` is returned.
    pub fn resolve(&self, from: &RecipientId, response: ResponseFrame) -> bool {
        let entry = {
            let mut pending = self.pending.lock();
            let owner = pending
                .get(&response.command_id)
                .map(|e| e.recipient.clone());
            match owner {
                Some(owner) if &owner == from => pending.remove(&response.command_id),
                Some(owner) => {
                    tracing::warn!(
                        command_id = %response.command_id,
                        expected = %owner,
                        from = %from,
                        "response from wrong recipient, dropping"
                    );
                    None
                }
                None => None,
            }
        };

        let Some(entry) = entry else {
            tracing::debug!(command_id = %response.command_id, "no pending command for response");
            return false;
        };

        tracing::debug!(
            command_id = %response.command_id,
            recipient_id = %from,
            elapsed_ms = entry.created_at.elapsed().as_millis() as u64,
            "command resolved"
        );
        let _ = entry.resolver.send(response.into_outcome());
        true
    }

    /// Complete a still-pending entry with a timeout.
    pub fn expire(&self, id: &CommandId, timeout: Duration) -> bool {
        self.fail(id, CommandError::Timeout(timeout))
    }

    /// Complete a still-pending entry with the given error.
    pub fn fail(&self, id: &CommandId, error: CommandError) -> bool {
        let entry = self.pending.lock().remove(id);
        match entry {
            Some(entry) => {
                let _ = entry.resolver.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Fail every entry issued on `connection` with `Disconnected`.
    pub fn cancel_all_for(&self, recipient: &RecipientId, connection: &ConnectionId) -> usize {
        let cancelled: Vec<(CommandId, PendingEntry)> = {
            let mut pending = self.pending.lock();
            let ids: Vec<CommandId> = pending
                .iter()
                .filter(|(_, e)| &e.recipient == recipient && &e.connection == connection)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|e| (id, e)))
                .collect()
        };

        let count = cancelled.len();
        for (id, entry) in cancelled {
            tracing::debug!(command_id = %id, recipient_id = %recipient, "cancelling pending command");
            let _ = entry.resolver.send(Err(CommandError::Disconnected));
        }
        count
    }

    /// Fail every entry with `Disconnected`.
    pub fn cancel_everything(&self) -> usize {
        let drained: Vec<PendingEntry> = self.pending.lock().drain().map(|(_, e)| e).collect();
        let count = drained.len();
        for entry in drained {
            let _ = entry.resolver.send(Err(CommandError::Disconnected));
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_pending(&self, id: &CommandId) -> bool {
        self.pending.lock().contains_key(id)
    }

    /// Remove an entry without completing it, if it still belongs to `seq`.
    fn discard(&self, id: &CommandId, seq: u64) {
        let mut pending = self.pending.lock();
        if pending.get(id).is_some_and(|e| e.seq == seq) {
            let _ = pending.remove(id);
        }
    }
}

/// Caller side of a pending result.
///
/// Dropping the handle before completion removes the entry, so a caller
/// that stops waiting leaves nothing behind; a late response is then
/// dropped like any unknown id.
pub struct PendingHandle {
    id: CommandId,
    seq: u64,
    deadline: Instant,
    timeout: Duration,
    rx: oneshot::Receiver<Outcome>,
    correlator: Arc<Correlator>,
}

impl PendingHandle {
    pub fn id(&self) -> &CommandId {
        &self.id
    }

    /// Wait for the outcome, bounded by the command's deadline.
    pub async fn wait(mut self) -> Outcome {
        match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(CommandError::Disconnected),
            Err(_) => {
                let _ = self.correlator.expire(&self.id, self.timeout);
                // A response may have landed between the deadline and expiry.
                match self.rx.try_recv() {
                    Ok(outcome) => outcome,
                    Err(_) => Err(CommandError::Timeout(self.timeout)),
                }
            }
        }
    }
}

impl Drop for PendingHandle {
    fn drop(&mut self) {
        self.correlator.discard(&self.id, self.seq);
    }
}
