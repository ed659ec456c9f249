use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use mesh_core::{CommandError, ConnectionId, Frame, RecipientId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::dispatch::Dispatcher;

/// What kind of principal holds the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Compute provider; eligible for provider routing.
    Provider,
    User,
}

impl Role {
    pub fn from_claim(claim: Option<&str>) -> Self {
        match claim {
            Some("provider") => Self::Provider,
            _ => Self::User,
        }
    }
}

/// Why the coordinator closed a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    Normal,
    /// Coordinator shutting down.
    Shutdown,
    /// A newer connection registered for the same recipient.
    Superseded,
    /// No inbound traffic within the heartbeat timeout.
    HeartbeatTimeout,
}

impl CloseReason {
    pub const SUPERSEDED_CODE: u16 = 4000;
    pub const HEARTBEAT_TIMEOUT_CODE: u16 = 4001;

    pub fn code(self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::Shutdown => 1001,
            Self::Superseded => Self::SUPERSEDED_CODE,
            Self::HeartbeatTimeout => Self::HEARTBEAT_TIMEOUT_CODE,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Self::Normal => "closed",
            Self::Shutdown => "coordinator shutting down",
            Self::Superseded => "superseded by a new connection",
            Self::HeartbeatTimeout => "heartbeat timeout",
        }
    }
}

/// Heartbeat timing for a connection.
#[derive(Clone, Copy, Debug)]
pub struct Heartbeat {
    pub interval: Duration,
    pub timeout: Duration,
}

/// One live agent socket.
pub struct AgentConnection {
    pub id: ConnectionId,
    pub recipient: RecipientId,
    pub role: Role,
    /// HTTP endpoint advertised by a provider at connect time.
    pub http_base_url: Option<String>,
    pub connected_at: DateTime<Utc>,
    tx: mpsc::Sender<String>,
    last_seen: Mutex<Instant>,
    close_reason: Mutex<Option<CloseReason>>,
    closed: CancellationToken,
}

impl AgentConnection {
    pub fn new(
        recipient: RecipientId,
        role: Role,
        http_base_url: Option<String>,
        tx: mpsc::Sender<String>,
    ) -> Self {
        Self {
            id: ConnectionId::new(),
            recipient,
            role,
            http_base_url,
            connected_at: Utc::now(),
            tx,
            last_seen: Mutex::new(Instant::now()),
            close_reason: Mutex::new(None),
            closed: CancellationToken::new(),
        }
    }

    /// Queue a frame for the writer task.
    pub fn send_frame(&self, frame: &Frame) -> Result<(), CommandError> {
        if self.is_closed() {
            return Err(CommandError::Disconnected);
        }
        match self.tx.try_send(frame.to_json()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(msg)) => {
                tracing::warn!(
                    recipient_id = %self.recipient,
                    connection_id = %self.id,
                    msg_len = msg.len(),
                    "send queue full, dropping frame"
                );
                Err(CommandError::SendFailed("send queue full".into()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(CommandError::Disconnected),
        }
    }

    /// Ask the writer to close the socket. Only the first reason sticks.
    pub fn close(&self, reason: CloseReason) {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock()
    }

    /// Record inbound activity.
    pub fn mark_alive(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    /// Time since the last inbound frame (or connection establishment).
    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    async fn closed(&self) {
        self.closed.cancelled().await;
    }
}

/// Drive an authenticated agent socket until it closes.
///
/// Registers the connection with the dispatcher, runs a writer task
/// (outbound frames, JSON pings, close frames) and a reader task (inbound
/// frames), then unregisters once either side finishes.
pub async fn serve_agent(
    socket: WebSocket,
    connection: Arc<AgentConnection>,
    rx: mpsc::Receiver<String>,
    dispatcher: Arc<Dispatcher>,
    heartbeat: Heartbeat,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    dispatcher.attach(Arc::clone(&connection));

    let writer_conn = Arc::clone(&connection);
    let mut writer = tokio::spawn(async move {
        let mut rx = rx;
        let mut ping_interval = tokio::time::interval(heartbeat.interval);
        ping_interval.tick().await; // consume first immediate tick

        loop {
            tokio::select! {
                biased;
                () = writer_conn.closed() => {
                    let reason = writer_conn.close_reason().unwrap_or(CloseReason::Normal);
                    let frame = CloseFrame {
                        code: reason.code(),
                        reason: reason.reason().into(),
                    };
                    let _ = ws_tx.send(WsMessage::Close(Some(frame))).await;
                    break;
                }
                msg = rx.recv() => {
                    let Some(text) = msg else { break };
                    if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    if writer_conn.idle_for() >= heartbeat.timeout {
                        tracing::warn!(
                            recipient_id = %writer_conn.recipient,
                            connection_id = %writer_conn.id,
                            "no traffic within heartbeat timeout, closing"
                        );
                        writer_conn.close(CloseReason::HeartbeatTimeout);
                        continue;
                    }
                    if ws_tx.send(WsMessage::Text(Frame::Ping.to_json().into())).await.is_err() {
                        break;
                    }
                    tracing::trace!(connection_id = %writer_conn.id, "sent ping");
                }
            }
        }
    });

    let reader_conn = Arc::clone(&connection);
    let reader_dispatcher = Arc::clone(&dispatcher);
    let mut reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    reader_conn.mark_alive();
                    reader_dispatcher.handle_inbound(&reader_conn, text.as_str());
                }
                WsMessage::Pong(_) => reader_conn.mark_alive(),
                WsMessage::Close(frame) => {
                    tracing::debug!(
                        connection_id = %reader_conn.id,
                        code = frame.as_ref().map(|f| f.code),
                        "agent sent close frame"
                    );
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut writer => {},
        _ = &mut reader => {},
    }
    reader.abort();
    writer.abort();

    connection.close(CloseReason::Normal);
    dispatcher.detach(&connection);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_connection(queue: usize) -> (AgentConnection, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(queue);
        let conn = AgentConnection::new(RecipientId::from("alice"), Role::Provider, None, tx);
        (conn, rx)
    }

    #[tokio::test]
    async fn send_frame_queues_json() {
        let (conn, mut rx) = make_connection(8);
        conn.send_frame(&Frame::Ping).unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg, r#"{"type":"ping"}"#);
    }

    #[test]
    fn send_to_full_queue_fails() {
        let (conn, _rx) = make_connection(1);
        conn.send_frame(&Frame::Ping).unwrap();
        let err = conn.send_frame(&Frame::Ping).unwrap_err();
        assert!(matches!(err, CommandError::SendFailed(_)));
    }

    #[test]
    fn send_to_dropped_receiver_is_disconnected() {
        let (conn, rx) = make_connection(8);
        drop(rx);
        assert_eq!(conn.send_frame(&Frame::Ping).unwrap_err(), CommandError::Disconnected);
    }

    #[test]
    fn send_after_close_is_disconnected() {
        let (conn, _rx) = make_connection(8);
        conn.close(CloseReason::Superseded);
        assert_eq!(conn.send_frame(&Frame::Ping).unwrap_err(), CommandError::Disconnected);
    }

    #[test]
    fn first_close_reason_wins() {
        let (conn, _rx) = make_connection(8);
        assert!(!conn.is_closed());
        conn.close(CloseReason::Superseded);
        conn.close(CloseReason::Normal);
        assert!(conn.is_closed());
        assert_eq!(conn.close_reason(), Some(CloseReason::Superseded));
    }

    #[test]
    fn close_codes_are_distinct() {
        assert_eq!(CloseReason::Normal.code(), 1000);
        assert_eq!(CloseReason::Shutdown.code(), 1001);
        assert_eq!(CloseReason::Superseded.code(), 4000);
        assert_eq!(CloseReason::HeartbeatTimeout.code(), 4001);
    }

    #[test]
    fn role_from_claim() {
        assert_eq!(Role::from_claim(Some("provider")), Role::Provider);
        assert_eq!(Role::from_claim(Some("user")), Role::User);
        assert_eq!(Role::from_claim(None), Role::User);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_time_tracks_activity() {
        let (conn, _rx) = make_connection(8);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(conn.idle_for() >= Duration::from_secs(5));
        conn.mark_alive();
        assert!(conn.idle_for() < Duration::from_secs(1));
    }
}
