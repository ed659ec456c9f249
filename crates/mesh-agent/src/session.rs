//! One socket lifetime on the agent side.
//!
//! The receive loop answers pings inline and runs every command as a
//! detached task, so a slow local call never delays liveness. When the
//! socket ends, unfinished commands are aborted and their responses dropped.

use std::collections::HashSet;
use std::sync::Arc;

use futures::{Sink, SinkExt, Stream, StreamExt};
use mesh_core::protocol::preview;
use mesh_core::{CommandId, Frame};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::executor::CommandHandler;

const OUTBOUND_QUEUE: usize = 64;

/// How a session ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    /// The peer closed the socket or the stream ended. `None` when no close
    /// code was received.
    Closed(Option<u16>),
    /// Stopped locally; a normal close was sent.
    Stopped,
    /// Transport error.
    Failed(String),
}

impl SessionEnd {
    /// Close code to feed the reconnection state machine.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Self::Closed(code) => *code,
            Self::Stopped => Some(1000),
            Self::Failed(_) => None,
        }
    }
}

fn normal_close() -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: "".into(),
    }))
}

/// Serve `ws` until it closes or `stop` fires.
pub async fn run_session<S>(
    ws: S,
    handler: Arc<dyn CommandHandler>,
    stop: &CancellationToken,
) -> SessionEnd
where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin + Send,
{
    let (mut sink, mut stream) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);
    let mut tasks: JoinSet<CommandId> = JoinSet::new();
    let mut in_flight: HashSet<CommandId> = HashSet::new();

    let end = loop {
        tokio::select! {
            biased;

            _ = stop.cancelled() => {
                let _ = sink.send(normal_close()).await;
                break SessionEnd::Stopped;
            }

            Some(text) = out_rx.recv() => {
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    break SessionEnd::Failed(e.to_string());
                }
            }

            Some(done) = tasks.join_next() => {
                if let Ok(id) = done {
                    in_flight.remove(&id);
                }
            }

            msg = stream.next() => match msg {
                None => break SessionEnd::Closed(None),
                Some(Err(e)) => break SessionEnd::Failed(e.to_string()),
                Some(Ok(Message::Text(text))) => match Frame::parse(text.as_str()) {
                    Ok(Frame::Ping) => {
                        if let Err(e) = sink.send(Message::Text(Frame::Pong.to_json().into())).await {
                            break SessionEnd::Failed(e.to_string());
                        }
                    }
                    Ok(Frame::Pong) => {}
                    Ok(Frame::Command(command)) => {
                        let id = command.command_id.clone();
                        if !in_flight.insert(id.clone()) {
                            warn!(command_id = %id, "duplicate command id in flight, dropping");
                            continue;
                        }
                        debug!(command_id = %id, method = %command.method, url = %command.url, "command received");
                        let handler = Arc::clone(&handler);
                        let tx = out_tx.clone();
                        tasks.spawn(async move {
                            let response = handler.handle(command).await;
                            let _ = tx.send(Frame::Response(response).to_json()).await;
                            id
                        });
                    }
                    Ok(Frame::Response(resp)) => {
                        warn!(command_id = %resp.command_id, "unexpected response frame from coordinator");
                    }
                    Err(e) => {
                        warn!(error = %e, frame = preview(text.as_str(), 100), "malformed frame dropped");
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    let code = frame.map(|f| u16::from(f.code));
                    info!(?code, "coordinator closed the socket");
                    let _ = sink.close().await;
                    break SessionEnd::Closed(code);
                }
                Some(Ok(_)) => {}
            },
        }
    };

    if !tasks.is_empty() {
        debug!(count = tasks.len(), "discarding unfinished commands");
    }
    tasks.abort_all();
    end
}
