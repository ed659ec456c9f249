//! Agent supervisor: owns at most one socket at a time and drives the
//! [`Reconnector`] from socket events, retry timers, the host's
//! connectivity signal and token changes.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Sleep;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::executor::CommandHandler;
use crate::reconnect::{Action, Reconnector};
use crate::session::{run_session, SessionEnd};

/// Connection status published for the host UI.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AgentStatus {
    Idle,
    Connecting,
    Connected,
    Reconnecting { attempt: u32, delay: Duration },
    Offline,
    /// Retries exhausted.
    Disconnected,
    /// The coordinator refused the token.
    Unauthorized,
}

#[derive(Debug)]
enum ConnEvent {
    Opened,
    Ended(SessionEnd),
    Rejected,
}

struct ActiveConnection {
    generation: u64,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

pub struct AgentRunner {
    config: Arc<AgentConfig>,
    handler: Arc<dyn CommandHandler>,
    status: watch::Sender<AgentStatus>,
}

impl AgentRunner {
    pub fn new(config: AgentConfig, handler: Arc<dyn CommandHandler>) -> Self {
        let (status, _) = watch::channel(AgentStatus::Idle);
        Self {
            config: Arc::new(config),
            handler,
            status,
        }
    }

    pub fn status(&self) -> watch::Receiver<AgentStatus> {
        self.status.subscribe()
    }

    fn set_status(&self, next: AgentStatus) {
        self.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            debug!(from = ?current, to = ?next, "agent status");
            *current = next;
            true
        });
    }

    /// Run until `shutdown` fires. `token` carries the current bearer token
    /// (`None` when signed out); `online` is the host connectivity signal.
    pub async fn run(
        &self,
        mut token: watch::Receiver<Option<SecretString>>,
        mut online: watch::Receiver<bool>,
        shutdown: CancellationToken,
    ) {
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let mut sup = Supervisor {
            runner: self,
            machine: Reconnector::new(
                self.config.reconnect_base_delay,
                self.config.max_reconnect_attempts,
            ),
            token: token.borrow_and_update().clone(),
            next_generation: 0,
            active: None,
            retry: None,
            events: events_tx,
        };

        if !*online.borrow_and_update() {
            let _ = sup.machine.on_offline();
            self.set_status(AgentStatus::Offline);
        }
        let action = sup.machine.start(sup.token.is_some());
        sup.apply(action);

        let mut token_open = true;
        let mut online_open = true;
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                Some((generation, event)) = events.recv() => {
                    sup.on_event(generation, event);
                }

                _ = sleep_opt(&mut sup.retry) => {
                    sup.retry = None;
                    let action = sup.machine.on_retry_elapsed(sup.token.is_some());
                    sup.apply(action);
                }

                changed = online.changed(), if online_open => {
                    if changed.is_err() {
                        online_open = false;
                        continue;
                    }
                    let now_online = *online.borrow_and_update();
                    sup.on_connectivity(now_online);
                }

                changed = token.changed(), if token_open => {
                    if changed.is_err() {
                        token_open = false;
                        continue;
                    }
                    sup.token = token.borrow_and_update().clone();
                    let action = sup.machine.on_token_changed(sup.token.is_some());
                    if sup.token.is_none() {
                        info!("token removed, disconnecting");
                        self.set_status(AgentStatus::Idle);
                    }
                    sup.apply(action);
                }
            }
        }

        if let Some(active) = sup.active.take() {
            active.stop.cancel();
            let _ = active.task.await;
        }
        self.set_status(AgentStatus::Idle);
        info!("agent stopped");
    }
}

struct Supervisor<'a> {
    runner: &'a AgentRunner,
    machine: Reconnector,
    token: Option<SecretString>,
    next_generation: u64,
    active: Option<ActiveConnection>,
    retry: Option<Pin<Box<Sleep>>>,
    events: mpsc::UnboundedSender<(u64, ConnEvent)>,
}

impl Supervisor<'_> {
    fn apply(&mut self, action: Action) {
        match action {
            Action::Nothing => {}
            Action::Connect => self.connect(),
            Action::ScheduleRetry { attempt, delay } => {
                info!(attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
                self.retry = Some(Box::pin(tokio::time::sleep(delay)));
                self.runner.set_status(AgentStatus::Reconnecting { attempt, delay });
            }
            Action::CloseSocket => {
                if let Some(active) = self.active.take() {
                    active.stop.cancel();
                }
            }
            Action::GiveUp => {
                warn!(
                    max_attempts = self.runner.config.max_reconnect_attempts,
                    "reconnect attempts exhausted"
                );
                self.runner.set_status(AgentStatus::Disconnected);
            }
        }
        if !self.machine.retry_scheduled() {
            self.retry = None;
        }
    }

    fn connect(&mut self) {
        let Some(token) = self.token.clone() else {
            return;
        };
        if let Some(stale) = self.active.take() {
            stale.stop.cancel();
        }
        self.next_generation += 1;
        let generation = self.next_generation;
        let stop = CancellationToken::new();
        info!(server = %self.runner.config.server_url, "connecting to coordinator");
        self.runner.set_status(AgentStatus::Connecting);
        let task = tokio::spawn(connection_task(
            Arc::clone(&self.runner.config),
            Arc::clone(&self.runner.handler),
            token,
            stop.clone(),
            generation,
            self.events.clone(),
        ));
        self.active = Some(ActiveConnection {
            generation,
            stop,
            task,
        });
    }

    fn on_event(&mut self, generation: u64, event: ConnEvent) {
        // Events from a socket already replaced or closed locally are stale.
        if !self.active.as_ref().is_some_and(|a| a.generation == generation) {
            return;
        }
        match event {
            ConnEvent::Opened => {
                self.machine.on_open();
                info!("connected to coordinator");
                self.runner.set_status(AgentStatus::Connected);
            }
            ConnEvent::Rejected => {
                self.active = None;
                self.machine.on_rejected();
                warn!("coordinator rejected the token");
                self.runner.set_status(AgentStatus::Unauthorized);
                self.apply(Action::Nothing);
            }
            ConnEvent::Ended(end) => {
                self.active = None;
                match &end {
                    SessionEnd::Failed(reason) => warn!(%reason, "connection failed"),
                    other => info!(code = ?other.close_code(), "connection closed"),
                }
                let action = self.machine.on_close(end.close_code(), self.token.is_some());
                if action == Action::Nothing {
                    self.runner.set_status(if self.machine.is_online() {
                        AgentStatus::Idle
                    } else {
                        AgentStatus::Offline
                    });
                }
                self.apply(action);
            }
        }
    }

    fn on_connectivity(&mut self, online: bool) {
        if online {
            info!("host back online");
            self.runner.set_status(if self.machine.is_rejected() {
                AgentStatus::Unauthorized
            } else {
                AgentStatus::Idle
            });
            let action = self.machine.on_online(self.token.is_some());
            self.apply(action);
        } else {
            warn!("host offline, closing connection");
            let action = self.machine.on_offline();
            self.apply(action);
            self.runner.set_status(AgentStatus::Offline);
        }
    }
}

async fn sleep_opt(sleep: &mut Option<Pin<Box<Sleep>>>) {
    match sleep {
        Some(s) => s.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn connection_task(
    config: Arc<AgentConfig>,
    handler: Arc<dyn CommandHandler>,
    token: SecretString,
    stop: CancellationToken,
    generation: u64,
    events: mpsc::UnboundedSender<(u64, ConnEvent)>,
) {
    let url = match config.connect_url(&token) {
        Ok(url) => url,
        Err(e) => {
            let _ = events.send((generation, ConnEvent::Ended(SessionEnd::Failed(e.to_string()))));
            return;
        }
    };

    let connected = tokio::select! {
        _ = stop.cancelled() => return,
        res = tokio_tungstenite::connect_async(url.as_str()) => res,
    };

    let event = match connected {
        Ok((ws, _)) => {
            let _ = events.send((generation, ConnEvent::Opened));
            handler.session_started();
            ConnEvent::Ended(run_session(ws, handler, &stop).await)
        }
        Err(WsError::Http(resp)) if resp.status().as_u16() == 401 => ConnEvent::Rejected,
        Err(e) => ConnEvent::Ended(SessionEnd::Failed(e.to_string())),
    };
    let _ = events.send((generation, event));
}
