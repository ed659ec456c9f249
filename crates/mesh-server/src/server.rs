use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::rejection::JsonRejection;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use mesh_core::{Command, CommandError, CommandId, Method, RecipientId};
use mesh_settings::ServerSettings;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::auth::TokenVerifier;
use crate::connection::{self, AgentConnection, Heartbeat, Role};
use crate::correlator::Correlator;
use crate::dispatch::{Dispatched, Dispatcher};
use crate::registry::normalize_base_url;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub command_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub max_send_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from(&ServerSettings::default())
    }
}

impl From<&ServerSettings> for ServerConfig {
    fn from(settings: &ServerSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            command_timeout: settings.command_timeout(),
            heartbeat_interval: settings.heartbeat_interval(),
            heartbeat_timeout: settings.heartbeat_timeout(),
            max_send_queue: settings.max_send_queue,
        }
    }
}

impl ServerConfig {
    fn heartbeat(&self) -> Heartbeat {
        Heartbeat {
            interval: self.heartbeat_interval,
            timeout: self.heartbeat_timeout,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub config: Arc<ServerConfig>,
    pub shutdown: CancellationToken,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: ServerConfig, verifier: Arc<dyn TokenVerifier>) -> Self {
        let correlator = Arc::new(Correlator::new(config.command_timeout));
        Self {
            dispatcher: Arc::new(Dispatcher::new(correlator)),
            verifier,
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
            started_at: Instant::now(),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/send-command/{recipient_id}", post(send_command_handler))
        .route("/broadcast-command", post(broadcast_handler))
        .route("/providers/command", post(provider_command_handler))
        .route("/providers/endpoint", get(provider_endpoint_handler))
        .route("/agents", get(agents_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Create and start the server. Returns a handle to shut it down.
pub async fn start(
    config: ServerConfig,
    verifier: Arc<dyn TokenVerifier>,
) -> Result<ServerHandle, std::io::Error> {
    let addr = format!("{}:{}", config.host, config.port);
    let state = AppState::new(config, verifier);
    let dispatcher = Arc::clone(&state.dispatcher);
    let shutdown = state.shutdown.clone();

    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(addr = %local_addr, "coordinator listening");

    let graceful_token = shutdown.clone();
    let graceful_dispatcher = Arc::clone(&dispatcher);
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                graceful_token.cancelled().await;
                graceful_dispatcher.shutdown();
            })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "server error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        dispatcher,
        shutdown,
        server,
    })
}

/// Handle returned by `start()`; keeps the server task alive.
pub struct ServerHandle {
    pub port: u16,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Close every agent socket, fail pending commands and stop serving.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.server.await;
    }
}

// ── WebSocket ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ConnectParams {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    http_base_url: Option<String>,
}

/// Authenticate, then upgrade. Rejections happen before the handshake.
async fn ws_handler(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> Response {
    if state.shutdown.is_cancelled() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "SHUTTING_DOWN", "coordinator is shutting down");
    }

    let token = params.token.unwrap_or_default();
    let identity = match state.verifier.verify(&token) {
        Ok(identity) => identity,
        Err(e) => {
            tracing::warn!(error = %e, "rejecting agent connection");
            return error_response(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", &e.to_string());
        }
    };

    let http_base_url = match (identity.role, params.http_base_url.as_deref()) {
        (Role::Provider, Some(raw)) => {
            let url = normalize_base_url(raw);
            if url.is_none() {
                tracing::warn!(
                    recipient_id = %identity.recipient,
                    http_base_url = raw,
                    "ignoring invalid provider endpoint"
                );
            }
            url
        }
        _ => None,
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let (tx, rx) = mpsc::channel(state.config.max_send_queue);
    let connection = Arc::new(AgentConnection::new(
        identity.recipient,
        identity.role,
        http_base_url,
        tx,
    ));
    let dispatcher = Arc::clone(&state.dispatcher);
    let heartbeat = state.config.heartbeat();

    ws.on_upgrade(move |socket| connection::serve_agent(socket, connection, rx, dispatcher, heartbeat))
}

// ── Control surface ─────────────────────────────────────────────────────────

/// Body of a command submission.
#[derive(Debug, Deserialize)]
struct CommandRequest {
    method: Method,
    url: String,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    command_id: Option<CommandId>,
}

impl CommandRequest {
    fn into_parts(self) -> Result<(Command, Option<CommandId>), Response> {
        if self.url.is_empty() {
            return Err(error_response(StatusCode::BAD_REQUEST, "INVALID_REQUEST", "url must not be empty"));
        }
        if self.command_id.as_ref().is_some_and(|id| id.as_str().is_empty()) {
            return Err(error_response(StatusCode::BAD_REQUEST, "INVALID_REQUEST", "command_id must not be empty"));
        }
        let data = self.data.filter(|d| !d.is_null());
        Ok((Command::new(self.method, self.url, data), self.command_id))
    }
}

fn parse_body(
    payload: Result<Json<CommandRequest>, JsonRejection>,
) -> Result<(Command, Option<CommandId>), Response> {
    match payload {
        Ok(Json(request)) => request.into_parts(),
        Err(rejection) => Err(error_response(
            StatusCode::BAD_REQUEST,
            "INVALID_REQUEST",
            &rejection.body_text(),
        )),
    }
}

async fn send_command_handler(
    State(state): State<AppState>,
    Path(recipient_id): Path<String>,
    payload: Result<Json<CommandRequest>, JsonRejection>,
) -> Response {
    let (command, command_id) = match parse_body(payload) {
        Ok(parts) => parts,
        Err(resp) => return resp,
    };
    let recipient = RecipientId::new(recipient_id);
    let dispatched = state.dispatcher.dispatch(&recipient, command, command_id).await;
    dispatched_response(&recipient, dispatched)
}

async fn provider_command_handler(
    State(state): State<AppState>,
    payload: Result<Json<CommandRequest>, JsonRejection>,
) -> Response {
    let (command, _) = match parse_body(payload) {
        Ok(parts) => parts,
        Err(resp) => return resp,
    };
    match state.dispatcher.send_to_any_provider(command).await {
        Ok((recipient, dispatched)) => dispatched_response(&recipient, dispatched),
        Err(e) => command_error_response(&e, None),
    }
}

async fn broadcast_handler(
    State(state): State<AppState>,
    payload: Result<Json<CommandRequest>, JsonRejection>,
) -> Response {
    let (command, _) = match parse_body(payload) {
        Ok(parts) => parts,
        Err(resp) => return resp,
    };
    let results = state.dispatcher.broadcast_command(command).await;
    let body: BTreeMap<String, Value> = results
        .into_iter()
        .map(|(recipient, result)| {
            let entry = match result {
                Ok(response) => json!({ "ok": true, "response": response }),
                Err(e) => json!({ "ok": false, "error": error_body(&e) }),
            };
            (recipient.to_string(), entry)
        })
        .collect();
    (StatusCode::OK, Json(json!({ "results": body }))).into_response()
}

/// A random connected provider's advertised HTTP endpoint, for callers that
/// talk to the provider directly instead of relaying through the socket.
async fn provider_endpoint_handler(State(state): State<AppState>) -> Response {
    match state.dispatcher.registry().random_provider_endpoint() {
        Some((recipient, http_base_url)) => Json(json!({
            "recipient_id": recipient,
            "http_base_url": http_base_url,
        }))
        .into_response(),
        None => command_error_response(
            &CommandError::NotConnected("no provider with an http endpoint".into()),
            None,
        ),
    }
}

async fn agents_handler(State(state): State<AppState>) -> Response {
    let agents = state.dispatcher.registry().list();
    Json(json!({ "agents": agents })).into_response()
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let dispatcher = &state.dispatcher;
    Json(json!({
        "status": "ok",
        "connections": dispatcher.registry().count(),
        "pending_commands": dispatcher.correlator().pending_count(),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

fn dispatched_response(recipient: &RecipientId, dispatched: Dispatched) -> Response {
    match dispatched.result {
        Ok(response) => (
            StatusCode::OK,
            Json(json!({
                "recipient_id": recipient,
                "command_id": dispatched.command_id,
                "response": response,
            })),
        )
            .into_response(),
        Err(e) => command_error_response(&e, dispatched.command_id.as_ref()),
    }
}

fn error_body(err: &CommandError) -> Value {
    json!({ "code": err.code(), "message": err.to_string() })
}

fn command_error_response(err: &CommandError, command_id: Option<&CommandId>) -> Response {
    if err.is_protocol_failure() {
        tracing::warn!(code = err.code(), command_id = ?command_id, error = %err, "command failed in relay");
    } else {
        tracing::debug!(code = err.code(), command_id = ?command_id, error = %err, "agent reported failure");
    }
    let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut body = json!({ "error": error_body(err) });
    if let Some(id) = command_id {
        body["command_id"] = json!(id);
    }
    (status, Json(body)).into_response()
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (status, Json(json!({ "error": { "code": code, "message": message } }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::InsecureVerifier;

    fn test_config() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..Default::default()
        }
    }

    #[test]
    fn config_from_settings() {
        let settings = ServerSettings {
            port: 9000,
            command_timeout_ms: 1500,
            ..Default::default()
        };
        let config = ServerConfig::from(&settings);
        assert_eq!(config.port, 9000);
        assert_eq!(config.command_timeout, Duration::from_millis(1500));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
    }

    #[test]
    fn build_router_creates_routes() {
        let state = AppState::new(test_config(), Arc::new(InsecureVerifier));
        let _router = build_router(state);
    }

    #[test]
    fn command_error_body_shape() {
        let resp = command_error_response(&CommandError::Timeout(Duration::from_secs(30)), None);
        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
        let resp = command_error_response(&CommandError::NotConnected("x".into()), None);
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn empty_url_is_rejected() {
        let request = CommandRequest {
            method: Method::Get,
            url: String::new(),
            data: None,
            command_id: None,
        };
        let resp = request.into_parts().unwrap_err();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn null_data_is_dropped() {
        let request = CommandRequest {
            method: Method::Post,
            url: "/x".into(),
            data: Some(Value::Null),
            command_id: None,
        };
        let (command, id) = request.into_parts().unwrap();
        assert!(command.data.is_none());
        assert!(id.is_none());
    }

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let handle = start(test_config(), Arc::new(InsecureVerifier)).await.unwrap();
        assert!(handle.port > 0);

        let url = format!("http://127.0.0.1:{}/health", handle.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);

        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connections"], 0);
        assert_eq!(body["pending_commands"], 0);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn send_to_unknown_recipient_is_404() {
        let handle = start(test_config(), Arc::new(InsecureVerifier)).await.unwrap();
        let url = format!("http://127.0.0.1:{}/send-command/nobody", handle.port);
        let resp = reqwest::Client::new()
            .post(&url)
            .json(&json!({"method": "GET", "url": "/status"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "NOT_CONNECTED");
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn malformed_body_is_400() {
        let handle = start(test_config(), Arc::new(InsecureVerifier)).await.unwrap();
        let url = format!("http://127.0.0.1:{}/send-command/alice", handle.port);
        let resp = reqwest::Client::new()
            .post(&url)
            .json(&json!({"method": "PATCH", "url": "/status"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "INVALID_REQUEST");
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn broadcast_with_no_agents_is_empty() {
        let handle = start(test_config(), Arc::new(InsecureVerifier)).await.unwrap();
        let url = format!("http://127.0.0.1:{}/broadcast-command", handle.port);
        let resp = reqwest::Client::new()
            .post(&url)
            .json(&json!({"method": "GET", "url": "/status"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["results"], json!({}));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn provider_endpoint_picks_a_provider_with_http_url() {
        let handle = start(test_config(), Arc::new(InsecureVerifier)).await.unwrap();
        let url = format!("http://127.0.0.1:{}/providers/endpoint", handle.port);

        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 404);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "NOT_CONNECTED");

        let (user_tx, _user_rx) = mpsc::channel(4);
        handle.dispatcher().attach(Arc::new(AgentConnection::new(
            RecipientId::from("alice"),
            Role::User,
            None,
            user_tx,
        )));
        let (bare_tx, _bare_rx) = mpsc::channel(4);
        handle.dispatcher().attach(Arc::new(AgentConnection::new(
            RecipientId::from("gpu-0"),
            Role::Provider,
            None,
            bare_tx,
        )));
        assert_eq!(reqwest::get(&url).await.unwrap().status(), 404);

        let (tx, _rx) = mpsc::channel(4);
        handle.dispatcher().attach(Arc::new(AgentConnection::new(
            RecipientId::from("gpu-1"),
            Role::Provider,
            Some("http://gpu-1:8080".into()),
            tx,
        )));
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["recipient_id"], "gpu-1");
        assert_eq!(body["http_base_url"], "http://gpu-1:8080");

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn ws_without_token_is_401() {
        let handle = start(test_config(), Arc::new(InsecureVerifier)).await.unwrap();
        let url = format!("http://127.0.0.1:{}/ws", handle.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 401);
        handle.shutdown().await;
    }
}
