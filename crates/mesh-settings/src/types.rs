//! Settings types for the coordinator, the agent and logging.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings document.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MeshSettings {
    pub server: ServerSettings,
    pub agent: AgentSettings,
    pub logging: LoggingSettings,
}

impl MeshSettings {
    /// Cross-field checks that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.server.command_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "server.commandTimeoutMs must be positive".into(),
            ));
        }
        if self.server.heartbeat_timeout_ms < self.server.heartbeat_interval_ms {
            return Err(SettingsError::InvalidValue(
                "server.heartbeatTimeoutMs must not be shorter than the interval".into(),
            ));
        }
        if self.agent.local_timeout_ms >= self.server.command_timeout_ms {
            return Err(SettingsError::InvalidValue(format!(
                "agent.localTimeoutMs ({}) must be below server.commandTimeoutMs ({})",
                self.agent.local_timeout_ms, self.server.command_timeout_ms
            )));
        }
        if self.agent.reconnect_base_delay_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "agent.reconnectBaseDelayMs must be positive".into(),
            ));
        }
        if !self.agent.server_url.starts_with("ws://") && !self.agent.server_url.starts_with("wss://")
        {
            return Err(SettingsError::InvalidValue(format!(
                "agent.serverUrl must be a ws:// or wss:// URL, got {}",
                self.agent.server_url
            )));
        }
        Ok(())
    }
}

/// Coordinator settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// HTTP + WebSocket port.
    pub port: u16,
    /// Deadline for a relayed command in milliseconds.
    pub command_timeout_ms: u64,
    /// JSON ping interval in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Close a connection silent for this long.
    pub heartbeat_timeout_ms: u64,
    /// Outbound frames buffered per connection.
    pub max_send_queue: usize,
    /// HS256 secret used to verify agent tokens.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt_secret: Option<String>,
    /// Accept the raw token string as the identity when no secret is set.
    pub allow_insecure_tokens: bool,
}

impl ServerSettings {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            command_timeout_ms: 30_000,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 90_000,
            max_send_queue: 256,
            jwt_secret: None,
            allow_insecure_tokens: false,
        }
    }
}

/// Local API endpoints used to inspect and switch the loaded model.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelEndpoints {
    pub status_path: String,
    pub load_path: String,
    pub unload_path: String,
}

impl Default for ModelEndpoints {
    fn default() -> Self {
        Self {
            status_path: "/v1/models/status".to_string(),
            load_path: "/v1/models/load".to_string(),
            unload_path: "/v1/models/unload".to_string(),
        }
    }
}

/// Agent settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentSettings {
    /// Coordinator WebSocket endpoint.
    pub server_url: String,
    /// Bearer token sent as the `token` query parameter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Base URL advertised to the coordinator when connecting as a provider.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_base_url: Option<String>,
    /// Base URL of the local HTTP API commands are executed against.
    pub local_api_url: String,
    /// Timeout for a single local API call.
    pub local_timeout_ms: u64,
    /// Timeout for a model load/unload call.
    pub model_load_timeout_ms: u64,
    /// First reconnect delay; doubles per attempt.
    pub reconnect_base_delay_ms: u64,
    /// Reconnect attempts before giving up.
    pub max_reconnect_attempts: u32,
    /// How often the connectivity probe runs.
    pub connectivity_probe_interval_ms: u64,
    /// `host:port` the connectivity probe opens a TCP connection to. It
    /// stands for the host's own network and must not be the coordinator,
    /// or a coordinator outage reads as the host being offline.
    pub connectivity_probe_target: String,
    /// Model lifecycle endpoints on the local API.
    pub model: ModelEndpoints,
    /// Local API paths whose commands need a specific model loaded.
    pub model_paths: Vec<String>,
}

impl AgentSettings {
    pub fn local_timeout(&self) -> Duration {
        Duration::from_millis(self.local_timeout_ms)
    }

    pub fn model_load_timeout(&self) -> Duration {
        Duration::from_millis(self.model_load_timeout_ms)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn connectivity_probe_interval(&self) -> Duration {
        Duration::from_millis(self.connectivity_probe_interval_ms)
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8000/ws".to_string(),
            token: None,
            http_base_url: None,
            local_api_url: "http://127.0.0.1:8080".to_string(),
            local_timeout_ms: 25_000,
            model_load_timeout_ms: 120_000,
            reconnect_base_delay_ms: 1000,
            max_reconnect_attempts: 10,
            connectivity_probe_interval_ms: 5000,
            connectivity_probe_target: "1.1.1.1:53".to_string(),
            model: ModelEndpoints::default(),
            model_paths: vec![
                "/v1/chat/completions".to_string(),
                "/v1/completions".to_string(),
                "/v1/embeddings".to_string(),
            ],
        }
    }
}

/// Logging settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level (`trace`..`error`).
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json: Option<bool>,
    /// Per-module level overrides.
    pub modules: BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: None,
            modules: BTreeMap::new(),
        }
    }
}
