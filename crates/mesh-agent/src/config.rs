use std::time::Duration;

use mesh_settings::{AgentSettings, ModelEndpoints};
use reqwest::Url;
use secrecy::{ExposeSecret, SecretString};

use crate::errors::AgentError;

/// Runtime configuration of the relay agent.
#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub server_url: String,
    pub http_base_url: Option<String>,
    pub local_api_url: String,
    pub local_timeout: Duration,
    pub model_load_timeout: Duration,
    pub reconnect_base_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub connectivity_probe_interval: Duration,
    pub connectivity_probe_target: String,
    pub model: ModelEndpoints,
    pub model_paths: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::from(&AgentSettings::default())
    }
}

impl From<&AgentSettings> for AgentConfig {
    fn from(settings: &AgentSettings) -> Self {
        Self {
            server_url: settings.server_url.clone(),
            http_base_url: settings.http_base_url.clone(),
            local_api_url: settings.local_api_url.clone(),
            local_timeout: settings.local_timeout(),
            model_load_timeout: settings.model_load_timeout(),
            reconnect_base_delay: settings.reconnect_base_delay(),
            max_reconnect_attempts: settings.max_reconnect_attempts,
            connectivity_probe_interval: settings.connectivity_probe_interval(),
            connectivity_probe_target: settings.connectivity_probe_target.clone(),
            model: settings.model.clone(),
            model_paths: settings.model_paths.clone(),
        }
    }
}

impl AgentConfig {
    /// Coordinator URL carrying the token (and advertised endpoint) as
    /// query parameters.
    pub fn connect_url(&self, token: &SecretString) -> Result<Url, AgentError> {
        let mut params = vec![("token", token.expose_secret())];
        if let Some(ref base) = self.http_base_url {
            params.push(("http_base_url", base.as_str()));
        }
        Url::parse_with_params(&self.server_url, &params)
            .map_err(|e| AgentError::Connect(format!("invalid server url {}: {e}", self.server_url)))
    }
}
