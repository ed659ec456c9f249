//! The agent's one stateful local resource: the loaded model.
//!
//! Commands against a model path carrying a `model` field require that
//! model to be active. [`ModelLifecycle`] serializes model changes behind
//! the [`StateLock`] and caches what it believes is loaded for the life of
//! one socket.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mesh_core::{CommandFrame, Method};
use mesh_settings::ModelEndpoints;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::errors::AgentError;
use crate::local_api::LocalApi;
use crate::state_lock::{StateGuard, StateLock};

/// Model required by `command`, if any.
pub fn required_model(command: &CommandFrame, model_paths: &[String]) -> Option<String> {
    let path = command.url.split('?').next().unwrap_or_default();
    if !model_paths.iter().any(|p| p == path) {
        return None;
    }
    command
        .data
        .as_ref()?
        .get("model")?
        .as_str()
        .filter(|m| !m.is_empty())
        .map(str::to_string)
}

/// Inspect and switch the loaded model.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn loaded_model(&self) -> Result<Option<String>, AgentError>;
    async fn load(&self, model: &str) -> Result<(), AgentError>;
    async fn unload(&self, model: &str) -> Result<(), AgentError>;
}

/// [`ModelBackend`] over the local API's status/load/unload endpoints.
pub struct HttpModelBackend {
    api: Arc<LocalApi>,
    endpoints: ModelEndpoints,
    load_timeout: Duration,
}

impl HttpModelBackend {
    pub fn new(api: Arc<LocalApi>, endpoints: ModelEndpoints, load_timeout: Duration) -> Self {
        Self {
            api,
            endpoints,
            load_timeout,
        }
    }
}

#[async_trait]
impl ModelBackend for HttpModelBackend {
    async fn loaded_model(&self) -> Result<Option<String>, AgentError> {
        let status = self
            .api
            .call(Method::Get, &self.endpoints.status_path, None)
            .await?;
        Ok(status
            .get("model")
            .and_then(Value::as_str)
            .filter(|m| !m.is_empty())
            .map(str::to_string))
    }

    async fn load(&self, model: &str) -> Result<(), AgentError> {
        let body = json!({ "model": model });
        self.api
            .call_with_timeout(Method::Post, &self.endpoints.load_path, Some(&body), self.load_timeout)
            .await
            .map(|_| ())
    }

    async fn unload(&self, model: &str) -> Result<(), AgentError> {
        let body = json!({ "model": model });
        self.api
            .call_with_timeout(Method::Post, &self.endpoints.unload_path, Some(&body), self.load_timeout)
            .await
            .map(|_| ())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum ActiveModel {
    Unknown,
    None,
    Loaded(String),
}

pub struct ModelLifecycle {
    backend: Arc<dyn ModelBackend>,
    lock: StateLock,
    active: Mutex<ActiveModel>,
}

impl ModelLifecycle {
    pub fn new(backend: Arc<dyn ModelBackend>) -> Self {
        Self {
            backend,
            lock: StateLock::new(),
            active: Mutex::new(ActiveModel::Unknown),
        }
    }

    /// Forget the cached model; the next precondition check queries it.
    pub fn reset(&self) {
        *self.active.lock() = ActiveModel::Unknown;
    }

    pub fn is_busy(&self) -> bool {
        self.lock.is_held()
    }

    /// Take the state lock or fail with `Busy`.
    pub fn try_begin(&self) -> Result<StateGuard, AgentError> {
        self.lock
            .try_acquire()
            .ok_or_else(|| AgentError::Busy("model change in progress".into()))
    }

    /// Make `model` the active model. Requires the state lock.
    pub async fn ensure(&self, model: &str, _guard: &StateGuard) -> Result<(), AgentError> {
        let result = self.switch_to(model).await;
        if let Err(ref e) = result {
            tracing::warn!(model, error = %e, "model precondition failed");
            self.reset();
        }
        result
    }

    async fn switch_to(&self, model: &str) -> Result<(), AgentError> {
        let cached = self.active.lock().clone();
        let current = match cached {
            ActiveModel::Loaded(name) => Some(name),
            ActiveModel::None => None,
            ActiveModel::Unknown => self
                .backend
                .loaded_model()
                .await
                .map_err(|e| precondition(model, e))?,
        };

        if current.as_deref() == Some(model) {
            *self.active.lock() = ActiveModel::Loaded(model.to_string());
            return Ok(());
        }

        if let Some(ref old) = current {
            tracing::info!(from = %old, to = model, "unloading model");
            self.backend
                .unload(old)
                .await
                .map_err(|e| precondition(model, e))?;
        }
        *self.active.lock() = ActiveModel::None;

        tracing::info!(model, "loading model");
        self.backend
            .load(model)
            .await
            .map_err(|e| precondition(model, e))?;
        *self.active.lock() = ActiveModel::Loaded(model.to_string());
        Ok(())
    }
}

fn precondition(model: &str, err: AgentError) -> AgentError {
    AgentError::Precondition {
        model: model.to_string(),
        reason: err.to_string(),
    }
}
