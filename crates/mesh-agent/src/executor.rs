use std::sync::Arc;

use async_trait::async_trait;
use mesh_core::{CommandFrame, ResponseFrame};
use serde_json::Value;

use crate::config::AgentConfig;
use crate::errors::AgentError;
use crate::local_api::LocalApi;
use crate::model::{required_model, HttpModelBackend, ModelBackend, ModelLifecycle};

/// Turns one command frame into its response frame. Never fails: errors
/// become error responses.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, command: CommandFrame) -> ResponseFrame;

    /// Called when a new socket opens.
    fn session_started(&self) {}
}

/// Executes commands against the local API, satisfying the model
/// precondition first when one applies.
pub struct Executor {
    api: Arc<LocalApi>,
    models: Arc<ModelLifecycle>,
    model_paths: Vec<String>,
}

impl Executor {
    pub fn new(api: Arc<LocalApi>, models: Arc<ModelLifecycle>, model_paths: Vec<String>) -> Self {
        Self {
            api,
            models,
            model_paths,
        }
    }

    /// Executor wired to the configured local API.
    pub fn from_config(config: &AgentConfig) -> Self {
        let api = Arc::new(LocalApi::new(&config.local_api_url, config.local_timeout));
        let backend: Arc<dyn ModelBackend> = Arc::new(HttpModelBackend::new(
            Arc::clone(&api),
            config.model.clone(),
            config.model_load_timeout,
        ));
        Self::new(
            api,
            Arc::new(ModelLifecycle::new(backend)),
            config.model_paths.clone(),
        )
    }

    pub fn models(&self) -> &Arc<ModelLifecycle> {
        &self.models
    }

    async fn run(&self, command: &CommandFrame) -> Result<Value, AgentError> {
        let _guard = match required_model(command, &self.model_paths) {
            Some(model) => {
                let guard = self.models.try_begin()?;
                self.models.ensure(&model, &guard).await?;
                Some(guard)
            }
            None => None,
        };
        self.api
            .call(command.method, &command.url, command.data.as_ref())
            .await
    }
}

#[async_trait]
impl CommandHandler for Executor {
    async fn handle(&self, command: CommandFrame) -> ResponseFrame {
        let id = command.command_id.clone();
        match self.run(&command).await {
            Ok(result) => {
                tracing::debug!(command_id = %id, "command executed");
                ResponseFrame::success(id, result)
            }
            Err(e) => {
                tracing::warn!(command_id = %id, url = %command.url, error = %e, "command failed");
                e.into_response(id)
            }
        }
    }

    fn session_started(&self) {
        self.models.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::routing::{get, post};
    use axum::{Json, Router};
    use mesh_core::{CommandId, Method};
    use serde_json::json;

    use crate::model::tests::FakeBackend;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.ok();
        });
        format!("http://{addr}")
    }

    fn fake_api() -> Router {
        Router::new()
            .route("/status", get(|| async { Json(json!({"ok": true})) }))
            .route(
                "/v1/chat/completions",
                post(|Json(body): Json<Value>| async move {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    Json(json!({"reply": "hi", "model": body["model"]}))
                }),
            )
    }

    async fn executor(backend: Arc<FakeBackend>) -> Executor {
        let api = Arc::new(LocalApi::new(serve(fake_api()).await, Duration::from_secs(5)));
        Executor::new(
            api,
            Arc::new(ModelLifecycle::new(backend)),
            vec!["/v1/chat/completions".into()],
        )
    }

    fn frame(id: &str, method: Method, url: &str, data: Option<Value>) -> CommandFrame {
        CommandFrame {
            command_id: CommandId::from_raw(id),
            method,
            url: url.into(),
            data,
        }
    }

    #[tokio::test]
    async fn plain_command_round_trip() {
        let exec = executor(Arc::new(FakeBackend::default())).await;
        let resp = exec.handle(frame("c1", Method::Get, "/status", None)).await;
        assert_eq!(resp.command_id.as_str(), "c1");
        assert_eq!(resp.result, json!({"ok": true}));
        assert!(!exec.models().is_busy());
    }

    #[tokio::test]
    async fn local_failure_becomes_error_response() {
        let exec = executor(Arc::new(FakeBackend::default())).await;
        let resp = exec.handle(frame("c2", Method::Get, "/missing", None)).await;
        assert!(resp.is_error());
    }

    #[tokio::test]
    async fn model_command_loads_then_executes() {
        let backend = Arc::new(FakeBackend::default());
        let exec = executor(backend.clone()).await;
        let resp = exec
            .handle(frame("c3", Method::Post, "/v1/chat/completions", Some(json!({"model": "llama"}))))
            .await;
        assert_eq!(resp.result["reply"], "hi");
        assert_eq!(backend.calls(), vec!["status", "load:llama"]);
        assert!(!exec.models().is_busy());
    }

    #[tokio::test]
    async fn concurrent_model_command_is_busy() {
        let backend = Arc::new(FakeBackend::default());
        let exec = Arc::new(executor(backend).await);

        let first = {
            let exec = Arc::clone(&exec);
            tokio::spawn(async move {
                exec.handle(frame("c1", Method::Post, "/v1/chat/completions", Some(json!({"model": "a"}))))
                    .await
            })
        };
        while !exec.models().is_busy() {
            tokio::task::yield_now().await;
        }

        let second = exec
            .handle(frame("c2", Method::Post, "/v1/chat/completions", Some(json!({"model": "b"}))))
            .await;
        assert_eq!(second.result["code"], "BUSY");

        let first = first.await.unwrap();
        assert!(!first.is_error());
        assert!(!exec.models().is_busy());
    }

    #[tokio::test]
    async fn precondition_failure_releases_lock() {
        let backend = Arc::new(FakeBackend::default());
        *backend.fail_load.lock() = true;
        let exec = executor(backend).await;
        let resp = exec
            .handle(frame("c4", Method::Post, "/v1/chat/completions", Some(json!({"model": "llama"}))))
            .await;
        assert!(resp.is_error());
        assert!(resp.result["error"].as_str().unwrap().contains("llama"));
        assert!(!exec.models().is_busy());
    }

    #[tokio::test]
    async fn non_model_commands_skip_the_lock() {
        let exec = executor(Arc::new(FakeBackend::default())).await;
        let _held = exec.models().try_begin().unwrap();
        let resp = exec.handle(frame("c5", Method::Get, "/status", None)).await;
        assert!(!resp.is_error());
    }
}
