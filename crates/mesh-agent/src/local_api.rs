use std::time::Duration;

use mesh_core::Method;
use serde_json::Value;

use crate::errors::AgentError;

/// HTTP client for the host's local API.
pub struct LocalApi {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl LocalApi {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .user_agent("mesh-agent/0.1")
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Call the local API with the default timeout.
    pub async fn call(
        &self,
        method: Method,
        path: &str,
        data: Option<&Value>,
    ) -> Result<Value, AgentError> {
        self.call_with_timeout(method, path, data, self.timeout).await
    }

    /// Call the local API, bounded by `timeout`.
    ///
    /// `GET` payload objects become query parameters; other methods send
    /// the payload as a JSON body. A non-2xx answer becomes
    /// [`AgentError::LocalApi`] carrying the API's own error message.
    pub async fn call_with_timeout(
        &self,
        method: Method,
        path: &str,
        data: Option<&Value>,
        timeout: Duration,
    ) -> Result<Value, AgentError> {
        let url = self.url_for(path);
        let mut req = self.client.request(to_reqwest(method), &url);
        match (method, data) {
            (_, None) => {}
            (Method::Get, Some(Value::Object(map))) => {
                let query: Vec<(&str, String)> = map
                    .iter()
                    .map(|(k, v)| (k.as_str(), query_value(v)))
                    .collect();
                req = req.query(&query);
            }
            (_, Some(body)) => req = req.json(body),
        }

        tracing::debug!(%method, %url, "calling local API");
        let send = async {
            let resp = req.send().await.map_err(|e| {
                if e.is_timeout() {
                    AgentError::LocalTimeout(timeout)
                } else {
                    AgentError::LocalApi(e.to_string())
                }
            })?;
            let status = resp.status();
            let text = resp
                .text()
                .await
                .map_err(|e| AgentError::LocalApi(e.to_string()))?;
            if !status.is_success() {
                return Err(AgentError::LocalApi(error_message(status.as_u16(), &text)));
            }
            Ok::<Value, AgentError>(parse_body(&text))
        };

        tokio::time::timeout(timeout, send)
            .await
            .map_err(|_| AgentError::LocalTimeout(timeout))?
    }

    fn url_for(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}/{path}", self.base_url)
        }
    }
}

fn to_reqwest(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Delete => reqwest::Method::DELETE,
    }
}

fn query_value(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Empty bodies decode as `null`, non-JSON bodies as a string.
fn parse_body(text: &str) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

fn error_message(status: u16, text: &str) -> String {
    if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(text) {
        for key in ["error", "detail", "message"] {
            match obj.get(key) {
                Some(Value::String(s)) => return s.clone(),
                Some(Value::Object(inner)) => {
                    if let Some(Value::String(s)) = inner.get("message") {
                        return s.clone();
                    }
                }
                _ => {}
            }
        }
    }
    let text = text.trim();
    if text.is_empty() {
        format!("local API returned HTTP {status}")
    } else {
        format!("local API returned HTTP {status}: {text}")
    }
}
