//! JSON frames exchanged over the agent WebSocket.
//!
//! ```text
//! coordinator -> agent   {"command_id", "method", "url", "data"?}
//! agent -> coordinator   {"command_id", "result"}
//!                        {"command_id", "result": {"error", "code"?}}
//! either direction       {"type": "ping"} / {"type": "pong"}
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::errors::CommandError;
use crate::ids::CommandId;

/// Error code an agent attaches when its local state lock is already held.
pub const BUSY_CODE: &str = "BUSY";

/// Errors produced while decoding an inbound frame.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("missing or invalid field: {0}")]
    MissingField(&'static str),
    #[error("unsupported method: {0}")]
    UnknownMethod(String),
    #[error("unknown frame type: {0}")]
    UnknownType(String),
}

/// HTTP verb forwarded to the agent's local API. Closed set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "DELETE" => Ok(Self::Delete),
            other => Err(FrameError::UnknownMethod(other.to_string())),
        }
    }
}

/// A command as submitted by a caller, before it gets an id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub method: Method,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Command {
    pub fn new(method: Method, url: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            method,
            url: url.into(),
            data,
        }
    }
}

/// Coordinator -> agent command frame.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CommandFrame {
    pub command_id: CommandId,
    pub method: Method,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl CommandFrame {
    pub fn new(command_id: CommandId, command: &Command) -> Self {
        Self {
            command_id,
            method: command.method,
            url: command.url.clone(),
            data: command.data.clone(),
        }
    }
}

/// Agent -> coordinator response frame.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResponseFrame {
    pub command_id: CommandId,
    pub result: Value,
}

impl ResponseFrame {
    pub fn success(command_id: CommandId, result: Value) -> Self {
        Self { command_id, result }
    }

    /// Structured error response; `message` is forwarded verbatim.
    pub fn error(command_id: CommandId, message: impl Into<String>) -> Self {
        Self {
            command_id,
            result: json!({ "error": message.into() }),
        }
    }

    pub fn busy(command_id: CommandId, message: impl Into<String>) -> Self {
        Self {
            command_id,
            result: json!({ "error": message.into(), "code": BUSY_CODE }),
        }
    }

    /// Whether the result carries an application-level error.
    pub fn is_error(&self) -> bool {
        self.result.get("error").is_some_and(|e| !e.is_null())
    }

    /// Map the frame into the caller-facing outcome.
    pub fn into_outcome(self) -> Result<Value, CommandError> {
        let Some(error) = self.result.get("error").filter(|e| !e.is_null()) else {
            return Ok(self.result);
        };
        let message = match error {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        if self.result.get("code").and_then(Value::as_str) == Some(BUSY_CODE) {
            Err(CommandError::Busy(message))
        } else {
            Err(CommandError::AgentError(message))
        }
    }
}

/// Any frame that can appear on the socket.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Ping,
    Pong,
    Command(CommandFrame),
    Response(ResponseFrame),
}

impl Frame {
    /// Decode a text frame.
    ///
    /// A frame carrying `method` or `url` is a command and must have all of
    /// `command_id`, `method` and `url`. Any other frame with a `command_id`
    /// is a response; a missing `result` decodes as `null`.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| FrameError::InvalidJson(e.to_string()))?;
        let Value::Object(mut obj) = value else {
            return Err(FrameError::NotAnObject);
        };

        if let Some(kind) = obj.get("type").and_then(Value::as_str) {
            return match kind {
                "ping" => Ok(Self::Ping),
                "pong" => Ok(Self::Pong),
                other => Err(FrameError::UnknownType(other.to_string())),
            };
        }

        if obj.contains_key("method") || obj.contains_key("url") {
            return parse_command(&mut obj).map(Self::Command);
        }

        let command_id = take_str(&mut obj, "command_id")?;
        let result = obj.remove("result").unwrap_or(Value::Null);
        Ok(Self::Response(ResponseFrame {
            command_id: CommandId::from_raw(command_id),
            result,
        }))
    }

    /// Serialize the frame for the wire.
    pub fn to_json(&self) -> String {
        let value = match self {
            Self::Ping => json!({ "type": "ping" }),
            Self::Pong => json!({ "type": "pong" }),
            Self::Command(c) => serde_json::to_value(c).unwrap_or(Value::Null),
            Self::Response(r) => serde_json::to_value(r).unwrap_or(Value::Null),
        };
        value.to_string()
    }
}

fn parse_command(obj: &mut Map<String, Value>) -> Result<CommandFrame, FrameError> {
    let command_id = take_str(obj, "command_id")?;
    let method: Method = take_str(obj, "method")?.parse()?;
    let url = take_str(obj, "url")?;
    let data = obj.remove("data").filter(|d| !d.is_null());
    Ok(CommandFrame {
        command_id: CommandId::from_raw(command_id),
        method,
        url,
        data,
    })
}

fn take_str(obj: &mut Map<String, Value>, key: &'static str) -> Result<String, FrameError> {
    match obj.remove(key) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s),
        _ => Err(FrameError::MissingField(key)),
    }
}

/// First `max` characters of a frame, for log lines.
pub fn preview(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
