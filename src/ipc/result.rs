//! Results sent back to the host application
//!
//! Every response is addressed to the callback id supplied with the command.

use serde::Serialize;
use tokio::sync::mpsc;

/// Caller-supplied correlation token
pub type CallbackId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CommandStatus {
    Ok,
    Error,
}

/// Structured error payload: `{code, message}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorPayload {
    pub code: i32,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Bool(bool),
    Level(i32),
    Error(ErrorPayload),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginResult {
    pub status: CommandStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
    pub keep_callback: bool,
}

impl PluginResult {
    /// Empty success, closes the callback
    pub fn ok() -> Self {
        Self {
            status: CommandStatus::Ok,
            payload: None,
            keep_callback: false,
        }
    }

    pub fn ok_bool(value: bool) -> Self {
        Self {
            payload: Some(Payload::Bool(value)),
            ..Self::ok()
        }
    }

    /// Standing reading: the callback stays open for the next one
    pub fn reading(level: i32) -> Self {
        Self {
            status: CommandStatus::Ok,
            payload: Some(Payload::Level(level)),
            keep_callback: true,
        }
    }

    pub fn error(payload: ErrorPayload) -> Self {
        Self {
            status: CommandStatus::Error,
            payload: Some(Payload::Error(payload)),
            keep_callback: false,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == CommandStatus::Ok
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginResponse {
    pub callback_id: CallbackId,
    #[serde(flatten)]
    pub result: PluginResult,
}

impl PluginResponse {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Sending half of the host bridge. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ResultSender {
    tx: mpsc::UnboundedSender<PluginResponse>,
}

impl ResultSender {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PluginResponse>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, callback_id: &str, result: PluginResult) {
        let response = PluginResponse {
            callback_id: callback_id.to_string(),
            result,
        };
        if self.tx.send(response).is_err() {
            tracing::debug!("Host bridge closed, dropping result for {}", callback_id);
        }
    }
}
