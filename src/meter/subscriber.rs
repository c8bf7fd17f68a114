//! The caller context that receives level readings

use super::controller::MeterError;
use crate::ipc::{CallbackId, PluginResult, ResultSender};

/// Standing channel registered by `start`
#[derive(Debug, Clone)]
pub struct Subscriber {
    callback_id: CallbackId,
    results: ResultSender,
}

impl Subscriber {
    pub fn new(callback_id: impl Into<CallbackId>, results: ResultSender) -> Self {
        Self {
            callback_id: callback_id.into(),
            results,
        }
    }

    pub fn callback_id(&self) -> &str {
        &self.callback_id
    }

    /// Delivers a reading without closing the callback
    pub fn send_reading(&self, level: i32) {
        self.results.send(&self.callback_id, PluginResult::reading(level));
    }

    pub fn send_error(&self, error: &MeterError) {
        self.results
            .send(&self.callback_id, PluginResult::error(error.to_payload()));
    }
}
