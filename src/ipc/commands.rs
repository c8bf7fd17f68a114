//! Host bridge commands
//!
//! One command per meter operation, each carrying the callback id its
//! results are addressed to. `start` and `stop` run on a single background
//! worker, in arrival order. `destroy` and the queries answer before
//! `dispatch` returns.

use super::result::{CallbackId, PluginResult, ResultSender};
use crate::audio::CaptureBackend;
use crate::meter::{MeterController, Subscriber};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Request {
    Start,
    Stop,
    Destroy,
    IsListening,
    IsInterrupted,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub callback_id: CallbackId,
    #[serde(rename = "action")]
    pub request: Request,
}

impl Command {
    pub fn new(callback_id: impl Into<CallbackId>, request: Request) -> Self {
        Self {
            callback_id: callback_id.into(),
            request,
        }
    }

    /// Parses a command sent by the host as JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Routes host commands to a [`MeterController`]
pub struct CommandBridge<B: CaptureBackend> {
    controller: Arc<MeterController<B>>,
    results: ResultSender,
    background_tx: mpsc::UnboundedSender<Command>,
    worker: JoinHandle<()>,
}

impl<B: CaptureBackend> CommandBridge<B> {
    /// Spawns the background worker on the current runtime
    pub fn new(controller: MeterController<B>, results: ResultSender) -> Self {
        let controller = Arc::new(controller);
        let (background_tx, background_rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_background(
            Arc::clone(&controller),
            results.clone(),
            background_rx,
        ));

        Self {
            controller,
            results,
            background_tx,
            worker,
        }
    }

    pub async fn dispatch(&self, command: Command) {
        tracing::debug!("Command {:?} ({})", command.request, command.callback_id);

        match command.request {
            Request::Start | Request::Stop => {
                if let Err(mpsc::error::SendError(command)) = self.background_tx.send(command) {
                    tracing::error!("Background worker gone, dropping {:?}", command.request);
                }
            }
            Request::Destroy => {
                let result = match self.controller.destroy().await {
                    Ok(()) => PluginResult::ok(),
                    Err(e) => PluginResult::error(e.to_payload()),
                };
                self.results.send(&command.callback_id, result);
            }
            Request::IsListening => {
                let listening = self.controller.is_listening();
                self.results
                    .send(&command.callback_id, PluginResult::ok_bool(listening));
            }
            Request::IsInterrupted => {
                let interrupted = self.controller.is_interrupted();
                self.results
                    .send(&command.callback_id, PluginResult::ok_bool(interrupted));
            }
        }
    }
}

impl<B: CaptureBackend> Drop for CommandBridge<B> {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

/// The single background context for `start` and `stop`
async fn run_background<B: CaptureBackend>(
    controller: Arc<MeterController<B>>,
    results: ResultSender,
    mut background_rx: mpsc::UnboundedReceiver<Command>,
) {
    while let Some(command) = background_rx.recv().await {
        match command.request {
            Request::Start => {
                let subscriber = Subscriber::new(command.callback_id, results.clone());
                // Failures already went to the subscriber
                let _ = controller.start(subscriber).await;
            }
            Request::Stop => {
                let result = match controller.stop().await {
                    Ok(()) => PluginResult::ok(),
                    Err(e) => PluginResult::error(e.to_payload()),
                };
                results.send(&command.callback_id, result);
            }
            other => {
                tracing::warn!("{:?} is not a background command", other);
            }
        }
    }
}
