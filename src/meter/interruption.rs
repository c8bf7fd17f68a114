//! System audio interruptions (incoming call, another app taking the mic...)
//!
//! The platform glue posts events into an [`InterruptionCenter`]; the meter
//! observes it once per controller.

use serde::Deserialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InterruptionEvent {
    Began,
    Ended,
}

/// Notification hub for interruption events
#[derive(Debug, Clone)]
pub struct InterruptionCenter {
    tx: broadcast::Sender<InterruptionEvent>,
}

impl InterruptionCenter {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self { tx }
    }

    /// Publishes an event to every observer. Returns the number of observers reached.
    pub fn post(&self, event: InterruptionEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InterruptionEvent> {
        self.tx.subscribe()
    }

    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for InterruptionCenter {
    fn default() -> Self {
        Self::new()
    }
}
