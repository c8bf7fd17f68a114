//! Meter controller
//!
//! Owns the capture resource, the sampler and the subscriber, and moves
//! between Uninitialized, Idle, Listening and Interrupted.

mod controller;
mod interruption;
mod sampler;
mod subscriber;

use crate::audio::AudioConfig;

pub use controller::{MeterController, MeterError, MeterPhase};
pub use interruption::{InterruptionCenter, InterruptionEvent};
pub use sampler::{Sampler, SamplerTiming};
pub use subscriber::Subscriber;

/// Meter configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MeterConfig {
    /// Sampler warm-up and period
    pub timing: SamplerTiming,
    /// Capture stream settings
    pub audio: AudioConfig,
}
