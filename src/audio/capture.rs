//! Capture device contract
//!
//! The meter never talks to an audio API directly. It acquires a
//! [`CaptureStream`] through a [`CaptureBackend`] and releases it by
//! dropping it.

use thiserror::Error;

#[cfg(test)]
use mockall::automock;

/// Audio configuration for the metering stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioConfig {
    /// Sample rate requested from the device
    pub sample_rate: u32,
    /// Number of channels (1 = mono)
    pub channels: u16,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            channels: 1,
        }
    }
}

/// Capture device errors
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("No audio device found")]
    NoDevice,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Stream error: {0}")]
    StreamError(String),

    #[error("Capture thread is gone")]
    Released,
}

/// An open input stream with metering enabled.
///
/// Dropping the stream releases the underlying device.
#[cfg_attr(test, automock)]
pub trait CaptureStream: Send {
    /// Begin (or resume) active capture
    fn record(&mut self) -> Result<(), CaptureError>;

    /// Halt active capture, keeping the stream allocated
    fn stop(&mut self) -> Result<(), CaptureError>;

    fn is_recording(&self) -> bool;

    /// Refresh the meter values from the samples captured since the last call
    fn update_meters(&mut self);

    /// Most recent peak level for `channel`, in dB relative to full scale
    fn peak_power(&self, channel: usize) -> f32;
}

/// Opens capture streams. Each call to [`CaptureBackend::open`] is one
/// acquisition of the device.
#[cfg_attr(test, automock(type Stream = MockCaptureStream;))]
pub trait CaptureBackend: Send + Sync + 'static {
    type Stream: CaptureStream + 'static;

    fn open(&self, config: &AudioConfig) -> Result<Self::Stream, CaptureError>;
}
