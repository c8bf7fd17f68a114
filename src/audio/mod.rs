//! Audio capture and metering
//!
//! Defines the capture device contract and its cpal implementation.

mod capture;
pub mod level;
mod microphone;

pub use capture::{AudioConfig, CaptureBackend, CaptureError, CaptureStream};
pub use microphone::{list_input_devices, CpalBackend, MicrophoneStream};

#[cfg(test)]
pub use capture::{MockCaptureBackend, MockCaptureStream};
