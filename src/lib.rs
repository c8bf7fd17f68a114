//! DBMeter - microphone sound level meter
//!
//! Periodically samples the peak level of the default microphone and streams
//! it to a single subscriber through a request/response command bridge.

pub mod audio;
pub mod ipc;
pub mod meter;

pub use audio::{CaptureBackend, CaptureStream, CpalBackend};
pub use ipc::{Command, CommandBridge, PluginResponse, PluginResult, Request, ResultSender};
pub use meter::{InterruptionCenter, InterruptionEvent, MeterController, MeterError, MeterPhase};
