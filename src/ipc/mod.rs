//! Host bridge IPC
//!
//! Typed commands in, typed results out, correlated by callback id.

mod commands;
mod result;

pub use commands::{Command, CommandBridge, Request};
pub use result::{
    CallbackId, CommandStatus, ErrorPayload, Payload, PluginResponse, PluginResult, ResultSender,
};
