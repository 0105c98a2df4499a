//! Hardware adapter implementations
//!
//! This module contains the low-level I/O abstraction used by the serial
//! instruments (the sensor board and the syringe pump). Drivers talk to a
//! [`SerialLink`] and never to a port directly, which lets tests substitute a
//! scripted link.

pub mod mock;
pub mod serial_adapter;

pub use mock::ScriptedLink;
pub use serial_adapter::{ResponseEnd, SerialAdapter, SerialFraming};

use async_trait::async_trait;

use crate::error::AppResult;

/// Line-oriented command/response transport.
#[async_trait]
pub trait SerialLink: Send {
    /// Short identifier used in logs (e.g. the port name).
    fn name(&self) -> &str;

    /// Write a command, appending the link's line terminator. No reply is read.
    async fn send(&mut self, command: &str) -> AppResult<()>;

    /// Write a command and return the (trimmed) reply.
    async fn query(&mut self, command: &str) -> AppResult<String>;
}
