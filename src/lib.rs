//! Provision Raspberry Pi OS disk images by booting them in an ephemeral
//! container and driving the serial console.

pub mod batch;
pub mod cancel;
pub mod cli;
pub mod config;
pub mod features;
pub mod logging;
pub mod pty;
pub mod runtime;
pub mod session;
