//! Session transport: a child process attached to a bidirectional
//! text stream, driven by "send line" and "wait for exact text".

mod expect;
mod session;
mod spawn_config;
mod transcript;

use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::cancel::CancelToken;

pub use expect::ExpectBuffer;
pub use session::{PtyConsole, PtyTransport};
pub use spawn_config::LaunchCommand;
pub use transcript::Transcript;

/// Label used in errors raised while waiting for the stream to end.
pub const END_OF_STREAM: &str = "<end of stream>";

/// Errors raised by a console or while spawning one.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to spawn '{program}': {message}")]
    Spawn { program: String, message: String },

    #[error("Console stream already closed")]
    Closed,

    #[error("Timed out after {waited:.1?} waiting for {expected:?}")]
    Timeout { expected: String, waited: Duration },

    #[error("Console stream ended after {waited:.1?} while waiting for {expected:?}")]
    StreamEnded { expected: String, waited: Duration },

    #[error("Cancelled while waiting for {expected:?}")]
    Cancelled { expected: String },

    #[error("Console I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Time spent waiting before the failure, when known.
    pub fn waited(&self) -> Option<Duration> {
        match self {
            TransportError::Timeout { waited, .. } | TransportError::StreamEnded { waited, .. } => {
                Some(*waited)
            }
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransportError::Cancelled { .. })
    }
}

/// A live console session with an ephemeral instance.
pub trait Console: Send {
    /// Write `text` followed by a line terminator.
    fn send_line(&mut self, text: &str) -> Result<(), TransportError>;

    /// Block until `literal` appears verbatim in the output received
    /// since the last successful expectation.
    fn expect(&mut self, literal: &str, timeout: Duration) -> Result<(), TransportError>;

    /// Block until the process stops producing output entirely.
    fn expect_eof(&mut self, timeout: Duration) -> Result<(), TransportError>;

    /// Release the stream and reap the child. Idempotent; returns a
    /// description of the exit status the first time it is known.
    fn close(&mut self) -> Option<String>;
}

/// Starts launch commands attached to a [`Console`].
pub trait Transport: Send + Sync {
    fn spawn(
        &self,
        launch: &LaunchCommand,
        transcript: Transcript,
        cancel: CancelToken,
    ) -> Result<Box<dyn Console>, TransportError>;
}
