//! Virtualization runtime collaborators: launching, probing and stopping
//! named ephemeral instances, plus host-side image preparation.

mod docker;
pub mod image;

use std::fmt;
use std::io;
use std::path::Path;
use thiserror::Error;

use crate::pty::LaunchCommand;

pub use docker::DockerRuntime;

/// Name of one ephemeral instance.
///
/// Generated once per session; cleanup only ever addresses the instance
/// by this exact name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceId(String);

impl ResourceId {
    /// `"<prefix>-<12 hex chars>"` from a fresh v4 UUID.
    pub fn generate(prefix: &str) -> Self {
        let token = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("{}-{}", prefix, &token[..12]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors from runtime tool invocations.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Failed to run '{command}': {source}")]
    Exec {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("'{command}' failed ({status}): {stderr}")]
    Failed {
        command: String,
        status: String,
        stderr: String,
    },
}

/// The runtime that executes disk images as named, removable instances.
pub trait Runtime: Send + Sync {
    /// Command that boots `image` as instance `id` attached to a console.
    fn launch_command(&self, image: &Path, id: &ResourceId) -> LaunchCommand;

    /// Whether an instance named exactly `id` is still running.
    fn is_alive(&self, id: &ResourceId) -> Result<bool, RuntimeError>;

    /// Ask the runtime to stop `id`. Stopping an absent instance is not an error.
    fn force_stop(&self, id: &ResourceId) -> Result<(), RuntimeError>;

    /// Grow the image file by `increment` (e.g. `"+1G"`).
    fn grow_image(&self, image: &Path, increment: &str) -> Result<(), RuntimeError>;
}
