use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::features::CommandFailure;
use crate::pty::TransportError;
use crate::runtime::image::ImageError;
use crate::runtime::RuntimeError;
use crate::session::login::LoginError;
use crate::session::RequestError;

/// Where in a provisioning run an error was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Request,
    Image,
    Prepare,
    Spawn,
    Login,
    Resync,
    Features,
    Shutdown,
    Cleanup,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Request => "request",
            Stage::Image => "image",
            Stage::Prepare => "prepare",
            Stage::Spawn => "spawn",
            Stage::Login => "login",
            Stage::Resync => "resync",
            Stage::Features => "features",
            Stage::Shutdown => "shutdown",
            Stage::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a provisioning run can fail with, surfaced after cleanup.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("Invalid request: {0}")]
    InvalidRequest(#[from] RequestError),

    #[error(transparent)]
    InvalidImage(#[from] ImageError),

    #[error("Failed to prepare image: {0}")]
    Prepare(#[source] RuntimeError),

    #[error("Failed to start instance: {0}")]
    Spawn(#[source] TransportError),

    #[error("Login failed: {0}")]
    LoginFailed(#[source] LoginError),

    #[error("Command failed: {0}")]
    CommandFailed(#[from] CommandFailure),

    #[error("Console failed during {stage}: {source}")]
    Transport {
        stage: Stage,
        #[source]
        source: TransportError,
    },

    #[error("Cancelled during {stage}")]
    Cancelled { stage: Stage },

    #[error("Instance {resource_id} was still running after shutdown and was force-stopped")]
    CleanupWarning { resource_id: String },

    #[error("Failed to stop instance {resource_id}: {source}")]
    CleanupFailed {
        resource_id: String,
        #[source]
        source: RuntimeError,
    },
}

impl ProvisionError {
    /// Console errors outside features; cancellation keeps its own kind.
    pub fn transport(stage: Stage, source: TransportError) -> Self {
        if source.is_cancelled() {
            ProvisionError::Cancelled { stage }
        } else {
            ProvisionError::Transport { stage, source }
        }
    }

    pub fn login(source: LoginError) -> Self {
        if source.is_cancelled() {
            ProvisionError::Cancelled {
                stage: Stage::Login,
            }
        } else {
            ProvisionError::LoginFailed(source)
        }
    }

    pub fn command(failure: CommandFailure) -> Self {
        if failure.source.is_cancelled() {
            ProvisionError::Cancelled {
                stage: Stage::Features,
            }
        } else {
            ProvisionError::CommandFailed(failure)
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            ProvisionError::InvalidRequest(_) => Stage::Request,
            ProvisionError::InvalidImage(_) => Stage::Image,
            ProvisionError::Prepare(_) => Stage::Prepare,
            ProvisionError::Spawn(_) => Stage::Spawn,
            ProvisionError::LoginFailed(_) => Stage::Login,
            ProvisionError::CommandFailed(_) => Stage::Features,
            ProvisionError::Transport { stage, .. } | ProvisionError::Cancelled { stage } => *stage,
            ProvisionError::CleanupWarning { .. } | ProvisionError::CleanupFailed { .. } => {
                Stage::Cleanup
            }
        }
    }

    /// Process exit status for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            ProvisionError::InvalidRequest(_)
            | ProvisionError::InvalidImage(_)
            | ProvisionError::Prepare(_) => 1,
            ProvisionError::Spawn(_) => 2,
            ProvisionError::LoginFailed(_) => 3,
            ProvisionError::CommandFailed(_) => 4,
            ProvisionError::CleanupWarning { .. } | ProvisionError::CleanupFailed { .. } => 5,
            ProvisionError::Transport { .. } => 6,
            ProvisionError::Cancelled { .. } => 130,
        }
    }
}
