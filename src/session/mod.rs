//! Session lifecycle controller.
//!
//! [`Provisioner::run`] drives one ephemeral instance from spawn to
//! close: login (or a prompt resync), the requested features in order,
//! then the shutdown command and a wait for the stream to end. Cleanup
//! (liveness check, force-stop if still running, console close) runs
//! exactly once on every path, including panics, through a scope guard
//! armed right after spawn.

pub mod error;
pub mod lifecycle;
pub mod login;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use scopeguard::ScopeGuard;
use serde::Serialize;
use thiserror::Error;

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::features::{Feature, FeatureEngine, FeatureKind};
use crate::pty::{Console, Transcript, Transport};
use crate::runtime::image::validate_image;
use crate::runtime::{ResourceId, Runtime, RuntimeError};

pub use error::{ProvisionError, Stage};
pub use lifecycle::{Lifecycle, PhaseRecord, SessionPhase};
pub use login::{login, Handshake, LoginError, LoginStep};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("feature '{0}' requested more than once")]
    DuplicateFeature(FeatureKind),

    #[error("package installation needs at least one non-empty package group")]
    EmptyPackageInstall,
}

/// What to do to one image. Fixed for the whole session.
#[derive(Debug, Clone)]
pub struct ProvisioningRequest {
    image: PathBuf,
    version_tag: Option<String>,
    features: Vec<Feature>,
    requires_login: bool,
}

impl ProvisioningRequest {
    /// Features are applied in the given order; each kind at most once.
    pub fn new(image: impl Into<PathBuf>, features: Vec<Feature>) -> Result<Self, RequestError> {
        let mut seen = HashSet::new();
        for feature in &features {
            if !seen.insert(feature.kind()) {
                return Err(RequestError::DuplicateFeature(feature.kind()));
            }
            if let Feature::PackageInstall(groups) = feature {
                if groups.is_empty() || groups.iter().any(|g| g.is_empty()) {
                    return Err(RequestError::EmptyPackageInstall);
                }
            }
        }
        Ok(Self {
            image: image.into(),
            version_tag: None,
            features,
            requires_login: true,
        })
    }

    pub fn with_version_tag(mut self, tag: Option<String>) -> Self {
        self.version_tag = tag;
        self
    }

    pub fn with_login(mut self, requires_login: bool) -> Self {
        self.requires_login = requires_login;
        self
    }

    pub fn image(&self) -> &Path {
        &self.image
    }

    pub fn version_tag(&self) -> Option<&str> {
        self.version_tag.as_deref()
    }

    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    pub fn requires_login(&self) -> bool {
        self.requires_login
    }

    fn wants(&self, kind: FeatureKind) -> bool {
        self.features.iter().any(|f| f.kind() == kind)
    }
}

/// Summary of one run, printed as text or JSON.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub image: PathBuf,
    pub version_tag: Option<String>,
    pub resource_id: Option<String>,
    pub features_applied: Vec<FeatureKind>,
    pub commands_sent: usize,
    pub phases: Vec<PhaseRecord>,
    /// Instance was still running at cleanup and had to be force-stopped.
    pub residual_resource: bool,
    pub exit_status: Option<String>,
    pub elapsed_ms: u64,
    pub stage: Option<Stage>,
    pub error: Option<String>,
}

impl SessionReport {
    fn new(request: &ProvisioningRequest) -> Self {
        Self {
            image: request.image.clone(),
            version_tag: request.version_tag.clone(),
            resource_id: None,
            features_applied: Vec::new(),
            commands_sent: 0,
            phases: Vec::new(),
            residual_resource: false,
            exit_status: None,
            elapsed_ms: 0,
            stage: None,
            error: None,
        }
    }

    pub fn phases(&self) -> Vec<SessionPhase> {
        self.phases.iter().map(|record| record.phase).collect()
    }
}

/// Report plus the typed result of a run.
#[derive(Debug)]
pub struct SessionOutcome {
    pub report: SessionReport,
    pub result: Result<(), ProvisionError>,
}

impl SessionOutcome {
    pub fn exit_code(&self) -> i32 {
        match &self.result {
            Ok(()) => 0,
            Err(e) => e.exit_code(),
        }
    }
}

/// What cleanup observed.
#[derive(Debug, Default)]
struct CleanupOutcome {
    was_alive: bool,
    stop_error: Option<RuntimeError>,
    exit_status: Option<String>,
}

/// The live console plus the instance it is attached to.
struct SessionHandle {
    console: Box<dyn Console>,
    resource_id: ResourceId,
    runtime: Arc<dyn Runtime>,
    lifecycle: Lifecycle,
    cancel: CancelToken,
    is_open: bool,
}

impl SessionHandle {
    /// Liveness check, force-stop when still running, then close the
    /// console. Only the first call does anything.
    fn cleanup(&mut self) -> Option<CleanupOutcome> {
        if !self.is_open {
            return None;
        }
        self.is_open = false;
        let id = &self.resource_id;
        let mut outcome = CleanupOutcome::default();

        let alive = match self.runtime.is_alive(id) {
            Ok(alive) => alive,
            Err(e) => {
                tracing::warn!(resource_id = %id, "Liveness check failed, stopping anyway: {}", e);
                true
            }
        };
        if alive {
            tracing::warn!(resource_id = %id, "Instance still running at cleanup, force-stopping");
            outcome.was_alive = true;
            if let Err(e) = self.runtime.force_stop(id) {
                tracing::error!(resource_id = %id, "Force-stop failed: {}", e);
                outcome.stop_error = Some(e);
            }
        }

        outcome.exit_status = self.console.close();
        self.cancel.untrack(id.as_str());
        self.lifecycle.advance(SessionPhase::Closed);
        tracing::info!(
            resource_id = %id,
            exit_status = outcome.exit_status.as_deref().unwrap_or("unknown"),
            "Session closed"
        );
        Some(outcome)
    }
}

/// Runs provisioning sessions against a runtime and a console transport.
pub struct Provisioner {
    config: Config,
    runtime: Arc<dyn Runtime>,
    transport: Arc<dyn Transport>,
    engine: FeatureEngine,
}

impl Provisioner {
    pub fn new(config: Config, runtime: Arc<dyn Runtime>, transport: Arc<dyn Transport>) -> Self {
        let engine = FeatureEngine::from_config(&config);
        Self {
            config,
            runtime,
            transport,
            engine,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Provision `request.image` in a fresh instance.
    ///
    /// Returns only after cleanup has finished. The image is left in
    /// place whatever the outcome.
    pub fn run(
        &self,
        request: &ProvisioningRequest,
        cancel: &CancelToken,
        transcript: Transcript,
    ) -> SessionOutcome {
        let started = Instant::now();
        let mut report = SessionReport::new(request);
        let result = self.drive(request, cancel, transcript, &mut report);

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        if let Err(e) = &result {
            report.stage = Some(e.stage());
            report.error = Some(e.to_string());
            tracing::error!(stage = %e.stage(), image = %request.image.display(), "Provisioning failed: {}", e);
        } else {
            tracing::info!(image = %request.image.display(), elapsed_ms = report.elapsed_ms, "Provisioning finished");
        }
        SessionOutcome { report, result }
    }

    fn drive(
        &self,
        request: &ProvisioningRequest,
        cancel: &CancelToken,
        transcript: Transcript,
        report: &mut SessionReport,
    ) -> Result<(), ProvisionError> {
        let mut lifecycle = Lifecycle::new();
        let result = self.prepare(request, cancel, report);
        let image = match result {
            Ok(image) => image,
            Err(e) => {
                lifecycle.advance(SessionPhase::Closed);
                report.phases = lifecycle.history().to_vec();
                return Err(e);
            }
        };

        let resource_id = ResourceId::generate(&self.config.runtime.name_prefix);
        report.resource_id = Some(resource_id.to_string());
        let launch = self.runtime.launch_command(&image, &resource_id);
        tracing::info!(resource_id = %resource_id, command = %launch, "Starting instance");

        let console = match self.transport.spawn(&launch, transcript, cancel.clone()) {
            Ok(console) => console,
            Err(e) => {
                // Nothing was started, so there is nothing to stop.
                lifecycle.advance(SessionPhase::Closed);
                report.phases = lifecycle.history().to_vec();
                return Err(ProvisionError::Spawn(e));
            }
        };
        lifecycle.advance(SessionPhase::Spawned);
        cancel.track(resource_id.as_str());

        let handle = SessionHandle {
            console,
            resource_id,
            runtime: Arc::clone(&self.runtime),
            lifecycle,
            cancel: cancel.clone(),
            is_open: true,
        };
        let mut guard = scopeguard::guard(handle, |mut handle| {
            handle.cleanup();
        });

        let converse = self.converse(&mut guard, request, cancel, report);

        let mut handle = ScopeGuard::into_inner(guard);
        let cleanup = handle.cleanup().unwrap_or_default();
        report.phases = handle.lifecycle.history().to_vec();
        report.residual_resource = cleanup.was_alive;
        report.exit_status = cleanup.exit_status;

        match (converse, cleanup.stop_error) {
            (Err(e), stop_error) => {
                if let Some(stop_error) = stop_error {
                    tracing::warn!(resource_id = %handle.resource_id, "Also failed to stop the instance: {}", stop_error);
                }
                Err(e)
            }
            (Ok(()), Some(source)) => Err(ProvisionError::CleanupFailed {
                resource_id: handle.resource_id.to_string(),
                source,
            }),
            (Ok(()), None) if cleanup.was_alive => Err(ProvisionError::CleanupWarning {
                resource_id: handle.resource_id.to_string(),
            }),
            (Ok(()), None) => Ok(()),
        }
    }

    /// Validate the image and grow it when storage expansion is requested.
    fn prepare(
        &self,
        request: &ProvisioningRequest,
        cancel: &CancelToken,
        report: &mut SessionReport,
    ) -> Result<PathBuf, ProvisionError> {
        let image = validate_image(&request.image)?;
        report.image = image.clone();

        if request.wants(FeatureKind::ExpandStorage) {
            if let Some(increment) = &self.config.runtime.grow_by {
                tracing::info!(image = %image.display(), %increment, "Growing image file");
                self.runtime
                    .grow_image(&image, increment)
                    .map_err(ProvisionError::Prepare)?;
            }
        }

        if cancel.is_cancelled() {
            return Err(ProvisionError::Cancelled {
                stage: Stage::Prepare,
            });
        }
        Ok(image)
    }

    /// Everything between spawn and cleanup.
    fn converse(
        &self,
        handle: &mut SessionHandle,
        request: &ProvisioningRequest,
        cancel: &CancelToken,
        report: &mut SessionReport,
    ) -> Result<(), ProvisionError> {
        let session = &self.config.session;
        let console = handle.console.as_mut();

        if request.requires_login {
            login(console, session, cancel).map_err(ProvisionError::login)?;
            handle.lifecycle.advance(SessionPhase::LoggedIn);
        } else {
            tracing::info!("Skipping login, waiting for the shell prompt");
            console
                .expect(&session.shell_prompt(), session.login_timeout())
                .map_err(|e| ProvisionError::transport(Stage::Resync, e))?;
            handle.lifecycle.advance(SessionPhase::SkippedLogin);
        }

        for feature in &request.features {
            let sent = self
                .engine
                .apply(console, feature, request.version_tag())
                .map_err(ProvisionError::command)?;
            report.commands_sent += sent;
            report.features_applied.push(feature.kind());
        }
        handle.lifecycle.advance(SessionPhase::FeaturesApplied);

        tracing::info!(command = %session.shutdown_command, "Shutting down instance");
        handle.lifecycle.advance(SessionPhase::ShuttingDown);
        console
            .send_line(&session.shutdown_command)
            .map_err(|e| ProvisionError::transport(Stage::Shutdown, e))?;
        console
            .expect_eof(session.shutdown_timeout())
            .map_err(|e| ProvisionError::transport(Stage::Shutdown, e))?;
        Ok(())
    }
}
