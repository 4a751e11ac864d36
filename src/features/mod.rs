//! Feature toggle engine.
//!
//! Each requested feature resolves to an ordered list of
//! [`CommandStep`]s from the [`CommandCatalog`], possibly picking a
//! variant by image release date, and is then replayed on a console one
//! command at a time: nothing is sent until the previous command's
//! prompt came back.

pub mod recipes;
pub mod version;

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Config;
use crate::pty::{Console, TransportError};

pub use recipes::{package_preset, CommandCatalog, Recipe};
pub use version::{parse_version_tag, GateBranch, VersionGate};

/// Feature names as they appear in config files, batch plans and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    Autologin,
    RemoteAccess,
    ExpandStorage,
    PackageInstall,
}

impl FeatureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Autologin => "autologin",
            Self::RemoteAccess => "remote_access",
            Self::ExpandStorage => "expand_storage",
            Self::PackageInstall => "package_install",
        }
    }
}

impl fmt::Display for FeatureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Packages installed by a single command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageGroup {
    pub packages: Vec<String>,
    /// Overrides `features.package_timeout_secs` for this group.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl PackageGroup {
    /// Whitespace-separated package names.
    pub fn parse(spec: &str) -> Self {
        Self {
            packages: spec.split_whitespace().map(str::to_string).collect(),
            timeout_secs: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs());
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

/// One OS mutation requested for an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feature {
    Autologin,
    RemoteAccess,
    ExpandStorage,
    PackageInstall(Vec<PackageGroup>),
}

impl Feature {
    pub fn kind(&self) -> FeatureKind {
        match self {
            Feature::Autologin => FeatureKind::Autologin,
            Feature::RemoteAccess => FeatureKind::RemoteAccess,
            Feature::ExpandStorage => FeatureKind::ExpandStorage,
            Feature::PackageInstall(_) => FeatureKind::PackageInstall,
        }
    }
}

/// A command, the prompt that marks its completion, and its wait ceiling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandStep {
    pub command: String,
    pub prompt: String,
    pub timeout: Duration,
}

/// Resolved command list for one feature.
#[derive(Debug, Clone)]
pub struct FeaturePlan {
    pub kind: FeatureKind,
    /// Set for version-gated features.
    pub branch: Option<GateBranch>,
    pub steps: Vec<CommandStep>,
}

/// A feature command whose prompt never came back.
#[derive(Debug, Error)]
#[error("{feature}: command {command:?} failed after {waited:.1?}: {source}")]
pub struct CommandFailure {
    pub feature: FeatureKind,
    pub command: String,
    pub waited: Duration,
    #[source]
    pub source: TransportError,
}

/// Resolves features to command plans and replays them on a console.
#[derive(Debug, Clone)]
pub struct FeatureEngine {
    catalog: CommandCatalog,
}

impl FeatureEngine {
    pub fn new(catalog: CommandCatalog) -> Self {
        Self { catalog }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(CommandCatalog::from_config(&config.session, &config.features))
    }

    pub fn plan(&self, feature: &Feature, tag: Option<&str>) -> FeaturePlan {
        let (branch, steps) = match feature {
            Feature::Autologin => {
                let (branch, steps) = self.catalog.autologin.resolve(tag);
                (branch, steps.to_vec())
            }
            Feature::RemoteAccess => {
                let (branch, steps) = self.catalog.remote_access.resolve(tag);
                (branch, steps.to_vec())
            }
            Feature::ExpandStorage => {
                let (branch, steps) = self.catalog.expand_storage.resolve(tag);
                (branch, steps.to_vec())
            }
            Feature::PackageInstall(groups) => (None, self.catalog.package_steps(groups)),
        };
        FeaturePlan {
            kind: feature.kind(),
            branch,
            steps,
        }
    }

    /// Run every step of `feature`, returning how many commands were sent.
    ///
    /// The first step whose prompt does not arrive aborts the feature.
    pub fn apply(
        &self,
        console: &mut dyn Console,
        feature: &Feature,
        tag: Option<&str>,
    ) -> Result<usize, CommandFailure> {
        let plan = self.plan(feature, tag);
        tracing::info!(
            feature = %plan.kind,
            branch = ?plan.branch,
            commands = plan.steps.len(),
            "Applying feature"
        );

        for (sent, step) in plan.steps.iter().enumerate() {
            let started = Instant::now();
            let fail = |source: TransportError| CommandFailure {
                feature: plan.kind,
                command: step.command.clone(),
                waited: source.waited().unwrap_or_else(|| started.elapsed()),
                source,
            };

            tracing::debug!(feature = %plan.kind, command = %step.command, "Sending command");
            console.send_line(&step.command).map_err(fail)?;
            console.expect(&step.prompt, step.timeout).map_err(fail)?;
            tracing::trace!(
                feature = %plan.kind,
                step = sent + 1,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Command finished"
            );
        }
        Ok(plan.steps.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> FeatureEngine {
        FeatureEngine::from_config(&Config::default())
    }

    fn commands(plan: &FeaturePlan) -> Vec<&str> {
        plan.steps.iter().map(|s| s.command.as_str()).collect()
    }

    #[test]
    fn autologin_plan_covers_both_consoles_in_order() {
        let plan = engine().plan(&Feature::Autologin, None);
        let cmds = commands(&plan);

        assert_eq!(plan.branch, None);
        assert_eq!(cmds.len(), 8);
        assert_eq!(
            cmds[0],
            "sudo mkdir -pv /etc/systemd/system/serial-getty@ttyAMA0.service.d"
        );
        assert!(cmds[1].starts_with("echo -en"));
        assert_eq!(
            cmds[2],
            "sudo mv autologin.conf /etc/systemd/system/serial-getty@ttyAMA0.service.d/autologin.conf"
        );
        assert_eq!(cmds[3], "sudo systemctl enable serial-getty@ttyAMA0.service");
        assert_eq!(cmds[4], "sudo mkdir -pv /etc/systemd/system/getty@tty1.service.d");
        assert_eq!(cmds[7], "sudo systemctl enable getty@tty1.service");
        assert!(plan.steps.iter().all(|s| s.prompt == "pi@raspberrypi:~$ "));
    }

    #[test]
    fn remote_access_legacy_is_single_enable() {
        let plan = engine().plan(&Feature::RemoteAccess, Some("2021-01-01"));
        assert_eq!(plan.branch, Some(GateBranch::Legacy));
        assert_eq!(commands(&plan), vec!["sudo systemctl enable ssh"]);
    }

    #[test]
    fn remote_access_current_installs_helper_first() {
        let plan = engine().plan(&Feature::RemoteAccess, Some("2023-01-01"));
        assert_eq!(plan.branch, Some(GateBranch::Current));
        assert_eq!(
            commands(&plan),
            vec![
                "sudo apt-get install -y openssh-server",
                "sudo raspi-config nonint do_ssh 0"
            ]
        );
        assert_eq!(plan.steps[0].timeout, Duration::from_secs(1800));
    }

    #[test]
    fn expand_storage_is_one_command() {
        let plan = engine().plan(&Feature::ExpandStorage, Some("2021-01-01"));
        assert_eq!(commands(&plan), vec!["sudo raspi-config --expand-rootfs"]);
    }

    #[test]
    fn package_group_parse_splits_whitespace() {
        let group = PackageGroup::parse("  git   xvfb\tpython3-pip ");
        assert_eq!(group.packages, vec!["git", "xvfb", "python3-pip"]);
        assert!(PackageGroup::parse("   ").is_empty());
    }

    #[test]
    fn feature_kind_serializes_snake_case() {
        let json = serde_json::to_string(&FeatureKind::RemoteAccess).unwrap();
        assert_eq!(json, "\"remote_access\"");
        let kind: FeatureKind = serde_json::from_str("\"package_install\"").unwrap();
        assert_eq!(kind, FeatureKind::PackageInstall);
    }
}
