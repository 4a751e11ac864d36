//! Command tables for each feature.
//!
//! The shell text is data: every entry pairs a command with the prompt
//! that signals it finished and the longest it may take.

use std::time::Duration;

use crate::config::{FeatureConfig, SessionConfig};
use crate::features::version::{GateBranch, VersionGate};
use crate::features::{CommandStep, PackageGroup};

/// A getty unit that gets an autologin drop-in.
struct GettyOverride {
    service: &'static str,
    agetty_args: &'static str,
}

/// QEMU's serial console first, then the default virtual terminal.
const AUTOLOGIN_OVERRIDES: [GettyOverride; 2] = [
    GettyOverride {
        service: "serial-getty@ttyAMA0.service",
        agetty_args: "--keep-baud 115200,38400,9600",
    },
    GettyOverride {
        service: "getty@tty1.service",
        agetty_args: "--noclear",
    },
];

const LEGACY_SSH_ENABLE: &str = "sudo systemctl enable ssh";
const CURRENT_SSH_ENABLE: &str = "sudo raspi-config nonint do_ssh 0";
const EXPAND_ROOTFS: &str = "sudo raspi-config --expand-rootfs";
const PACKAGE_INDEX_REFRESH: &str = "sudo apt-get update -qq";

/// Package groups of the Mu editor image, split so no single install
/// runs long enough to hit its timeout.
const MU_PACKAGE_GROUPS: [&str; 4] = [
    "git xvfb python3-pip",
    "python3-pyqt5 python3-pyqt5.qtserialport",
    "python3-pyqt5.qsci python3-pyqt5.qtsvg python3-pyqt5.qtchart",
    "libxmlsec1-dev libxml2 libxml2-dev libxkbcommon-x11-0 libatlas-base-dev",
];

/// Named package group presets.
pub fn package_preset(name: &str) -> Option<Vec<PackageGroup>> {
    match name {
        "mu" => Some(
            MU_PACKAGE_GROUPS
                .iter()
                .map(|group| PackageGroup::parse(group))
                .collect(),
        ),
        _ => None,
    }
}

pub fn preset_names() -> &'static [&'static str] {
    &["mu"]
}

/// Body of a systemd drop-in that logs `username` in automatically.
pub fn autologin_override_body(username: &str, agetty_args: &str) -> String {
    format!(
        "[Service]\nExecStart=\nExecStart=-/sbin/agetty --autologin {} {} %I $TERM\n",
        username, agetty_args
    )
}

/// Command list for one feature, optionally split by image release.
#[derive(Debug, Clone)]
pub enum Recipe {
    Fixed(Vec<CommandStep>),
    Gated {
        gate: VersionGate,
        legacy: Vec<CommandStep>,
        current: Vec<CommandStep>,
    },
}

impl Recipe {
    pub fn resolve(&self, tag: Option<&str>) -> (Option<GateBranch>, &[CommandStep]) {
        match self {
            Recipe::Fixed(steps) => (None, steps.as_slice()),
            Recipe::Gated {
                gate,
                legacy,
                current,
            } => match gate.select(tag) {
                GateBranch::Legacy => (Some(GateBranch::Legacy), legacy.as_slice()),
                GateBranch::Current => (Some(GateBranch::Current), current.as_slice()),
            },
        }
    }
}

/// Every feature's commands, rendered for one session configuration.
#[derive(Debug, Clone)]
pub struct CommandCatalog {
    pub autologin: Recipe,
    pub remote_access: Recipe,
    pub expand_storage: Recipe,
    prompt: String,
    package_timeout: Duration,
}

impl CommandCatalog {
    pub fn from_config(session: &SessionConfig, features: &FeatureConfig) -> Self {
        let prompt = session.shell_prompt();
        let timeout = session.command_timeout();
        let package_timeout = features.package_timeout();
        let step = |command: String, timeout: Duration| CommandStep {
            command,
            prompt: prompt.clone(),
            timeout,
        };

        let mut autologin = Vec::with_capacity(AUTOLOGIN_OVERRIDES.len() * 4);
        for getty in &AUTOLOGIN_OVERRIDES {
            let dir = format!("/etc/systemd/system/{}.d", getty.service);
            let body = autologin_override_body(&session.username, getty.agetty_args);
            autologin.push(step(format!("sudo mkdir -pv {}", dir), timeout));
            autologin.push(step(
                format!("echo -en '{}' > autologin.conf", body.replace('\n', "\\n")),
                timeout,
            ));
            autologin.push(step(
                format!("sudo mv autologin.conf {}/autologin.conf", dir),
                timeout,
            ));
            autologin.push(step(format!("sudo systemctl enable {}", getty.service), timeout));
        }

        let remote_access = Recipe::Gated {
            gate: VersionGate::new(features.remote_access_cutoff),
            legacy: vec![step(LEGACY_SSH_ENABLE.to_string(), timeout)],
            current: vec![
                step(
                    format!("sudo apt-get install -y {}", features.remote_access_helper),
                    package_timeout,
                ),
                step(CURRENT_SSH_ENABLE.to_string(), timeout),
            ],
        };

        let expand_storage = Recipe::Fixed(vec![step(EXPAND_ROOTFS.to_string(), timeout)]);

        Self {
            autologin: Recipe::Fixed(autologin),
            remote_access,
            expand_storage,
            prompt,
            package_timeout,
        }
    }

    /// Index refresh followed by one install per group.
    pub fn package_steps(&self, groups: &[PackageGroup]) -> Vec<CommandStep> {
        let mut steps = Vec::with_capacity(groups.len() + 1);
        steps.push(CommandStep {
            command: PACKAGE_INDEX_REFRESH.to_string(),
            prompt: self.prompt.clone(),
            timeout: self.package_timeout,
        });
        for group in groups {
            steps.push(CommandStep {
                command: format!("sudo apt-get install -y {}", group.packages.join(" ")),
                prompt: self.prompt.clone(),
                timeout: group.timeout().unwrap_or(self.package_timeout),
            });
        }
        steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_body_matches_serial_getty_dropin() {
        assert_eq!(
            autologin_override_body("pi", "--keep-baud 115200,38400,9600"),
            "[Service]\nExecStart=\nExecStart=-/sbin/agetty --autologin pi --keep-baud 115200,38400,9600 %I $TERM\n"
        );
    }

    #[test]
    fn write_command_keeps_body_on_one_line() {
        let catalog =
            CommandCatalog::from_config(&SessionConfig::default(), &FeatureConfig::default());
        let (_, steps) = catalog.autologin.resolve(None);
        let write = &steps[1].command;
        assert!(!write.contains('\n'));
        assert!(write.starts_with("echo -en '[Service]\\nExecStart=\\n"));
        // Single quotes keep $TERM literal in the drop-in.
        assert!(write.contains("%I $TERM\\n' > autologin.conf"));
    }

    #[test]
    fn mu_preset_has_four_groups() {
        let groups = package_preset("mu").unwrap();
        assert_eq!(groups.len(), 4);
        assert_eq!(groups[0].packages, vec!["git", "xvfb", "python3-pip"]);
        assert!(package_preset("unknown").is_none());
    }

    #[test]
    fn package_steps_use_group_timeout_override() {
        let catalog =
            CommandCatalog::from_config(&SessionConfig::default(), &FeatureConfig::default());
        let groups = vec![
            PackageGroup::parse("git"),
            PackageGroup::parse("python3-pyqt5").with_timeout(Duration::from_secs(3600)),
        ];
        let steps = catalog.package_steps(&groups);

        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0].command, "sudo apt-get update -qq");
        assert_eq!(steps[1].timeout, Duration::from_secs(1800));
        assert_eq!(steps[2].command, "sudo apt-get install -y python3-pyqt5");
        assert_eq!(steps[2].timeout, Duration::from_secs(3600));
    }
}
