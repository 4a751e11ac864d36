use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use thiserror::Error;

use crate::config::Defaults;
use crate::features::{package_preset, recipes::preset_names, Feature, FeatureKind, PackageGroup};

const RUN_DEFAULTS_HELP: &str = "\
Without any feature flag, the features listed in [defaults].features of the
config file are applied; out of the box that is autologin only. Feature flags
are applied in the order autologin, ssh, expand-fs, packages.

Interrupting once stops the instance and exits with 130. Interrupting a
second time exits at once without cleanup; the ids of instances left
running are logged and can be stopped with `docker stop <id>`.";

#[derive(Parser, Debug)]
#[command(name = "pibake")]
#[command(about = "Boot a Raspberry Pi OS image in a throwaway container and customise it over its serial console")]
#[command(version)]
pub struct Cli {
    /// Config file (default: <config dir>/pibake/config.toml)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Provision a single image
    #[command(after_help = RUN_DEFAULTS_HELP)]
    Run(RunArgs),

    /// Provision one copy of a base image per job in a TOML plan
    Batch(BatchArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Disk image to modify in place (must end in .img)
    #[arg(value_name = "IMAGE")]
    pub image: PathBuf,

    /// Log the default user in automatically on the serial console and tty1
    #[arg(long)]
    pub autologin: bool,

    /// Enable the SSH server
    #[arg(long)]
    pub ssh: bool,

    /// Grow the image file and expand the root filesystem into it
    #[arg(long = "expand-fs")]
    pub expand_fs: bool,

    /// Install a group of space-separated packages (repeatable, one install per group)
    #[arg(long = "packages", value_name = "GROUP")]
    pub packages: Vec<String>,

    /// Install a named set of package groups (available: mu)
    #[arg(long, value_name = "NAME")]
    pub package_preset: Option<String>,

    /// Release date of the image (YYYY-MM-DD), selects version-specific commands
    #[arg(long, value_name = "TAG")]
    pub version_tag: Option<String>,

    /// Do not log in; only wait for the shell prompt (for images with autologin)
    #[arg(long)]
    pub skip_login: bool,

    /// Copy IMAGE to this path and provision the copy instead
    #[arg(long, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Also write the console transcript to this file
    #[arg(long, value_name = "PATH")]
    pub transcript: Option<PathBuf>,

    /// Do not echo the console transcript to stdout
    #[arg(short, long)]
    pub quiet: bool,

    /// Print the run report as JSON on stdout (implies --quiet)
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct BatchArgs {
    /// Batch plan (TOML)
    #[arg(value_name = "PLAN")]
    pub plan: PathBuf,

    /// How many images to provision at the same time
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..))]
    pub parallel: u16,

    /// Print job outcomes as JSON on stdout
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CliError {
    #[error("Unknown package preset '{name}' (available: {available})")]
    UnknownPreset { name: String, available: String },

    #[error("Default feature 'package_install' needs --packages or --package-preset")]
    DefaultPackagesWithoutGroups,
}

/// Package groups from a preset followed by explicit `--packages` groups.
pub fn package_groups(
    preset: Option<&str>,
    explicit: &[String],
) -> Result<Vec<PackageGroup>, CliError> {
    let mut groups = match preset {
        Some(name) => package_preset(name).ok_or_else(|| CliError::UnknownPreset {
            name: name.to_string(),
            available: preset_names().join(", "),
        })?,
        None => Vec::new(),
    };
    groups.extend(explicit.iter().map(|spec| PackageGroup::parse(spec)));
    Ok(groups)
}

/// Turn feature kinds into features, attaching `groups` to package installation.
pub fn features_from_kinds(
    kinds: &[FeatureKind],
    groups: &[PackageGroup],
) -> Result<Vec<Feature>, CliError> {
    kinds
        .iter()
        .map(|kind| match kind {
            FeatureKind::Autologin => Ok(Feature::Autologin),
            FeatureKind::RemoteAccess => Ok(Feature::RemoteAccess),
            FeatureKind::ExpandStorage => Ok(Feature::ExpandStorage),
            FeatureKind::PackageInstall if groups.is_empty() => {
                Err(CliError::DefaultPackagesWithoutGroups)
            }
            FeatureKind::PackageInstall => Ok(Feature::PackageInstall(groups.to_vec())),
        })
        .collect()
}

impl RunArgs {
    fn has_feature_flags(&self) -> bool {
        self.autologin
            || self.ssh
            || self.expand_fs
            || !self.packages.is_empty()
            || self.package_preset.is_some()
    }

    /// Requested features in application order.
    pub fn features(&self, defaults: &Defaults) -> Result<Vec<Feature>, CliError> {
        let groups = package_groups(self.package_preset.as_deref(), &self.packages)?;
        if !self.has_feature_flags() {
            return features_from_kinds(&defaults.features, &groups);
        }

        let mut features = Vec::new();
        if self.autologin {
            features.push(Feature::Autologin);
        }
        if self.ssh {
            features.push(Feature::RemoteAccess);
        }
        if self.expand_fs {
            features.push(Feature::ExpandStorage);
        }
        if !groups.is_empty() {
            features.push(Feature::PackageInstall(groups));
        }
        Ok(features)
    }

    pub fn requires_login(&self, defaults: &Defaults) -> bool {
        !self.skip_login && defaults.requires_login
    }
}
