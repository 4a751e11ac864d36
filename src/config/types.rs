use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};

use crate::config::credentials::SecureString;
use crate::features::FeatureKind;

/// Root configuration container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub features: FeatureConfig,
    #[serde(default)]
    pub defaults: Defaults,
}

/// How ephemeral instances are launched and inspected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Container CLI (e.g., "docker", "podman").
    #[serde(default = "default_runtime_program")]
    pub program: String,
    /// Container image that boots the disk image under QEMU.
    #[serde(default = "default_runtime_image")]
    pub image: String,
    /// Path inside the container where the disk image is mounted.
    #[serde(default = "default_mount_target")]
    pub mount_target: String,
    /// Prefix of generated instance names.
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
    /// Host tool used to grow the image file.
    #[serde(default = "default_qemu_img")]
    pub qemu_img: String,
    /// Size increment passed to `qemu-img resize` when expanding storage.
    /// `None` skips host-side growth.
    #[serde(default = "default_grow_by")]
    pub grow_by: Option<String>,
}

/// Credentials, prompts and timing of the console session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default = "default_password")]
    pub password: SecureString,
    #[serde(default = "default_login_prompt")]
    pub login_prompt: String,
    #[serde(default = "default_password_prompt")]
    pub password_prompt: String,
    /// Shell prompt; derived from the username when unset.
    #[serde(default)]
    pub shell_prompt: Option<String>,
    #[serde(default = "default_shutdown_command")]
    pub shutdown_command: String,
    /// Wait ceiling for the login prompt, which covers the whole boot.
    #[serde(default = "default_login_timeout")]
    pub login_timeout_secs: u64,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
    /// Pause after the login prompt before sending the username.
    #[serde(default = "default_username_delay")]
    pub username_delay_secs: u64,
    /// Pause after the password prompt before sending the password.
    #[serde(default = "default_password_delay")]
    pub password_delay_secs: u64,
}

/// Feature-specific tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureConfig {
    /// Images dated before this use the legacy remote-access command.
    #[serde(
        default = "default_remote_access_cutoff",
        deserialize_with = "deserialize_date"
    )]
    pub remote_access_cutoff: NaiveDate,
    /// Package that must be present before the configuration tool can
    /// enable remote access on current images.
    #[serde(default = "default_remote_access_helper")]
    pub remote_access_helper: String,
    /// Wait ceiling for each package group.
    #[serde(default = "default_package_timeout")]
    pub package_timeout_secs: u64,
}

/// What `run` does when the command line names no feature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Defaults {
    #[serde(default = "default_features")]
    pub features: Vec<FeatureKind>,
    #[serde(default = "default_requires_login")]
    pub requires_login: bool,
}

impl SessionConfig {
    pub fn shell_prompt(&self) -> String {
        self.shell_prompt
            .clone()
            .unwrap_or_else(|| format!("{}@raspberrypi:~$ ", self.username))
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn username_delay(&self) -> Duration {
        Duration::from_secs(self.username_delay_secs)
    }

    pub fn password_delay(&self) -> Duration {
        Duration::from_secs(self.password_delay_secs)
    }
}

impl FeatureConfig {
    pub fn package_timeout(&self) -> Duration {
        Duration::from_secs(self.package_timeout_secs)
    }
}

fn default_runtime_program() -> String {
    "docker".to_string()
}

fn default_runtime_image() -> String {
    "lukechilds/dockerpi:vm".to_string()
}

fn default_mount_target() -> String {
    "/sdcard/filesystem.img".to_string()
}

fn default_name_prefix() -> String {
    "rpi-os".to_string()
}

fn default_qemu_img() -> String {
    "qemu-img".to_string()
}

fn default_grow_by() -> Option<String> {
    Some("+1G".to_string())
}

fn default_username() -> String {
    "pi".to_string()
}

fn default_password() -> SecureString {
    SecureString::new("raspberry".to_string())
}

fn default_login_prompt() -> String {
    "raspberrypi login: ".to_string()
}

fn default_password_prompt() -> String {
    "Password: ".to_string()
}

fn default_shutdown_command() -> String {
    "sudo shutdown now".to_string()
}

fn default_login_timeout() -> u64 {
    600
}

fn default_command_timeout() -> u64 {
    600
}

fn default_shutdown_timeout() -> u64 {
    600
}

fn default_username_delay() -> u64 {
    30
}

fn default_password_delay() -> u64 {
    5
}

/// Accept both a bare TOML date (`2022-04-04`) and a quoted one.
fn deserialize_date<'de, D>(deserializer: D) -> Result<NaiveDate, D::Error>
where
    D: Deserializer<'de>,
{
    let text = match toml::Value::deserialize(deserializer)? {
        toml::Value::String(text) => text,
        toml::Value::Datetime(datetime) => datetime.to_string(),
        other => {
            return Err(serde::de::Error::custom(format!(
                "expected a date, found {}",
                other.type_str()
            )))
        }
    };
    NaiveDate::parse_from_str(&text, "%Y-%m-%d")
        .map_err(|e| serde::de::Error::custom(format!("invalid date '{}': {}", text, e)))
}

fn default_remote_access_cutoff() -> NaiveDate {
    NaiveDate::from_ymd_opt(2022, 4, 4).unwrap_or_default()
}

fn default_remote_access_helper() -> String {
    "openssh-server".to_string()
}

fn default_package_timeout() -> u64 {
    1800
}

fn default_features() -> Vec<FeatureKind> {
    vec![FeatureKind::Autologin]
}

fn default_requires_login() -> bool {
    true
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            program: default_runtime_program(),
            image: default_runtime_image(),
            mount_target: default_mount_target(),
            name_prefix: default_name_prefix(),
            qemu_img: default_qemu_img(),
            grow_by: default_grow_by(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            username: default_username(),
            password: default_password(),
            login_prompt: default_login_prompt(),
            password_prompt: default_password_prompt(),
            shell_prompt: None,
            shutdown_command: default_shutdown_command(),
            login_timeout_secs: default_login_timeout(),
            command_timeout_secs: default_command_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            username_delay_secs: default_username_delay(),
            password_delay_secs: default_password_delay(),
        }
    }
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            remote_access_cutoff: default_remote_access_cutoff(),
            remote_access_helper: default_remote_access_helper(),
            package_timeout_secs: default_package_timeout(),
        }
    }
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            features: default_features(),
            requires_login: default_requires_login(),
        }
    }
}
