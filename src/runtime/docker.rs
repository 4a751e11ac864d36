use std::path::Path;
use std::process::{Command, Output};

use crate::config::RuntimeConfig;
use crate::pty::LaunchCommand;
use crate::runtime::{ResourceId, Runtime, RuntimeError};

/// Docker-compatible CLI runtime (docker, podman).
///
/// Boots the disk image with `run -it --rm`, so a stopped instance is
/// removed by the runtime itself.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    program: String,
    image: String,
    mount_target: String,
    qemu_img: String,
}

impl DockerRuntime {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            program: config.program.clone(),
            image: config.image.clone(),
            mount_target: config.mount_target.clone(),
            qemu_img: config.qemu_img.clone(),
        }
    }

    fn run_tool(&self, program: &str, args: &[&str]) -> Result<Output, RuntimeError> {
        let command = describe(program, args);
        tracing::debug!(%command, "Running runtime tool");
        Command::new(program)
            .args(args)
            .output()
            .map_err(|source| RuntimeError::Exec { command, source })
    }
}

fn describe(program: &str, args: &[&str]) -> String {
    std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}

fn failure(program: &str, args: &[&str], output: &Output) -> RuntimeError {
    RuntimeError::Failed {
        command: describe(program, args),
        status: output.status.to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    }
}

/// Anchored name filter so `rpi-os-ab` never matches `rpi-os-abc`.
fn name_filter(id: &ResourceId) -> String {
    format!("name=^/?{}$", id)
}

fn is_missing_container(stderr: &[u8]) -> bool {
    String::from_utf8_lossy(stderr)
        .to_lowercase()
        .contains("no such container")
}

impl Runtime for DockerRuntime {
    fn launch_command(&self, image: &Path, id: &ResourceId) -> LaunchCommand {
        LaunchCommand::new(self.program.as_str())
            .args(["run", "-it", "--rm", "--name"])
            .arg(id.as_str())
            .arg("-v")
            .arg(format!("{}:{}", image.display(), self.mount_target))
            .arg(self.image.as_str())
    }

    fn is_alive(&self, id: &ResourceId) -> Result<bool, RuntimeError> {
        let filter = name_filter(id);
        let args = ["ps", "--filter", filter.as_str(), "-q"];
        let output = self.run_tool(&self.program, &args)?;
        if !output.status.success() {
            return Err(failure(&self.program, &args, &output));
        }
        Ok(!String::from_utf8_lossy(&output.stdout).trim().is_empty())
    }

    fn force_stop(&self, id: &ResourceId) -> Result<(), RuntimeError> {
        let args = ["stop", id.as_str()];
        let output = self.run_tool(&self.program, &args)?;
        if output.status.success() || is_missing_container(&output.stderr) {
            return Ok(());
        }
        Err(failure(&self.program, &args, &output))
    }

    fn grow_image(&self, image: &Path, increment: &str) -> Result<(), RuntimeError> {
        let path = image.display().to_string();
        let args = ["resize", "-f", "raw", path.as_str(), increment];
        let output = self.run_tool(&self.qemu_img, &args)?;
        if !output.status.success() {
            return Err(failure(&self.qemu_img, &args, &output));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn runtime() -> DockerRuntime {
        DockerRuntime::from_config(&RuntimeConfig::default())
    }

    #[test]
    fn launch_command_mounts_image_and_names_instance() {
        let id = ResourceId::generate("rpi-os");
        let cmd = runtime().launch_command(&PathBuf::from("/tmp/os.img"), &id);

        assert_eq!(cmd.program(), "docker");
        let args = cmd.arguments();
        assert_eq!(&args[..4], &["run", "-it", "--rm", "--name"]);
        assert_eq!(args[4], id.as_str());
        assert_eq!(args[5], "-v");
        assert_eq!(args[6], "/tmp/os.img:/sdcard/filesystem.img");
        assert_eq!(args[7], "lukechilds/dockerpi:vm");
    }

    #[test]
    fn name_filter_is_anchored() {
        let id = ResourceId("rpi-os-abc".to_string());
        assert_eq!(name_filter(&id), "name=^/?rpi-os-abc$");
    }

    #[test]
    fn missing_container_is_recognised() {
        assert!(is_missing_container(
            b"Error response from daemon: No such container: rpi-os-abc"
        ));
        assert!(is_missing_container(b"Error: no such container rpi-os-abc"));
        assert!(!is_missing_container(b"permission denied"));
    }

    #[test]
    fn missing_program_is_an_exec_error() {
        let mut config = RuntimeConfig::default();
        config.program = "/nonexistent/pibake-docker".to_string();
        let runtime = DockerRuntime::from_config(&config);
        let err = runtime
            .is_alive(&ResourceId::generate("rpi-os"))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Exec { .. }));
    }
}
