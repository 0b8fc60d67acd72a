//! Docker command abstraction and builder utilities.
//!
//! Every invocation of the `docker` CLI goes through [`DockerCommand`], which
//! applies a per-command timeout and turns failures into consistent errors.

use std::time::Duration;

use fixture_core::command_stream::{run_command_with_timeout, CommandOutput};
use fixture_core::error::{FixtureError, Result};
use tracing::debug;

/// Label present on every container this crate starts.
pub const MANAGED_LABEL: &str = "fixture.managed=true";
pub const NAME_LABEL: &str = "fixture.name";
pub const RUN_LABEL: &str = "fixture.run";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Builder for Docker commands with fluent interface and consistent error handling.
#[derive(Debug, Clone)]
pub struct DockerCommand {
    subcommand: Option<String>,
    args: Vec<String>,
    timeout: Duration,
}

impl DockerCommand {
    pub fn new() -> Self {
        Self {
            subcommand: None,
            args: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set the Docker subcommand (e.g., "run", "port", "rm").
    pub fn subcommand<S: Into<String>>(mut self, cmd: S) -> Self {
        self.subcommand = Some(cmd.into());
        self
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Kill the command if it has not finished after `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn argv(&self) -> Vec<String> {
        self.subcommand
            .iter()
            .cloned()
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// Run and return the raw output, whatever the exit status.
    ///
    /// Use this when a non-zero exit or a timeout needs special handling.
    pub fn execute_raw(self) -> Result<CommandOutput> {
        let argv = self.argv();
        debug!("Executing docker {}", argv.join(" "));
        run_command_with_timeout("docker", &argv, Some(self.timeout))
    }

    /// Run and return stdout, failing on a non-zero exit or a timeout.
    pub fn execute_with_output(self) -> Result<String> {
        let label = self.argv().join(" ");
        let output = self.execute_raw()?;
        if output.timed_out {
            return Err(FixtureError::Command(format!("docker {} timed out", label)));
        }
        if output.success {
            Ok(output.stdout)
        } else {
            Err(FixtureError::Command(format!(
                "docker {} failed: {}",
                label,
                output.stderr_trimmed()
            )))
        }
    }

    pub fn execute(self) -> Result<()> {
        self.execute_with_output().map(|_| ())
    }
}

impl Default for DockerCommand {
    fn default() -> Self {
        Self::new()
    }
}

/// Common Docker operations with pre-configured command patterns.
pub struct DockerOps;

impl DockerOps {
    /// Check the daemon answers, distinguishing a stopped daemon from a
    /// socket the current user may not open.
    pub fn check_daemon_running() -> Result<()> {
        let output = DockerCommand::new()
            .subcommand("info")
            .arg("--format")
            .arg("{{.ServerVersion}}")
            .timeout(Duration::from_secs(10))
            .execute_raw()?;
        if output.success {
            return Ok(());
        }
        if output.stderr.to_lowercase().contains("permission denied") {
            Err(FixtureError::DockerPermission)
        } else {
            Err(FixtureError::DockerNotRunning)
        }
    }

    pub fn image_present(image: &str) -> Result<bool> {
        let output = DockerCommand::new()
            .subcommand("image")
            .arg("inspect")
            .arg(image)
            .execute_raw()?;
        Ok(output.success)
    }

    pub fn is_container_running(id: &str) -> Result<bool> {
        let output = DockerCommand::new()
            .subcommand("inspect")
            .arg("--format")
            .arg("{{.State.Running}}")
            .arg(id)
            .execute_raw()?;
        Ok(output.success && output.stdout_trimmed() == "true")
    }

    pub fn container_exists(id: &str) -> Result<bool> {
        let output = DockerCommand::new()
            .subcommand("inspect")
            .arg("--format")
            .arg("{{.Id}}")
            .arg(id)
            .execute_raw()?;
        Ok(output.success)
    }

    /// Host port published for `container_port/tcp`.
    pub fn host_port(id: &str, container_port: u16) -> Result<u16> {
        let stdout = DockerCommand::new()
            .subcommand("port")
            .arg(id)
            .arg(format!("{}/tcp", container_port))
            .execute_with_output()?;
        parse_port_output(&stdout).ok_or_else(|| {
            FixtureError::Sandbox(format!(
                "docker did not report a host port for {}/tcp: '{}'",
                container_port,
                stdout.trim()
            ))
        })
    }

    /// Remove a container and its anonymous volumes. Missing containers are
    /// fine.
    pub fn remove_container(id: &str) -> Result<()> {
        let output = DockerCommand::new()
            .subcommand("rm")
            .arg("-f")
            .arg("-v")
            .arg(id)
            .execute_raw()?;
        if output.success || output.stderr.contains("No such container") {
            Ok(())
        } else if output.timed_out {
            Err(FixtureError::Command(format!("docker rm {} timed out", id)))
        } else {
            Err(FixtureError::Command(format!(
                "docker rm {} failed: {}",
                id,
                output.stderr_trimmed()
            )))
        }
    }

    /// Ids of managed containers, optionally restricted to one run.
    pub fn list_managed(run_id: Option<&str>) -> Result<Vec<String>> {
        let mut cmd = DockerCommand::new()
            .subcommand("ps")
            .arg("-aq")
            .arg("--filter")
            .arg(format!("label={}", MANAGED_LABEL));
        if let Some(run) = run_id {
            cmd = cmd.arg("--filter").arg(format!("label={}={}", RUN_LABEL, run));
        }
        let stdout = cmd.execute_with_output()?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }
}

/// Parse `docker port` output such as `0.0.0.0:49153` or `[::]:49153`,
/// taking the first mapping.
pub fn parse_port_output(stdout: &str) -> Option<u16> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .find_map(|line| line.rsplit_once(':').and_then(|(_, port)| port.parse().ok()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_docker_command_builder() {
        let cmd = DockerCommand::new()
            .subcommand("ps")
            .arg("-a")
            .args(["--format", "{{.Names}}"])
            .timeout(Duration::from_secs(5));

        assert_eq!(cmd.argv(), vec!["ps", "-a", "--format", "{{.Names}}"]);
        assert_eq!(cmd.timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_parse_port_output() {
        assert_eq!(parse_port_output("127.0.0.1:49153\n"), Some(49153));
        assert_eq!(parse_port_output("0.0.0.0:5000\n[::]:5000\n"), Some(5000));
        assert_eq!(parse_port_output(""), None);
        assert_eq!(parse_port_output("garbage"), None);
    }
}
