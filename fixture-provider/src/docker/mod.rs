//! Docker backend: fixtures are containers started through the `docker` CLI.

use std::path::Path;

use fixture_config::{FixtureSpec, InitSpec, PortRange};
use fixture_core::command_stream::{is_tool_installed, CommandOutput};
use fixture_core::error::{FixtureError, ProvisionError, ProvisionErrorKind, Result};
use once_cell::sync::OnceCell;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{PortMapping, Sandbox, SandboxInstance};

pub mod command;

pub use command::{DockerCommand, DockerOps, MANAGED_LABEL, NAME_LABEL, RUN_LABEL};

const HOST: &str = "127.0.0.1";

pub struct DockerSandbox {
    daemon: OnceCell<std::result::Result<(), String>>,
}

impl DockerSandbox {
    pub fn new() -> Result<Self> {
        if !is_tool_installed("docker") {
            return Err(FixtureError::Dependency("Docker".into()));
        }
        Ok(Self {
            daemon: OnceCell::new(),
        })
    }

    fn ensure_daemon(&self, fixture: &str) -> std::result::Result<(), ProvisionError> {
        self.daemon
            .get_or_init(|| DockerOps::check_daemon_running().map_err(|e| e.to_string()))
            .clone()
            .map_err(|message| {
                ProvisionError::new(ProvisionErrorKind::SandboxUnavailable, fixture, message)
            })
    }

    fn ensure_image(&self, spec: &FixtureSpec) -> std::result::Result<(), ProvisionError> {
        let image = spec.image_ref().to_string();
        let present = DockerOps::image_present(&image).map_err(|e| {
            ProvisionError::new(ProvisionErrorKind::SandboxUnavailable, &spec.name, e.to_string())
        })?;
        if present {
            return Ok(());
        }

        info!("Pulling image {}", image);
        let output = DockerCommand::new()
            .subcommand("pull")
            .arg(&image)
            .timeout(spec.pull_timeout())
            .execute_raw()
            .map_err(|e| {
                ProvisionError::new(
                    ProvisionErrorKind::SandboxUnavailable,
                    &spec.name,
                    e.to_string(),
                )
            })?;

        if output.timed_out {
            Err(ProvisionError::new(
                ProvisionErrorKind::StartTimeout,
                &spec.name,
                format!(
                    "pulling {} did not finish within {}s",
                    image, spec.pull_timeout_secs
                ),
            ))
        } else if !output.success {
            Err(ProvisionError::new(
                ProvisionErrorKind::ImagePullFailed,
                &spec.name,
                format!("{}: {}", image, output.stderr_trimmed()),
            ))
        } else {
            Ok(())
        }
    }

    fn publish(&self, spec: &FixtureSpec, id: &str) -> Result<Vec<PortMapping>> {
        spec.ports
            .iter()
            .map(|&container_port| {
                Ok(PortMapping {
                    container_port,
                    host_port: DockerOps::host_port(id, container_port)?,
                })
            })
            .collect()
    }

    fn discard(&self, id: &str) {
        if let Err(e) = DockerOps::remove_container(id) {
            warn!("Failed to remove container {}: {}", id, e);
        }
    }
}

/// Arguments for `docker run`, without the leading subcommand.
pub fn run_args(
    spec: &FixtureSpec,
    container_name: &str,
    run_id: &str,
    range: Option<PortRange>,
) -> Vec<String> {
    let mut args = vec![
        "-d".to_string(),
        "--name".to_string(),
        container_name.to_string(),
        "--label".to_string(),
        MANAGED_LABEL.to_string(),
        "--label".to_string(),
        format!("{}={}", NAME_LABEL, spec.name),
        "--label".to_string(),
        format!("{}={}", RUN_LABEL, run_id),
    ];

    for port in &spec.ports {
        args.push("-p".to_string());
        args.push(match range {
            Some(r) => format!("{}:{}:{}", HOST, r, port),
            None => format!("{}::{}", HOST, port),
        });
    }

    for (key, value) in &spec.env {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }

    for script in &spec.init.scripts {
        let file_name = script
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        args.push("-v".to_string());
        args.push(format!(
            "{}:{}/{}:ro",
            script.display(),
            spec.init.mount_dir.trim_end_matches('/'),
            file_name
        ));
    }

    if let Some(entrypoint) = &spec.entrypoint {
        args.push("--entrypoint".to_string());
        args.push(entrypoint.clone());
    }

    args.push(spec.image_ref().to_string());
    args.extend(spec.cmd.iter().cloned());
    args
}

fn check_scripts(spec: &FixtureSpec) -> std::result::Result<(), ProvisionError> {
    for script in &spec.init.scripts {
        if !Path::new(script).is_file() {
            return Err(ProvisionError::new(
                ProvisionErrorKind::InitScriptFailed,
                &spec.name,
                format!("init script {} does not exist", script.display()),
            ));
        }
    }
    Ok(())
}

impl Sandbox for DockerSandbox {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn start(
        &self,
        spec: &FixtureSpec,
        run_id: &str,
    ) -> std::result::Result<SandboxInstance, ProvisionError> {
        self.ensure_daemon(&spec.name)?;
        check_scripts(spec)?;
        self.ensure_image(spec)?;

        let range = match spec.host_port_range.as_deref().map(PortRange::parse) {
            Some(Ok(range)) => Some(range),
            Some(Err(e)) => {
                return Err(ProvisionError::new(
                    ProvisionErrorKind::StartFailed,
                    &spec.name,
                    e.to_string(),
                ))
            }
            None => None,
        };

        let short = Uuid::new_v4().simple().to_string();
        let container_name = format!("{}-{}", spec.name, &short[..12]);
        let output = DockerCommand::new()
            .subcommand("run")
            .args(run_args(spec, &container_name, run_id, range))
            .timeout(spec.startup_timeout())
            .execute_raw()
            .map_err(|e| {
                ProvisionError::new(
                    ProvisionErrorKind::SandboxUnavailable,
                    &spec.name,
                    e.to_string(),
                )
            })?;

        if output.timed_out {
            // The container may exist even though `run` never returned.
            self.discard(&container_name);
            return Err(ProvisionError::new(
                ProvisionErrorKind::StartTimeout,
                &spec.name,
                format!(
                    "docker run did not return within {}s",
                    spec.startup_timeout_secs
                ),
            ));
        }
        if !output.success {
            self.discard(&container_name);
            return Err(ProvisionError::new(
                ProvisionErrorKind::StartFailed,
                &spec.name,
                output.stderr_trimmed().to_string(),
            ));
        }

        let id = output.stdout_trimmed().to_string();
        let ports = match self.publish(spec, &id) {
            Ok(ports) => ports,
            Err(e) => {
                self.discard(&id);
                return Err(ProvisionError::new(
                    ProvisionErrorKind::StartFailed,
                    &spec.name,
                    e.to_string(),
                ));
            }
        };

        debug!("Started container {} ({}) with {:?}", container_name, id, ports);
        Ok(SandboxInstance {
            id,
            name: container_name,
            fixture: spec.name.clone(),
            host: HOST.to_string(),
            ports,
        })
    }

    fn initialize(
        &self,
        instance: &SandboxInstance,
        init: &InitSpec,
    ) -> std::result::Result<(), ProvisionError> {
        // Mounted scripts are run by the image's own entrypoint.
        for command in &init.exec {
            let output = self.exec(&instance.id, command).map_err(|e| {
                ProvisionError::new(
                    ProvisionErrorKind::InitScriptFailed,
                    &instance.fixture,
                    e.to_string(),
                )
            })?;
            if !output.success {
                return Err(ProvisionError::new(
                    ProvisionErrorKind::InitScriptFailed,
                    &instance.fixture,
                    format!(
                        "'{}' exited with {:?}: {}",
                        command.join(" "),
                        output.code,
                        output.stderr_trimmed()
                    ),
                ));
            }
        }
        Ok(())
    }

    fn logs(&self, id: &str) -> Result<Vec<String>> {
        let output = DockerCommand::new()
            .subcommand("logs")
            .arg(id)
            .execute_raw()?;
        if !output.success {
            return Err(FixtureError::Command(format!(
                "docker logs {} failed: {}",
                id,
                output.stderr_trimmed()
            )));
        }
        // Containers write to both streams; keep them together.
        Ok(output
            .stdout
            .lines()
            .chain(output.stderr.lines())
            .map(String::from)
            .collect())
    }

    fn is_running(&self, id: &str) -> Result<bool> {
        DockerOps::is_container_running(id)
    }

    fn exists(&self, id: &str) -> Result<bool> {
        DockerOps::container_exists(id)
    }

    fn exec(&self, id: &str, cmd: &[String]) -> Result<CommandOutput> {
        DockerCommand::new()
            .subcommand("exec")
            .arg(id)
            .args(cmd.iter().cloned())
            .execute_raw()
    }

    fn stop(&self, id: &str) -> Result<()> {
        DockerOps::remove_container(id)
    }
}

/// Remove leftover managed containers, returning how many were removed.
pub fn prune(run_id: Option<&str>) -> Result<usize> {
    if !is_tool_installed("docker") {
        return Err(FixtureError::Dependency("Docker".into()));
    }
    DockerOps::check_daemon_running()?;
    let ids = DockerOps::list_managed(run_id)?;
    let mut removed = 0;
    for id in &ids {
        match DockerOps::remove_container(id) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to remove container {}: {}", id, e),
        }
    }
    Ok(removed)
}
