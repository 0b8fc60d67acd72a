//! Fixture provider library.
//!
//! This library starts disposable dependencies in sandboxes and decides when
//! they are ready to serve. It defines the [`Sandbox`] trait implemented by
//! each runtime (Docker, an in-process engine, and a scripted mock), the
//! [`Provisioner`] that owns every sandbox it creates, and the
//! [`ReadinessGate`] that blocks until a fixture answers.

use std::sync::Arc;

use fixture_config::{BackendKind, FixtureSpec, InitSpec};
use fixture_core::command_stream::CommandOutput;
use fixture_core::error::{ProvisionError, Result};

pub mod local;
pub mod provisioner;
pub mod readiness;

#[cfg(feature = "docker")]
pub mod docker;

// When the `test-helpers` feature is enabled, include the mock sandbox.
#[cfg(feature = "test-helpers")]
pub mod mock;

pub use provisioner::{FixtureStatus, ProvisionedFixture, Provisioner};
pub use readiness::{ProbeCheck, ProbeOutcome, ReadinessCheck, ReadinessGate, ReadinessProbe};

/// A container port and the host port it was published on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortMapping {
    pub container_port: u16,
    pub host_port: u16,
}

/// What a backend reports after starting a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxInstance {
    /// Backend identifier (container id, engine id).
    pub id: String,
    /// Unique human-readable name, derived from the fixture name.
    pub name: String,
    pub fixture: String,
    pub host: String,
    pub ports: Vec<PortMapping>,
}

impl SandboxInstance {
    pub fn host_port(&self, container_port: u16) -> Option<u16> {
        self.ports
            .iter()
            .find(|m| m.container_port == container_port)
            .map(|m| m.host_port)
    }
}

/// A runtime able to host fixtures.
///
/// Backends only report facts; lifecycle bookkeeping (status, idempotent
/// termination) is done by the [`Provisioner`].
pub trait Sandbox: Send + Sync {
    /// Name of the backend (e.g., "docker", "local").
    fn name(&self) -> &'static str;

    /// Start a sandbox for `spec`, publishing its ports on free host ports.
    /// `run_id` tags the sandbox so leftovers of a run can be found later.
    fn start(
        &self,
        spec: &FixtureSpec,
        run_id: &str,
    ) -> std::result::Result<SandboxInstance, ProvisionError>;

    /// Apply init scripts and commands to a freshly started sandbox.
    fn initialize(
        &self,
        instance: &SandboxInstance,
        init: &InitSpec,
    ) -> std::result::Result<(), ProvisionError>;

    /// Log lines emitted by the sandbox so far.
    fn logs(&self, id: &str) -> Result<Vec<String>>;

    fn is_running(&self, id: &str) -> Result<bool>;

    fn exists(&self, id: &str) -> Result<bool>;

    /// Execute a command inside the sandbox.
    fn exec(&self, id: &str, cmd: &[String]) -> Result<CommandOutput>;

    /// Stop and remove the sandbox with its volumes. Removing a sandbox that
    /// no longer exists is not an error.
    fn stop(&self, id: &str) -> Result<()>;
}

/// Creates the sandbox backend a spec asks for.
///
/// # Arguments
/// * `spec` - The fixture spec whose `backend` selects the runtime
///
/// # Returns
/// A shared backend or an error if the runtime is unavailable.
pub fn sandbox_for(spec: &FixtureSpec) -> Result<Arc<dyn Sandbox>> {
    match spec.backend {
        #[cfg(feature = "docker")]
        BackendKind::Docker => Ok(Arc::new(docker::DockerSandbox::new()?)),
        #[cfg(not(feature = "docker"))]
        BackendKind::Docker => Err(fixture_core::FixtureError::Config(
            "Docker backend is not compiled in (enable the `docker` feature)".to_string(),
        )),
        BackendKind::Local => Ok(Arc::new(local::LocalSandbox::new())),
        #[cfg(feature = "test-helpers")]
        BackendKind::Mock => Ok(Arc::new(mock::MockSandbox::new())),
        #[cfg(not(feature = "test-helpers"))]
        BackendKind::Mock => Err(fixture_core::FixtureError::Config(
            "Mock backend requires the `test-helpers` feature".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sandbox_for_local() {
        let spec = FixtureSpec::new("kv", "local/kv").with_backend(BackendKind::Local);
        let sandbox = sandbox_for(&spec).unwrap();
        assert_eq!(sandbox.name(), "local");
    }

    #[test]
    #[cfg(feature = "docker")]
    fn test_sandbox_for_default_docker() {
        let spec = FixtureSpec::new("pg", "postgres:16");
        // Docker may not be installed where tests run
        match sandbox_for(&spec) {
            Ok(sandbox) => assert_eq!(sandbox.name(), "docker"),
            Err(error) => assert!(error.to_string().contains("Dependency not found")),
        }
    }

    #[test]
    #[cfg(feature = "test-helpers")]
    fn test_sandbox_for_mock() {
        let spec = FixtureSpec::new("m", "mock/any").with_backend(BackendKind::Mock);
        assert_eq!(sandbox_for(&spec).unwrap().name(), "mock");
    }

    #[test]
    #[cfg(not(feature = "test-helpers"))]
    fn test_sandbox_for_mock_without_feature() {
        let spec = FixtureSpec::new("m", "mock/any").with_backend(BackendKind::Mock);
        let error = sandbox_for(&spec).err().unwrap();
        assert!(error.to_string().contains("test-helpers"));
    }

    #[test]
    fn test_instance_port_lookup() {
        let instance = SandboxInstance {
            id: "abc".into(),
            name: "pg-1".into(),
            fixture: "pg".into(),
            host: "127.0.0.1".into(),
            ports: vec![PortMapping {
                container_port: 5432,
                host_port: 49153,
            }],
        };
        assert_eq!(instance.host_port(5432), Some(49153));
        assert_eq!(instance.host_port(6379), None);
    }
}
