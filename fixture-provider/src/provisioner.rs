//! Fixture provisioning and guaranteed termination.
//!
//! The [`Provisioner`] is the only owner of sandboxes: it starts them, keeps a
//! record of every fixture it created during the run, and is the only thing
//! that ever stops them.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use fixture_config::{validate_spec, BackendKind, FixtureSpec};
use fixture_core::command_stream::CommandOutput;
use fixture_core::driver::Endpoint;
use fixture_core::error::{ProvisionError, ProvisionErrorKind, Result};
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

use crate::{sandbox_for, PortMapping, Sandbox, SandboxInstance};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FixtureStatus {
    Starting,
    Ready,
    Failed,
    Terminated,
}

impl FixtureStatus {
    /// Allowed moves: Starting to anything else, Ready to Terminated.
    pub fn can_transition_to(self, next: FixtureStatus) -> bool {
        matches!(
            (self, next),
            (FixtureStatus::Starting, FixtureStatus::Ready)
                | (FixtureStatus::Starting, FixtureStatus::Failed)
                | (FixtureStatus::Starting, FixtureStatus::Terminated)
                | (FixtureStatus::Ready, FixtureStatus::Terminated)
        )
    }

    /// Still holding (or about to hold) sandbox resources.
    pub fn is_live(self) -> bool {
        matches!(self, FixtureStatus::Starting | FixtureStatus::Ready)
    }
}

impl fmt::Display for FixtureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FixtureStatus::Starting => "starting",
            FixtureStatus::Ready => "ready",
            FixtureStatus::Failed => "failed",
            FixtureStatus::Terminated => "terminated",
        };
        f.write_str(label)
    }
}

struct FixtureInner {
    spec: Arc<FixtureSpec>,
    instance: SandboxInstance,
    sandbox: Arc<dyn Sandbox>,
    status: Mutex<FixtureStatus>,
    released: AtomicBool,
    started: Instant,
    started_at: DateTime<Utc>,
}

/// A live sandbox instance produced by the [`Provisioner`].
///
/// Cheap to clone; all clones observe the same status.
#[derive(Clone)]
pub struct ProvisionedFixture {
    inner: Arc<FixtureInner>,
}

impl ProvisionedFixture {
    fn new(spec: Arc<FixtureSpec>, instance: SandboxInstance, sandbox: Arc<dyn Sandbox>) -> Self {
        Self {
            inner: Arc::new(FixtureInner {
                spec,
                instance,
                sandbox,
                status: Mutex::new(FixtureStatus::Starting),
                released: AtomicBool::new(false),
                started: Instant::now(),
                started_at: Utc::now(),
            }),
        }
    }

    pub fn spec(&self) -> &Arc<FixtureSpec> {
        &self.inner.spec
    }

    pub fn name(&self) -> &str {
        &self.inner.spec.name
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance.id
    }

    pub fn sandbox_name(&self) -> &str {
        &self.inner.instance.name
    }

    pub fn backend(&self) -> &'static str {
        self.inner.sandbox.name()
    }

    pub fn host(&self) -> &str {
        &self.inner.instance.host
    }

    pub fn ports(&self) -> &[PortMapping] {
        &self.inner.instance.ports
    }

    pub fn host_port(&self, container_port: u16) -> Option<u16> {
        self.inner.instance.host_port(container_port)
    }

    /// Endpoint of the primary (first) published port.
    pub fn endpoint(&self) -> Option<Endpoint> {
        self.ports()
            .first()
            .map(|m| Endpoint::new(self.host(), m.host_port, m.container_port))
    }

    pub fn endpoint_for(&self, container_port: u16) -> Option<Endpoint> {
        self.host_port(container_port)
            .map(|port| Endpoint::new(self.host(), port, container_port))
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    pub fn uptime(&self) -> Duration {
        self.inner.started.elapsed()
    }

    fn lock_status(&self) -> MutexGuard<'_, FixtureStatus> {
        self.inner
            .status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn status(&self) -> FixtureStatus {
        *self.lock_status()
    }

    fn transition(&self, next: FixtureStatus) -> bool {
        let mut status = self.lock_status();
        if status.can_transition_to(next) {
            debug!("Fixture '{}': {} -> {}", self.name(), *status, next);
            *status = next;
            true
        } else {
            false
        }
    }

    /// Record that the dependency answered. Fails if the fixture already
    /// failed or was terminated meanwhile.
    pub fn mark_ready(&self) -> bool {
        self.transition(FixtureStatus::Ready)
    }

    pub fn mark_failed(&self) -> bool {
        self.transition(FixtureStatus::Failed)
    }

    pub fn logs(&self) -> Result<Vec<String>> {
        self.inner.sandbox.logs(self.instance_id())
    }

    pub fn is_running(&self) -> Result<bool> {
        self.inner.sandbox.is_running(self.instance_id())
    }

    /// Whether the backend still knows the sandbox.
    pub fn exists(&self) -> Result<bool> {
        self.inner.sandbox.exists(self.instance_id())
    }

    pub fn exec(&self, cmd: &[String]) -> Result<CommandOutput> {
        self.inner.sandbox.exec(self.instance_id(), cmd)
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }

    /// Stop the sandbox once. Returns false if it was already released.
    fn release(&self) -> bool {
        if self.inner.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        // Failed stays Failed; everything else ends Terminated.
        self.transition(FixtureStatus::Terminated);

        let sandbox = Arc::clone(&self.inner.sandbox);
        let id = self.instance_id().to_string();
        match panic::catch_unwind(AssertUnwindSafe(|| sandbox.stop(&id))) {
            Ok(Ok(())) => info!("Terminated fixture '{}' ({})", self.name(), self.sandbox_name()),
            Ok(Err(e)) => warn!(
                "Failed to terminate fixture '{}' ({}): {}",
                self.name(),
                self.sandbox_name(),
                e
            ),
            Err(_) => warn!(
                "Sandbox backend panicked while terminating fixture '{}'",
                self.name()
            ),
        }
        true
    }
}

impl fmt::Debug for ProvisionedFixture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisionedFixture")
            .field("name", &self.name())
            .field("instance_id", &self.instance_id())
            .field("backend", &self.backend())
            .field("host", &self.host())
            .field("ports", &self.ports())
            .field("status", &self.status())
            .finish()
    }
}

/// Starts fixtures in sandboxes and guarantees they are torn down.
///
/// At most one live fixture exists per spec name. Every fixture created is
/// remembered so [`Provisioner::terminate_all`] can reclaim it, including
/// ones whose initialization failed.
pub struct Provisioner {
    run_id: String,
    sandbox: Option<Arc<dyn Sandbox>>,
    fixtures: Mutex<Vec<ProvisionedFixture>>,
}

impl Provisioner {
    /// Backends are chosen per spec with [`sandbox_for`].
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            sandbox: None,
            fixtures: Mutex::new(Vec::new()),
        }
    }

    /// Use `sandbox` for every spec, whatever its `backend` says.
    pub fn with_sandbox(sandbox: Arc<dyn Sandbox>) -> Self {
        Self {
            sandbox: Some(sandbox),
            ..Self::new()
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    fn fixtures(&self) -> MutexGuard<'_, Vec<ProvisionedFixture>> {
        self.fixtures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fixtures created so far, in creation order.
    pub fn fixtures_snapshot(&self) -> Vec<ProvisionedFixture> {
        self.fixtures().clone()
    }

    fn backend_for(
        &self,
        spec: &FixtureSpec,
    ) -> std::result::Result<Arc<dyn Sandbox>, ProvisionError> {
        match &self.sandbox {
            Some(sandbox) => Ok(Arc::clone(sandbox)),
            None => sandbox_for(spec).map_err(|e| {
                let kind = match spec.backend {
                    BackendKind::Mock => ProvisionErrorKind::StartFailed,
                    _ => ProvisionErrorKind::SandboxUnavailable,
                };
                ProvisionError::new(kind, &spec.name, e.to_string())
            }),
        }
    }

    /// Start the fixture described by `spec` and apply its init.
    ///
    /// The returned fixture is `Starting`; only the readiness gate moves it to
    /// `Ready`. If initialization fails the sandbox is removed before the
    /// error is returned.
    pub fn provision(
        &self,
        spec: Arc<FixtureSpec>,
    ) -> std::result::Result<ProvisionedFixture, ProvisionError> {
        let span = info_span!("fixture", name = %spec.name);
        let _enter = span.enter();

        validate_spec(&spec).map_err(|e| {
            ProvisionError::new(ProvisionErrorKind::StartFailed, &spec.name, e.to_string())
        })?;

        // Hold the registry for the whole start so two callers cannot race
        // on the same name.
        let mut fixtures = self.fixtures();
        if fixtures
            .iter()
            .any(|f| f.name() == spec.name && f.status().is_live() && !f.is_released())
        {
            return Err(ProvisionError::new(
                ProvisionErrorKind::Duplicate,
                &spec.name,
                "a live fixture with this name already exists in this run",
            ));
        }

        let sandbox = self.backend_for(&spec)?;
        info!(
            "Provisioning fixture '{}' from {} on {}",
            spec.name,
            spec.image,
            sandbox.name()
        );
        let instance = sandbox.start(&spec, &self.run_id)?;
        let fixture = ProvisionedFixture::new(Arc::clone(&spec), instance, Arc::clone(&sandbox));
        fixtures.push(fixture.clone());
        drop(fixtures);

        if !spec.init.is_empty() {
            if let Err(e) = sandbox.initialize(&fixture.inner.instance, &spec.init) {
                warn!("Initialization of fixture '{}' failed: {}", spec.name, e);
                fixture.mark_failed();
                fixture.release();
                return Err(e);
            }
        }

        info!(
            "Fixture '{}' started as {} ({})",
            spec.name,
            fixture.sandbox_name(),
            describe_ports(fixture.ports())
        );
        Ok(fixture)
    }

    /// Stop and remove the fixture's sandbox. Idempotent; failures are logged
    /// and never returned.
    pub fn terminate(&self, fixture: &ProvisionedFixture) {
        let span = info_span!("fixture", name = %fixture.name());
        let _enter = span.enter();
        if !fixture.release() {
            debug!("Fixture '{}' already terminated", fixture.name());
        }
    }

    /// Terminate every fixture this provisioner created, newest first.
    pub fn terminate_all(&self) {
        let fixtures = self.fixtures_snapshot();
        for fixture in fixtures.iter().rev() {
            self.terminate(fixture);
        }
    }
}

impl Default for Provisioner {
    fn default() -> Self {
        Self::new()
    }
}

fn describe_ports(ports: &[PortMapping]) -> String {
    if ports.is_empty() {
        return "no published ports".to_string();
    }
    ports
        .iter()
        .map(|m| format!("{}->{}", m.container_port, m.host_port))
        .collect::<Vec<_>>()
        .join(", ")
}
