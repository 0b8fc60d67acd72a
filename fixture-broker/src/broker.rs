use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use fixture_config::FixtureSpec;
use fixture_core::cancel::CancelToken;
use fixture_core::driver::{Driver, Endpoint};
use fixture_core::error::{LifecycleError, NotReadyError, ProvisionError, ProvisionErrorKind};
use fixture_provider::{ProvisionedFixture, Provisioner, ReadinessGate, ReadinessProbe};
use once_cell::sync::OnceCell;
use tracing::{debug, info, info_span, warn};

use crate::context::TestCaseContext;

/// Lifecycle of a [`Broker`].
///
/// `Uninitialized -> Provisioning -> Ready -> TornDown`, or
/// `Provisioning -> Failed -> TornDown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerState {
    Uninitialized,
    Provisioning,
    Ready,
    Failed,
    TornDown,
}

impl fmt::Display for BrokerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BrokerState::Uninitialized => "uninitialized",
            BrokerState::Provisioning => "provisioning",
            BrokerState::Ready => "ready",
            BrokerState::Failed => "failed",
            BrokerState::TornDown => "torn down",
        };
        f.write_str(label)
    }
}

/// A driver handle to a ready fixture, shared by every test case.
///
/// Clones share the same underlying client.
pub struct ConnectionHandle<H> {
    client: Arc<H>,
    endpoint: Endpoint,
    published: Vec<Endpoint>,
}

impl<H> ConnectionHandle<H> {
    pub fn new(client: H, endpoint: Endpoint) -> Self {
        Self {
            client: Arc::new(client),
            published: vec![endpoint.clone()],
            endpoint,
        }
    }

    /// Record every published port, not just the primary one.
    pub fn with_published(mut self, endpoints: Vec<Endpoint>) -> Self {
        if !endpoints.is_empty() {
            self.published = endpoints;
        }
        self
    }

    pub fn client(&self) -> &H {
        &self.client
    }

    /// Where the driver connected: the fixture's primary port.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.published
    }

    pub fn endpoint_for(&self, container_port: u16) -> Option<&Endpoint> {
        self.published
            .iter()
            .find(|e| e.container_port == container_port)
    }

    /// True when both handles wrap the same client.
    pub fn shares_client_with(&self, other: &ConnectionHandle<H>) -> bool {
        Arc::ptr_eq(&self.client, &other.client)
    }
}

impl<H> Clone for ConnectionHandle<H> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            endpoint: self.endpoint.clone(),
            published: self.published.clone(),
        }
    }
}

impl<H> Deref for ConnectionHandle<H> {
    type Target = H;

    fn deref(&self) -> &H {
        &self.client
    }
}

impl<H> fmt::Debug for ConnectionHandle<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("endpoint", &self.endpoint)
            .field("published", &self.published.len())
            .finish_non_exhaustive()
    }
}

type SetupOutcome<H> = Result<ConnectionHandle<H>, LifecycleError>;

/// Execute-once setup and teardown of one fixture for a whole test run.
///
/// `setup` may be called from any number of threads; the first call
/// provisions and gates the fixture, concurrent callers block until it
/// settles, and every caller sees the same outcome. `teardown` runs at most
/// once and also runs when the broker is dropped.
///
/// Teardown terminates every fixture of the broker's [`Provisioner`], so give
/// each broker its own provisioner unless sharing that scope is intended.
pub struct Broker<D: Driver> {
    spec: Arc<FixtureSpec>,
    provisioner: Arc<Provisioner>,
    driver: D,
    probe: Option<ReadinessProbe>,
    cancel: CancelToken,
    state: Mutex<BrokerState>,
    fixture: Mutex<Option<ProvisionedFixture>>,
    setup_once: OnceCell<SetupOutcome<D::Handle>>,
    teardown_once: OnceCell<()>,
    expected_consumers: usize,
    released: AtomicUsize,
}

impl<D: Driver> Broker<D> {
    pub fn new(spec: Arc<FixtureSpec>, provisioner: Arc<Provisioner>, driver: D) -> Self {
        Self {
            spec,
            provisioner,
            driver,
            probe: None,
            cancel: CancelToken::new(),
            state: Mutex::new(BrokerState::Uninitialized),
            fixture: Mutex::new(None),
            setup_once: OnceCell::new(),
            teardown_once: OnceCell::new(),
            expected_consumers: 0,
            released: AtomicUsize::new(0),
        }
    }

    /// Broker with a provisioner of its own.
    pub fn for_spec(spec: FixtureSpec, driver: D) -> Self {
        Self::new(Arc::new(spec), Arc::new(Provisioner::new()), driver)
    }

    /// Gate on `probe` instead of the spec's readiness settings.
    pub fn with_probe(mut self, probe: ReadinessProbe) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Abort a pending readiness wait when `parent` is cancelled. Teardown
    /// never cancels `parent` itself.
    pub fn with_cancel(mut self, parent: &CancelToken) -> Self {
        self.cancel = parent.child();
        self
    }

    /// Tear down automatically once `consumers` leases have been released.
    pub fn with_expected_consumers(mut self, consumers: usize) -> Self {
        self.expected_consumers = consumers;
        self
    }

    pub fn spec(&self) -> &FixtureSpec {
        &self.spec
    }

    pub fn provisioner(&self) -> &Arc<Provisioner> {
        &self.provisioner
    }

    pub fn state(&self) -> BrokerState {
        *lock(&self.state)
    }

    fn set_state(&self, next: BrokerState) {
        let mut state = lock(&self.state);
        debug!("Broker for '{}': {} -> {}", self.spec.name, *state, next);
        *state = next;
    }

    /// The provisioned fixture, once setup got that far.
    pub fn fixture(&self) -> Option<ProvisionedFixture> {
        lock(&self.fixture).clone()
    }

    /// The recorded setup failure, if setup ran and failed.
    pub fn last_error(&self) -> Option<LifecycleError> {
        self.setup_once
            .get()
            .and_then(|outcome| outcome.as_ref().err().cloned())
    }

    /// Provision the fixture and wait until it is ready. Runs once; later
    /// and concurrent calls return the first call's outcome.
    pub fn setup(&self) -> Result<ConnectionHandle<D::Handle>, LifecycleError> {
        self.setup_once.get_or_init(|| self.run_setup()).clone()
    }

    fn run_setup(&self) -> SetupOutcome<D::Handle> {
        let span = info_span!("fixture", name = %self.spec.name);
        let _enter = span.enter();

        self.set_state(BrokerState::Provisioning);
        let outcome = self.provision_and_gate();
        match &outcome {
            Ok(handle) => {
                self.set_state(BrokerState::Ready);
                info!(
                    "Fixture '{}' shared at {} via {}",
                    self.spec.name,
                    handle.endpoint(),
                    self.driver.name()
                );
            }
            Err(e) => {
                self.set_state(BrokerState::Failed);
                warn!("Setup of fixture '{}' failed: {}", self.spec.name, e);
            }
        }
        outcome
    }

    fn provision_and_gate(&self) -> SetupOutcome<D::Handle> {
        let probe = match &self.probe {
            Some(probe) => probe.clone(),
            None => ReadinessProbe::from_spec(&self.spec.readiness).map_err(|e| {
                ProvisionError::new(ProvisionErrorKind::StartFailed, &self.spec.name, e.to_string())
            })?,
        };

        let fixture = self.provisioner.provision(Arc::clone(&self.spec))?;
        *lock(&self.fixture) = Some(fixture.clone());

        let client = ReadinessGate::with_cancel(self.cancel.clone())
            .wait_until_ready(&fixture, &probe, &self.driver)?;
        let endpoint = fixture.endpoint().ok_or_else(|| {
            ProvisionError::new(
                ProvisionErrorKind::StartFailed,
                &self.spec.name,
                "fixture publishes no ports",
            )
        })?;
        let published = fixture
            .ports()
            .iter()
            .filter_map(|m| fixture.endpoint_for(m.container_port))
            .collect();
        Ok(ConnectionHandle::new(client, endpoint).with_published(published))
    }

    /// The shared handle. Never blocks; fails unless setup has completed
    /// successfully and teardown has not started.
    pub fn acquire(&self) -> Result<ConnectionHandle<D::Handle>, NotReadyError> {
        let state = self.state();
        match self.setup_once.get() {
            Some(Ok(handle)) if state == BrokerState::Ready => Ok(handle.clone()),
            _ => Err(NotReadyError {
                state: state.to_string(),
            }),
        }
    }

    /// A fresh per-case context around the shared handle.
    pub fn context(
        &self,
        case: impl Into<String>,
    ) -> Result<TestCaseContext<D::Handle>, NotReadyError> {
        Ok(TestCaseContext::new(case, self.acquire()?))
    }

    /// Set up if needed and take a consumer lease. Once
    /// `with_expected_consumers` leases are released (failed attempts
    /// included) the broker tears down.
    pub fn lease(&self) -> Result<Lease<'_, D>, LifecycleError> {
        match self.setup().and_then(|_| self.acquire().map_err(Into::into)) {
            Ok(handle) => Ok(Lease {
                broker: self,
                handle,
            }),
            Err(e) => {
                self.release_consumer();
                Err(e)
            }
        }
    }

    fn release_consumer(&self) {
        let released = self.released.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(
            "Broker for '{}': {}/{} consumers released",
            self.spec.name, released, self.expected_consumers
        );
        if self.expected_consumers > 0 && released >= self.expected_consumers {
            self.teardown();
        }
    }

    /// Terminate everything this broker provisioned. Runs once; a pending
    /// readiness wait is cancelled and an in-flight setup is waited for.
    pub fn teardown(&self) {
        self.teardown_once.get_or_init(|| {
            let span = info_span!("fixture", name = %self.spec.name);
            let _enter = span.enter();

            self.cancel.cancel();
            // Blocks behind an in-flight setup; stops a later one from starting.
            let _ = self.setup_once.get_or_init(|| {
                Err(NotReadyError {
                    state: BrokerState::TornDown.to_string(),
                }
                .into())
            });

            if self.provisioner.fixtures_snapshot().is_empty() {
                debug!("Nothing to tear down for '{}'", self.spec.name);
            } else {
                info!("Tearing down fixture '{}'", self.spec.name);
                self.provisioner.terminate_all();
            }
            self.set_state(BrokerState::TornDown);
        });
    }
}

impl<D: Driver> Drop for Broker<D> {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl<D: Driver> fmt::Debug for Broker<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("fixture", &self.spec.name)
            .field("driver", &self.driver.name())
            .field("state", &self.state())
            .finish()
    }
}

/// A consumer's claim on a broker's shared fixture.
///
/// Holds the handle for as long as the consumer needs it; dropping the lease
/// counts the consumer as finished.
pub struct Lease<'a, D: Driver> {
    broker: &'a Broker<D>,
    handle: ConnectionHandle<D::Handle>,
}

impl<D: Driver> Lease<'_, D> {
    pub fn handle(&self) -> &ConnectionHandle<D::Handle> {
        &self.handle
    }
}

impl<D: Driver> Deref for Lease<'_, D> {
    type Target = D::Handle;

    fn deref(&self) -> &D::Handle {
        self.handle.client()
    }
}

impl<D: Driver> Drop for Lease<'_, D> {
    fn drop(&mut self) {
        self.broker.release_consumer();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
