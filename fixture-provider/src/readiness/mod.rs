//! Deterministic readiness gating.
//!
//! [`ReadinessGate::wait_until_ready`] polls a [`ReadinessProbe`] until the
//! fixture answers, the probe timeout passes, or the gate's [`CancelToken`]
//! fires. Each poll:
//!
//! 1. checks the sandbox is still running (an exited sandbox fails at once),
//! 2. evaluates the probe,
//! 3. once the probe passes, opens a driver handle and pings it, within
//!    whatever is left of the timeout.
//!
//! Only a successful ping marks the fixture `Ready`. Waiting between polls
//! happens on the cancel token, so cancellation takes effect immediately.

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use fixture_core::cancel::CancelToken;
use fixture_core::driver::{Driver, Endpoint};
use fixture_core::error::{FixtureError, ReadinessTimeout, WaitAbort};
use tracing::{debug, info, info_span, warn};

use crate::provisioner::ProvisionedFixture;

mod probe;

pub use probe::{ProbeCheck, ProbeOutcome, ReadinessCheck, ReadinessProbe};

#[derive(Debug, Clone, Default)]
pub struct ReadinessGate {
    cancel: CancelToken,
}

impl ReadinessGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gate whose waits end as soon as `cancel` fires.
    pub fn with_cancel(cancel: CancelToken) -> Self {
        Self { cancel }
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Block until `fixture` is ready and return an open driver handle.
    ///
    /// Never waits longer than the probe timeout plus one poll interval. On
    /// any failure the fixture is marked `Failed`.
    pub fn wait_until_ready<D: Driver>(
        &self,
        fixture: &ProvisionedFixture,
        probe: &ReadinessProbe,
        driver: &D,
    ) -> Result<D::Handle, ReadinessTimeout> {
        let span = info_span!("fixture", name = %fixture.name());
        let _enter = span.enter();

        let started = Instant::now();
        let deadline = started + probe.timeout;
        let mut polls = 0u32;
        let mut last_observed = String::from("not probed yet");

        info!(
            "Waiting up to {:.1}s for fixture '{}' ({})",
            probe.timeout.as_secs_f64(),
            fixture.name(),
            probe.describe()
        );

        let fail = |reason: WaitAbort, last_observed: String| {
            fixture.mark_failed();
            let err = ReadinessTimeout {
                fixture: fixture.name().to_string(),
                probe: probe.describe(),
                elapsed: started.elapsed(),
                last_observed,
                reason,
            };
            warn!("{}", err);
            err
        };

        loop {
            if self.cancel.is_cancelled() {
                return Err(fail(WaitAbort::Cancelled, last_observed));
            }
            polls += 1;

            match fixture.is_running() {
                Ok(false) => {
                    let tail = fixture
                        .logs()
                        .ok()
                        .and_then(|lines| lines.last().cloned())
                        .unwrap_or_default();
                    return Err(fail(
                        WaitAbort::PermanentFailure,
                        format!("sandbox exited; last log line: {}", tail),
                    ));
                }
                Err(e) => last_observed = format!("status unavailable: {}", e),
                Ok(true) => match probe.evaluate_within(fixture, remaining(deadline)) {
                    ProbeOutcome::Ready => match fixture.endpoint() {
                        Some(endpoint) => match self.connect(driver, &endpoint, deadline) {
                            DriverStep::Connected(handle) => {
                                if fixture.mark_ready() {
                                    info!(
                                        "Fixture '{}' ready at {} after {:.2}s ({} polls)",
                                        fixture.name(),
                                        endpoint,
                                        started.elapsed().as_secs_f64(),
                                        polls
                                    );
                                    return Ok(handle);
                                }
                                return Err(fail(
                                    WaitAbort::PermanentFailure,
                                    format!("fixture is {}", fixture.status()),
                                ));
                            }
                            DriverStep::Failed(e) => {
                                last_observed = format!("{} driver: {}", driver.name(), e)
                            }
                            DriverStep::Stalled => {
                                let observed = format!(
                                    "{} driver: no answer from {}",
                                    driver.name(),
                                    endpoint
                                );
                                let reason = if self.cancel.is_cancelled() {
                                    WaitAbort::Cancelled
                                } else {
                                    WaitAbort::Deadline
                                };
                                return Err(fail(reason, observed));
                            }
                        },
                        None => {
                            return Err(fail(
                                WaitAbort::PermanentFailure,
                                "fixture publishes no ports for the driver".to_string(),
                            ))
                        }
                    },
                    ProbeOutcome::NotYetReady(reason) => last_observed = reason,
                    ProbeOutcome::PermanentlyFailed(reason) => {
                        return Err(fail(WaitAbort::PermanentFailure, reason))
                    }
                },
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(fail(WaitAbort::Deadline, last_observed));
            }
            debug!("Fixture '{}' not ready: {}", fixture.name(), last_observed);
            let pause = probe.poll_interval.min(deadline - now);
            if self.cancel.wait_timeout(pause) {
                return Err(fail(WaitAbort::Cancelled, last_observed));
            }
        }
    }

    /// Open and ping a driver handle on a helper thread, giving up when the
    /// deadline passes or the gate is cancelled. A stalled helper finishes
    /// on its own and drops whatever handle it opened.
    fn connect<D: Driver>(
        &self,
        driver: &D,
        endpoint: &Endpoint,
        deadline: Instant,
    ) -> DriverStep<D::Handle> {
        let done = self.cancel.child();
        let (tx, rx) = mpsc::channel();
        let worker = {
            let driver = driver.clone();
            let endpoint = endpoint.clone();
            let done = done.clone();
            move || {
                let result = driver
                    .open(&endpoint)
                    .and_then(|handle| driver.ping(&handle).map(|_| handle));
                let _ = tx.send(result);
                done.cancel();
            }
        };
        let spawned = thread::Builder::new()
            .name("fixture-driver".to_string())
            .spawn(worker);
        if let Err(e) = spawned {
            return DriverStep::Failed(FixtureError::Io(e));
        }

        done.wait_timeout(remaining(deadline));
        match rx.try_recv() {
            Ok(Ok(handle)) => DriverStep::Connected(handle),
            Ok(Err(e)) => DriverStep::Failed(e),
            Err(_) => DriverStep::Stalled,
        }
    }
}

enum DriverStep<H> {
    Connected(H),
    Failed(FixtureError),
    /// Neither open nor ping answered within the budget.
    Stalled,
}

/// Time left before `deadline`, never zero so socket timeouts stay valid.
fn remaining(deadline: Instant) -> Duration {
    deadline
        .saturating_duration_since(Instant::now())
        .max(Duration::from_millis(1))
}
