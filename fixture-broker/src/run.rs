//! Whole-run orchestration on top of a [`Broker`].
//!
//! A [`TestRun`] owns the registered cases and the run settings. With
//! [`SharingScope::Shared`] one broker serves every case; with
//! [`SharingScope::Isolated`] each case gets a full setup/teardown cycle of
//! its own. Either way teardown always runs, infrastructure failures are
//! reported apart from test failures, and a run deadline skips cases that
//! have not started yet.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use fixture_config::{FixtureSpec, RunSettings, SharingScope};
use fixture_core::cancel::CancelToken;
use fixture_core::driver::Driver;
use fixture_core::error::LifecycleError;
use fixture_provider::{Provisioner, ReadinessProbe, Sandbox};
use rayon::prelude::*;
use tracing::{info, info_span, warn};

use crate::broker::{Broker, BrokerState};
use crate::context::{panic_message, TestCaseContext};
use crate::report::{decide_status, CaseOutcome, CaseReport, RunReport};

type CaseBody<H> = Box<dyn Fn(&mut TestCaseContext<H>) -> anyhow::Result<()> + Send + Sync>;

struct TestCase<H> {
    name: String,
    body: CaseBody<H>,
}

pub struct TestRun<D: Driver> {
    spec: Arc<FixtureSpec>,
    driver: D,
    settings: RunSettings,
    sandbox: Option<Arc<dyn Sandbox>>,
    probe: Option<ReadinessProbe>,
    deadline: Option<Duration>,
    cases: Vec<TestCase<D::Handle>>,
}

type CaseSetup<H> = Result<TestCaseContext<H>, LifecycleError>;

/// What executing the cases under one sharing scope produced.
struct Phase {
    cases: Vec<CaseReport>,
    setup_error: Option<LifecycleError>,
    deadline_hit: bool,
    teardown_completed: bool,
}

impl<D: Driver> TestRun<D> {
    pub fn new(spec: FixtureSpec, driver: D) -> Self {
        Self {
            spec: Arc::new(spec),
            driver,
            settings: RunSettings::default(),
            sandbox: None,
            probe: None,
            deadline: None,
            cases: Vec::new(),
        }
    }

    pub fn with_settings(mut self, settings: RunSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.settings.workers = workers.max(1);
        self
    }

    /// Overrides `deadline_secs` from the settings.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_sharing(mut self, sharing: SharingScope) -> Self {
        self.settings.sharing = sharing;
        self
    }

    /// Run every fixture on `sandbox` regardless of the spec's backend.
    pub fn with_sandbox(mut self, sandbox: Arc<dyn Sandbox>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn with_probe(mut self, probe: ReadinessProbe) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Register a test case. Cases run in registration order when there is a
    /// single worker.
    pub fn case<F>(mut self, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut TestCaseContext<D::Handle>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.cases.push(TestCase {
            name: name.into(),
            body: Box::new(body),
        });
        self
    }

    pub fn case_count(&self) -> usize {
        self.cases.len()
    }

    fn broker(&self, cancel: &CancelToken) -> Broker<D> {
        let provisioner = match &self.sandbox {
            Some(sandbox) => Provisioner::with_sandbox(Arc::clone(sandbox)),
            None => Provisioner::new(),
        };
        let broker = Broker::new(
            Arc::clone(&self.spec),
            Arc::new(provisioner),
            self.driver.clone(),
        )
        .with_cancel(cancel);
        match &self.probe {
            Some(probe) => broker.with_probe(probe.clone()),
            None => broker,
        }
    }

    /// Run every case and tear down. Never panics on a case panic.
    pub fn execute(self) -> RunReport {
        let span = info_span!("fixture", name = %self.spec.name);
        let _enter = span.enter();

        let started_at = Utc::now();
        let started = Instant::now();
        let cancel = CancelToken::new();
        if let Some(deadline) = self.deadline() {
            cancel.cancel_after(deadline);
        }

        info!(
            "Running {} case(s) against '{}' ({:?}, {} worker(s))",
            self.cases.len(),
            self.spec.name,
            self.settings.sharing,
            self.settings.workers
        );

        let phase = match self.settings.sharing {
            SharingScope::Shared => self.execute_shared(&cancel),
            SharingScope::Isolated => self.execute_isolated(&cancel),
        };
        // Stops the deadline watcher.
        cancel.cancel();

        let status = decide_status(&phase.cases, phase.setup_error.as_ref(), phase.deadline_hit);
        let report = RunReport {
            fixture: self.spec.name.clone(),
            started_at,
            finished_at: Utc::now(),
            duration_ms: millis(started.elapsed()),
            cases: phase.cases,
            setup_error: phase.setup_error,
            teardown_completed: phase.teardown_completed,
            status,
        };
        info!("Run of '{}' finished: {}", self.spec.name, report.summary());
        report
    }

    fn deadline(&self) -> Option<Duration> {
        self.deadline.or_else(|| self.settings.deadline())
    }

    fn execute_shared(&self, cancel: &CancelToken) -> Phase {
        let broker = self.broker(cancel);
        let (cases, setup_error) = match broker.setup() {
            Ok(_) => {
                let cases = self.run_cases(cancel, |case| {
                    broker.context(&case.name).map_err(Into::into)
                });
                (cases, None)
            }
            Err(e) => {
                warn!("Skipping all cases: {}", e);
                let reason = format!("fixture setup failed: {}", e);
                let cases = self
                    .cases
                    .iter()
                    .map(|case| skipped(&case.name, reason.clone()))
                    .collect();
                (cases, Some(e))
            }
        };
        let deadline_hit = cancel.is_cancelled();
        broker.teardown();
        Phase {
            cases,
            setup_error,
            deadline_hit,
            teardown_completed: broker.state() == BrokerState::TornDown,
        }
    }

    fn execute_isolated(&self, cancel: &CancelToken) -> Phase {
        let first_error = Mutex::new(None::<LifecycleError>);
        let all_torn_down = AtomicBool::new(true);

        let cases = self.run_cases_with(cancel, |case| {
            let broker = self.broker(cancel);
            let report = match broker.setup() {
                Ok(_) => self.run_case(case, cancel, || {
                    broker.context(&case.name).map_err(Into::into)
                }),
                Err(e) => {
                    let reason = format!("fixture setup failed: {}", e);
                    let mut slot = first_error
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    slot.get_or_insert(e);
                    skipped(&case.name, reason)
                }
            };
            broker.teardown();
            if broker.state() != BrokerState::TornDown {
                all_torn_down.store(false, Ordering::SeqCst);
            }
            report
        });

        let deadline_hit = cancel.is_cancelled();
        let setup_error = first_error
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Phase {
            cases,
            setup_error,
            deadline_hit,
            teardown_completed: all_torn_down.into_inner(),
        }
    }

    fn run_cases<F>(&self, cancel: &CancelToken, setup: F) -> Vec<CaseReport>
    where
        F: Fn(&TestCase<D::Handle>) -> CaseSetup<D::Handle> + Sync,
    {
        self.run_cases_with(cancel, |case| self.run_case(case, cancel, || setup(case)))
    }

    /// Apply `run` to every case, on a bounded pool when more than one worker
    /// is configured. Reports come back in registration order.
    fn run_cases_with<F>(&self, cancel: &CancelToken, run: F) -> Vec<CaseReport>
    where
        F: Fn(&TestCase<D::Handle>) -> CaseReport + Sync,
    {
        let guarded = |case: &TestCase<D::Handle>| {
            if cancel.is_cancelled() {
                skipped(&case.name, "run deadline reached before the case started")
            } else {
                run(case)
            }
        };

        if self.settings.workers <= 1 {
            return self.cases.iter().map(guarded).collect();
        }
        match rayon::ThreadPoolBuilder::new()
            .num_threads(self.settings.workers)
            .thread_name(|i| format!("fixture-case-{}", i))
            .build()
        {
            Ok(pool) => pool.install(|| self.cases.par_iter().map(guarded).collect()),
            Err(e) => {
                warn!("Failed to build worker pool, running cases sequentially: {}", e);
                self.cases.iter().map(guarded).collect()
            }
        }
    }

    fn run_case<S>(&self, case: &TestCase<D::Handle>, cancel: &CancelToken, setup: S) -> CaseReport
    where
        S: FnOnce() -> CaseSetup<D::Handle>,
    {
        if cancel.is_cancelled() {
            return skipped(&case.name, "run deadline reached before the case started");
        }
        let mut ctx = match setup() {
            Ok(ctx) => ctx,
            Err(e) => return skipped(&case.name, e.to_string()),
        };

        let started = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(|| (case.body)(&mut ctx)));
        let cleanup_failures = ctx.run_cleanups();

        let outcome = match result {
            Ok(Ok(())) if cleanup_failures.is_empty() => CaseOutcome::Passed,
            Ok(Ok(())) => CaseOutcome::Failed(format!(
                "cleanup failed: {}",
                cleanup_failures.join("; ")
            )),
            Ok(Err(e)) => CaseOutcome::Failed(format!("{:#}", e)),
            Err(payload) => CaseOutcome::Failed(format!("panicked: {}", panic_message(&*payload))),
        };
        match &outcome {
            CaseOutcome::Failed(reason) => warn!("Case '{}' failed: {}", case.name, reason),
            _ => info!("Case '{}' passed", case.name),
        }

        CaseReport {
            name: case.name.clone(),
            outcome,
            duration_ms: millis(started.elapsed()),
            cleanup_failures,
        }
    }
}

fn skipped(name: &str, reason: impl Into<String>) -> CaseReport {
    CaseReport {
        name: name.to_string(),
        outcome: CaseOutcome::Skipped(reason.into()),
        duration_ms: 0,
        cleanup_failures: Vec::new(),
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
