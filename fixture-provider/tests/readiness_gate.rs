//! Readiness gate behaviour against the in-process KV engine.

use std::sync::Arc;
use std::time::{Duration, Instant};

use fixture_config::{BackendKind, FixtureSpec};
use fixture_core::driver::{Driver, Endpoint, TcpDriver};
use fixture_core::error::{Result, WaitAbort};
use fixture_core::CancelToken;
use fixture_kv::KvDriver;
use fixture_provider::{
    FixtureStatus, ProbeOutcome, ProvisionedFixture, Provisioner, ReadinessCheck, ReadinessGate,
    ReadinessProbe,
};

fn kv_spec(name: &str) -> FixtureSpec {
    FixtureSpec::new(name, "local/kv")
        .with_backend(BackendKind::Local)
        .with_port(7070)
}

struct NeverReady;

impl ReadinessCheck for NeverReady {
    fn describe(&self) -> String {
        "never".to_string()
    }

    fn evaluate(&self, _fixture: &ProvisionedFixture) -> ProbeOutcome {
        ProbeOutcome::NotYetReady("still warming up".to_string())
    }
}

/// Connects fine, then sits on the ping far longer than any probe timeout.
#[derive(Clone)]
struct HangingDriver;

impl Driver for HangingDriver {
    type Handle = Endpoint;

    fn name(&self) -> &str {
        "hanging"
    }

    fn open(&self, endpoint: &Endpoint) -> Result<Endpoint> {
        Ok(endpoint.clone())
    }

    fn ping(&self, _handle: &Endpoint) -> Result<()> {
        std::thread::sleep(Duration::from_secs(5));
        Ok(())
    }
}

#[test]
fn ready_fixture_returns_live_handle() {
    fixture_logging::init_test_subscriber();
    let provisioner = Provisioner::new();
    let fixture = provisioner
        .provision(Arc::new(kv_spec("kv").with_seed("user:1", "ada")))
        .unwrap();

    let probe = ReadinessProbe::tcp().with_timeout(Duration::from_secs(5));
    let client = ReadinessGate::new()
        .wait_until_ready(&fixture, &probe, &KvDriver::default())
        .unwrap();

    assert_eq!(fixture.status(), FixtureStatus::Ready);
    assert_eq!(client.get("user:1").unwrap().as_deref(), Some("ada"));

    provisioner.terminate_all();
    assert_eq!(fixture.status(), FixtureStatus::Terminated);
    assert!(!fixture.exists().unwrap());
}

#[test]
fn slow_start_times_out_near_probe_timeout() {
    fixture_logging::init_test_subscriber();
    let provisioner = Provisioner::new();
    let fixture = provisioner
        .provision(Arc::new(kv_spec("slow").with_env("KV_STARTUP_DELAY_MS", "5000")))
        .unwrap();

    let probe = ReadinessProbe::tcp()
        .with_timeout(Duration::from_secs(2))
        .with_poll_interval(Duration::from_millis(100));
    let started = Instant::now();
    let err = ReadinessGate::new()
        .wait_until_ready(&fixture, &probe, &KvDriver::default())
        .unwrap_err();
    let waited = started.elapsed();

    assert_eq!(err.reason, WaitAbort::Deadline);
    assert!(waited >= Duration::from_secs(2), "returned early: {:?}", waited);
    assert!(waited < Duration::from_millis(2_600), "overran: {:?}", waited);
    assert!(err.elapsed >= Duration::from_secs(2));
    assert_eq!(fixture.status(), FixtureStatus::Failed);

    provisioner.terminate_all();
    assert!(!fixture.exists().unwrap());
}

#[test]
fn never_ready_probe_is_bounded() {
    fixture_logging::init_test_subscriber();
    let provisioner = Provisioner::new();
    let fixture = provisioner.provision(Arc::new(kv_spec("stuck"))).unwrap();

    let timeout = Duration::from_millis(600);
    let poll = Duration::from_millis(200);
    let probe = ReadinessProbe::custom(Arc::new(NeverReady))
        .with_timeout(timeout)
        .with_poll_interval(poll);

    let started = Instant::now();
    let err = ReadinessGate::new()
        .wait_until_ready(&fixture, &probe, &TcpDriver::default())
        .unwrap_err();

    assert!(started.elapsed() <= timeout + poll + Duration::from_millis(100));
    assert_eq!(err.last_observed, "still warming up");
    assert_eq!(err.probe, "never");
    provisioner.terminate_all();
}

#[test]
fn exited_sandbox_fails_without_waiting() {
    fixture_logging::init_test_subscriber();
    let provisioner = Provisioner::new();
    let fixture = provisioner
        .provision(Arc::new(
            kv_spec("crashy")
                .with_env("KV_STARTUP_DELAY_MS", "1000")
                .with_env("KV_EXIT_AFTER_MS", "100"),
        ))
        .unwrap();

    let probe = ReadinessProbe::tcp()
        .with_timeout(Duration::from_secs(10))
        .with_poll_interval(Duration::from_millis(50));
    let started = Instant::now();
    let err = ReadinessGate::new()
        .wait_until_ready(&fixture, &probe, &TcpDriver::default())
        .unwrap_err();

    // The engine notices its exit deadline once the startup delay is over.
    assert_eq!(err.reason, WaitAbort::PermanentFailure);
    assert!(err.last_observed.contains("exiting after 100ms"));
    assert!(started.elapsed() < Duration::from_secs(3));
    provisioner.terminate_all();
}

#[test]
fn cancellation_cuts_the_wait_short() {
    fixture_logging::init_test_subscriber();
    let provisioner = Provisioner::new();
    let fixture = provisioner
        .provision(Arc::new(kv_spec("cancel").with_env("KV_STARTUP_DELAY_MS", "10000")))
        .unwrap();

    let cancel = CancelToken::new();
    cancel.cancel_after(Duration::from_millis(300));
    let probe = ReadinessProbe::tcp()
        .with_timeout(Duration::from_secs(30))
        .with_poll_interval(Duration::from_secs(1));

    let started = Instant::now();
    let err = ReadinessGate::with_cancel(cancel)
        .wait_until_ready(&fixture, &probe, &TcpDriver::default())
        .unwrap_err();

    assert_eq!(err.reason, WaitAbort::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(2));
    provisioner.terminate_all();
}

#[test]
fn log_pattern_probe_waits_for_engine_message() {
    fixture_logging::init_test_subscriber();
    let provisioner = Provisioner::new();
    let fixture = provisioner
        .provision(Arc::new(kv_spec("logged").with_env("KV_STARTUP_DELAY_MS", "300")))
        .unwrap();

    let probe = ReadinessProbe::log("ready to accept connections", 1)
        .unwrap()
        .with_timeout(Duration::from_secs(5))
        .with_poll_interval(Duration::from_millis(50));
    let endpoint = ReadinessGate::new()
        .wait_until_ready(&fixture, &probe, &TcpDriver::default())
        .unwrap();

    assert_eq!(Some(endpoint.port), fixture.host_port(7070));
    assert!(fixture.uptime() >= Duration::from_millis(300));
    provisioner.terminate_all();
}

#[test]
fn hanging_driver_is_bounded_by_the_probe_timeout() {
    fixture_logging::init_test_subscriber();
    let provisioner = Provisioner::new();
    let fixture = provisioner.provision(Arc::new(kv_spec("hang-deadline"))).unwrap();
    let probe = ReadinessProbe::tcp()
        .with_timeout(Duration::from_millis(300))
        .with_poll_interval(Duration::from_millis(50));

    let started = Instant::now();
    let err = ReadinessGate::new()
        .wait_until_ready(&fixture, &probe, &HangingDriver)
        .unwrap_err();

    assert_eq!(err.reason, WaitAbort::Deadline);
    assert!(err.last_observed.contains("hanging driver: no answer"));
    assert!(started.elapsed() < Duration::from_millis(500), "{:?}", started.elapsed());
    assert_eq!(fixture.status(), FixtureStatus::Failed);
    provisioner.terminate_all();
}

#[test]
fn cancellation_interrupts_a_hanging_driver() {
    fixture_logging::init_test_subscriber();
    let provisioner = Provisioner::new();
    let fixture = provisioner.provision(Arc::new(kv_spec("hang-cancel"))).unwrap();
    let probe = ReadinessProbe::tcp().with_timeout(Duration::from_secs(30));

    let cancel = CancelToken::new();
    cancel.cancel_after(Duration::from_millis(200));

    let started = Instant::now();
    let err = ReadinessGate::with_cancel(cancel)
        .wait_until_ready(&fixture, &probe, &HangingDriver)
        .unwrap_err();

    assert_eq!(err.reason, WaitAbort::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(1), "{:?}", started.elapsed());
    provisioner.terminate_all();
}
