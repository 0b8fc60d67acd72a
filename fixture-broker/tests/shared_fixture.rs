//! Broker lifecycle against the in-process KV engine.

use std::io::Write;
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use fixture_broker::{Broker, BrokerState};
use fixture_config::{BackendKind, FixtureSpec, ProbeSpec};
use fixture_core::error::{LifecycleError, ProvisionErrorKind, WaitAbort};
use fixture_kv::KvDriver;
use fixture_provider::mock::MockSandbox;
use fixture_provider::{Provisioner, ReadinessProbe};

fn kv_spec(name: &str, timeout: Duration) -> FixtureSpec {
    FixtureSpec::new(name, "local/kv")
        .with_backend(BackendKind::Local)
        .with_port(7070)
        .with_readiness(
            ProbeSpec::tcp()
                .with_timeout(timeout)
                .with_poll_interval(Duration::from_millis(100)),
        )
}

#[test]
fn seeded_record_is_read_back_and_engine_removed() {
    fixture_logging::init_test_subscriber();
    let broker = Broker::for_spec(
        kv_spec("users", Duration::from_secs(5)).with_seed("user:1", "ada lovelace"),
        KvDriver::default(),
    );

    let handle = broker.setup().unwrap();
    assert_eq!(broker.state(), BrokerState::Ready);
    assert_eq!(handle.get("user:1").unwrap().as_deref(), Some("ada lovelace"));
    assert_eq!(handle.count().unwrap(), 1);

    let fixture = broker.fixture().unwrap();
    broker.teardown();
    assert_eq!(broker.state(), BrokerState::TornDown);
    assert!(!fixture.exists().unwrap());
    assert!(fixture.is_released());
}

#[test]
fn concurrent_setup_provisions_once() {
    fixture_logging::init_test_subscriber();
    let provisioner = Arc::new(Provisioner::new());
    let broker = Arc::new(Broker::new(
        Arc::new(kv_spec("once", Duration::from_secs(5)).with_env("KV_STARTUP_DELAY_MS", "200")),
        Arc::clone(&provisioner),
        KvDriver::default(),
    ));

    let callers: Vec<_> = (0..4)
        .map(|_| {
            let broker = Arc::clone(&broker);
            thread::spawn(move || broker.setup().unwrap())
        })
        .collect();
    let handles: Vec<_> = callers.into_iter().map(|c| c.join().unwrap()).collect();

    assert_eq!(provisioner.fixtures_snapshot().len(), 1);
    assert!(handles.windows(2).all(|w| w[0].shares_client_with(&w[1])));
    broker.teardown();
}

#[test]
fn writes_are_visible_to_later_consumers() {
    fixture_logging::init_test_subscriber();
    let broker = Broker::for_spec(kv_spec("orders", Duration::from_secs(5)), KvDriver::default());
    broker.setup().unwrap();

    let first = broker.context("inserts").unwrap();
    first.client().set("order:7", "pending").unwrap();
    let endpoint = first.endpoint().clone();
    drop(first);

    let second = broker.context("reads").unwrap();
    assert_eq!(second.endpoint(), &endpoint);
    assert_eq!(second.client().get("order:7").unwrap().as_deref(), Some("pending"));
}

#[test]
fn slow_engine_fails_setup_near_probe_timeout() {
    fixture_logging::init_test_subscriber();
    let broker = Broker::for_spec(
        kv_spec("slow", Duration::from_secs(2)).with_env("KV_STARTUP_DELAY_MS", "5000"),
        KvDriver::default(),
    );

    let started = Instant::now();
    let err = broker.setup().unwrap_err();
    let waited = started.elapsed();

    match &err {
        LifecycleError::Readiness(timeout) => {
            assert_eq!(timeout.reason, WaitAbort::Deadline);
            assert!(timeout.elapsed >= Duration::from_secs(2));
        }
        other => panic!("expected a readiness timeout, got {:?}", other),
    }
    assert!(waited < Duration::from_millis(2_600), "overran: {:?}", waited);
    assert_eq!(broker.state(), BrokerState::Failed);
    assert!(broker.acquire().is_err());

    let fixture = broker.fixture().unwrap();
    broker.teardown();
    assert!(!fixture.exists().unwrap());
}

#[test]
fn silent_dependency_fails_setup_within_probe_timeout() {
    fixture_logging::init_test_subscriber();
    // The kernel completes the handshake, but nothing ever reads or answers.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let sandbox = Arc::new(MockSandbox::new().with_host_port(7070, port));
    let broker = Broker::new(
        Arc::new(FixtureSpec::new("silent", "mock/kv").with_port(7070)),
        Arc::new(Provisioner::with_sandbox(sandbox)),
        KvDriver::default(),
    )
    .with_probe(
        ReadinessProbe::tcp()
            .with_timeout(Duration::from_millis(200))
            .with_poll_interval(Duration::from_millis(50)),
    );

    let started = Instant::now();
    let err = broker.setup().unwrap_err();
    let waited = started.elapsed();

    match &err {
        LifecycleError::Readiness(timeout) => {
            assert_eq!(timeout.reason, WaitAbort::Deadline);
            assert!(timeout.last_observed.contains("no answer"), "{}", timeout);
        }
        other => panic!("expected a readiness timeout, got {:?}", other),
    }
    assert!(waited <= Duration::from_millis(400), "overran: {:?}", waited);
    broker.teardown();
    drop(listener);
}

#[test]
fn malformed_init_script_fails_setup() {
    fixture_logging::init_test_subscriber();
    let mut script = tempfile::NamedTempFile::new().unwrap();
    writeln!(script, "SET user:1 ada").unwrap();
    writeln!(script, "SETX user:2").unwrap();

    let broker = Broker::for_spec(
        kv_spec("broken", Duration::from_secs(5)).with_init_script(script.path()),
        KvDriver::default(),
    );
    let err = broker.setup().unwrap_err();
    assert_eq!(err.provision_kind(), Some(ProvisionErrorKind::InitScriptFailed));
    assert!(err.to_string().contains("line 2"), "{}", err);

    broker.teardown();
    broker.teardown();
    assert_eq!(broker.state(), BrokerState::TornDown);
    assert!(broker.provisioner().fixtures_snapshot().iter().all(|f| f.is_released()));
}

#[test]
fn teardown_cancels_pending_setup() {
    fixture_logging::init_test_subscriber();
    let broker = Arc::new(Broker::for_spec(
        kv_spec("stalled", Duration::from_secs(30)).with_env("KV_STARTUP_DELAY_MS", "20000"),
        KvDriver::default(),
    ));

    let setup = {
        let broker = Arc::clone(&broker);
        thread::spawn(move || broker.setup())
    };
    thread::sleep(Duration::from_millis(300));

    let started = Instant::now();
    broker.teardown();
    assert!(started.elapsed() < Duration::from_secs(3));

    match setup.join().unwrap() {
        Err(LifecycleError::Readiness(timeout)) => assert_eq!(timeout.reason, WaitAbort::Cancelled),
        other => panic!("expected a cancelled wait, got {:?}", other),
    }
    assert_eq!(broker.state(), BrokerState::TornDown);
}

#[test]
fn lease_releases_trigger_teardown() {
    fixture_logging::init_test_subscriber();
    let broker = Broker::for_spec(kv_spec("leased", Duration::from_secs(5)), KvDriver::default())
        .with_expected_consumers(2);

    let first = broker.lease().unwrap();
    let second = broker.lease().unwrap();
    first.set("shared", "yes").unwrap();
    assert_eq!(second.get("shared").unwrap().as_deref(), Some("yes"));

    drop(first);
    assert_eq!(broker.state(), BrokerState::Ready);
    drop(second);
    assert_eq!(broker.state(), BrokerState::TornDown);
    assert!(broker.lease().is_err());
}
