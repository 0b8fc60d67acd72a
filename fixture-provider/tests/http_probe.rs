//! HTTP health probes against a real HTTP server.
//!
//! The server runs on its own tokio runtime; the sandbox below only reports
//! where it listens.

use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use fixture_config::{FixtureSpec, InitSpec};
use fixture_core::command_stream::CommandOutput;
use fixture_core::driver::TcpDriver;
use fixture_core::error::{ProvisionError, Result, WaitAbort};
use fixture_provider::{
    FixtureStatus, PortMapping, Provisioner, ReadinessGate, ReadinessProbe, Sandbox,
    SandboxInstance,
};

fn spawn_health_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let port = listener.local_addr().unwrap().port();

    thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            let app = Router::new()
                .route("/health", get(|| async { StatusCode::NO_CONTENT }))
                .route("/", get(|| async { "ok" }));
            axum::serve(listener, app).await.unwrap();
        });
    });
    port
}

/// Reports an already running server as the fixture.
struct ExternalSandbox {
    host_port: u16,
}

impl Sandbox for ExternalSandbox {
    fn name(&self) -> &'static str {
        "external"
    }

    fn start(
        &self,
        spec: &FixtureSpec,
        _run_id: &str,
    ) -> std::result::Result<SandboxInstance, ProvisionError> {
        Ok(SandboxInstance {
            id: "external-1".into(),
            name: spec.name.clone(),
            fixture: spec.name.clone(),
            host: "127.0.0.1".into(),
            ports: vec![PortMapping {
                container_port: 8080,
                host_port: self.host_port,
            }],
        })
    }

    fn initialize(
        &self,
        _instance: &SandboxInstance,
        _init: &InitSpec,
    ) -> std::result::Result<(), ProvisionError> {
        Ok(())
    }

    fn logs(&self, _id: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn is_running(&self, _id: &str) -> Result<bool> {
        Ok(true)
    }

    fn exists(&self, _id: &str) -> Result<bool> {
        Ok(true)
    }

    fn exec(&self, _id: &str, _cmd: &[String]) -> Result<CommandOutput> {
        Ok(CommandOutput::default())
    }

    fn stop(&self, _id: &str) -> Result<()> {
        Ok(())
    }
}

fn provision(name: &str) -> (Provisioner, fixture_provider::ProvisionedFixture) {
    let port = spawn_health_server();
    let provisioner = Provisioner::with_sandbox(Arc::new(ExternalSandbox { host_port: port }));
    let fixture = provisioner
        .provision(Arc::new(FixtureSpec::new(name, "example/web").with_port(8080)))
        .unwrap();
    (provisioner, fixture)
}

#[test]
fn http_probe_accepts_expected_status() {
    fixture_logging::init_test_subscriber();
    let (provisioner, fixture) = provision("web");
    let probe = ReadinessProbe::http("/health")
        .expect_status(204)
        .on_port(8080)
        .with_timeout(Duration::from_secs(5))
        .with_poll_interval(Duration::from_millis(100));

    ReadinessGate::new()
        .wait_until_ready(&fixture, &probe, &TcpDriver::default())
        .unwrap();
    assert_eq!(fixture.status(), FixtureStatus::Ready);
    provisioner.terminate_all();
}

#[test]
fn http_probe_reports_wrong_status() {
    fixture_logging::init_test_subscriber();
    let (provisioner, fixture) = provision("web-missing");
    let probe = ReadinessProbe::http("/missing")
        .with_timeout(Duration::from_millis(800))
        .with_poll_interval(Duration::from_millis(100));

    let err = ReadinessGate::new()
        .wait_until_ready(&fixture, &probe, &TcpDriver::default())
        .unwrap_err();
    assert_eq!(err.reason, WaitAbort::Deadline);
    assert!(err.last_observed.contains("404"), "{}", err.last_observed);
    provisioner.terminate_all();
}
