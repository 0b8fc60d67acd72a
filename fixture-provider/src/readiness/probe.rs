use std::fmt;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use fixture_config::{ProbeKind, ProbeSpec};
use fixture_core::driver::Endpoint;
use fixture_core::error::{FixtureError, Result};
use regex::Regex;

use crate::provisioner::ProvisionedFixture;

/// Result of a single probe evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Ready,
    NotYetReady(String),
    /// The dependency can never become ready; stop waiting.
    PermanentlyFailed(String),
}

/// Caller-supplied readiness strategy.
pub trait ReadinessCheck: Send + Sync {
    fn describe(&self) -> String;

    fn evaluate(&self, fixture: &ProvisionedFixture) -> ProbeOutcome;
}

/// The predicate a probe evaluates.
#[derive(Clone)]
pub enum ProbeCheck {
    /// A TCP connection to the mapped port succeeds.
    TcpAccept { port: Option<u16> },
    /// The sandbox log matches `regex` at least `occurrences` times.
    LogPattern { regex: Regex, occurrences: usize },
    /// An HTTP GET answers with `status`, or any 2xx when unset.
    HttpHealth {
        port: Option<u16>,
        path: String,
        status: Option<u16>,
    },
    Custom(Arc<dyn ReadinessCheck>),
}

impl fmt::Debug for ProbeCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeCheck::TcpAccept { port } => {
                f.debug_struct("TcpAccept").field("port", port).finish()
            }
            ProbeCheck::LogPattern { regex, occurrences } => f
                .debug_struct("LogPattern")
                .field("regex", &regex.as_str())
                .field("occurrences", occurrences)
                .finish(),
            ProbeCheck::HttpHealth { port, path, status } => f
                .debug_struct("HttpHealth")
                .field("port", port)
                .field("path", path)
                .field("status", status)
                .finish(),
            ProbeCheck::Custom(check) => f.debug_tuple("Custom").field(&check.describe()).finish(),
        }
    }
}

/// A readiness predicate with its time bounds. Holds no state between
/// evaluations.
#[derive(Debug, Clone)]
pub struct ReadinessProbe {
    pub check: ProbeCheck,
    pub timeout: Duration,
    pub poll_interval: Duration,
}

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);
const MIN_ATTEMPT: Duration = Duration::from_millis(50);
const MAX_ATTEMPT: Duration = Duration::from_secs(2);

impl ReadinessProbe {
    pub fn new(check: ProbeCheck) -> Self {
        Self {
            check,
            timeout: DEFAULT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn tcp() -> Self {
        Self::new(ProbeCheck::TcpAccept { port: None })
    }

    pub fn log(pattern: &str, occurrences: usize) -> Result<Self> {
        let regex = Regex::new(pattern).map_err(|e| {
            FixtureError::Config(format!("Invalid log pattern '{}': {}", pattern, e))
        })?;
        Ok(Self::new(ProbeCheck::LogPattern { regex, occurrences }))
    }

    pub fn http(path: impl Into<String>) -> Self {
        Self::new(ProbeCheck::HttpHealth {
            port: None,
            path: path.into(),
            status: None,
        })
    }

    pub fn custom(check: Arc<dyn ReadinessCheck>) -> Self {
        Self::new(ProbeCheck::Custom(check))
    }

    pub fn from_spec(spec: &ProbeSpec) -> Result<Self> {
        let probe = match &spec.kind {
            ProbeKind::Tcp { port } => Self::new(ProbeCheck::TcpAccept { port: *port }),
            ProbeKind::Log {
                pattern,
                occurrences,
            } => Self::log(pattern, *occurrences)?,
            ProbeKind::Http { port, path, status } => Self::new(ProbeCheck::HttpHealth {
                port: *port,
                path: path.clone(),
                status: *status,
            }),
        };
        Ok(probe
            .with_timeout(spec.timeout())
            .with_poll_interval(spec.poll_interval()))
    }

    /// Probe a specific container port instead of the primary one.
    pub fn on_port(mut self, container_port: u16) -> Self {
        match &mut self.check {
            ProbeCheck::TcpAccept { port } | ProbeCheck::HttpHealth { port, .. } => {
                *port = Some(container_port)
            }
            ProbeCheck::LogPattern { .. } | ProbeCheck::Custom(_) => {}
        }
        self
    }

    pub fn expect_status(mut self, expected: u16) -> Self {
        if let ProbeCheck::HttpHealth { status, .. } = &mut self.check {
            *status = Some(expected);
        }
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn describe(&self) -> String {
        match &self.check {
            ProbeCheck::TcpAccept { port: Some(p) } => format!("tcp accept on {}", p),
            ProbeCheck::TcpAccept { port: None } => "tcp accept".to_string(),
            ProbeCheck::LogPattern { regex, occurrences } => {
                format!("log /{}/ x{}", regex.as_str(), occurrences)
            }
            ProbeCheck::HttpHealth { path, status, .. } => match status {
                Some(s) => format!("http GET {} -> {}", path, s),
                None => format!("http GET {} -> 2xx", path),
            },
            ProbeCheck::Custom(check) => check.describe(),
        }
    }

    /// Per-attempt network timeout, so one attempt never outlasts a poll.
    fn attempt_timeout(&self) -> Duration {
        self.poll_interval.clamp(MIN_ATTEMPT, MAX_ATTEMPT)
    }

    pub fn evaluate(&self, fixture: &ProvisionedFixture) -> ProbeOutcome {
        self.evaluate_within(fixture, self.attempt_timeout())
    }

    /// Evaluate with network attempts capped at `budget` as well as at the
    /// per-attempt timeout.
    pub fn evaluate_within(&self, fixture: &ProvisionedFixture, budget: Duration) -> ProbeOutcome {
        let attempt = self.attempt_timeout().min(budget);
        match &self.check {
            ProbeCheck::TcpAccept { port } => match target(fixture, *port) {
                Ok(endpoint) => tcp_accept(&endpoint, attempt),
                Err(outcome) => outcome,
            },
            ProbeCheck::LogPattern { regex, occurrences } => match fixture.logs() {
                Ok(lines) => {
                    let seen = lines.iter().filter(|line| regex.is_match(line)).count();
                    if seen >= *occurrences {
                        ProbeOutcome::Ready
                    } else {
                        ProbeOutcome::NotYetReady(format!(
                            "pattern seen {}/{} times",
                            seen, occurrences
                        ))
                    }
                }
                Err(e) => ProbeOutcome::NotYetReady(format!("logs unavailable: {}", e)),
            },
            ProbeCheck::HttpHealth { port, path, status } => match target(fixture, *port) {
                Ok(endpoint) => http_health(&endpoint, path, *status, attempt),
                Err(outcome) => outcome,
            },
            ProbeCheck::Custom(check) => check.evaluate(fixture),
        }
    }

}

fn tcp_accept(endpoint: &Endpoint, attempt: Duration) -> ProbeOutcome {
    let addr = match endpoint.socket_addr() {
        Ok(addr) => addr,
        Err(e) => return ProbeOutcome::PermanentlyFailed(e.to_string()),
    };
    match TcpStream::connect_timeout(&addr, attempt) {
        Ok(_) => ProbeOutcome::Ready,
        Err(e) => ProbeOutcome::NotYetReady(format!("connect to {}: {}", endpoint, e)),
    }
}

fn http_health(
    endpoint: &Endpoint,
    path: &str,
    expected: Option<u16>,
    attempt: Duration,
) -> ProbeOutcome {
    let client = match reqwest::blocking::Client::builder().timeout(attempt).build() {
        Ok(client) => client,
        Err(e) => return ProbeOutcome::PermanentlyFailed(format!("http client: {}", e)),
    };
    let url = format!("{}{}", endpoint.url("http"), path);
    match client.get(&url).send() {
        Ok(response) => {
            let status = response.status();
            let ok = match expected {
                Some(code) => status.as_u16() == code,
                None => status.is_success(),
            };
            if ok {
                ProbeOutcome::Ready
            } else {
                ProbeOutcome::NotYetReady(format!("GET {} returned {}", url, status))
            }
        }
        Err(e) => ProbeOutcome::NotYetReady(format!("GET {}: {}", url, e)),
    }
}

fn target(
    fixture: &ProvisionedFixture,
    port: Option<u16>,
) -> std::result::Result<Endpoint, ProbeOutcome> {
    let endpoint = match port {
        Some(p) => fixture.endpoint_for(p),
        None => fixture.endpoint(),
    };
    endpoint.ok_or_else(|| {
        ProbeOutcome::PermanentlyFailed(match port {
            Some(p) => format!("container port {} is not published", p),
            None => "fixture publishes no ports".to_string(),
        })
    })
}
