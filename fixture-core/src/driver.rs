//! Client-side view of a provisioned dependency.
//!
//! An [`Endpoint`] is where a fixture can be reached from the host. A
//! [`Driver`] knows how to turn an endpoint into a live client handle and how
//! to check that handle is usable; the readiness gate uses the driver as the
//! final step before declaring a fixture ready.

use std::fmt;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::error::{FixtureError, Result};

/// Host address of a fixture, with the container port it maps to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub container_port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, container_port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            container_port,
        }
    }

    /// `host:port`, suitable for `TcpStream::connect`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Build a URL such as `postgres://127.0.0.1:49153` or `http://127.0.0.1:8080`.
    pub fn url(&self, scheme: &str) -> String {
        format!("{}://{}:{}", scheme, self.host, self.port)
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.address()
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| FixtureError::Config(format!("Unresolvable endpoint: {}", self)))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Dependency client capability: `open(endpoint) -> handle`, `ping(handle)`.
///
/// Handles are shared by every test case of a run, so they must be safe to
/// use from several threads at once (pool connections internally if needed).
/// Drivers are cloned onto a helper thread while the readiness gate waits on
/// them, so keep them cheap to clone.
pub trait Driver: Clone + Send + Sync + 'static {
    type Handle: Send + Sync + 'static;

    /// Short name used in logs and diagnostics.
    fn name(&self) -> &str;

    fn open(&self, endpoint: &Endpoint) -> Result<Self::Handle>;

    fn ping(&self, handle: &Self::Handle) -> Result<()>;
}

/// Driver for dependencies that only need a reachable TCP port. The handle is
/// the endpoint itself.
#[derive(Debug, Clone)]
pub struct TcpDriver {
    connect_timeout: Duration,
}

impl TcpDriver {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpDriver {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

impl Driver for TcpDriver {
    type Handle = Endpoint;

    fn name(&self) -> &str {
        "tcp"
    }

    fn open(&self, endpoint: &Endpoint) -> Result<Endpoint> {
        Ok(endpoint.clone())
    }

    fn ping(&self, handle: &Endpoint) -> Result<()> {
        let addr = handle.socket_addr()?;
        TcpStream::connect_timeout(&addr, self.connect_timeout)?;
        Ok(())
    }
}
