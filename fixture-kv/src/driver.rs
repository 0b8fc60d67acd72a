use std::time::Duration;

use fixture_core::driver::{Driver, Endpoint};
use fixture_core::error::Result;

use crate::client::KvClient;

/// Opens a pooled [`KvClient`] against a fixture endpoint.
#[derive(Debug, Clone)]
pub struct KvDriver {
    timeout: Duration,
}

impl KvDriver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for KvDriver {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl Driver for KvDriver {
    type Handle = KvClient;

    fn name(&self) -> &str {
        "kv"
    }

    fn open(&self, endpoint: &Endpoint) -> Result<KvClient> {
        KvClient::connect(endpoint.socket_addr()?, self.timeout)
    }

    fn ping(&self, handle: &KvClient) -> Result<()> {
        handle.ping()
    }
}
