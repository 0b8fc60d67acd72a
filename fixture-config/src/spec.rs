//! The description of a disposable dependency.
//!
//! A [`FixtureSpec`] is built once per run (from YAML or with the builder
//! methods), validated, and then shared read-only as `Arc<FixtureSpec>`.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Which sandbox runtime hosts the fixture.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// A container started through the `docker` CLI.
    #[default]
    Docker,
    /// An engine hosted inside the test process (e.g. `local/kv`).
    Local,
    /// Scripted in-memory sandbox, only available with `test-helpers`.
    Mock,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Docker => f.write_str("docker"),
            BackendKind::Local => f.write_str("local"),
            BackendKind::Mock => f.write_str("mock"),
        }
    }
}

/// `repository[:tag]`, tag defaulting to `latest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub repository: String,
    pub tag: String,
}

impl ImageRef {
    pub fn parse(image: &str) -> Self {
        let image = image.trim();
        // A colon before the last slash belongs to a registry host:port.
        let last_slash = image.rfind('/').map_or(0, |i| i + 1);
        match image[last_slash..].rfind(':') {
            Some(pos) => {
                let split = last_slash + pos;
                Self {
                    repository: image[..split].to_string(),
                    tag: image[split + 1..].to_string(),
                }
            }
            None => Self {
                repository: image.to_string(),
                tag: "latest".to_string(),
            },
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

fn default_mount_dir() -> String {
    "/docker-entrypoint-initdb.d".to_string()
}

/// Initialization applied while provisioning, before readiness is checked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitSpec {
    /// Script files. Docker mounts them read-only into `mount_dir`; the local
    /// KV engine executes them as command files.
    #[serde(default)]
    pub scripts: Vec<PathBuf>,
    #[serde(default = "default_mount_dir")]
    pub mount_dir: String,
    /// Commands executed inside the sandbox right after it starts.
    #[serde(default)]
    pub exec: Vec<Vec<String>>,
    /// Records written before the local engine accepts connections.
    #[serde(default)]
    pub seed: IndexMap<String, String>,
}

impl Default for InitSpec {
    fn default() -> Self {
        Self {
            scripts: Vec::new(),
            mount_dir: default_mount_dir(),
            exec: Vec::new(),
            seed: IndexMap::new(),
        }
    }
}

impl InitSpec {
    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty() && self.exec.is_empty() && self.seed.is_empty()
    }
}

fn default_occurrences() -> usize {
    1
}

fn default_http_path() -> String {
    "/".to_string()
}

/// The predicate a readiness probe evaluates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProbeKind {
    /// The mapped host port accepts TCP connections.
    Tcp {
        #[serde(default)]
        port: Option<u16>,
    },
    /// The sandbox log contains `pattern` at least `occurrences` times.
    Log {
        pattern: String,
        #[serde(default = "default_occurrences")]
        occurrences: usize,
    },
    /// `GET path` on the mapped port answers with `status` (any 2xx if unset).
    Http {
        #[serde(default)]
        port: Option<u16>,
        #[serde(default = "default_http_path")]
        path: String,
        #[serde(default)]
        status: Option<u16>,
    },
}

fn default_probe_timeout_ms() -> u64 {
    60_000
}

fn default_poll_interval_ms() -> u64 {
    250
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeSpec {
    #[serde(flatten)]
    pub kind: ProbeKind,
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for ProbeSpec {
    fn default() -> Self {
        Self::tcp()
    }
}

impl ProbeSpec {
    fn with_kind(kind: ProbeKind) -> Self {
        Self {
            kind,
            timeout_ms: default_probe_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }

    pub fn tcp() -> Self {
        Self::with_kind(ProbeKind::Tcp { port: None })
    }

    pub fn log(pattern: impl Into<String>, occurrences: usize) -> Self {
        Self::with_kind(ProbeKind::Log {
            pattern: pattern.into(),
            occurrences,
        })
    }

    pub fn http(path: impl Into<String>) -> Self {
        Self::with_kind(ProbeKind::Http {
            port: None,
            path: path.into(),
            status: None,
        })
    }

    /// Probe a specific container port instead of the primary one.
    pub fn on_port(mut self, container_port: u16) -> Self {
        match &mut self.kind {
            ProbeKind::Tcp { port } | ProbeKind::Http { port, .. } => *port = Some(container_port),
            ProbeKind::Log { .. } => {}
        }
        self
    }

    pub fn expect_status(mut self, expected: u16) -> Self {
        if let ProbeKind::Http { status, .. } = &mut self.kind {
            *status = Some(expected);
        }
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = duration_ms(timeout);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = duration_ms(interval);
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Short human-readable description, used in errors and logs.
    pub fn describe(&self) -> String {
        match &self.kind {
            ProbeKind::Tcp { port: Some(p) } => format!("tcp accept on {}", p),
            ProbeKind::Tcp { port: None } => "tcp accept".to_string(),
            ProbeKind::Log {
                pattern,
                occurrences,
            } => format!("log /{}/ x{}", pattern, occurrences),
            ProbeKind::Http { path, status, .. } => match status {
                Some(s) => format!("http GET {} -> {}", path, s),
                None => format!("http GET {} -> 2xx", path),
            },
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn default_startup_timeout_secs() -> u64 {
    120
}

fn default_pull_timeout_secs() -> u64 {
    600
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureSpec {
    pub name: String,
    #[serde(default)]
    pub backend: BackendKind,
    pub image: String,
    /// Container ports to publish on dynamically chosen host ports. The first
    /// one is the primary port.
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default)]
    pub env: IndexMap<String, String>,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub entrypoint: Option<String>,
    #[serde(default)]
    pub init: InitSpec,
    #[serde(default)]
    pub readiness: ProbeSpec,
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
    #[serde(default = "default_pull_timeout_secs")]
    pub pull_timeout_secs: u64,
    /// Restrict host ports to `START-END` instead of any ephemeral port.
    #[serde(default)]
    pub host_port_range: Option<String>,
}

impl FixtureSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            backend: BackendKind::default(),
            image: image.into(),
            ports: Vec::new(),
            env: IndexMap::new(),
            cmd: Vec::new(),
            entrypoint: None,
            init: InitSpec::default(),
            readiness: ProbeSpec::default(),
            startup_timeout_secs: default_startup_timeout_secs(),
            pull_timeout_secs: default_pull_timeout_secs(),
            host_port_range: None,
        }
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.ports.push(port);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_cmd<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cmd = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_init_script(mut self, path: impl Into<PathBuf>) -> Self {
        self.init.scripts.push(path.into());
        self
    }

    pub fn with_init_exec<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.init.exec.push(command.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_seed(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.init.seed.insert(key.into(), value.into());
        self
    }

    pub fn with_readiness(mut self, probe: ProbeSpec) -> Self {
        self.readiness = probe;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn with_host_port_range(mut self, range: impl Into<String>) -> Self {
        self.host_port_range = Some(range.into());
        self
    }

    pub fn primary_port(&self) -> Option<u16> {
        self.ports.first().copied()
    }

    pub fn image_ref(&self) -> ImageRef {
        ImageRef::parse(&self.image)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn pull_timeout(&self) -> Duration {
        Duration::from_secs(self.pull_timeout_secs)
    }
}
