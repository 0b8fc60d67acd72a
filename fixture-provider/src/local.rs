//! Local backend: fixtures hosted inside the test process.
//!
//! Only one engine exists today, `local/kv`, the line-protocol store from
//! `fixture-kv`. The backend honours two environment knobs from the spec so
//! that slow and crashing dependencies can be reproduced without containers:
//!
//! - `KV_STARTUP_DELAY_MS`: refuse connections for this long after start
//! - `KV_EXIT_AFTER_MS`: stop the engine after this long

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use fixture_config::{FixtureSpec, InitSpec};
use fixture_core::command_stream::CommandOutput;
use fixture_core::error::{FixtureError, ProvisionError, ProvisionErrorKind, Result};
use fixture_kv::{load_script, KvServer, Request, Response, ServerConfig};
use tracing::debug;
use uuid::Uuid;

use crate::{PortMapping, Sandbox, SandboxInstance};

pub const KV_IMAGE: &str = "local/kv";
/// Container port reported when a `local/kv` spec lists no ports.
pub const KV_DEFAULT_PORT: u16 = 7070;

#[derive(Default)]
pub struct LocalSandbox {
    engines: Mutex<HashMap<String, Arc<KvServer>>>,
}

impl LocalSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn engines(&self) -> MutexGuard<'_, HashMap<String, Arc<KvServer>>> {
        self.engines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn engine(&self, id: &str) -> Option<Arc<KvServer>> {
        self.engines().get(id).cloned()
    }

    fn require(&self, id: &str) -> Result<Arc<KvServer>> {
        self.engine(id)
            .ok_or_else(|| FixtureError::Sandbox(format!("no local engine '{}'", id)))
    }
}

fn env_millis(
    spec: &FixtureSpec,
    key: &str,
) -> std::result::Result<Option<Duration>, ProvisionError> {
    match spec.env.get(key) {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|_| {
                ProvisionError::new(
                    ProvisionErrorKind::StartFailed,
                    &spec.name,
                    format!("{} must be a number of milliseconds, got '{}'", key, raw),
                )
            }),
        None => Ok(None),
    }
}

/// Build the engine configuration a spec describes.
pub fn server_config(spec: &FixtureSpec) -> std::result::Result<ServerConfig, ProvisionError> {
    let image = spec.image_ref();
    if image.repository != KV_IMAGE {
        return Err(ProvisionError::new(
            ProvisionErrorKind::ImagePullFailed,
            &spec.name,
            format!("unknown local engine '{}' (available: {})", image, KV_IMAGE),
        ));
    }
    if spec.ports.len() > 1 {
        return Err(ProvisionError::new(
            ProvisionErrorKind::StartFailed,
            &spec.name,
            format!("{} publishes a single port, {} requested", KV_IMAGE, spec.ports.len()),
        ));
    }

    let mut config = ServerConfig::default();
    if let Some(delay) = env_millis(spec, "KV_STARTUP_DELAY_MS")? {
        config = config.with_startup_delay(delay);
    }
    if let Some(after) = env_millis(spec, "KV_EXIT_AFTER_MS")? {
        config = config.with_exit_after(after);
    }
    for (key, value) in &spec.init.seed {
        config = config.with_seed(key.clone(), value.clone());
    }
    Ok(config)
}

fn run_request(server: &KvServer, line: &str) -> CommandOutput {
    match Request::parse(line) {
        Ok(request) => match server.store().apply(&request) {
            Response::Err(message) => failed(message),
            response => CommandOutput {
                code: Some(0),
                success: true,
                stdout: format!("{}\n", response),
                ..CommandOutput::default()
            },
        },
        Err(message) => failed(message),
    }
}

fn failed(message: String) -> CommandOutput {
    CommandOutput {
        code: Some(1),
        success: false,
        stderr: message,
        ..CommandOutput::default()
    }
}

impl Sandbox for LocalSandbox {
    fn name(&self) -> &'static str {
        "local"
    }

    fn start(
        &self,
        spec: &FixtureSpec,
        _run_id: &str,
    ) -> std::result::Result<SandboxInstance, ProvisionError> {
        let config = server_config(spec)?;
        if spec.host_port_range.is_some() {
            debug!("host_port_range is ignored by the local backend");
        }

        let server = KvServer::start(config).map_err(|e| {
            ProvisionError::new(ProvisionErrorKind::StartFailed, &spec.name, e.to_string())
        })?;

        let short = Uuid::new_v4().simple().to_string();
        let id = format!("local-{}", short);
        let instance = SandboxInstance {
            id: id.clone(),
            name: format!("{}-{}", spec.name, &short[..12]),
            fixture: spec.name.clone(),
            host: server.local_addr().ip().to_string(),
            ports: vec![PortMapping {
                container_port: spec.primary_port().unwrap_or(KV_DEFAULT_PORT),
                host_port: server.port(),
            }],
        };

        debug!("Started {} engine {} on {}", KV_IMAGE, id, server.local_addr());
        self.engines().insert(id, Arc::new(server));
        Ok(instance)
    }

    fn initialize(
        &self,
        instance: &SandboxInstance,
        init: &InitSpec,
    ) -> std::result::Result<(), ProvisionError> {
        let init_failed = |message: String| {
            ProvisionError::new(ProvisionErrorKind::InitScriptFailed, &instance.fixture, message)
        };
        let server = self
            .engine(&instance.id)
            .ok_or_else(|| init_failed(format!("engine {} is gone", instance.id)))?;

        for script in &init.scripts {
            let requests = load_script(script)
                .map_err(|e| init_failed(format!("{}: {}", script.display(), e)))?;
            for request in &requests {
                server.store().apply(request);
            }
            debug!("Applied {} ({} commands)", script.display(), requests.len());
        }

        for command in &init.exec {
            let output = run_request(&server, &command.join(" "));
            if !output.success {
                return Err(init_failed(format!(
                    "'{}' failed: {}",
                    command.join(" "),
                    output.stderr
                )));
            }
        }
        Ok(())
    }

    fn logs(&self, id: &str) -> Result<Vec<String>> {
        Ok(self.require(id)?.logs())
    }

    fn is_running(&self, id: &str) -> Result<bool> {
        Ok(self.engine(id).is_some_and(|server| server.is_running()))
    }

    fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.engines().contains_key(id))
    }

    fn exec(&self, id: &str, cmd: &[String]) -> Result<CommandOutput> {
        let server = self.require(id)?;
        Ok(run_request(&server, &cmd.join(" ")))
    }

    fn stop(&self, id: &str) -> Result<()> {
        let removed = self.engines().remove(id);
        if let Some(server) = removed {
            server.stop();
        }
        Ok(())
    }
}
