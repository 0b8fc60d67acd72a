use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use fixture_config::{FixtureSpec, InitSpec};
use fixture_core::command_stream::CommandOutput;
use fixture_core::error::{FixtureError, ProvisionError, ProvisionErrorKind, Result};

use crate::{PortMapping, Sandbox, SandboxInstance};

#[derive(Debug, Clone)]
struct MockInstance {
    running: bool,
    logs: Vec<String>,
}

#[derive(Debug, Default)]
struct Script {
    start_failure: Option<(ProvisionErrorKind, String)>,
    init_failure: Option<String>,
    fail_stop: bool,
    logs: Vec<String>,
    host_ports: HashMap<u16, u16>,
}

/// Scripted in-memory sandbox for unit tests.
///
/// Nothing listens on the reported ports unless a test maps a container port
/// onto a listener it owns with [`MockSandbox::with_host_port`].
#[derive(Debug, Default)]
pub struct MockSandbox {
    script: Mutex<Script>,
    instances: Mutex<HashMap<String, MockInstance>>,
    calls: Mutex<Vec<String>>,
    next_id: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_start_failure(self, kind: ProvisionErrorKind, message: impl Into<String>) -> Self {
        lock(&self.script).start_failure = Some((kind, message.into()));
        self
    }

    pub fn with_init_failure(self, message: impl Into<String>) -> Self {
        lock(&self.script).init_failure = Some(message.into());
        self
    }

    pub fn with_stop_failure(self) -> Self {
        lock(&self.script).fail_stop = true;
        self
    }

    /// Log lines every new instance starts with.
    pub fn with_logs<I, S>(self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        lock(&self.script).logs = lines.into_iter().map(Into::into).collect();
        self
    }

    /// Report `host_port` for `container_port` instead of a made-up port.
    pub fn with_host_port(self, container_port: u16, host_port: u16) -> Self {
        lock(&self.script).host_ports.insert(container_port, host_port);
        self
    }

    /// Every backend call made so far, e.g. `start:pg`, `stop:mock-1`.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self, prefix: &str) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn live_instances(&self) -> usize {
        lock(&self.instances).len()
    }

    /// Simulate the sandbox process dying.
    pub fn crash(&self, id: &str) {
        if let Some(instance) = lock(&self.instances).get_mut(id) {
            instance.running = false;
        }
    }

    pub fn push_log(&self, id: &str, line: impl Into<String>) {
        if let Some(instance) = lock(&self.instances).get_mut(id) {
            instance.logs.push(line.into());
        }
    }

    fn record(&self, call: String) {
        lock(&self.calls).push(call);
    }

    fn instance(&self, id: &str) -> Result<MockInstance> {
        lock(&self.instances)
            .get(id)
            .cloned()
            .ok_or_else(|| FixtureError::Sandbox(format!("no mock instance '{}'", id)))
    }
}

impl Sandbox for MockSandbox {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn start(
        &self,
        spec: &FixtureSpec,
        _run_id: &str,
    ) -> std::result::Result<SandboxInstance, ProvisionError> {
        self.record(format!("start:{}", spec.name));
        let script = lock(&self.script);
        if let Some((kind, message)) = &script.start_failure {
            return Err(ProvisionError::new(*kind, &spec.name, message.clone()));
        }

        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("mock-{}", n);
        let ports = spec
            .ports
            .iter()
            .enumerate()
            .map(|(i, &container_port)| PortMapping {
                container_port,
                host_port: script
                    .host_ports
                    .get(&container_port)
                    .copied()
                    .unwrap_or(49_000 + (n * 10 + i) as u16),
            })
            .collect();

        lock(&self.instances).insert(
            id.clone(),
            MockInstance {
                running: true,
                logs: script.logs.clone(),
            },
        );

        Ok(SandboxInstance {
            id: id.clone(),
            name: format!("{}-{}", spec.name, n),
            fixture: spec.name.clone(),
            host: "127.0.0.1".to_string(),
            ports,
        })
    }

    fn initialize(
        &self,
        instance: &SandboxInstance,
        _init: &InitSpec,
    ) -> std::result::Result<(), ProvisionError> {
        self.record(format!("initialize:{}", instance.id));
        match &lock(&self.script).init_failure {
            Some(message) => Err(ProvisionError::new(
                ProvisionErrorKind::InitScriptFailed,
                &instance.fixture,
                message.clone(),
            )),
            None => Ok(()),
        }
    }

    fn logs(&self, id: &str) -> Result<Vec<String>> {
        Ok(self.instance(id)?.logs)
    }

    fn is_running(&self, id: &str) -> Result<bool> {
        Ok(lock(&self.instances).get(id).is_some_and(|i| i.running))
    }

    fn exists(&self, id: &str) -> Result<bool> {
        Ok(lock(&self.instances).contains_key(id))
    }

    fn exec(&self, id: &str, cmd: &[String]) -> Result<CommandOutput> {
        self.instance(id)?;
        self.record(format!("exec:{}:{}", id, cmd.join(" ")));
        Ok(CommandOutput {
            code: Some(0),
            success: true,
            ..CommandOutput::default()
        })
    }

    fn stop(&self, id: &str) -> Result<()> {
        self.record(format!("stop:{}", id));
        lock(&self.instances).remove(id);
        if lock(&self.script).fail_stop {
            return Err(FixtureError::Sandbox("mock stop failure".to_string()));
        }
        Ok(())
    }
}
