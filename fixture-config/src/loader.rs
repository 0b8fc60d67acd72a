//! Loading fixture configuration files.
//!
//! A configuration file describes one fixture and how the run around it is
//! driven:
//!
//! ```yaml
//! fixture:
//!   name: kv
//!   backend: local
//!   image: local/kv
//!   ports: [7070]
//!   init:
//!     scripts: [seed.kv]
//!   readiness:
//!     kind: tcp
//!     timeout_ms: 10000
//! run:
//!   workers: 2
//!   deadline_secs: 600
//! ```
//!
//! Relative init script paths are resolved against the file's directory.
//! Environment variables override the file (see [`FixtureConfig::apply_env_overrides`]).

use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use fixture_core::error::{FixtureError, Result};
use serde::{Deserialize, Serialize};
use serde_yaml_ng as serde_yaml;
use tracing::debug;

use crate::spec::FixtureSpec;
use crate::validator::collect_problems;

/// Whether test cases share one fixture or each get their own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SharingScope {
    /// One provisioning, one teardown, one handle for every test case.
    #[default]
    Shared,
    /// A full setup/teardown cycle around each test case.
    Isolated,
}

fn default_workers() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSettings {
    /// Overall run deadline; pending readiness waits are cancelled when it
    /// passes and cases that have not started are skipped.
    #[serde(default)]
    pub deadline_secs: Option<u64>,
    /// Test cases executed concurrently.
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub sharing: SharingScope,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            deadline_secs: None,
            workers: default_workers(),
            sharing: SharingScope::default(),
        }
    }
}

impl RunSettings {
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureConfig {
    pub fixture: FixtureSpec,
    #[serde(default)]
    pub run: RunSettings,
}

impl FixtureConfig {
    /// Load, resolve, override from the environment, and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let config = Self::read(path)?;
        config.validate()?;

        debug!(
            "Loaded fixture '{}' ({} backend) from {}",
            config.fixture.name,
            config.fixture.backend,
            path.display()
        );
        Ok(config)
    }

    /// Like [`FixtureConfig::load`] but without validation, so every problem
    /// can be reported at once with [`FixtureConfig::problems`].
    pub fn read(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            FixtureError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let mut config: FixtureConfig = serde_yaml::from_str(&content).map_err(|e| {
            FixtureError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;

        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Parse without touching the filesystem or the environment.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: FixtureConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Every validation problem, fixture and run settings alike.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = collect_problems(&self.fixture);
        if self.run.workers == 0 {
            problems.push("run.workers must be at least 1".to_string());
        }
        if self.run.deadline_secs == Some(0) {
            problems.push("run.deadline_secs must be greater than 0".to_string());
        }
        problems
    }

    pub fn validate(&self) -> Result<()> {
        let problems = self.problems();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(FixtureError::Config(format!(
                "Invalid fixture '{}':\n  - {}",
                self.fixture.name,
                problems.join("\n  - ")
            )))
        }
    }

    fn resolve_paths(&mut self, base: &Path) {
        for script in &mut self.fixture.init.scripts {
            if script.is_relative() {
                *script = base.join(&*script);
            }
        }
    }

    /// Apply `FIXTURE_STARTUP_TIMEOUT_SECS`, `FIXTURE_READINESS_TIMEOUT_SECS`,
    /// `FIXTURE_RUN_DEADLINE_SECS` and `FIXTURE_WORKERS`.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(secs) = env_u64("FIXTURE_STARTUP_TIMEOUT_SECS")? {
            self.fixture.startup_timeout_secs = secs;
        }
        if let Some(secs) = env_u64("FIXTURE_READINESS_TIMEOUT_SECS")? {
            self.fixture.readiness.timeout_ms = secs.saturating_mul(1000);
        }
        if let Some(secs) = env_u64("FIXTURE_RUN_DEADLINE_SECS")? {
            self.run.deadline_secs = Some(secs);
        }
        if let Some(workers) = env_u64("FIXTURE_WORKERS")? {
            self.run.workers = usize::try_from(workers).unwrap_or(usize::MAX);
        }
        Ok(())
    }
}

fn env_u64(name: &str) -> Result<Option<u64>> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| {
                FixtureError::Config(format!("{} must be an integer, got '{}'", name, raw))
            }),
        Err(_) => Ok(None),
    }
}
