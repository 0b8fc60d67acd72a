//! Static checks on a [`FixtureSpec`] before anything is provisioned.
//!
//! All problems are collected and reported together so a broken spec can be
//! fixed in one pass.

use std::collections::HashSet;

use fixture_core::error::{FixtureError, Result};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::ports::PortRange;
use crate::spec::{BackendKind, FixtureSpec, ProbeKind};

// Names end up in container names and labels.
static NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").expect("valid regex literal"));

pub fn validate_spec(spec: &FixtureSpec) -> Result<()> {
    let problems = collect_problems(spec);
    if problems.is_empty() {
        Ok(())
    } else {
        Err(FixtureError::Config(format!(
            "Invalid fixture '{}':\n  - {}",
            spec.name,
            problems.join("\n  - ")
        )))
    }
}

pub fn collect_problems(spec: &FixtureSpec) -> Vec<String> {
    let mut problems = Vec::new();

    if !NAME_PATTERN.is_match(&spec.name) {
        problems.push(format!(
            "name '{}' must start with a letter or digit and contain only letters, digits, '_', '.' or '-'",
            spec.name
        ));
    }
    if spec.image.trim().is_empty() {
        problems.push("image must not be empty".to_string());
    }

    let mut seen = HashSet::new();
    for port in &spec.ports {
        if *port == 0 {
            problems.push("ports must be non-zero container ports".to_string());
        } else if !seen.insert(*port) {
            problems.push(format!("port {} is listed more than once", port));
        }
    }

    for key in spec.env.keys() {
        if key.is_empty() || key.contains('=') {
            problems.push(format!("invalid environment variable name '{}'", key));
        }
    }

    check_probe(spec, &mut problems);

    if spec.startup_timeout_secs == 0 {
        problems.push("startup_timeout_secs must be greater than 0".to_string());
    }
    if spec.pull_timeout_secs == 0 {
        problems.push("pull_timeout_secs must be greater than 0".to_string());
    }

    if let Some(raw) = &spec.host_port_range {
        match PortRange::parse(raw) {
            Ok(range) if range.size() < spec.ports.len() as u32 => problems.push(format!(
                "host_port_range {} is smaller than the {} published ports",
                range,
                spec.ports.len()
            )),
            Ok(_) => {}
            Err(e) => problems.push(e.to_string()),
        }
    }

    if spec.backend == BackendKind::Docker && !spec.init.seed.is_empty() {
        problems.push("init.seed is only supported by the local backend".to_string());
    }
    if spec.init.exec.iter().any(|cmd| cmd.is_empty()) {
        problems.push("init.exec entries must not be empty commands".to_string());
    }

    problems
}

fn check_probe(spec: &FixtureSpec, problems: &mut Vec<String>) {
    let probe = &spec.readiness;

    if probe.timeout_ms == 0 {
        problems.push("readiness.timeout_ms must be greater than 0".to_string());
    }
    if probe.poll_interval_ms == 0 {
        problems.push("readiness.poll_interval_ms must be greater than 0".to_string());
    } else if probe.poll_interval_ms > probe.timeout_ms {
        problems.push("readiness.poll_interval_ms must not exceed timeout_ms".to_string());
    }

    let check_port = |port: &Option<u16>, problems: &mut Vec<String>| match port {
        Some(p) if !spec.ports.contains(p) => problems.push(format!(
            "readiness probe targets port {} which is not in ports",
            p
        )),
        None if spec.ports.is_empty() => {
            problems.push("readiness probe needs at least one published port".to_string())
        }
        _ => {}
    };

    match &probe.kind {
        ProbeKind::Tcp { port } => check_port(port, problems),
        ProbeKind::Http { port, path, status } => {
            check_port(port, problems);
            if !path.starts_with('/') {
                problems.push(format!("readiness path '{}' must start with '/'", path));
            }
            if let Some(s) = status {
                if !(100..=599).contains(s) {
                    problems.push(format!("readiness status {} is not an HTTP status", s));
                }
            }
        }
        ProbeKind::Log {
            pattern,
            occurrences,
        } => {
            if let Err(e) = Regex::new(pattern) {
                problems.push(format!("readiness pattern does not compile: {}", e));
            }
            if *occurrences == 0 {
                problems.push("readiness occurrences must be at least 1".to_string());
            }
        }
    }
}
