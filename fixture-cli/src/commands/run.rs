use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use fixture_broker::{CaseOutcome, ConnectionHandle, RunReport, TestRun};
use fixture_config::FixtureConfig;
use fixture_core::command_stream::run_inheriting;
use fixture_core::driver::TcpDriver;
use fixture_core::{fx_error, fx_info, fx_progress, fx_success, fx_warning};

use super::hint_for;

/// Provision the fixture, run `command` as the single test case, tear down.
pub fn handle_run(
    file: &Path,
    deadline: Option<u64>,
    report_path: Option<&Path>,
    command: &[String],
) -> Result<i32> {
    let config = FixtureConfig::load(file)?;
    let (program, program_args) = command
        .split_first()
        .context("No command given after '--'")?;
    let program = program.clone();
    let program_args = program_args.to_vec();

    fx_progress!(
        "Starting fixture '{}' from {} ({} backend)",
        config.fixture.name,
        config.fixture.image,
        config.fixture.backend
    );

    let mut run = TestRun::new(config.fixture, TcpDriver::default()).with_settings(config.run);
    if let Some(secs) = deadline {
        run = run.with_deadline(Duration::from_secs(secs));
    }
    let report = run
        .case(command.join(" "), move |ctx| {
            let envs = fixture_env(ctx.handle());
            fx_progress!("Running '{}' against {}", ctx.name(), ctx.endpoint());
            let code = run_inheriting(&program, &program_args, &envs)?;
            anyhow::ensure!(code == 0, "command exited with status {}", code);
            Ok(())
        })
        .execute();

    print_report(&report);
    if let Some(path) = report_path {
        let json = serde_json::to_string_pretty(&report)?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
        fx_info!("Report written to {}", path.display());
    }
    Ok(report.exit_code())
}

/// Environment handed to the command: the primary endpoint plus one
/// `FIXTURE_PORT_<container port>` per published port.
pub fn fixture_env<H>(handle: &ConnectionHandle<H>) -> Vec<(String, String)> {
    let primary = handle.endpoint();
    let mut envs = vec![
        ("FIXTURE_HOST".to_string(), primary.host.clone()),
        ("FIXTURE_PORT".to_string(), primary.port.to_string()),
        ("FIXTURE_ENDPOINT".to_string(), primary.address()),
    ];
    for endpoint in handle.endpoints() {
        envs.push((
            format!("FIXTURE_PORT_{}", endpoint.container_port),
            endpoint.port.to_string(),
        ));
    }
    envs
}

fn print_report(report: &RunReport) {
    if let Some(error) = &report.setup_error {
        fx_error!("{}", error);
        if let Some(hint) = hint_for(error) {
            fixture_core::fx_error_hint!("{}", hint);
        }
    }
    for case in &report.cases {
        match &case.outcome {
            CaseOutcome::Passed => fx_success!("{} ({} ms)", case.name, case.duration_ms),
            CaseOutcome::Failed(reason) => fx_error!("{}: {}", case.name, reason),
            CaseOutcome::Skipped(reason) => fx_warning!("{} skipped: {}", case.name, reason),
        }
    }
    if !report.teardown_completed {
        fx_warning!("Teardown did not complete; run 'fixture prune' to clean up");
    }
    fx_info!("{}", report.summary());
}
