// Command handlers for fixture operations

use anyhow::Result;
use fixture_broker::Broker;
use fixture_core::driver::Driver;
use fixture_core::error::{LifecycleError, ProvisionErrorKind};
use fixture_core::{fx_error_hint, fx_println};
use tracing::debug;

use crate::cli::{Args, Command};

pub mod check;
pub mod prune;
pub mod run;
pub mod validate;

/// Main command dispatcher. Returns the process exit code.
#[must_use = "command exit codes should be propagated"]
pub fn execute_command(args: Args) -> Result<i32> {
    match args.command {
        Command::Validate { file } => {
            debug!("Handling validate command");
            validate::handle_validate(&file)
        }
        Command::Check { file } => {
            debug!("Handling check command");
            check::handle_check(&file)
        }
        Command::Run {
            file,
            deadline,
            report,
            command,
        } => {
            debug!("Handling run command");
            run::handle_run(&file, deadline, report.as_deref(), &command)
        }
        Command::Prune { run } => {
            debug!("Handling prune command");
            prune::handle_prune(run.as_deref())
        }
    }
}

/// A next step for the user after a setup failure, when one is obvious.
pub(crate) fn hint_for(error: &LifecycleError) -> Option<&'static str> {
    match error {
        LifecycleError::Provision(e) => match e.kind {
            ProvisionErrorKind::SandboxUnavailable => {
                Some("Is Docker installed and running? Try 'docker info'.")
            }
            ProvisionErrorKind::ImagePullFailed => {
                Some("Check the image name and that the registry is reachable.")
            }
            ProvisionErrorKind::StartTimeout => {
                Some("Raise startup_timeout_secs or pull the image beforehand.")
            }
            ProvisionErrorKind::InitScriptFailed => {
                Some("Fix the init script and run 'fixture check' again.")
            }
            ProvisionErrorKind::StartFailed | ProvisionErrorKind::Duplicate => None,
        },
        LifecycleError::Readiness(_) => {
            Some("Raise readiness.timeout_ms or check the fixture logs above.")
        }
        LifecycleError::NotReady(_) => None,
    }
}

const LOG_TAIL: usize = 10;

/// Print the hint and the last log lines of a fixture that failed setup.
pub(crate) fn explain_failure<D: Driver>(broker: &Broker<D>, error: &LifecycleError) {
    if let Some(fixture) = broker.fixture() {
        if let Ok(lines) = fixture.logs() {
            if !lines.is_empty() {
                fx_println!("Last log lines of '{}':", fixture.name());
                for line in lines.iter().skip(lines.len().saturating_sub(LOG_TAIL)) {
                    fx_println!("  | {}", line);
                }
            }
        }
    }
    if let Some(hint) = hint_for(error) {
        fx_error_hint!("{}", hint);
    }
}
