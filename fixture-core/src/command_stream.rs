// Standard library
use std::ffi::{OsStr, OsString};
use std::thread;
use std::time::{Duration, Instant};

// External crates
use crate::error::{FixtureError, Result};
use duct::cmd;
use tracing::debug;
use which::which;

/// Captured result of a finished (or killed) child process.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    /// The command was killed because it exceeded its timeout.
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    pub fn stderr_trimmed(&self) -> &str {
        self.stderr.trim()
    }
}

/// Run a command to completion, capturing stdout/stderr.
///
/// A non-zero exit status is not an error here; callers inspect
/// [`CommandOutput::success`]. An error is only returned when the process
/// cannot be spawned. If `timeout` is exceeded the child is killed and the
/// output comes back with `timed_out` set.
pub fn run_command_with_timeout<A: AsRef<OsStr>>(
    command: &str,
    args: &[A],
    timeout: Option<Duration>,
) -> Result<CommandOutput> {
    let handle = cmd(command, os_args(args))
        .stdout_capture()
        .stderr_capture()
        .unchecked()
        .start()
        .map_err(|e| FixtureError::Command(format!("Failed to start '{}': {}", command, e)))?;

    let started = Instant::now();
    loop {
        if let Some(output) = handle.try_wait()? {
            return Ok(CommandOutput {
                code: output.status.code(),
                success: output.status.success(),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                timed_out: false,
            });
        }

        if let Some(limit) = timeout {
            if started.elapsed() >= limit {
                debug!(
                    "Killing '{}' after {:.1}s timeout",
                    command,
                    limit.as_secs_f64()
                );
                if let Err(e) = handle.kill() {
                    debug!("Failed to kill timed out '{}': {}", command, e);
                }
                return Ok(CommandOutput {
                    timed_out: true,
                    ..CommandOutput::default()
                });
            }
        }

        thread::sleep(Duration::from_millis(25));
    }
}

/// Run a command with inherited stdio and extra environment variables,
/// returning its exit code. Used to hand the terminal to a test command.
pub fn run_inheriting<A: AsRef<OsStr>>(
    command: &str,
    args: &[A],
    envs: &[(String, String)],
) -> Result<i32> {
    let mut expression = cmd(command, os_args(args)).unchecked();
    for (key, value) in envs {
        expression = expression.env(key, value);
    }
    let output = expression
        .run()
        .map_err(|e| FixtureError::Command(format!("Failed to run '{}': {}", command, e)))?;
    // Signal-terminated children have no code; report them as a failure.
    Ok(output.status.code().unwrap_or(1))
}

fn os_args<A: AsRef<OsStr>>(args: &[A]) -> Vec<OsString> {
    args.iter().map(|a| a.as_ref().to_os_string()).collect()
}

/// Checks if a command-line tool is available in the system's PATH.
pub fn is_tool_installed(tool_name: &str) -> bool {
    which(tool_name).is_ok()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_captures_stdout_and_status() {
        let output = run_command_with_timeout("sh", &["-c", "echo hello; exit 3"], None).unwrap();
        assert_eq!(output.stdout_trimmed(), "hello");
        assert_eq!(output.code, Some(3));
        assert!(!output.success);
        assert!(!output.timed_out);
    }

    #[test]
    fn test_kills_on_timeout() {
        let start = Instant::now();
        let output =
            run_command_with_timeout("sh", &["-c", "sleep 5"], Some(Duration::from_millis(100)))
                .unwrap();
        assert!(output.timed_out);
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_missing_binary_is_an_error() {
        let result =
            run_command_with_timeout::<&str>("definitely-not-a-real-binary-xyz", &[], None);
        assert!(result.is_err());
    }

    #[test]
    fn test_run_inheriting_passes_env() {
        let code = run_inheriting(
            "sh",
            &["-c", "test \"$FIXTURE_PORT\" = 4242"],
            &[("FIXTURE_PORT".to_string(), "4242".to_string())],
        )
        .unwrap();
        assert_eq!(code, 0);
    }

    #[test]
    fn test_is_tool_installed() {
        assert!(is_tool_installed("sh"));
        assert!(!is_tool_installed("definitely-not-a-real-binary-xyz"));
    }
}
