pub use anyhow::bail;
use std::fmt::{self, Display, Formatter};
use std::time::Duration;
use thiserror::Error;

/// Why a sandbox could not be brought up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProvisionErrorKind {
    ImagePullFailed,
    StartTimeout,
    InitScriptFailed,
    StartFailed,
    SandboxUnavailable,
    Duplicate,
}

impl Display for ProvisionErrorKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let label = match self {
            ProvisionErrorKind::ImagePullFailed => "image pull failed",
            ProvisionErrorKind::StartTimeout => "start timed out",
            ProvisionErrorKind::InitScriptFailed => "init script failed",
            ProvisionErrorKind::StartFailed => "start failed",
            ProvisionErrorKind::SandboxUnavailable => "sandbox unavailable",
            ProvisionErrorKind::Duplicate => "already provisioned",
        };
        f.write_str(label)
    }
}

/// Fatal setup error raised while creating the sandbox.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Failed to provision fixture '{fixture}' ({kind}): {message}")]
pub struct ProvisionError {
    pub kind: ProvisionErrorKind,
    pub fixture: String,
    pub message: String,
}

impl ProvisionError {
    pub fn new(
        kind: ProvisionErrorKind,
        fixture: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            fixture: fixture.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ProvisionErrorKind {
        self.kind
    }
}

/// What cut a readiness wait short.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitAbort {
    /// The probe timeout elapsed.
    Deadline,
    /// The wait was cancelled from outside (run deadline, teardown).
    Cancelled,
    /// The probe reported the dependency can never become ready.
    PermanentFailure,
}

impl Display for WaitAbort {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            WaitAbort::Deadline => f.write_str("timed out"),
            WaitAbort::Cancelled => f.write_str("cancelled"),
            WaitAbort::PermanentFailure => f.write_str("permanently failed"),
        }
    }
}

/// The sandbox started but the dependency never became serviceable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error(
    "Fixture '{fixture}' not ready after {:.2}s ({reason}, probe: {probe}); last observed: {last_observed}",
    .elapsed.as_secs_f64()
)]
pub struct ReadinessTimeout {
    pub fixture: String,
    pub probe: String,
    pub elapsed: Duration,
    pub last_observed: String,
    pub reason: WaitAbort,
}

/// A handle was requested before the broker reached `Ready`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Fixture handle requested while broker is {state}; setup() must complete first")]
pub struct NotReadyError {
    pub state: String,
}

/// Errors that belong to the fixture lifecycle rather than to a test body.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    #[error(transparent)]
    Readiness(#[from] ReadinessTimeout),
    #[error(transparent)]
    NotReady(#[from] NotReadyError),
}

impl LifecycleError {
    /// Environment problems (could not provision or ready the fixture), as
    /// opposed to framework integration bugs.
    pub fn is_infrastructure(&self) -> bool {
        !matches!(self, LifecycleError::NotReady(_))
    }

    pub fn provision_kind(&self) -> Option<ProvisionErrorKind> {
        match self {
            LifecycleError::Provision(e) => Some(e.kind),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum FixtureError {
    Config(String),
    Sandbox(String),
    Io(#[from] std::io::Error),
    Command(String),
    Dependency(String),
    Internal(String),
    Serialization(String),
    DockerNotRunning,
    DockerPermission,
    Lifecycle(#[from] LifecycleError),
    Other(#[from] anyhow::Error),
}

impl Display for FixtureError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            FixtureError::Config(s) => write!(f, "Configuration error: {}", s),
            FixtureError::Sandbox(s) => write!(f, "Sandbox error: {}", s),
            FixtureError::Io(e) => write!(f, "I/O error: {}", e),
            FixtureError::Command(s) => write!(f, "Command failed: {}", s),
            FixtureError::Dependency(s) => write!(f, "Dependency not found: {}", s),
            FixtureError::Internal(s) => write!(f, "Internal error: {}", s),
            FixtureError::Serialization(s) => write!(f, "Serialization error: {}", s),
            FixtureError::DockerNotRunning => {
                write!(f, "Docker daemon is not running\n\n")?;
                write!(f, "Fix:\n")?;
                write!(f, "  • Start Docker Desktop, or\n")?;
                write!(f, "  • Run: sudo systemctl start docker\n")?;
                write!(f, "  • Verify: docker ps")
            }
            FixtureError::DockerPermission => {
                write!(f, "Permission denied accessing Docker\n\n")?;
                write!(f, "Fix:\n")?;
                write!(f, "  • Add user to docker group: sudo usermod -aG docker $USER\n")?;
                write!(f, "  • Log out and back in")
            }
            FixtureError::Lifecycle(e) => write!(f, "{}", e),
            FixtureError::Other(e) => write!(f, "Other error: {}", e),
        }
    }
}

impl From<ProvisionError> for FixtureError {
    fn from(err: ProvisionError) -> Self {
        FixtureError::Lifecycle(err.into())
    }
}

impl From<ReadinessTimeout> for FixtureError {
    fn from(err: ReadinessTimeout) -> Self {
        FixtureError::Lifecycle(err.into())
    }
}

impl From<NotReadyError> for FixtureError {
    fn from(err: NotReadyError) -> Self {
        FixtureError::Lifecycle(err.into())
    }
}

impl From<serde_yaml_ng::Error> for FixtureError {
    fn from(err: serde_yaml_ng::Error) -> Self {
        FixtureError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for FixtureError {
    fn from(err: serde_json::Error) -> Self {
        FixtureError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FixtureError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_ready_is_not_infrastructure() {
        let err = LifecycleError::from(NotReadyError {
            state: "Uninitialized".into(),
        });
        assert!(!err.is_infrastructure());
        assert_eq!(err.provision_kind(), None);
    }

    #[test]
    fn test_provision_error_classification() {
        let err = LifecycleError::from(ProvisionError::new(
            ProvisionErrorKind::InitScriptFailed,
            "kv",
            "line 2: unknown command",
        ));
        assert!(err.is_infrastructure());
        assert_eq!(
            err.provision_kind(),
            Some(ProvisionErrorKind::InitScriptFailed)
        );
        assert!(err.to_string().contains("init script failed"));
    }

    #[test]
    fn test_readiness_timeout_message_reports_elapsed() {
        let err = ReadinessTimeout {
            fixture: "pg".into(),
            probe: "tcp".into(),
            elapsed: Duration::from_millis(2_050),
            last_observed: "connection refused".into(),
            reason: WaitAbort::Deadline,
        };
        let msg = err.to_string();
        assert!(msg.contains("2.05s"));
        assert!(msg.contains("connection refused"));
    }

    #[test]
    fn test_lifecycle_error_lifts_into_fixture_error() {
        let err: FixtureError =
            ProvisionError::new(ProvisionErrorKind::ImagePullFailed, "pg", "not found").into();
        assert!(matches!(
            err,
            FixtureError::Lifecycle(LifecycleError::Provision(_))
        ));
    }
}
