use std::fmt;

use chrono::{DateTime, Utc};
use fixture_core::error::LifecycleError;
use serde::Serialize;

/// How a single test case ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "lowercase")]
pub enum CaseOutcome {
    Passed,
    Failed(String),
    /// Never started: the fixture was unavailable or the run deadline passed.
    Skipped(String),
}

impl CaseOutcome {
    pub fn is_passed(&self) -> bool {
        matches!(self, CaseOutcome::Passed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaseReport {
    pub name: String,
    #[serde(flatten)]
    pub outcome: CaseOutcome,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cleanup_failures: Vec<String>,
}

/// Overall verdict, keeping environment problems apart from test failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Passed,
    TestFailure,
    InfrastructureFailure,
    /// The run deadline passed before every case could run.
    Aborted,
}

impl RunStatus {
    /// `0` pass, `1` test failure, `2` infrastructure failure or abort.
    pub fn exit_code(self) -> i32 {
        match self {
            RunStatus::Passed => 0,
            RunStatus::TestFailure => 1,
            RunStatus::InfrastructureFailure | RunStatus::Aborted => 2,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunStatus::Passed => "passed",
            RunStatus::TestFailure => "test failure",
            RunStatus::InfrastructureFailure => "infrastructure failure",
            RunStatus::Aborted => "aborted",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub fixture: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub cases: Vec<CaseReport>,
    /// First fixture setup failure, if any.
    #[serde(serialize_with = "serialize_error")]
    pub setup_error: Option<LifecycleError>,
    pub teardown_completed: bool,
    pub status: RunStatus,
}

fn serialize_error<S>(error: &Option<LifecycleError>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match error {
        Some(e) => serializer.serialize_some(&e.to_string()),
        None => serializer.serialize_none(),
    }
}

impl RunReport {
    fn count(&self, pick: impl Fn(&CaseOutcome) -> bool) -> usize {
        self.cases.iter().filter(|c| pick(&c.outcome)).count()
    }

    pub fn passed(&self) -> usize {
        self.count(CaseOutcome::is_passed)
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, CaseOutcome::Failed(_)))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, CaseOutcome::Skipped(_)))
    }

    pub fn case(&self, name: &str) -> Option<&CaseReport> {
        self.cases.iter().find(|c| c.name == name)
    }

    pub fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }

    /// One-line summary, e.g. `3 passed, 1 failed, 0 skipped (test failure)`.
    pub fn summary(&self) -> String {
        format!(
            "{} passed, {} failed, {} skipped ({})",
            self.passed(),
            self.failed(),
            self.skipped(),
            self.status
        )
    }
}

/// Aborted wins when the deadline left work undone; setup failures come next.
pub(crate) fn decide_status(
    cases: &[CaseReport],
    setup_error: Option<&LifecycleError>,
    deadline_hit: bool,
) -> RunStatus {
    let unfinished = cases
        .iter()
        .any(|c| matches!(c.outcome, CaseOutcome::Skipped(_)));
    if deadline_hit && (unfinished || setup_error.is_some()) {
        RunStatus::Aborted
    } else if setup_error.is_some() {
        RunStatus::InfrastructureFailure
    } else if cases.iter().any(|c| matches!(c.outcome, CaseOutcome::Failed(_))) {
        RunStatus::TestFailure
    } else {
        RunStatus::Passed
    }
}
