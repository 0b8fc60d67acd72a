//! Shared-fixture broker.
//!
//! A [`Broker`] turns one fixture spec into a single connection handle shared
//! by every test case of a run: [`Broker::setup`] provisions and gates the
//! fixture exactly once, test bodies borrow the handle with
//! [`Broker::acquire`], and [`Broker::teardown`] reclaims everything exactly
//! once, even when dropped without an explicit call.
//!
//! [`TestRun`] drives a whole run on top of a broker: it executes registered
//! cases on a bounded worker pool and reports infrastructure failures
//! separately from test failures.

pub mod broker;
pub mod context;
pub mod report;
pub mod run;

pub use broker::{Broker, BrokerState, ConnectionHandle, Lease};
pub use context::TestCaseContext;
pub use report::{CaseOutcome, CaseReport, RunReport, RunStatus};
pub use run::TestRun;
