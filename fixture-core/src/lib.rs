//! Foundation types shared by every fixture crate: the lifecycle error
//! taxonomy, endpoints and drivers, cancellation, and child-process helpers.

pub mod cancel;
pub mod command_stream;
pub mod driver;
pub mod error;
pub mod output_macros;

pub use cancel::CancelToken;
pub use driver::{Driver, Endpoint, TcpDriver};
pub use error::{
    FixtureError, LifecycleError, NotReadyError, ProvisionError, ProvisionErrorKind,
    ReadinessTimeout, Result, WaitAbort,
};
