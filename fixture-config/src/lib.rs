//! Fixture configuration library.
//!
//! ## Main Features
//! - [`FixtureSpec`]: the immutable description of a disposable dependency
//! - [`FixtureConfig`]: a spec plus run settings, loaded from YAML
//! - Environment overrides and validation that reports every problem at once
//! - Host port ranges for sandboxes that must stay inside a window

pub mod loader;
pub mod ports;
pub mod spec;
pub mod validator;

pub use loader::{FixtureConfig, RunSettings, SharingScope};
pub use ports::PortRange;
pub use spec::{BackendKind, FixtureSpec, ImageRef, InitSpec, ProbeKind, ProbeSpec};
pub use validator::{collect_problems, validate_spec};
