//! A tiny key-value store speaking a line protocol over TCP.
//!
//! It exists so fixtures can be exercised end to end without a container
//! runtime: the local sandbox backend hosts a [`KvServer`] in the test
//! process, tests talk to it through a pooled [`KvClient`], and the
//! readiness gate opens that client through [`KvDriver`].
//!
//! Protocol, one request and one reply per line:
//!
//! | Request       | Reply                  |
//! |---------------|------------------------|
//! | `PING`        | `PONG`                 |
//! | `GET k`       | `VALUE v` or `NIL`     |
//! | `SET k v...`  | `OK`                   |
//! | `DEL k`       | `INT 1` or `INT 0`     |
//! | `COUNT`       | `INT n`                |
//! | `FLUSH`       | `OK`                   |
//!
//! Malformed requests get `ERR <message>`.

pub mod client;
pub mod driver;
pub mod protocol;
pub mod script;
pub mod server;

pub use client::KvClient;
pub use driver::KvDriver;
pub use protocol::{Request, Response};
pub use script::{load_script, parse_script, ScriptError};
pub use server::{KvServer, ServerConfig, Store};
