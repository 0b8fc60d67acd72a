use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Mutex;
use std::time::Duration;

use fixture_core::error::{FixtureError, Result};
use tracing::trace;

use crate::protocol::{Request, Response};

struct Connection {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Connection {
    fn open(addr: SocketAddr, timeout: Duration) -> Result<Self> {
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;
        let writer = stream.try_clone()?;
        Ok(Self {
            reader: BufReader::new(stream),
            writer,
        })
    }

    fn call(&mut self, request: &Request) -> Result<Response> {
        writeln!(self.writer, "{}", request)?;
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Err(FixtureError::Command(
                "kv: server closed the connection".to_string(),
            ));
        }
        Response::parse(&line).map_err(|e| FixtureError::Command(format!("kv: {}", e)))
    }
}

/// Thread-safe client for the KV engine.
///
/// Idle connections are kept in a small pool; a request borrows one for the
/// duration of a single round trip, so concurrent callers never share a
/// socket. Connections that fail are dropped instead of returned.
pub struct KvClient {
    addr: SocketAddr,
    timeout: Duration,
    idle: Mutex<Vec<Connection>>,
}

impl KvClient {
    /// Connect and verify the server answers.
    pub fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self> {
        let client = Self {
            addr,
            timeout,
            idle: Mutex::new(Vec::new()),
        };
        let conn = Connection::open(addr, timeout)?;
        client.checkin(conn);
        Ok(client)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn checkout(&self) -> Result<Connection> {
        let pooled = self
            .idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop();
        match pooled {
            Some(conn) => Ok(conn),
            None => Connection::open(self.addr, self.timeout),
        }
    }

    fn checkin(&self, conn: Connection) {
        self.idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(conn);
    }

    pub fn request(&self, request: &Request) -> Result<Response> {
        let mut conn = self.checkout()?;
        let response = conn.call(request)?;
        trace!("kv {} <- {} -> {}", self.addr, request, response);
        self.checkin(conn);
        match response {
            Response::Err(message) => Err(FixtureError::Command(format!(
                "kv: '{}' rejected: {}",
                request, message
            ))),
            other => Ok(other),
        }
    }

    pub fn ping(&self) -> Result<()> {
        match self.request(&Request::Ping)? {
            Response::Pong => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        match self.request(&Request::Get(key.to_string()))? {
            Response::Value(v) => Ok(Some(v)),
            Response::Nil => Ok(None),
            other => Err(unexpected(&other)),
        }
    }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        match self.request(&Request::Set(key.to_string(), value.to_string()))? {
            Response::Ok => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Returns whether the key existed.
    pub fn del(&self, key: &str) -> Result<bool> {
        match self.request(&Request::Del(key.to_string()))? {
            Response::Int(n) => Ok(n > 0),
            other => Err(unexpected(&other)),
        }
    }

    pub fn count(&self) -> Result<u64> {
        match self.request(&Request::Count)? {
            Response::Int(n) => Ok(n),
            other => Err(unexpected(&other)),
        }
    }

    pub fn flush(&self) -> Result<()> {
        match self.request(&Request::Flush)? {
            Response::Ok => Ok(()),
            other => Err(unexpected(&other)),
        }
    }
}

impl std::fmt::Debug for KvClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvClient")
            .field("addr", &self.addr)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

fn unexpected(response: &Response) -> FixtureError {
    FixtureError::Command(format!("kv: unexpected reply '{}'", response))
}
