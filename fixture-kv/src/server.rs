//! The in-process KV engine.
//!
//! The server binds its port as soon as it is started so the port can be
//! published immediately. With a startup delay the socket is released again
//! and only re-bound once the delay has passed, which makes the engine look
//! exactly like a slow container: connections are refused until it is up.
//!
//! Each server owns a small tokio runtime. The accept loop and every
//! connection run as tasks on it, and [`KvServer::stop`] signals the loop
//! through a oneshot channel before shutting the runtime down.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use fixture_core::error::{FixtureError, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::protocol::{Request, Response};

/// How long `stop` waits for the accept loop to wind down.
const STOP_GRACE: Duration = Duration::from_secs(2);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Shared key-value map. Cloning shares the same data.
#[derive(Debug, Clone, Default)]
pub struct Store {
    inner: Arc<Mutex<HashMap<String, String>>>,
}

impl Store {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, String>> {
        lock(&self.inner)
    }

    pub fn apply(&self, request: &Request) -> Response {
        let mut map = self.lock();
        match request {
            Request::Ping => Response::Pong,
            Request::Get(key) => map
                .get(key)
                .map_or(Response::Nil, |v| Response::Value(v.clone())),
            Request::Set(key, value) => {
                map.insert(key.clone(), value.clone());
                Response::Ok
            }
            Request::Del(key) => Response::Int(u64::from(map.remove(key).is_some())),
            Request::Count => Response::Int(map.len() as u64),
            Request::Flush => {
                map.clear();
                Response::Ok
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    /// Time before the engine starts accepting connections.
    pub startup_delay: Duration,
    /// Stop on its own after this long, as if the process crashed.
    pub exit_after: Option<Duration>,
    /// Records present before the first connection is accepted.
    pub seed: Vec<(String, String)>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            startup_delay: Duration::ZERO,
            exit_after: None,
            seed: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn with_startup_delay(mut self, delay: Duration) -> Self {
        self.startup_delay = delay;
        self
    }

    pub fn with_exit_after(mut self, after: Duration) -> Self {
        self.exit_after = Some(after);
        self
    }

    pub fn with_seed(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.seed.push((key.into(), value.into()));
        self
    }
}

#[derive(Clone, Default)]
struct EngineLog(Arc<Mutex<Vec<String>>>);

impl EngineLog {
    fn push(&self, line: String) {
        debug!("{}", line);
        lock(&self.0).push(line);
    }

    fn snapshot(&self) -> Vec<String> {
        lock(&self.0).clone()
    }
}

pub struct KvServer {
    addr: SocketAddr,
    store: Store,
    log: EngineLog,
    running: Arc<AtomicBool>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    engine: Mutex<Option<(Runtime, JoinHandle<()>)>>,
}

impl KvServer {
    /// Bind a free port on `config.host` and start serving on a dedicated
    /// runtime. Must not be called from inside another tokio runtime.
    pub fn start(config: ServerConfig) -> Result<Self> {
        let listener = std::net::TcpListener::bind((config.host.as_str(), 0));
        let listener = listener.map_err(|e| {
            FixtureError::Sandbox(format!("kv: failed to bind {}: {}", config.host, e))
        })?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let store = Store::default();
        for (key, value) in &config.seed {
            store.apply(&Request::Set(key.clone(), value.clone()));
        }

        let log = EngineLog::default();
        log.push(format!("kv: starting on {}", addr));
        if !config.seed.is_empty() {
            log.push(format!("kv: loaded {} seed records", config.seed.len()));
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name(format!("kv-{}", addr.port()))
            .enable_all()
            .build()?;

        let running = Arc::new(AtomicBool::new(true));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let engine = Engine {
            addr,
            store: store.clone(),
            log: log.clone(),
            running: Arc::clone(&running),
            started: Instant::now(),
            config,
        };

        // A delayed engine releases its port until it is ready.
        let listener = engine.config.startup_delay.is_zero().then_some(listener);
        let task = runtime.spawn(engine.run(listener, shutdown_rx));

        Ok(Self {
            addr,
            store,
            log,
            running,
            shutdown: Mutex::new(Some(shutdown_tx)),
            engine: Mutex::new(Some((runtime, task))),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Direct access to the data, bypassing the network.
    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn logs(&self) -> Vec<String> {
        self.log.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop accepting, close open connections and shut the runtime down.
    /// Safe to call more than once.
    pub fn stop(&self) {
        if let Some(shutdown) = lock(&self.shutdown).take() {
            // The engine may already have exited on its own.
            let _ = shutdown.send(());
        }
        let engine = lock(&self.engine).take();
        if let Some((runtime, task)) = engine {
            match runtime.block_on(async { tokio::time::timeout(STOP_GRACE, task).await }) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("kv engine on {} failed: {}", self.addr, e),
                Err(_) => warn!("kv engine on {} did not stop in time", self.addr),
            }
            runtime.shutdown_timeout(STOP_GRACE);
        }
        self.running.store(false, Ordering::SeqCst);
    }
}

impl Drop for KvServer {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Engine {
    addr: SocketAddr,
    store: Store,
    log: EngineLog,
    running: Arc<AtomicBool>,
    started: Instant,
    config: ServerConfig,
}

impl Engine {
    async fn run(
        self,
        listener: Option<std::net::TcpListener>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let bound = match listener {
            Some(listener) => TcpListener::from_std(listener),
            None => {
                tokio::select! {
                    _ = &mut shutdown => {
                        self.finish("kv: shut down before becoming ready");
                        return;
                    }
                    _ = sleep_until(self.started + self.config.startup_delay) => {}
                }
                if let Some(message) = self.exit_due() {
                    self.finish(&message);
                    return;
                }
                TcpListener::bind(self.addr).await
            }
        };
        let listener = match bound {
            Ok(listener) => listener,
            Err(e) => {
                self.finish(&format!("kv: failed to listen on {}: {}", self.addr, e));
                return;
            }
        };
        self.log
            .push(format!("kv: ready to accept connections on {}", self.addr));

        // Flipped once the engine stops; every connection task watches it.
        let (closed_tx, closed_rx) = watch::channel(false);
        let exit = self.exit_timer();
        tokio::pin!(exit);

        let message = loop {
            tokio::select! {
                _ = &mut shutdown => break "kv: shutting down".to_string(),
                message = &mut exit => break message,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("kv {}: connection from {}", self.addr, peer);
                        let store = self.store.clone();
                        let closed = closed_rx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, store, closed).await {
                                debug!("kv connection from {} closed: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => warn!("kv {}: accept failed: {}", self.addr, e),
                },
            }
        };
        let _ = closed_tx.send(true);
        self.finish(&message);
    }

    /// Resolves with the exit message once `exit_after` has passed; never
    /// resolves for an engine without one.
    async fn exit_timer(&self) -> String {
        match self.config.exit_after {
            Some(limit) => {
                sleep_until(self.started + limit).await;
                format!("kv: exiting after {}ms", limit.as_millis())
            }
            None => std::future::pending().await,
        }
    }

    fn exit_due(&self) -> Option<String> {
        self.config
            .exit_after
            .filter(|limit| self.started.elapsed() >= *limit)
            .map(|limit| format!("kv: exiting after {}ms", limit.as_millis()))
    }

    fn finish(&self, message: &str) {
        self.log.push(message.to_string());
        self.running.store(false, Ordering::SeqCst);
    }
}

async fn serve_connection(
    stream: TcpStream,
    store: Store,
    mut closed: watch::Receiver<bool>,
) -> io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        tokio::select! {
            // Also fires when the engine is gone.
            _ = closed.changed() => break,
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let response = match Request::parse(&line) {
                    Ok(request) => store.apply(&request),
                    Err(message) => Response::Err(message),
                };
                writer.write_all(format!("{}\n", response).as_bytes()).await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpStream;
    use std::thread;

    fn roundtrip(addr: SocketAddr, line: &str) -> String {
        let mut stream = TcpStream::connect(addr).unwrap();
        writeln!(stream, "{}", line).unwrap();
        let mut reply = String::new();
        BufReader::new(stream).read_line(&mut reply).unwrap();
        reply.trim_end().to_string()
    }

    #[test]
    fn test_store_apply() {
        let store = Store::default();
        assert_eq!(store.apply(&Request::Get("a".into())), Response::Nil);
        store.apply(&Request::Set("a".into(), "1".into()));
        assert_eq!(store.get("a").as_deref(), Some("1"));
        assert_eq!(store.apply(&Request::Del("a".into())), Response::Int(1));
        assert_eq!(store.apply(&Request::Del("a".into())), Response::Int(0));
        assert!(store.is_empty());
    }

    #[test]
    fn test_seeded_server_serves_requests() {
        let server = KvServer::start(ServerConfig::default().with_seed("user:1", "ada")).unwrap();
        assert_eq!(roundtrip(server.local_addr(), "GET user:1"), "VALUE ada");
        assert_eq!(roundtrip(server.local_addr(), "BOGUS"), "ERR unknown command 'BOGUS'");
        assert!(server
            .logs()
            .iter()
            .any(|l| l.contains("ready to accept connections")));
        server.stop();
        assert!(!server.is_running());
    }

    #[test]
    fn test_startup_delay_refuses_connections() {
        let server = KvServer::start(
            ServerConfig::default().with_startup_delay(Duration::from_millis(400)),
        )
        .unwrap();
        assert!(TcpStream::connect(server.local_addr()).is_err());

        thread::sleep(Duration::from_millis(700));
        assert_eq!(roundtrip(server.local_addr(), "PING"), "PONG");
    }

    #[test]
    fn test_exit_after_stops_engine() {
        let server =
            KvServer::start(ServerConfig::default().with_exit_after(Duration::from_millis(100)))
                .unwrap();
        thread::sleep(Duration::from_millis(400));
        assert!(!server.is_running());
        assert!(server.logs().iter().any(|l| l.contains("exiting after")));
    }

    #[test]
    fn test_stop_closes_open_connections() {
        let server = KvServer::start(ServerConfig::default()).unwrap();
        let mut stream = TcpStream::connect(server.local_addr()).unwrap();
        writeln!(stream, "PING").unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut reply = String::new();
        reader.read_line(&mut reply).unwrap();
        assert_eq!(reply.trim_end(), "PONG");

        server.stop();
        stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        reply.clear();
        assert_eq!(reader.read_line(&mut reply).unwrap_or(0), 0);
        assert!(server.logs().iter().any(|l| l.contains("shutting down")));
        assert!(TcpStream::connect(server.local_addr()).is_err());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let server = KvServer::start(ServerConfig::default()).unwrap();
        server.stop();
        server.stop();
        assert!(!server.is_running());
    }
}
