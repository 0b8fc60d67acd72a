use std::io::Write;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use fixture_core::driver::{Driver, Endpoint};
use fixture_kv::{load_script, KvClient, KvDriver, KvServer, ServerConfig};
use tempfile::NamedTempFile;

#[test]
fn concurrent_callers_share_one_client() {
    let server = KvServer::start(ServerConfig::default()).unwrap();
    let client = Arc::new(KvClient::connect(server.local_addr(), Duration::from_secs(1)).unwrap());

    let workers: Vec<_> = (0..8)
        .map(|i| {
            let client = Arc::clone(&client);
            thread::spawn(move || {
                for j in 0..20 {
                    client.set(&format!("k{}-{}", i, j), "v").unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(client.count().unwrap(), 160);
    assert_eq!(server.store().len(), 160);
}

#[test]
fn script_file_applies_to_store() {
    let mut script = NamedTempFile::new().unwrap();
    writeln!(script, "# fixtures\nSET user:1 ada\nSET user:2 grace\nDEL user:2").unwrap();

    let server = KvServer::start(ServerConfig::default()).unwrap();
    for request in load_script(script.path()).unwrap() {
        server.store().apply(&request);
    }

    let client = KvClient::connect(server.local_addr(), Duration::from_secs(1)).unwrap();
    assert_eq!(client.get("user:1").unwrap().as_deref(), Some("ada"));
    assert_eq!(client.get("user:2").unwrap(), None);
}

#[test]
fn driver_opens_and_pings() {
    let server = KvServer::start(ServerConfig::default()).unwrap();
    let driver = KvDriver::default();
    let endpoint = Endpoint::new("127.0.0.1", server.port(), 7070);

    let handle = driver.open(&endpoint).unwrap();
    driver.ping(&handle).unwrap();

    server.stop();
    assert!(driver.ping(&handle).is_err() || driver.open(&endpoint).is_err());
}

#[test]
fn driver_open_fails_while_engine_is_starting() {
    let server =
        KvServer::start(ServerConfig::default().with_startup_delay(Duration::from_secs(2)))
            .unwrap();
    let endpoint = Endpoint::new("127.0.0.1", server.port(), 7070);
    assert!(KvDriver::default().open(&endpoint).is_err());
}
