use std::path::Path;
use std::time::Instant;

use anyhow::Result;
use fixture_broker::Broker;
use fixture_config::FixtureConfig;
use fixture_core::driver::TcpDriver;
use fixture_core::{fx_error, fx_info, fx_println, fx_progress, fx_success};

use super::explain_failure;

/// Provision, gate and tear down once. Exit code 2 when the fixture never
/// became ready.
pub fn handle_check(file: &Path) -> Result<i32> {
    let config = FixtureConfig::load(file)?;
    let name = config.fixture.name.clone();
    fx_progress!(
        "Starting fixture '{}' from {} ({} backend)",
        name,
        config.fixture.image,
        config.fixture.backend
    );

    let started = Instant::now();
    let broker = Broker::for_spec(config.fixture, TcpDriver::default());
    let code = match broker.setup() {
        Ok(handle) => {
            fx_success!(
                "Fixture '{}' ready at {} after {:.1}s",
                name,
                handle.endpoint(),
                started.elapsed().as_secs_f64()
            );
            for endpoint in handle.endpoints() {
                fx_println!("  {} -> {}", endpoint.container_port, endpoint);
            }
            0
        }
        Err(e) => {
            fx_error!("{}", e);
            explain_failure(&broker, &e);
            2
        }
    };

    broker.teardown();
    fx_info!("Fixture '{}' torn down", name);
    Ok(code)
}
