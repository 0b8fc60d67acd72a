use std::path::Path;

use anyhow::Result;
use fixture_config::FixtureConfig;
use fixture_core::{fx_error, fx_error_with_details, fx_success};

pub fn handle_validate(file: &Path) -> Result<i32> {
    let config = match FixtureConfig::read(file) {
        Ok(config) => config,
        Err(e) => {
            fx_error!("{}", e);
            return Ok(1);
        }
    };

    let problems = config.problems();
    if !problems.is_empty() {
        fx_error_with_details!(
            format!("{} has {} problem(s)", file.display(), problems.len()),
            &problems
        );
        return Ok(1);
    }

    let fixture = &config.fixture;
    let ports: Vec<String> = fixture.ports.iter().map(u16::to_string).collect();
    fx_success!(
        "{} is valid: fixture '{}' ({} backend, image {}, ports [{}], probe {})",
        file.display(),
        fixture.name,
        fixture.backend,
        fixture.image,
        ports.join(", "),
        fixture.readiness.describe()
    );
    Ok(0)
}
