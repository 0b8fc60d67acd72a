use anyhow::Result;
use fixture_core::fx_info;

#[cfg(feature = "docker")]
pub fn handle_prune(run: Option<&str>) -> Result<i32> {
    let removed = fixture_provider::docker::prune(run)?;
    if removed == 0 {
        fx_info!("No leftover fixture containers");
    } else {
        fixture_core::fx_success!("Removed {} fixture container(s)", removed);
    }
    Ok(0)
}

#[cfg(not(feature = "docker"))]
pub fn handle_prune(_run: Option<&str>) -> Result<i32> {
    fx_info!("Built without Docker support; nothing to prune");
    Ok(0)
}
