//! Configuration display.

use anyhow::{Context, Result};
use tickmesh_config::TickmeshConfig;

/// Prints the effective configuration as TOML.
pub fn show(config: &TickmeshConfig) -> Result<()> {
    let toml = config
        .to_toml()
        .context("Failed to serialize configuration")?;
    print!("{toml}");
    Ok(())
}
