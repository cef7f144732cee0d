//! `adsel config`: prints the effective configuration.

use adsel_core::AdSelectionConfig;
use anyhow::{Context, Result};

/// Prints `config` as TOML.
///
/// # Errors
///
/// Returns an error if the configuration cannot be serialized.
pub fn show(config: &AdSelectionConfig) -> Result<()> {
    print!("{}", render(config)?);
    Ok(())
}

fn render(config: &AdSelectionConfig) -> Result<String> {
    config.to_toml().context("failed to serialize configuration")
}
