//! Configuration loading and schema definitions for testfleet.
//!
//! This module provides types and functions for loading testfleet
//! configuration from TOML files or strings. The schema covers worker and
//! attempt limits, bail policy, port ranges and the test command template.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

/// Loads testfleet configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
///
/// # Example
///
/// ```no_run
/// use testfleet::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("testfleet.toml"))?;
/// println!("Max workers: {}", config.testfleet.max_workers);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads testfleet configuration from a TOML string.
///
/// # Example
///
/// ```
/// use testfleet::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [testfleet]
///     max_workers = 4
///     bail_fast = true
///
///     [framework]
///     command = "node run.js"
/// "#)?;
///
/// assert_eq!(config.testfleet.max_workers, 4);
/// assert_eq!(config.testfleet.effective_max_attempts(), 1);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}
