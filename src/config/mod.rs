//! Server configuration
//!
//! Loaded from an optional JSON file; every section falls back to its
//! defaults, and command-line flags are applied on top by the binary.

mod schema;

pub use schema::*;

use std::path::Path;

use crate::error::{AppError, Result};

/// Load and validate a JSON configuration file
pub fn load(path: &Path) -> Result<ServerConfig> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        AppError::Config(format!("Failed to read {}: {}", path.display(), e))
    })?;
    let config: ServerConfig = serde_json::from_str(&text)?;
    config.validate()?;
    Ok(config)
}
