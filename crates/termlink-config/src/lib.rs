//! termlink configuration.
//!
//! TOML-based configuration shared by the hub and the agent. All sections
//! use defaults so partial configs work out of the box.

pub mod schema;
pub mod toml_loader;
pub mod validation;

pub use schema::{
    AgentConfig, BackendPreference, HubConfig, SidecarConfig, TermlinkConfig,
    CONFIG_SCHEMA_VERSION,
};

use std::path::Path;

use termlink_common::ConfigError;

/// Load config from `path` when given, else from the platform default path.
pub fn load_config(path: Option<&Path>) -> Result<TermlinkConfig, ConfigError> {
    let config = match path {
        Some(path) => toml_loader::load_from_path(path)?,
        None => toml_loader::load_default()?,
    };
    validation::validate(&config)?;
    Ok(config)
}
