//! TOML config file loading and creation.

use std::path::{Path, PathBuf};

use termlink_common::ConfigError;
use tracing::{info, warn};

use crate::schema::TermlinkConfig;
use crate::validation;

/// Load config from a specific TOML file path.
///
/// Missing fields use serde defaults. If validation fails, a warning is
/// logged and the default config is returned.
pub fn load_from_path(path: &Path) -> Result<TermlinkConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path).map_err(|e| {
        ConfigError::ParseError(format!("failed to read {}: {e}", path.display()))
    })?;

    let config: TermlinkConfig = toml::from_str(&content)
        .map_err(|e| ConfigError::ParseError(format!("failed to parse TOML: {e}")))?;

    if let Err(e) = validation::validate(&config) {
        warn!("config validation warning: {e}");
        warn!("falling back to default config");
        return Ok(TermlinkConfig::default());
    }

    info!("loaded config from {}", path.display());
    Ok(config)
}

/// Load config from the platform-specific default path, creating a
/// commented default file if none exists.
pub fn load_default() -> Result<TermlinkConfig, ConfigError> {
    let path = default_config_path()?;

    if !path.exists() {
        info!("no config found at {}, creating default", path.display());
        create_default_config(&path)?;
        return Ok(TermlinkConfig::default());
    }

    load_from_path(&path)
}

/// `<config_dir>/termlink/config.toml`
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    let config_dir = dirs::config_dir().ok_or_else(|| {
        ConfigError::ParseError("could not determine config directory".into())
    })?;
    Ok(config_dir.join("termlink").join("config.toml"))
}

pub fn create_default_config(path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            ConfigError::ParseError(format!(
                "failed to create config directory {}: {e}",
                parent.display()
            ))
        })?;
    }

    std::fs::write(path, default_config_toml()).map_err(|e| {
        ConfigError::ParseError(format!(
            "failed to write default config to {}: {e}",
            path.display()
        ))
    })?;

    info!("created default config at {}", path.display());
    Ok(())
}

fn default_config_toml() -> &'static str {
    r##"# termlink configuration
# Schema version 1
# Only override what you want to change -- missing fields use defaults.

[hub]
# port = 8080
# max_terminals_per_socket = 4     # 1-64
# max_terminals_per_session = 8    # 1-256
# keep_alive_ms = 30000            # 0 reclaims orphans immediately
# idle_timeout_ms = 1800000        # 0 disables
# removal_reason_ttl_ms = 60000
# session_ttl_secs = 300

[agent]
# hub_url = "ws://127.0.0.1:8080"
# max_terminals = 8                # 1-256
# backend = "auto"                 # auto, pty, sidecar
# cwd = "/home/me"

[agent.env]
# EDITOR = "vim"

[agent.sidecar]
# path = "/opt/termlink/termlink-sidecar"
# hello_timeout_ms = 5000
# heartbeat_interval_ms = 30000
# heartbeat_timeout_ms = 90000     # must exceed heartbeat_interval_ms
# shutdown_timeout_ms = 3000
"##
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::BackendPreference;

    #[test]
    fn load_from_nonexistent_returns_file_not_found() {
        let result = load_from_path(Path::new("/tmp/nonexistent_termlink_config.toml"));
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn load_valid_partial_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[hub]
keep_alive_ms = 5000

[agent]
backend = "sidecar"

[agent.env]
EDITOR = "vim"
"#,
        )
        .unwrap();

        let config = load_from_path(&path).unwrap();
        assert_eq!(config.hub.keep_alive_ms, 5_000);
        assert_eq!(config.agent.backend, BackendPreference::Sidecar);
        assert_eq!(config.agent.env.get("EDITOR").map(String::as_str), Some("vim"));
        // Defaults preserved
        assert_eq!(config.hub.max_terminals_per_session, 8);
        assert_eq!(config.agent.sidecar.hello_timeout_ms, 5_000);
    }

    #[test]
    fn load_invalid_toml_returns_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "this is not valid toml {{{").unwrap();

        let result = load_from_path(&path);
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn load_config_with_invalid_values_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[agent]\nmax_terminals = 0\n").unwrap();

        let config = load_from_path(&path).unwrap();
        assert_eq!(config.agent.max_terminals, 8);
    }

    #[test]
    fn default_toml_parses_and_validates() {
        let config: TermlinkConfig = toml::from_str(default_config_toml()).unwrap();
        assert!(validation::validate(&config).is_ok());
    }

    #[test]
    fn create_default_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        create_default_config(&path).unwrap();
        assert!(path.exists());
        let config = load_from_path(&path).unwrap();
        assert_eq!(config.hub.port, 8080);
    }
}
