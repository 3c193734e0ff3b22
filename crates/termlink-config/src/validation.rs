//! Configuration validation.
//!
//! Checks numeric ranges and the ordering constraints between sidecar timers.

use crate::schema::TermlinkConfig;
use termlink_common::ConfigError;

/// Run all validations on a config, collecting all errors.
pub fn validate(config: &TermlinkConfig) -> Result<(), ConfigError> {
    let mut errors: Vec<String> = Vec::new();

    let hub = &config.hub;
    if hub.port == 0 {
        errors.push("hub.port must be non-zero".into());
    }
    validate_range(&mut errors, "hub.max_terminals_per_socket", hub.max_terminals_per_socket, 1, 64);
    validate_range(&mut errors, "hub.max_terminals_per_session", hub.max_terminals_per_session, 1, 256);
    if hub.max_terminals_per_socket > hub.max_terminals_per_session {
        errors.push(format!(
            "hub.max_terminals_per_socket ({}) exceeds hub.max_terminals_per_session ({})",
            hub.max_terminals_per_socket, hub.max_terminals_per_session
        ));
    }
    if hub.removal_reason_ttl_ms == 0 {
        errors.push("hub.removal_reason_ttl_ms must be non-zero".into());
    }

    let agent = &config.agent;
    if !agent.hub_url.starts_with("ws://") && !agent.hub_url.starts_with("wss://") {
        errors.push(format!(
            "agent.hub_url = {:?} must start with ws:// or wss://",
            agent.hub_url
        ));
    }
    validate_range(&mut errors, "agent.max_terminals", agent.max_terminals, 1, 256);

    let sidecar = &agent.sidecar;
    if sidecar.hello_timeout_ms == 0 {
        errors.push("agent.sidecar.hello_timeout_ms must be non-zero".into());
    }
    if sidecar.heartbeat_interval_ms == 0 {
        errors.push("agent.sidecar.heartbeat_interval_ms must be non-zero".into());
    }
    if sidecar.heartbeat_timeout_ms <= sidecar.heartbeat_interval_ms {
        errors.push(format!(
            "agent.sidecar.heartbeat_timeout_ms ({}) must exceed heartbeat_interval_ms ({})",
            sidecar.heartbeat_timeout_ms, sidecar.heartbeat_interval_ms
        ));
    }
    if sidecar.shutdown_timeout_ms == 0 {
        errors.push("agent.sidecar.shutdown_timeout_ms must be non-zero".into());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationError(errors.join("; ")))
    }
}

fn validate_range(errors: &mut Vec<String>, name: &str, value: usize, min: usize, max: usize) {
    if value < min || value > max {
        errors.push(format!("{name} = {value} is out of range [{min}, {max}]"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let config = TermlinkConfig::default();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn catches_zero_socket_quota() {
        let mut config = TermlinkConfig::default();
        config.hub.max_terminals_per_socket = 0;
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("hub.max_terminals_per_socket"));
    }

    #[test]
    fn catches_socket_quota_above_session_quota() {
        let mut config = TermlinkConfig::default();
        config.hub.max_terminals_per_socket = 10;
        config.hub.max_terminals_per_session = 5;
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn catches_heartbeat_timeout_not_above_interval() {
        let mut config = TermlinkConfig::default();
        config.agent.sidecar.heartbeat_interval_ms = 1_000;
        config.agent.sidecar.heartbeat_timeout_ms = 1_000;
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("heartbeat_timeout_ms"));
    }

    #[test]
    fn catches_bad_hub_url() {
        let mut config = TermlinkConfig::default();
        config.agent.hub_url = "http://example.com".into();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn collects_multiple_errors() {
        let mut config = TermlinkConfig::default();
        config.hub.port = 0;
        config.agent.max_terminals = 0;
        let msg = validate(&config).unwrap_err().to_string();
        assert!(msg.contains("hub.port"));
        assert!(msg.contains("agent.max_terminals"));
    }

    #[test]
    fn zero_keep_alive_is_allowed() {
        let mut config = TermlinkConfig::default();
        config.hub.keep_alive_ms = 0;
        config.hub.idle_timeout_ms = 0;
        assert!(validate(&config).is_ok());
    }
}
