//! Configuration schema types for termlink.
//!
//! All structs use `serde(default)` so partial configs work correctly.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Current config schema version.
pub const CONFIG_SCHEMA_VERSION: u32 = 1;

// =============================================================================
// Hub Config
// =============================================================================

/// Relay-side limits and timers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Port the hub listens on.
    pub port: u16,
    /// Attached terminals a single viewer socket may own.
    pub max_terminals_per_socket: usize,
    /// Terminals (attached or orphaned) a single session may hold.
    pub max_terminals_per_session: usize,
    /// Grace period for an orphaned terminal before it is reclaimed.
    /// Zero reclaims immediately on viewer disconnect.
    pub keep_alive_ms: u64,
    /// Inactivity window for an attached terminal. Zero disables.
    pub idle_timeout_ms: u64,
    /// How long a removal reason is remembered for reattach diagnostics.
    pub removal_reason_ttl_ms: u64,
    /// Age after which a session with no agent is forgotten.
    pub session_ttl_secs: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            max_terminals_per_socket: 4,
            max_terminals_per_session: 8,
            keep_alive_ms: 30_000,
            idle_timeout_ms: 1_800_000,
            removal_reason_ttl_ms: 60_000,
            session_ttl_secs: 300,
        }
    }
}

impl HubConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }

    pub fn removal_reason_ttl(&self) -> Duration {
        Duration::from_millis(self.removal_reason_ttl_ms)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}

// =============================================================================
// Agent Config
// =============================================================================

/// Which terminal backend the agent uses.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendPreference {
    /// Sidecar on Windows, direct PTY spawn elsewhere.
    #[default]
    Auto,
    Pty,
    Sidecar,
}

/// Helper-process timers and location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SidecarConfig {
    /// Explicit helper binary. Checked after `TERMLINK_SIDECAR_PATH`.
    pub path: Option<PathBuf>,
    pub hello_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            path: None,
            hello_timeout_ms: 5_000,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 90_000,
            shutdown_timeout_ms: 3_000,
        }
    }
}

/// Agent-side settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Hub WebSocket URL.
    pub hub_url: String,
    /// Local cap on concurrently open terminals.
    pub max_terminals: usize,
    pub backend: BackendPreference,
    /// Working directory for new shells. Defaults to the agent's cwd.
    pub cwd: Option<PathBuf>,
    /// Extra environment variables for every shell.
    pub env: HashMap<String, String>,
    pub sidecar: SidecarConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            hub_url: "ws://127.0.0.1:8080".into(),
            max_terminals: 8,
            backend: BackendPreference::Auto,
            cwd: None,
            env: HashMap::new(),
            sidecar: SidecarConfig::default(),
        }
    }
}

// =============================================================================
// Root
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TermlinkConfig {
    pub hub: HubConfig,
    pub agent: AgentConfig,
}
