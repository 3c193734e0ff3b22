use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Closed set of error codes carried by `terminal:error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    SessionUnavailable,
    TooManyTerminals,
    CliNotConnected,
    TerminalAlreadyExists,
    TerminalNotFound,
    CliDisconnected,
    SidecarNotFound,
    SidecarCrashed,
    SidecarProtocolMismatch,
    SidecarTimeout,
    StartupFailed,
    RuntimeUnavailable,
    AttachFailed,
    SpawnFailed,
    StreamClosed,
    #[serde(other)]
    Unknown,
}

/// How a viewer is expected to react to an error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorTaxonomy {
    /// Quota or authorization; retry or back off.
    Recoverable,
    /// The peer is gone; the terminal must be recreated.
    LostPeer,
    /// The backend failed for the affected terminal(s).
    Transport,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionUnavailable => "session_unavailable",
            Self::TooManyTerminals => "too_many_terminals",
            Self::CliNotConnected => "cli_not_connected",
            Self::TerminalAlreadyExists => "terminal_already_exists",
            Self::TerminalNotFound => "terminal_not_found",
            Self::CliDisconnected => "cli_disconnected",
            Self::SidecarNotFound => "sidecar_not_found",
            Self::SidecarCrashed => "sidecar_crashed",
            Self::SidecarProtocolMismatch => "sidecar_protocol_mismatch",
            Self::SidecarTimeout => "sidecar_timeout",
            Self::StartupFailed => "startup_failed",
            Self::RuntimeUnavailable => "runtime_unavailable",
            Self::AttachFailed => "attach_failed",
            Self::SpawnFailed => "spawn_failed",
            Self::StreamClosed => "stream_closed",
            Self::Unknown => "unknown",
        }
    }

    pub fn taxonomy(&self) -> ErrorTaxonomy {
        match self {
            Self::SessionUnavailable
            | Self::TooManyTerminals
            | Self::CliNotConnected
            | Self::TerminalAlreadyExists => ErrorTaxonomy::Recoverable,
            Self::CliDisconnected | Self::TerminalNotFound => ErrorTaxonomy::LostPeer,
            _ => ErrorTaxonomy::Transport,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured terminal error: a code plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct TerminalError {
    pub code: ErrorCode,
    pub message: String,
}

impl TerminalError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("config parse error: {0}")]
    ParseError(String),

    #[error("config validation error: {0}")]
    ValidationError(String),
}

#[derive(Debug, thiserror::Error)]
pub enum TermlinkError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Terminal(#[from] TerminalError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for TermlinkError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}
