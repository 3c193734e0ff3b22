//! Sidecar stdio protocol: one JSON object per line, tagged by `type`.

use std::collections::HashMap;
use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use termlink_common::ErrorCode;

/// Protocol version this backend speaks.
pub const SIDECAR_PROTOCOL_VERSION: u32 = 1;

/// Requests written to the sidecar's stdin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SidecarRequest {
    #[serde(rename_all = "camelCase")]
    Open {
        terminal_id: String,
        cwd: PathBuf,
        cols: u16,
        rows: u16,
        env: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        shell: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        shell_options: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    Write { terminal_id: String, data: String },
    #[serde(rename_all = "camelCase")]
    Resize {
        terminal_id: String,
        cols: u16,
        rows: u16,
    },
    #[serde(rename_all = "camelCase")]
    Close { terminal_id: String },
    Ping,
    Shutdown,
}

impl SidecarRequest {
    /// Serialize as one protocol line, newline included.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Events read from the sidecar's stdout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SidecarEvent {
    Hello {
        version: String,
        protocol: u32,
    },
    #[serde(rename_all = "camelCase")]
    Ready {
        terminal_id: String,
        #[serde(default)]
        display_name: Option<String>,
    },
    /// `data` is base64-encoded raw terminal output.
    #[serde(rename_all = "camelCase")]
    Output { terminal_id: String, data: String },
    #[serde(rename_all = "camelCase")]
    Exit {
        terminal_id: String,
        #[serde(default)]
        code: Option<i32>,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        #[serde(default)]
        terminal_id: Option<String>,
        code: ErrorCode,
        message: String,
    },
    Pong,
    ShutdownAck,
}

impl SidecarEvent {
    pub fn parse_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

/// Decode an `output` payload. Returns `None` for empty or invalid payloads.
pub fn decode_output(data: &str) -> Option<Vec<u8>> {
    match B64.decode(data.trim()) {
        Ok(bytes) if bytes.is_empty() => None,
        Ok(bytes) => Some(bytes),
        Err(e) => {
            tracing::warn!(error = %e, "Invalid base64 in sidecar output");
            None
        }
    }
}
