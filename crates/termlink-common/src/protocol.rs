//! Wire frames exchanged over hub sockets.
//!
//! Terminal frames are `{"event": "terminal:<name>", "data": {...}}` with
//! camelCase fields. The connection hello that precedes them is tagged by
//! `type`, like the relay envelope it grew out of.

use serde::{Deserialize, Serialize};

use crate::errors::{ErrorCode, TerminalError};

// =============================================================================
// CONNECTION HELLO
// =============================================================================

/// First frame every hub socket sends to identify itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ConnectionHello {
    #[serde(rename = "viewer_hello")]
    ViewerHello { namespace: String },

    #[serde(rename = "agent_hello")]
    AgentHello {
        namespace: String,
        #[serde(rename = "sessionId")]
        session_id: String,
    },
}

/// Hub reply to a connection hello.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HelloResponse {
    #[serde(rename = "connected")]
    Connected {
        #[serde(rename = "socketId")]
        socket_id: String,
    },

    #[serde(rename = "error")]
    Error { message: String },
}

// =============================================================================
// VIEWER → HUB
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTerminal {
    pub session_id: String,
    pub terminal_id: String,
    pub cols: u16,
    pub rows: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shell_options: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachTerminal {
    pub session_id: String,
    pub terminal_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteTerminal {
    pub terminal_id: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizeTerminal {
    pub terminal_id: String,
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseTerminal {
    pub terminal_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Requests a viewer socket sends to the hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ViewerRequest {
    #[serde(rename = "terminal:create")]
    Create(CreateTerminal),

    #[serde(rename = "terminal:attach")]
    Attach(AttachTerminal),

    #[serde(rename = "terminal:write")]
    Write(WriteTerminal),

    #[serde(rename = "terminal:resize")]
    Resize(ResizeTerminal),

    #[serde(rename = "terminal:close")]
    Close(CloseTerminal),
}

// =============================================================================
// HUB → AGENT
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenTerminal {
    pub session_id: String,
    pub terminal_id: String,
    pub cols: u16,
    pub rows: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shell_options: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionWrite {
    pub session_id: String,
    pub terminal_id: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResize {
    pub session_id: String,
    pub terminal_id: String,
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionClose {
    pub session_id: String,
    pub terminal_id: String,
}

/// Requests the hub forwards to the agent serving a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum AgentRequest {
    #[serde(rename = "terminal:open")]
    Open(OpenTerminal),

    #[serde(rename = "terminal:write")]
    Write(SessionWrite),

    #[serde(rename = "terminal:resize")]
    Resize(SessionResize),

    #[serde(rename = "terminal:close")]
    Close(SessionClose),
}

impl AgentRequest {
    pub fn terminal_id(&self) -> &str {
        match self {
            Self::Open(m) => &m.terminal_id,
            Self::Write(m) => &m.terminal_id,
            Self::Resize(m) => &m.terminal_id,
            Self::Close(m) => &m.terminal_id,
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            Self::Open(m) => &m.session_id,
            Self::Write(m) => &m.session_id,
            Self::Resize(m) => &m.session_id,
            Self::Close(m) => &m.session_id,
        }
    }
}

impl From<&CreateTerminal> for OpenTerminal {
    fn from(create: &CreateTerminal) -> Self {
        Self {
            session_id: create.session_id.clone(),
            terminal_id: create.terminal_id.clone(),
            cols: create.cols,
            rows: create.rows,
            shell: create.shell.clone(),
            shell_options: create.shell_options.clone(),
        }
    }
}

// =============================================================================
// AGENT → HUB → VIEWER
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalReady {
    pub session_id: String,
    pub terminal_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalOutput {
    pub session_id: String,
    pub terminal_id: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalExit {
    pub session_id: String,
    pub terminal_id: String,
    #[serde(default)]
    pub code: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalFailure {
    pub session_id: String,
    pub terminal_id: String,
    pub code: ErrorCode,
    pub message: String,
}

/// Terminal lifecycle events. Agents emit them to the hub, and the hub
/// relays them (plus its own errors) to the owning viewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum TerminalEvent {
    #[serde(rename = "terminal:ready")]
    Ready(TerminalReady),

    #[serde(rename = "terminal:output")]
    Output(TerminalOutput),

    #[serde(rename = "terminal:exit")]
    Exit(TerminalExit),

    #[serde(rename = "terminal:error")]
    Error(TerminalFailure),
}

impl TerminalEvent {
    pub fn ready(session_id: &str, terminal_id: &str) -> Self {
        Self::Ready(TerminalReady {
            session_id: session_id.to_string(),
            terminal_id: terminal_id.to_string(),
        })
    }

    pub fn error(session_id: &str, terminal_id: &str, error: TerminalError) -> Self {
        Self::Error(TerminalFailure {
            session_id: session_id.to_string(),
            terminal_id: terminal_id.to_string(),
            code: error.code,
            message: error.message,
        })
    }

    pub fn terminal_id(&self) -> &str {
        match self {
            Self::Ready(m) => &m.terminal_id,
            Self::Output(m) => &m.terminal_id,
            Self::Exit(m) => &m.terminal_id,
            Self::Error(m) => &m.terminal_id,
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            Self::Ready(m) => &m.session_id,
            Self::Output(m) => &m.session_id,
            Self::Exit(m) => &m.session_id,
            Self::Error(m) => &m.session_id,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
