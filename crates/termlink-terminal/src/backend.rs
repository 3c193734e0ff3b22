//! Terminal backend abstraction over direct PTY spawning and the sidecar
//! helper process.
//!
//! Backends never return errors from their operations. Every outcome,
//! including failures, is reported as a `BackendEvent` on the sink the
//! backend was constructed with, so the caller sees one uniform stream.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use termlink_common::{ErrorCode, TerminalError};
use tokio::sync::mpsc;

/// Everything a backend needs to open a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOptions {
    pub terminal_id: String,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub shell: Option<String>,
    pub shell_options: Vec<String>,
    pub cols: u16,
    pub rows: u16,
}

/// Events raised by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    Ready {
        terminal_id: String,
    },
    Output {
        terminal_id: String,
        data: Vec<u8>,
    },
    Exit {
        terminal_id: String,
        code: Option<i32>,
        signal: Option<String>,
    },
    Error {
        terminal_id: String,
        error: TerminalError,
    },
}

impl BackendEvent {
    pub fn error(terminal_id: &str, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            terminal_id: terminal_id.to_string(),
            error: TerminalError::new(code, message),
        }
    }

    pub fn terminal_id(&self) -> &str {
        match self {
            Self::Ready { terminal_id }
            | Self::Output { terminal_id, .. }
            | Self::Exit { terminal_id, .. }
            | Self::Error { terminal_id, .. } => terminal_id,
        }
    }
}

/// Where backend events go. There is exactly one consumer.
pub type EventSink = mpsc::UnboundedSender<BackendEvent>;

/// Capability contract shared by the direct-spawn and sidecar backends.
#[async_trait]
pub trait TerminalBackend: Send + Sync {
    /// Open a terminal. Emits `Ready` on success, `Error` otherwise.
    async fn create(&self, options: CreateOptions);

    /// Send keystrokes to a terminal.
    fn write(&self, terminal_id: &str, data: &str);

    fn resize(&self, terminal_id: &str, cols: u16, rows: u16);

    /// Close one terminal. Idempotent.
    fn close(&self, terminal_id: &str);

    /// Close every terminal and release backend-wide resources.
    async fn close_all(&self);

    /// Whether the backend is tracking this terminal id.
    fn contains(&self, terminal_id: &str) -> bool;

    fn terminal_count(&self) -> usize;

    /// Backend name for logs.
    fn name(&self) -> &'static str;
}

/// Send an event, ignoring a dropped receiver (the agent is shutting down).
pub(crate) fn emit(sink: &EventSink, event: BackendEvent) {
    if sink.send(event).is_err() {
        tracing::trace!("backend event dropped: receiver closed");
    }
}
