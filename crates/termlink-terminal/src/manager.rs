//! Agent-side terminal manager: picks a backend and enforces the local
//! terminal limit.

use std::path::PathBuf;

use termlink_common::ErrorCode;
use termlink_config::{AgentConfig, BackendPreference};

use crate::backend::{emit, BackendEvent, CreateOptions, EventSink, TerminalBackend};
use crate::pty::PtyBackend;
use crate::sidecar::SidecarBackend;

/// Which backend a preference resolves to on this platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Pty,
    Sidecar,
}

impl BackendKind {
    pub fn select(preference: BackendPreference) -> Self {
        match preference {
            BackendPreference::Pty => Self::Pty,
            BackendPreference::Sidecar => Self::Sidecar,
            BackendPreference::Auto if cfg!(windows) => Self::Sidecar,
            BackendPreference::Auto => Self::Pty,
        }
    }
}

pub struct TerminalManager {
    backend: Box<dyn TerminalBackend>,
    sink: EventSink,
    max_terminals: usize,
    default_cwd: PathBuf,
}

impl TerminalManager {
    /// Build the manager and its backend from agent config. Backend events
    /// go to `sink`.
    pub fn new(config: &AgentConfig, sink: EventSink) -> Self {
        let backend: Box<dyn TerminalBackend> = match BackendKind::select(config.backend) {
            BackendKind::Pty => Box::new(PtyBackend::new(sink.clone())),
            BackendKind::Sidecar => Box::new(SidecarBackend::new(&config.sidecar, sink.clone())),
        };
        tracing::info!(backend = backend.name(), max = config.max_terminals, "Terminal manager ready");

        let mut manager = Self::with_backend(backend, sink, config.max_terminals);
        if let Some(cwd) = &config.cwd {
            manager.default_cwd = cwd.clone();
        }
        manager
    }

    /// Use an already constructed backend. The backend must report to the
    /// same sink.
    pub fn with_backend(backend: Box<dyn TerminalBackend>, sink: EventSink, max_terminals: usize) -> Self {
        let default_cwd = std::env::current_dir()
            .ok()
            .or_else(dirs::home_dir)
            .unwrap_or_else(std::env::temp_dir);
        Self {
            backend,
            sink,
            max_terminals,
            default_cwd,
        }
    }

    /// Working directory for terminals that do not name one.
    pub fn default_cwd(&self) -> &PathBuf {
        &self.default_cwd
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub async fn create(&self, options: CreateOptions) {
        let count = self.backend.terminal_count();
        if count >= self.max_terminals {
            tracing::warn!(
                terminal_id = %options.terminal_id,
                count,
                max = self.max_terminals,
                "Refusing terminal: limit reached"
            );
            emit(
                &self.sink,
                BackendEvent::error(
                    &options.terminal_id,
                    ErrorCode::TooManyTerminals,
                    format!("at most {} terminals may be open", self.max_terminals),
                ),
            );
            return;
        }
        self.backend.create(options).await;
    }

    pub fn write(&self, terminal_id: &str, data: &str) {
        if self.ensure_known(terminal_id) {
            self.backend.write(terminal_id, data);
        }
    }

    pub fn resize(&self, terminal_id: &str, cols: u16, rows: u16) {
        if self.ensure_known(terminal_id) {
            self.backend.resize(terminal_id, cols, rows);
        }
    }

    pub fn close(&self, terminal_id: &str) {
        self.backend.close(terminal_id);
    }

    pub async fn close_all(&self) {
        self.backend.close_all().await;
    }

    pub fn count(&self) -> usize {
        self.backend.terminal_count()
    }

    fn ensure_known(&self, terminal_id: &str) -> bool {
        if self.backend.contains(terminal_id) {
            return true;
        }
        emit(
            &self.sink,
            BackendEvent::error(
                terminal_id,
                ErrorCode::TerminalNotFound,
                format!("no terminal {terminal_id}"),
            ),
        );
        false
    }
}
