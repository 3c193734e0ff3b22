//! Direct-spawn backend: shells on native pseudo-terminals.
//!
//! Uses `portable-pty` to open a PTY per terminal. Each terminal gets a
//! background reader thread that streams output chunks to the event sink as
//! they arrive and reports the exit (or an unexpected stream closure) when
//! the stream ends. Input goes through a queue to a writer thread, so a
//! shell that stops reading never stalls the caller.

mod io;
mod spawn;
mod types;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use async_trait::async_trait;
use termlink_common::ErrorCode;

use crate::backend::{emit, BackendEvent, CreateOptions, EventSink, TerminalBackend};

pub use spawn::{default_shell, resolve_shell, spawn_pty};
pub use types::PtyHandle;

pub(crate) type Terminals = Arc<Mutex<HashMap<String, PtyHandle>>>;

pub(crate) fn lock(terminals: &Terminals) -> MutexGuard<'_, HashMap<String, PtyHandle>> {
    terminals.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Backend that spawns shells in-process.
pub struct PtyBackend {
    terminals: Terminals,
    sink: EventSink,
}

impl PtyBackend {
    pub fn new(sink: EventSink) -> Self {
        Self {
            terminals: Arc::new(Mutex::new(HashMap::new())),
            sink,
        }
    }

    /// Ids of every live terminal.
    pub fn terminal_ids(&self) -> Vec<String> {
        lock(&self.terminals).keys().cloned().collect()
    }
}

#[async_trait]
impl TerminalBackend for PtyBackend {
    async fn create(&self, options: CreateOptions) {
        let terminal_id = options.terminal_id.clone();

        if self.contains(&terminal_id) {
            emit(
                &self.sink,
                BackendEvent::error(
                    &terminal_id,
                    ErrorCode::StartupFailed,
                    format!("terminal {terminal_id} already exists"),
                ),
            );
            return;
        }

        let (mut handle, reader) = match spawn_pty(&options) {
            Ok(spawned) => spawned,
            Err(error) => {
                tracing::warn!(terminal_id = %terminal_id, error = %error, "PTY spawn failed");
                emit(&self.sink, BackendEvent::Error { terminal_id, error });
                return;
            }
        };

        {
            let mut map = lock(&self.terminals);
            if map.contains_key(&terminal_id) {
                drop(map);
                handle.kill();
                emit(
                    &self.sink,
                    BackendEvent::error(
                        &terminal_id,
                        ErrorCode::StartupFailed,
                        format!("terminal {terminal_id} already exists"),
                    ),
                );
                return;
            }
            map.insert(terminal_id.clone(), handle);
        }

        // Ready goes out before the reader starts so it precedes any output.
        tracing::info!(
            terminal_id = %terminal_id,
            cols = options.cols,
            rows = options.rows,
            "PTY terminal ready"
        );
        emit(
            &self.sink,
            BackendEvent::Ready {
                terminal_id: terminal_id.clone(),
            },
        );

        let terminals = Arc::clone(&self.terminals);
        let sink = self.sink.clone();
        let reader_id = terminal_id.clone();
        let spawned = thread::Builder::new()
            .name(format!("pty-reader-{terminal_id}"))
            .spawn(move || io::read_loop(reader_id, reader, terminals, sink));

        if let Err(e) = spawned {
            if let Some(mut handle) = lock(&self.terminals).remove(&terminal_id) {
                handle.kill();
            }
            emit(
                &self.sink,
                BackendEvent::error(
                    &terminal_id,
                    ErrorCode::AttachFailed,
                    format!("failed to spawn PTY reader thread: {e}"),
                ),
            );
        }
    }

    fn write(&self, terminal_id: &str, data: &str) {
        let queued = lock(&self.terminals)
            .get(terminal_id)
            .map(|handle| handle.write_input(data.as_bytes()));
        match queued {
            Some(Ok(())) => {}
            Some(Err(e)) => tracing::warn!(terminal_id = %terminal_id, "PTY write failed: {e}"),
            None => {
                emit(
                    &self.sink,
                    BackendEvent::error(
                        terminal_id,
                        ErrorCode::TerminalNotFound,
                        format!("no terminal {terminal_id}"),
                    ),
                );
            }
        }
    }

    fn resize(&self, terminal_id: &str, cols: u16, rows: u16) {
        let mut map = lock(&self.terminals);
        match map.get_mut(terminal_id) {
            Some(handle) => {
                if let Err(e) = handle.resize(cols, rows) {
                    tracing::debug!(terminal_id = %terminal_id, "{e}");
                }
            }
            None => {
                drop(map);
                emit(
                    &self.sink,
                    BackendEvent::error(
                        terminal_id,
                        ErrorCode::TerminalNotFound,
                        format!("no terminal {terminal_id}"),
                    ),
                );
            }
        }
    }

    fn close(&self, terminal_id: &str) {
        let handle = lock(&self.terminals).remove(terminal_id);
        if let Some(mut handle) = handle {
            handle.kill();
            // Dropping the handle releases the master side of the PTY.
            drop(handle);
            tracing::info!(terminal_id = %terminal_id, "PTY terminal closed");
        }
    }

    async fn close_all(&self) {
        let ids = self.terminal_ids();
        let count = ids.len();
        for terminal_id in ids {
            self.close(&terminal_id);
        }
        tracing::info!(count, "All PTY terminals closed");
    }

    fn contains(&self, terminal_id: &str) -> bool {
        lock(&self.terminals).contains_key(terminal_id)
    }

    fn terminal_count(&self) -> usize {
        lock(&self.terminals).len()
    }

    fn name(&self) -> &'static str {
        "pty"
    }
}

// =============================================================================
// TESTS
// =============================================================================
