//! PTY I/O: input queueing, resize, kill, and the reader and writer threads.

use std::io::{Read, Write};
use std::sync::mpsc;
use std::time::Duration;

use termlink_common::ErrorCode;

use super::types::{size_or, PtyHandle, EXIT_POLL_ATTEMPTS, EXIT_POLL_INTERVAL_MS, PTY_READ_CHUNK};
use super::Terminals;
use crate::backend::{emit, BackendEvent, EventSink};

// =============================================================================
// HANDLE OPERATIONS
// =============================================================================

impl PtyHandle {
    /// Queue raw input bytes for the writer thread.
    pub fn write_input(&self, data: &[u8]) -> Result<(), String> {
        self.input
            .send(data.to_vec())
            .map_err(|_| "PTY writer thread is gone".to_string())
    }

    /// Resize the PTY. A zero dimension keeps its current value.
    pub fn resize(&mut self, cols: u16, rows: u16) -> Result<(), String> {
        let new_size = size_or(cols, rows, self.size);
        self.master
            .resize(new_size)
            .map_err(|e| format!("PTY resize failed: {e}"))?;
        self.size = new_size;
        Ok(())
    }

    /// Kill the child if it is still running and reap it.
    pub fn kill(&mut self) {
        match self.child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) => {}
            Err(e) => tracing::debug!("PTY try_wait error: {e}"),
        }
        if let Err(e) = self.child.kill() {
            tracing::debug!("PTY kill error (may already be dead): {e}");
        }
        if let Err(e) = self.child.wait() {
            tracing::debug!("PTY wait error: {e}");
        }
    }

    /// Poll for the child's exit status for a short while.
    fn poll_exit_code(&mut self) -> Option<i32> {
        for _ in 0..EXIT_POLL_ATTEMPTS {
            match self.child.try_wait() {
                Ok(Some(status)) => return Some(status.exit_code() as i32),
                Ok(None) => std::thread::sleep(Duration::from_millis(EXIT_POLL_INTERVAL_MS)),
                Err(e) => {
                    tracing::debug!("PTY try_wait error: {e}");
                    return None;
                }
            }
        }
        None
    }
}

// =============================================================================
// WRITER THREAD
// =============================================================================

/// Write queued input to the PTY in order until the handle drops its end of
/// the queue or a write fails.
pub(super) fn write_loop(
    terminal_id: String,
    mut writer: Box<dyn Write + Send>,
    input: mpsc::Receiver<Vec<u8>>,
) {
    while let Ok(data) = input.recv() {
        let written = writer.write_all(&data).and_then(|()| writer.flush());
        if let Err(e) = written {
            tracing::warn!(terminal_id = %terminal_id, "PTY write failed: {e}");
            break;
        }
    }
    tracing::debug!(terminal_id = %terminal_id, "PTY writer stopped");
}

// =============================================================================
// READER THREAD
// =============================================================================

/// Forward PTY output to the sink until the stream ends, then report how
/// the terminal went away.
///
/// If the terminal was closed on purpose its handle is already gone from
/// `terminals` and nothing is reported.
pub(super) fn read_loop(
    terminal_id: String,
    mut reader: Box<dyn Read + Send>,
    terminals: Terminals,
    sink: EventSink,
) {
    let mut buf = [0u8; PTY_READ_CHUNK];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if sink
                    .send(BackendEvent::Output {
                        terminal_id: terminal_id.clone(),
                        data: buf[..n].to_vec(),
                    })
                    .is_err()
                {
                    break;
                }
            }
            Err(e) => {
                // Linux reports EIO once the slave side closes.
                tracing::debug!(terminal_id = %terminal_id, "PTY reader error: {e}");
                break;
            }
        }
    }

    let handle = super::lock(&terminals).remove(&terminal_id);
    let Some(mut handle) = handle else {
        return;
    };

    match handle.poll_exit_code() {
        Some(code) => {
            tracing::info!(terminal_id = %terminal_id, code, "Shell exited");
            emit(
                &sink,
                BackendEvent::Exit {
                    terminal_id,
                    code: Some(code),
                    signal: None,
                },
            );
        }
        None => {
            tracing::warn!(terminal_id = %terminal_id, "PTY stream closed while shell still running");
            handle.kill();
            emit(
                &sink,
                BackendEvent::error(
                    &terminal_id,
                    ErrorCode::StreamClosed,
                    "terminal output stream closed unexpectedly",
                ),
            );
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
