//! Direct-spawn types: the per-terminal PTY handle.

use std::sync::mpsc;

use portable_pty::{Child, MasterPty, PtySize};

// =============================================================================
// CONSTANTS
// =============================================================================

/// Maximum bytes read from a PTY in one call (8 KB).
pub const PTY_READ_CHUNK: usize = 8_192;

/// How many times the reader polls for the child's exit status once the
/// output stream ends.
pub const EXIT_POLL_ATTEMPTS: u32 = 25;

/// Delay between exit-status polls.
pub const EXIT_POLL_INTERVAL_MS: u64 = 20;

/// Default terminal columns.
pub const DEFAULT_COLS: u16 = 80;

/// Default terminal rows.
pub const DEFAULT_ROWS: u16 = 24;

// =============================================================================
// PTY HANDLE
// =============================================================================

/// A single spawned shell.
///
/// Owns the master side of the PTY pair and the child process. Output is
/// read and input written on two dedicated threads; the handle only keeps
/// the sending end of the input queue.
pub struct PtyHandle {
    /// Input queue drained by the writer thread. Dropping it ends the thread.
    pub(super) input: mpsc::Sender<Vec<u8>>,
    /// Child process handle (for wait / kill).
    pub(super) child: Box<dyn Child + Send + Sync>,
    /// Master PTY handle (for resize). Dropping it releases the PTY.
    pub(super) master: Box<dyn MasterPty + Send>,
    /// Current terminal size.
    pub(super) size: PtySize,
}

pub(super) fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// `cols`×`rows`, with a zero dimension taken from `fallback`.
pub(super) fn size_or(cols: u16, rows: u16, fallback: PtySize) -> PtySize {
    pty_size(
        if cols == 0 { fallback.cols } else { cols },
        if rows == 0 { fallback.rows } else { rows },
    )
}

/// Size a new PTY opens at.
pub(super) fn initial_size(cols: u16, rows: u16) -> PtySize {
    size_or(cols, rows, pty_size(DEFAULT_COLS, DEFAULT_ROWS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pty_constants_are_sane() {
        assert_eq!(PTY_READ_CHUNK, 8_192);
        assert_eq!(DEFAULT_COLS, 80);
        assert_eq!(DEFAULT_ROWS, 24);
        assert!(EXIT_POLL_ATTEMPTS as u64 * EXIT_POLL_INTERVAL_MS >= 250);
    }

    #[test]
    fn pty_size_has_no_pixels() {
        let size = pty_size(120, 40);
        assert_eq!(size.cols, 120);
        assert_eq!(size.rows, 40);
        assert_eq!(size.pixel_width, 0);
        assert_eq!(size.pixel_height, 0);
    }

    #[test]
    fn zero_dimensions_take_defaults() {
        let size = initial_size(0, 0);
        assert_eq!((size.cols, size.rows), (DEFAULT_COLS, DEFAULT_ROWS));

        let size = initial_size(132, 0);
        assert_eq!((size.cols, size.rows), (132, DEFAULT_ROWS));

        let size = initial_size(100, 30);
        assert_eq!((size.cols, size.rows), (100, 30));
    }

    #[test]
    fn resize_keeps_current_dimension_when_zero() {
        let current = pty_size(120, 40);
        let size = size_or(0, 50, current);
        assert_eq!((size.cols, size.rows), (120, 50));
        let size = size_or(90, 0, current);
        assert_eq!((size.cols, size.rows), (90, 40));
    }
}
