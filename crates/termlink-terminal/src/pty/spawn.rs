//! PTY spawn logic: open a PTY pair and start the user's shell on it.

use std::io::Read;
use std::sync::mpsc;
use std::thread;

use portable_pty::{native_pty_system, CommandBuilder};
use termlink_common::{ErrorCode, TerminalError};

use super::io::write_loop;
use super::types::{initial_size, PtyHandle};
use crate::backend::CreateOptions;

// =============================================================================
// SHELL DETECTION
// =============================================================================

/// Get the user's default shell.
///
/// - Unix: reads `$SHELL`, falls back to `/bin/sh`
/// - Windows: reads `$COMSPEC`, falls back to `cmd.exe`
pub fn default_shell() -> String {
    #[cfg(unix)]
    {
        std::env::var("SHELL")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "/bin/sh".to_string())
    }
    #[cfg(windows)]
    {
        std::env::var("COMSPEC").unwrap_or_else(|_| "cmd.exe".to_string())
    }
}

/// The shell a create request resolves to.
pub fn resolve_shell(options: &CreateOptions) -> String {
    options
        .shell
        .clone()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(default_shell)
}

// =============================================================================
// COMMAND
// =============================================================================

/// Build the `CommandBuilder` for a create request.
///
/// The process environment is inherited; `options.env` is layered on top and
/// `TERM` is always forced so full-screen programs render correctly.
fn build_shell_command(shell: &str, options: &CreateOptions) -> CommandBuilder {
    let mut cmd = CommandBuilder::new(shell);

    if options.shell_options.is_empty() {
        // Login shell so profile files are sourced.
        #[cfg(unix)]
        {
            cmd.arg("-l");
        }
    } else {
        cmd.args(&options.shell_options);
    }

    cmd.cwd(&options.cwd);
    for (key, value) in &options.env {
        cmd.env(key, value);
    }
    cmd.env("TERM", "xterm-256color");

    cmd
}

// =============================================================================
// SPAWN
// =============================================================================

/// Spawn a shell on a fresh PTY.
///
/// Starts the input writer thread and returns the handle plus the reader
/// half of the master, which the caller moves onto a reader thread. A zero
/// `cols` or `rows` opens at the default size. Any failure after the child
/// exists kills it before returning.
pub fn spawn_pty(options: &CreateOptions) -> Result<(PtyHandle, Box<dyn Read + Send>), TerminalError> {
    let pty_system = native_pty_system();
    let size = initial_size(options.cols, options.rows);

    let pair = pty_system.openpty(size).map_err(|e| {
        TerminalError::new(
            ErrorCode::RuntimeUnavailable,
            format!("pseudo-terminal unavailable: {e}"),
        )
    })?;

    let shell = resolve_shell(options);
    let cmd = build_shell_command(&shell, options);

    let mut child = pair.slave.spawn_command(cmd).map_err(|e| {
        TerminalError::new(
            ErrorCode::SpawnFailed,
            format!("failed to spawn shell '{shell}': {e}"),
        )
    })?;

    // Only the master side is needed from here on.
    drop(pair.slave);

    let reader = match pair.master.try_clone_reader() {
        Ok(reader) => reader,
        Err(e) => {
            kill_quietly(&mut child);
            return Err(TerminalError::new(
                ErrorCode::AttachFailed,
                format!("failed to clone PTY reader: {e}"),
            ));
        }
    };

    let writer = match pair.master.take_writer() {
        Ok(writer) => writer,
        Err(e) => {
            kill_quietly(&mut child);
            return Err(TerminalError::new(
                ErrorCode::AttachFailed,
                format!("failed to take PTY writer: {e}"),
            ));
        }
    };

    let (input, queue) = mpsc::channel();
    let writer_id = options.terminal_id.clone();
    let spawned = thread::Builder::new()
        .name(format!("pty-writer-{}", options.terminal_id))
        .spawn(move || write_loop(writer_id, writer, queue));
    if let Err(e) = spawned {
        kill_quietly(&mut child);
        return Err(TerminalError::new(
            ErrorCode::AttachFailed,
            format!("failed to spawn PTY writer thread: {e}"),
        ));
    }

    Ok((
        PtyHandle {
            input,
            child,
            master: pair.master,
            size,
        },
        reader,
    ))
}

fn kill_quietly(child: &mut Box<dyn portable_pty::Child + Send + Sync>) {
    if let Err(e) = child.kill() {
        tracing::debug!("PTY kill error (may already be dead): {e}");
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::super::types::{DEFAULT_COLS, DEFAULT_ROWS};
    use super::*;
    use std::collections::HashMap;

    fn options(shell: Option<&str>) -> CreateOptions {
        CreateOptions {
            terminal_id: "t1".into(),
            cwd: std::env::temp_dir(),
            env: HashMap::new(),
            shell: shell.map(String::from),
            shell_options: vec![],
            cols: 80,
            rows: 24,
        }
    }

    #[test]
    fn default_shell_returns_nonempty() {
        assert!(!default_shell().is_empty());
    }

    #[test]
    fn explicit_shell_wins() {
        assert_eq!(resolve_shell(&options(Some("/bin/zsh"))), "/bin/zsh");
    }

    #[test]
    fn empty_shell_falls_back_to_default() {
        assert_eq!(resolve_shell(&options(Some(""))), default_shell());
        assert_eq!(resolve_shell(&options(None)), default_shell());
    }

    #[cfg(unix)]
    #[test]
    fn spawn_missing_shell_reports_spawn_failed() {
        let opts = options(Some("/definitely/not/a/shell"));
        match spawn_pty(&opts) {
            Err(err) => assert_eq!(err.code, ErrorCode::SpawnFailed),
            Ok((mut handle, _reader)) => {
                // Some platforms defer exec failure to the child; it must
                // then exit on its own.
                let _ = handle.child.kill();
            }
        }
    }

    #[cfg(unix)]
    #[test]
    fn spawn_sh_creates_handle() {
        let opts = options(Some("/bin/sh"));
        let (mut handle, _reader) = spawn_pty(&opts).expect("spawn should succeed");
        assert_eq!(handle.size.cols, 80);
        assert_eq!(handle.size.rows, 24);
        handle.child.kill().ok();
    }

    #[cfg(unix)]
    #[test]
    fn spawn_with_zero_size_uses_defaults() {
        let mut opts = options(Some("/bin/sh"));
        opts.cols = 0;
        opts.rows = 0;
        let (mut handle, _reader) = spawn_pty(&opts).expect("spawn should succeed");
        assert_eq!(handle.size.cols, DEFAULT_COLS);
        assert_eq!(handle.size.rows, DEFAULT_ROWS);

        handle.resize(0, 50).expect("resize should succeed");
        assert_eq!((handle.size.cols, handle.size.rows), (DEFAULT_COLS, 50));
        handle.child.kill().ok();
    }
}
