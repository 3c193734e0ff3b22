//! Locating and launching the sidecar helper binary.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use termlink_common::{ErrorCode, TerminalError};
use termlink_config::SidecarConfig;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Environment variable that overrides every other lookup.
pub const SIDECAR_PATH_ENV: &str = "TERMLINK_SIDECAR_PATH";

#[cfg(windows)]
pub const SIDECAR_BINARY_NAME: &str = "termlink-sidecar.exe";
#[cfg(not(windows))]
pub const SIDECAR_BINARY_NAME: &str = "termlink-sidecar";

/// How the helper process ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }

    pub fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("exit code {code}"),
            (None, Some(signal)) => format!("signal {signal}"),
            (None, None) => "unknown status".to_string(),
        }
    }
}

/// The pipes and controls of a launched helper.
///
/// Cancelling `kill` terminates the helper; `exit` resolves once it is gone.
pub struct SidecarIo {
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub exit: oneshot::Receiver<ExitInfo>,
    pub kill: CancellationToken,
}

/// Starts helper processes. Must be called from within a tokio runtime.
pub trait SidecarLauncher: Send + Sync {
    fn launch(&self) -> Result<SidecarIo, TerminalError>;
}

// =============================================================================
// BINARY RESOLUTION
// =============================================================================

/// Candidate binary paths, in lookup order.
pub fn sidecar_candidates(
    env_override: Option<PathBuf>,
    configured: Option<&Path>,
    exe_dir: Option<&Path>,
) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(path) = env_override.filter(|p| !p.as_os_str().is_empty()) {
        candidates.push(path);
    }
    if let Some(path) = configured {
        candidates.push(path.to_path_buf());
    }
    if let Some(dir) = exe_dir {
        candidates.push(dir.join(SIDECAR_BINARY_NAME));
    }
    candidates.push(
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../sidecar/bin")
            .join(SIDECAR_BINARY_NAME),
    );
    candidates
}

/// First candidate that exists on disk.
pub fn resolve_sidecar_path(configured: Option<&Path>) -> Result<PathBuf, TerminalError> {
    let env_override = std::env::var_os(SIDECAR_PATH_ENV).map(PathBuf::from);
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf));

    let candidates = sidecar_candidates(env_override, configured, exe_dir.as_deref());
    candidates
        .iter()
        .find(|path| path.is_file())
        .cloned()
        .ok_or_else(|| {
            let tried: Vec<String> = candidates.iter().map(|p| p.display().to_string()).collect();
            TerminalError::new(
                ErrorCode::SidecarNotFound,
                format!("sidecar binary not found (tried {})", tried.join(", ")),
            )
        })
}

// =============================================================================
// PROCESS LAUNCHER
// =============================================================================

/// Launches the real helper binary with piped stdio.
pub struct ProcessLauncher {
    configured: Option<PathBuf>,
}

impl ProcessLauncher {
    pub fn new(config: &SidecarConfig) -> Self {
        Self {
            configured: config.path.clone(),
        }
    }
}

impl SidecarLauncher for ProcessLauncher {
    fn launch(&self) -> Result<SidecarIo, TerminalError> {
        let path = resolve_sidecar_path(self.configured.as_deref())?;
        tracing::info!(path = %path.display(), "Launching sidecar");

        let mut child = Command::new(&path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                let code = if e.kind() == std::io::ErrorKind::NotFound {
                    ErrorCode::SidecarNotFound
                } else {
                    ErrorCode::StartupFailed
                };
                TerminalError::new(code, format!("failed to launch sidecar {}: {e}", path.display()))
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(TerminalError::new(
                ErrorCode::StartupFailed,
                "sidecar stdio was not captured",
            ));
        };
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(stderr));
        }

        let kill = CancellationToken::new();
        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(watch_child(child, kill.clone(), exit_tx));

        Ok(SidecarIo {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            exit: exit_rx,
            kill,
        })
    }
}

async fn watch_child(mut child: Child, kill: CancellationToken, exit_tx: oneshot::Sender<ExitInfo>) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill.cancelled() => {
            if let Err(e) = child.start_kill() {
                tracing::debug!("sidecar kill error (may already be dead): {e}");
            }
            child.wait().await
        }
    };

    let info = match status {
        Ok(status) => ExitInfo::from_status(status),
        Err(e) => {
            tracing::debug!("sidecar wait error: {e}");
            ExitInfo::default()
        }
    };
    let _ = exit_tx.send(info);
}

async fn drain_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => tracing::debug!(target: "termlink::sidecar", "{line}"),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("sidecar stderr read error: {e}");
                break;
            }
        }
    }
}
