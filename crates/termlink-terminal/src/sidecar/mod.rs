//! Helper-process backend: shells hosted by an external sidecar binary.
//!
//! One sidecar is launched lazily on the first create and shared by every
//! terminal. The backend talks to it over line-delimited JSON on stdio:
//!
//! ```text
//! NotStarted ──create──▶ Starting ──hello(v1)──▶ Ready ──close_all──▶ ShuttingDown
//!                           │                      │                      │
//!                           ▼                      ▼                      ▼
//!                         Failed            Exited (crash /          Exited
//!                                           heartbeat timeout)
//! ```
//!
//! A create from `Failed` or `Exited` launches a fresh sidecar. A create
//! during `ShuttingDown` kills the outgoing sidecar and launches a fresh one.
//! Each launch bumps a generation counter; callbacks from an older generation
//! are ignored.

mod launcher;
mod protocol;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use termlink_common::{ErrorCode, ScheduledTask, TerminalError};
use termlink_config::SidecarConfig;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backend::{emit, BackendEvent, CreateOptions, EventSink, TerminalBackend};

pub use launcher::{
    resolve_sidecar_path, sidecar_candidates, ExitInfo, ProcessLauncher, SidecarIo,
    SidecarLauncher, SIDECAR_BINARY_NAME, SIDECAR_PATH_ENV,
};
pub use protocol::{decode_output, SidecarEvent, SidecarRequest, SIDECAR_PROTOCOL_VERSION};

// =============================================================================
// TYPES
// =============================================================================

/// Sidecar timer settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SidecarTimings {
    pub hello_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl From<&SidecarConfig> for SidecarTimings {
    fn from(config: &SidecarConfig) -> Self {
        Self {
            hello_timeout: Duration::from_millis(config.hello_timeout_ms),
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms),
            heartbeat_timeout: Duration::from_millis(config.heartbeat_timeout_ms),
            shutdown_timeout: Duration::from_millis(config.shutdown_timeout_ms),
        }
    }
}

type StartWaiter = oneshot::Sender<Result<(), TerminalError>>;

#[derive(Debug)]
enum Phase {
    NotStarted,
    Starting(Vec<StartWaiter>),
    Ready,
    ShuttingDown,
    Failed,
    Exited,
}

/// Why the backend itself ended the sidecar. An exit after one of these is
/// expected and not reported as a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Termination {
    Shutdown,
    HeartbeatTimeout,
    ProtocolMismatch,
    StartFailed,
}

/// A line queued for the sidecar's stdin.
struct Outgoing {
    request: SidecarRequest,
    /// Set for `open`; a failed write fails that terminal.
    open_for: Option<String>,
}

struct State {
    phase: Phase,
    generation: u64,
    /// Tracked terminal ids; `true` once `open` has been sent.
    terminals: HashMap<String, bool>,
    writer: Option<mpsc::UnboundedSender<Outgoing>>,
    kill: Option<CancellationToken>,
    termination: Option<Termination>,
    last_pong: Instant,
    hello_timer: Option<ScheduledTask>,
    heartbeat: Option<ScheduledTask>,
    shutdown_timer: Option<ScheduledTask>,
}

impl State {
    fn new() -> Self {
        Self {
            phase: Phase::NotStarted,
            generation: 0,
            terminals: HashMap::new(),
            writer: None,
            kill: None,
            termination: None,
            last_pong: Instant::now(),
            hello_timer: None,
            heartbeat: None,
            shutdown_timer: None,
        }
    }

    /// Move to `phase`, returning the start waiters if we were starting.
    fn transition(&mut self, phase: Phase) -> Vec<StartWaiter> {
        match std::mem::replace(&mut self.phase, phase) {
            Phase::Starting(waiters) => waiters,
            _ => Vec::new(),
        }
    }

    fn kill(&self) {
        if let Some(kill) = &self.kill {
            kill.cancel();
        }
    }

    fn send(&self, request: SidecarRequest) -> bool {
        match &self.writer {
            Some(writer) => writer
                .send(Outgoing {
                    request,
                    open_for: None,
                })
                .is_ok(),
            None => false,
        }
    }

    fn drain_terminals(&mut self) -> Vec<String> {
        self.terminals.drain().map(|(id, _)| id).collect()
    }
}

struct Shared {
    launcher: Box<dyn SidecarLauncher>,
    timings: SidecarTimings,
    sink: EventSink,
    state: Mutex<State>,
}

/// Backend that hosts terminals in the sidecar helper process.
pub struct SidecarBackend {
    shared: Arc<Shared>,
}

// =============================================================================
// CONSTRUCTION
// =============================================================================

impl SidecarBackend {
    /// Backend that launches the real sidecar binary.
    pub fn new(config: &SidecarConfig, sink: EventSink) -> Self {
        Self::with_launcher(
            Box::new(ProcessLauncher::new(config)),
            SidecarTimings::from(config),
            sink,
        )
    }

    pub fn with_launcher(
        launcher: Box<dyn SidecarLauncher>,
        timings: SidecarTimings,
        sink: EventSink,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                launcher,
                timings,
                sink,
                state: Mutex::new(State::new()),
            }),
        }
    }

    /// Whether a sidecar is up and has completed its handshake.
    pub fn is_ready(&self) -> bool {
        matches!(self.shared.lock().phase, Phase::Ready)
    }
}

impl Drop for SidecarBackend {
    fn drop(&mut self) {
        self.shared.lock().kill();
    }
}

// =============================================================================
// LIFECYCLE
// =============================================================================

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait until a sidecar is ready, launching one if needed. Concurrent
    /// callers share the in-flight start.
    async fn ensure_started(self: &Arc<Self>) -> Result<(), TerminalError> {
        let (tx, rx) = oneshot::channel();
        let launch = {
            let mut guard = self.lock();
            let state = &mut *guard;
            match state.phase {
                Phase::Ready => return Ok(()),
                Phase::Starting(ref mut waiters) => {
                    waiters.push(tx);
                    None
                }
                Phase::ShuttingDown => {
                    // The old sidecar has no terminals left; its exit is
                    // ignored once the generation moves on.
                    tracing::debug!("Sidecar still shutting down, replacing it");
                    state.kill();
                    state.kill = None;
                    state.writer = None;
                    state.shutdown_timer = None;
                    state.generation += 1;
                    state.termination = None;
                    state.phase = Phase::Starting(vec![tx]);
                    Some(state.generation)
                }
                Phase::NotStarted | Phase::Failed | Phase::Exited => {
                    state.generation += 1;
                    state.termination = None;
                    state.phase = Phase::Starting(vec![tx]);
                    Some(state.generation)
                }
            }
        };

        if let Some(generation) = launch {
            self.launch(generation);
        }

        rx.await.unwrap_or_else(|_| {
            Err(TerminalError::new(
                ErrorCode::SidecarCrashed,
                "sidecar start was abandoned",
            ))
        })
    }

    fn launch(self: &Arc<Self>, generation: u64) {
        let io = match self.launcher.launch() {
            Ok(io) => io,
            Err(error) => {
                tracing::warn!(code = %error.code, "Sidecar launch failed: {}", error.message);
                let waiters = {
                    let mut state = self.lock();
                    if state.generation != generation {
                        return;
                    }
                    state.transition(Phase::Failed)
                };
                for waiter in waiters {
                    let _ = waiter.send(Err(error.clone()));
                }
                return;
            }
        };

        let SidecarIo {
            stdin,
            stdout,
            exit,
            kill,
        } = io;
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();

        {
            let mut state = self.lock();
            if state.generation != generation {
                kill.cancel();
                return;
            }
            state.writer = Some(writer_tx);
            state.kill = Some(kill);
            state.hello_timer = Some(self.arm_hello_timer(generation));
        }

        tokio::spawn(write_loop(Arc::clone(self), generation, stdin, writer_rx));
        tokio::spawn(read_loop(Arc::clone(self), generation, stdout));
        tokio::spawn(Arc::clone(self).watch_exit(generation, exit));
    }

    fn arm_hello_timer(self: &Arc<Self>, generation: u64) -> ScheduledTask {
        let weak = Arc::downgrade(self);
        let timeout = self.timings.hello_timeout;
        ScheduledTask::after(timeout, async move {
            if let Some(shared) = weak.upgrade() {
                shared.fail_start(
                    generation,
                    Termination::StartFailed,
                    TerminalError::new(
                        ErrorCode::SidecarCrashed,
                        format!("sidecar sent no hello within {}ms", timeout.as_millis()),
                    ),
                );
            }
        })
    }

    /// Validate the first line the sidecar prints. Returns whether the
    /// connection may continue.
    fn handle_hello(self: &Arc<Self>, generation: u64, line: &str) -> bool {
        match SidecarEvent::parse_line(line) {
            Ok(SidecarEvent::Hello { version, protocol }) if protocol == SIDECAR_PROTOCOL_VERSION => {
                self.complete_start(generation, &version)
            }
            Ok(SidecarEvent::Hello { version, protocol }) => {
                self.fail_start(
                    generation,
                    Termination::ProtocolMismatch,
                    TerminalError::new(
                        ErrorCode::SidecarProtocolMismatch,
                        format!(
                            "sidecar {version} speaks protocol {protocol}, expected {SIDECAR_PROTOCOL_VERSION}"
                        ),
                    ),
                );
                false
            }
            Ok(other) => {
                self.fail_start(
                    generation,
                    Termination::StartFailed,
                    TerminalError::new(
                        ErrorCode::SidecarCrashed,
                        format!("sidecar sent {other:?} before hello"),
                    ),
                );
                false
            }
            Err(e) => {
                self.fail_start(
                    generation,
                    Termination::StartFailed,
                    TerminalError::new(ErrorCode::SidecarCrashed, format!("malformed sidecar hello: {e}")),
                );
                false
            }
        }
    }

    fn complete_start(self: &Arc<Self>, generation: u64, version: &str) -> bool {
        let waiters = {
            let mut state = self.lock();
            if state.generation != generation || !matches!(state.phase, Phase::Starting(_)) {
                return false;
            }
            state.hello_timer = None;
            state.last_pong = Instant::now();
            state.heartbeat = Some(self.start_heartbeat(generation));
            state.transition(Phase::Ready)
        };

        tracing::info!(version, generation, "Sidecar ready");
        for waiter in waiters {
            let _ = waiter.send(Ok(()));
        }
        true
    }

    fn fail_start(&self, generation: u64, termination: Termination, error: TerminalError) {
        let waiters = {
            let mut state = self.lock();
            if state.generation != generation || !matches!(state.phase, Phase::Starting(_)) {
                return;
            }
            state.termination = Some(termination);
            state.hello_timer = None;
            state.kill();
            state.transition(Phase::Failed)
        };

        tracing::warn!(code = %error.code, "Sidecar start failed: {}", error.message);
        for waiter in waiters {
            let _ = waiter.send(Err(error.clone()));
        }
    }

    // -------------------------------------------------------------------------
    // HEARTBEAT
    // -------------------------------------------------------------------------

    fn start_heartbeat(self: &Arc<Self>, generation: u64) -> ScheduledTask {
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.timings.heartbeat_interval;
        ScheduledTask::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                if !shared.heartbeat_tick(generation) {
                    break;
                }
            }
        })
    }

    /// One heartbeat tick. Returns whether the heartbeat should keep going.
    fn heartbeat_tick(&self, generation: u64) -> bool {
        let victims = {
            let mut state = self.lock();
            if state.generation != generation || !matches!(state.phase, Phase::Ready) {
                return false;
            }
            if state.last_pong.elapsed() < self.timings.heartbeat_timeout {
                state.send(SidecarRequest::Ping);
                return true;
            }
            state.termination = Some(Termination::HeartbeatTimeout);
            state.kill();
            state.writer = None;
            state.heartbeat = None;
            state.transition(Phase::Exited);
            state.drain_terminals()
        };

        tracing::warn!(
            terminals = victims.len(),
            "Sidecar missed heartbeat for {}ms, terminating",
            self.timings.heartbeat_timeout.as_millis()
        );
        for terminal_id in victims {
            emit(
                &self.sink,
                BackendEvent::error(&terminal_id, ErrorCode::SidecarTimeout, "sidecar stopped responding"),
            );
        }
        false
    }

    // -------------------------------------------------------------------------
    // EVENTS
    // -------------------------------------------------------------------------

    fn is_tracked(&self, generation: u64, terminal_id: &str) -> bool {
        let state = self.lock();
        state.generation == generation && state.terminals.contains_key(terminal_id)
    }

    /// Stop tracking a terminal. Returns whether it was tracked.
    fn untrack(&self, terminal_id: &str) -> bool {
        self.lock().terminals.remove(terminal_id).is_some()
    }

    fn untrack_in(&self, generation: u64, terminal_id: &str) -> bool {
        let mut state = self.lock();
        state.generation == generation && state.terminals.remove(terminal_id).is_some()
    }

    fn handle_event(self: &Arc<Self>, generation: u64, event: SidecarEvent) {
        match event {
            SidecarEvent::Hello { version, .. } => {
                tracing::debug!(version, "Ignoring repeated sidecar hello");
            }
            SidecarEvent::Ready {
                terminal_id,
                display_name,
            } => {
                if self.is_tracked(generation, &terminal_id) {
                    tracing::info!(terminal_id = %terminal_id, display_name = ?display_name, "Sidecar terminal ready");
                    emit(&self.sink, BackendEvent::Ready { terminal_id });
                }
            }
            SidecarEvent::Output { terminal_id, data } => {
                if !self.is_tracked(generation, &terminal_id) {
                    return;
                }
                if let Some(data) = decode_output(&data) {
                    emit(&self.sink, BackendEvent::Output { terminal_id, data });
                }
            }
            SidecarEvent::Exit { terminal_id, code } => {
                if self.untrack_in(generation, &terminal_id) {
                    tracing::info!(terminal_id = %terminal_id, code = ?code, "Sidecar terminal exited");
                    emit(
                        &self.sink,
                        BackendEvent::Exit {
                            terminal_id,
                            code,
                            signal: None,
                        },
                    );
                }
            }
            SidecarEvent::Error {
                terminal_id: Some(terminal_id),
                code,
                message,
            } => {
                if self.untrack_in(generation, &terminal_id) {
                    tracing::warn!(terminal_id = %terminal_id, %code, "Sidecar terminal error: {message}");
                    emit(
                        &self.sink,
                        BackendEvent::Error {
                            terminal_id,
                            error: TerminalError::new(code, message),
                        },
                    );
                }
            }
            SidecarEvent::Error {
                terminal_id: None,
                code,
                message,
            } => {
                let targets: Vec<String> = {
                    let state = self.lock();
                    if state.generation != generation {
                        return;
                    }
                    state.terminals.keys().cloned().collect()
                };
                tracing::warn!(%code, terminals = targets.len(), "Sidecar error: {message}");
                for terminal_id in targets {
                    emit(&self.sink, BackendEvent::error(&terminal_id, code, message.clone()));
                }
            }
            SidecarEvent::Pong => {
                let mut state = self.lock();
                if state.generation == generation {
                    state.last_pong = Instant::now();
                }
            }
            SidecarEvent::ShutdownAck => {
                let mut state = self.lock();
                if state.generation == generation && matches!(state.phase, Phase::ShuttingDown) {
                    // Acked; the process still has one more timeout to exit.
                    state.shutdown_timer = Some(self.arm_shutdown_timer(generation, true));
                    tracing::debug!("Sidecar acknowledged shutdown");
                }
            }
        }
    }

    /// Runs once the sidecar process is gone.
    async fn watch_exit(self: Arc<Self>, generation: u64, exit: oneshot::Receiver<ExitInfo>) {
        let info = exit.await.unwrap_or_default();

        let (waiters, termination, victims) = {
            let mut state = self.lock();
            if state.generation != generation {
                return;
            }
            let termination = state.termination.take();
            let waiters = state.transition(Phase::Exited);
            state.writer = None;
            state.kill = None;
            state.hello_timer = None;
            state.heartbeat = None;
            state.shutdown_timer = None;
            let victims = if termination.is_none() && waiters.is_empty() {
                state.drain_terminals()
            } else {
                Vec::new()
            };
            (waiters, termination, victims)
        };

        if !waiters.is_empty() {
            let error = TerminalError::new(
                ErrorCode::SidecarCrashed,
                format!("sidecar exited during startup ({})", info.describe()),
            );
            tracing::warn!("{}", error.message);
            for waiter in waiters {
                let _ = waiter.send(Err(error.clone()));
            }
            return;
        }

        if let Some(termination) = termination {
            tracing::info!(?termination, status = %info.describe(), "Sidecar stopped");
            return;
        }

        tracing::error!(terminals = victims.len(), status = %info.describe(), "Sidecar crashed");
        let message = format!("sidecar exited unexpectedly ({})", info.describe());
        for terminal_id in victims {
            emit(
                &self.sink,
                BackendEvent::error(&terminal_id, ErrorCode::SidecarCrashed, message.clone()),
            );
        }
    }

    // -------------------------------------------------------------------------
    // REQUESTS
    // -------------------------------------------------------------------------

    fn send_open(&self, options: CreateOptions) {
        let terminal_id = options.terminal_id.clone();
        let sent = {
            let mut state = self.lock();
            let Some(opened) = state.terminals.get_mut(&terminal_id) else {
                // Closed while the sidecar was starting.
                return;
            };
            *opened = true;
            let request = SidecarRequest::Open {
                terminal_id: options.terminal_id,
                cwd: options.cwd,
                cols: options.cols,
                rows: options.rows,
                env: options.env,
                shell: options.shell,
                shell_options: options.shell_options,
            };
            match (&state.phase, &state.writer) {
                (Phase::Ready, Some(writer)) => writer
                    .send(Outgoing {
                        request,
                        open_for: Some(terminal_id.clone()),
                    })
                    .is_ok(),
                _ => false,
            }
        };

        if !sent && self.untrack(&terminal_id) {
            emit(
                &self.sink,
                BackendEvent::error(
                    &terminal_id,
                    ErrorCode::SidecarCrashed,
                    "sidecar went away before the terminal could open",
                ),
            );
        }
    }

    /// Forward a request for an opened terminal, or report it unknown.
    fn forward(&self, terminal_id: &str, request: SidecarRequest) {
        let known = {
            let state = self.lock();
            match state.terminals.get(terminal_id) {
                Some(true) => {
                    if !state.send(request) {
                        tracing::debug!(terminal_id, "Sidecar writer gone, dropping request");
                    }
                    true
                }
                Some(false) => {
                    tracing::debug!(terminal_id, "Terminal not open yet, dropping request");
                    true
                }
                None => false,
            }
        };

        if !known {
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

    /// Kill the sidecar if it is still shutting down after `shutdown_timeout`.
    fn arm_shutdown_timer(self: &Arc<Self>, generation: u64, acked: bool) -> ScheduledTask {
        let weak = Arc::downgrade(self);
        ScheduledTask::after(self.timings.shutdown_timeout, async move {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let state = shared.lock();
            if state.generation == generation && matches!(state.phase, Phase::ShuttingDown) {
                if acked {
                    tracing::warn!("Sidecar acknowledged shutdown but did not exit, killing");
                } else {
                    tracing::warn!("Sidecar did not acknowledge shutdown, killing");
                }
                state.kill();
            }
        })
    }
}

// =============================================================================
// STDIO TASKS
// =============================================================================

async fn write_loop(
    shared: Arc<Shared>,
    generation: u64,
    mut stdin: Box<dyn AsyncWrite + Send + Unpin>,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
) {
    while let Some(Outgoing { request, open_for }) = rx.recv().await {
        let line = match request.to_line() {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("Failed to encode sidecar request: {e}");
                continue;
            }
        };

        let written = match stdin.write_all(line.as_bytes()).await {
            Ok(()) => stdin.flush().await,
            Err(e) => Err(e),
        };

        if let Err(e) = written {
            tracing::warn!("Sidecar stdin write failed: {e}");
            if let Some(terminal_id) = open_for {
                if shared.untrack_in(generation, &terminal_id) {
                    emit(
                        &shared.sink,
                        BackendEvent::error(
                            &terminal_id,
                            ErrorCode::SidecarCrashed,
                            format!("failed to send open to sidecar: {e}"),
                        ),
                    );
                }
            }
        }
    }
}

async fn read_loop(shared: Arc<Shared>, generation: u64, stdout: Box<dyn AsyncRead + Send + Unpin>) {
    let mut lines = BufReader::new(stdout).lines();
    let mut greeted = false;

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("Sidecar stdout read error: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        if !greeted {
            if !shared.handle_hello(generation, &line) {
                break;
            }
            greeted = true;
            continue;
        }

        match SidecarEvent::parse_line(&line) {
            Ok(event) => shared.handle_event(generation, event),
            Err(e) => tracing::warn!("Ignoring malformed sidecar line: {e}"),
        }
    }
    tracing::debug!(generation, "Sidecar stdout closed");
}

// =============================================================================
// BACKEND
// =============================================================================

#[async_trait]
impl TerminalBackend for SidecarBackend {
    async fn create(&self, options: CreateOptions) {
        let terminal_id = options.terminal_id.clone();

        let duplicate = {
            let mut state = self.shared.lock();
            if state.terminals.contains_key(&terminal_id) {
                true
            } else {
                state.terminals.insert(terminal_id.clone(), false);
                false
            }
        };
        if duplicate {
            emit(
                &self.shared.sink,
                BackendEvent::error(
                    &terminal_id,
                    ErrorCode::StartupFailed,
                    format!("terminal {terminal_id} already exists"),
                ),
            );
            return;
        }

        match self.shared.ensure_started().await {
            Ok(()) => self.shared.send_open(options),
            Err(error) => {
                if self.shared.untrack(&terminal_id) {
                    emit(&self.shared.sink, BackendEvent::Error { terminal_id, error });
                }
            }
        }
    }

    fn write(&self, terminal_id: &str, data: &str) {
        self.shared.forward(
            terminal_id,
            SidecarRequest::Write {
                terminal_id: terminal_id.to_string(),
                data: data.to_string(),
            },
        );
    }

    fn resize(&self, terminal_id: &str, cols: u16, rows: u16) {
        self.shared.forward(
            terminal_id,
            SidecarRequest::Resize {
                terminal_id: terminal_id.to_string(),
                cols,
                rows,
            },
        );
    }

    fn close(&self, terminal_id: &str) {
        let mut guard = self.shared.lock();
        let state = &mut *guard;
        if state.terminals.remove(terminal_id) == Some(true) && matches!(state.phase, Phase::Ready) {
            state.send(SidecarRequest::Close {
                terminal_id: terminal_id.to_string(),
            });
        }
    }

    async fn close_all(&self) {
        let (count, rejected) = {
            let mut guard = self.shared.lock();
            let state = &mut *guard;
            let count = state.terminals.len();
            state.terminals.clear();

            let rejected = match state.phase {
                Phase::Ready => {
                    state.phase = Phase::ShuttingDown;
                    state.termination = Some(Termination::Shutdown);
                    state.heartbeat = None;
                    state.send(SidecarRequest::Shutdown);
                    state.shutdown_timer = Some(self.shared.arm_shutdown_timer(state.generation, false));
                    Vec::new()
                }
                Phase::Starting(_) => {
                    state.termination = Some(Termination::Shutdown);
                    state.hello_timer = None;
                    state.kill();
                    state.transition(Phase::ShuttingDown)
                }
                _ => Vec::new(),
            };
            (count, rejected)
        };

        for waiter in rejected {
            let _ = waiter.send(Err(TerminalError::new(
                ErrorCode::StartupFailed,
                "sidecar is shutting down",
            )));
        }
        tracing::info!(count, "All sidecar terminals closed");
    }

    fn contains(&self, terminal_id: &str) -> bool {
        self.shared.lock().terminals.contains_key(terminal_id)
    }

    fn terminal_count(&self) -> usize {
        self.shared.lock().terminals.len()
    }

    fn name(&self) -> &'static str {
        "sidecar"
    }
}

// =============================================================================
// TESTS
// =============================================================================
