//! Outbound hub client: connects to the hub, announces the session this
//! agent serves, and bridges terminal requests and events.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use termlink_common::protocol::{
    AgentRequest, ConnectionHello, HelloResponse, TerminalEvent, TerminalExit, TerminalOutput,
};
use termlink_terminal::{BackendEvent, CreateOptions, TerminalManager};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

type HubStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Configuration for the hub client.
#[derive(Debug, Clone)]
pub struct HubClientConfig {
    pub hub_url: String,
    pub namespace: String,
    /// The session this agent serves.
    pub session_id: String,
    /// Extra environment for every shell.
    pub env: HashMap<String, String>,
}

impl HubClientConfig {
    fn hello(&self) -> ConnectionHello {
        ConnectionHello::AgentHello {
            namespace: self.namespace.clone(),
            session_id: self.session_id.clone(),
        }
    }
}

/// Run the hub client with auto-reconnect until `shutdown_rx` fires.
///
/// Terminals never outlive the connection they were opened on: the hub
/// reports them as `cli_disconnected` to their viewers, so the agent closes
/// everything whenever a connection ends.
pub async fn run_hub_client(
    config: HubClientConfig,
    manager: TerminalManager,
    mut events: mpsc::UnboundedReceiver<BackendEvent>,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    let manager = Arc::new(manager);
    let mut backoff = MIN_BACKOFF;

    loop {
        tracing::info!(
            url = %config.hub_url,
            namespace = %config.namespace,
            session = %config.session_id,
            "Connecting to hub..."
        );

        match connect_async(config.hub_url.as_str()).await {
            Ok((ws, _)) => {
                backoff = MIN_BACKOFF;
                let result = hub_session(ws, &config, &manager, &mut events, &mut shutdown_rx).await;
                manager.close_all().await;

                match result {
                    SessionResult::Shutdown => {
                        tracing::info!("Hub client shutting down");
                        return;
                    }
                    SessionResult::Disconnected(reason) => {
                        tracing::warn!(reason = %reason, "Hub connection lost");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to connect to hub");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown_rx.recv() => {
                tracing::info!("Hub client shutting down");
                return;
            }
        }

        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

enum SessionResult {
    Shutdown,
    Disconnected(String),
}

/// Handle a single hub connection: hello → forward loop.
///
/// Hub requests are applied by a worker task in arrival order, so a write
/// never overtakes the open it follows and a slow open never holds up the
/// loop. The worker finishes its queue before this returns.
async fn hub_session(
    ws: HubStream,
    config: &HubClientConfig,
    manager: &Arc<TerminalManager>,
    events: &mut mpsc::UnboundedReceiver<BackendEvent>,
    shutdown_rx: &mut mpsc::Receiver<()>,
) -> SessionResult {
    let (mut sink, mut stream) = ws.split();

    // Events queued while disconnected belong to terminals that are gone.
    let mut stale = 0usize;
    while events.try_recv().is_ok() {
        stale += 1;
    }
    if stale > 0 {
        tracing::debug!(count = stale, "Discarded events from previous connection");
    }

    // 1. Send agent_hello
    if let Err(e) = send_json(&mut sink, &config.hello()).await {
        return SessionResult::Disconnected(format!("failed to send hello: {e}"));
    }

    // 2. Wait for connected
    match read_hello_response(&mut stream).await {
        Some(HelloResponse::Connected { socket_id }) => {
            tracing::info!(socket_id = %socket_id, "Hub connection ready");
        }
        Some(HelloResponse::Error { message }) => {
            return SessionResult::Disconnected(format!("hub rejected hello: {message}"));
        }
        None => {
            return SessionResult::Disconnected("unexpected hub response".into());
        }
    }

    // 3. Forward until the connection ends
    let (requests, queue) = mpsc::unbounded_channel();
    let worker = tokio::spawn(apply_requests(queue, config.env.clone(), Arc::clone(manager)));

    let result = forward(&mut sink, &mut stream, config, &requests, events, shutdown_rx).await;

    drop(requests);
    if let Err(e) = worker.await {
        tracing::warn!(error = %e, "Request worker failed");
    }
    result
}

/// Forwarding loop: backend events to the hub, hub requests to the worker.
async fn forward(
    sink: &mut SplitSink<HubStream, Message>,
    stream: &mut SplitStream<HubStream>,
    config: &HubClientConfig,
    requests: &mpsc::UnboundedSender<AgentRequest>,
    events: &mut mpsc::UnboundedReceiver<BackendEvent>,
    shutdown_rx: &mut mpsc::Receiver<()>,
) -> SessionResult {
    let mut output = OutputDecoder::default();

    loop {
        tokio::select! {
            // Backend events → hub
            Some(event) = events.recv() => {
                let Some(frame) = to_terminal_event(&config.session_id, event, &mut output) else {
                    continue;
                };
                if send_json(sink, &frame).await.is_err() {
                    return SessionResult::Disconnected("send failed".into());
                }
            }

            // Requests from hub → worker
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<AgentRequest>(&text) {
                        Ok(request) => route(request, config, requests, &mut output),
                        Err(e) => tracing::warn!(error = %e, "Invalid hub frame"),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return SessionResult::Disconnected("hub closed connection".into());
                    }
                    Some(Err(e)) => {
                        return SessionResult::Disconnected(format!("ws error: {e}"));
                    }
                    _ => {}
                }
            }

            // Shutdown signal
            _ = shutdown_rx.recv() => {
                let _ = sink.close().await;
                return SessionResult::Shutdown;
            }
        }
    }
}

/// Queue a hub request for the worker. Requests for another session are
/// dropped here.
fn route(
    request: AgentRequest,
    config: &HubClientConfig,
    requests: &mpsc::UnboundedSender<AgentRequest>,
    output: &mut OutputDecoder,
) {
    if request.session_id() != config.session_id {
        tracing::warn!(
            session = %request.session_id(),
            terminal_id = %request.terminal_id(),
            "Ignoring request for another session"
        );
        return;
    }
    if let AgentRequest::Close(close) = &request {
        output.forget(&close.terminal_id);
    }
    if requests.send(request).is_err() {
        tracing::warn!("Request worker gone, dropping hub request");
    }
}

/// Drain the request queue into the manager, one request at a time.
async fn apply_requests(
    mut queue: mpsc::UnboundedReceiver<AgentRequest>,
    env: HashMap<String, String>,
    manager: Arc<TerminalManager>,
) {
    while let Some(request) = queue.recv().await {
        apply(request, &env, &manager).await;
    }
}

/// Apply one hub request to the manager.
async fn apply(request: AgentRequest, env: &HashMap<String, String>, manager: &TerminalManager) {
    match request {
        AgentRequest::Open(open) => {
            let options = CreateOptions {
                terminal_id: open.terminal_id,
                cwd: manager.default_cwd().clone(),
                env: env.clone(),
                shell: open.shell,
                shell_options: open.shell_options,
                cols: open.cols,
                rows: open.rows,
            };
            manager.create(options).await;
        }
        AgentRequest::Write(write) => manager.write(&write.terminal_id, &write.data),
        AgentRequest::Resize(resize) => manager.resize(&resize.terminal_id, resize.cols, resize.rows),
        AgentRequest::Close(close) => manager.close(&close.terminal_id),
    }
}

/// Map a backend event onto the wire. Returns `None` when there is nothing
/// to send yet (output that ends mid-character).
fn to_terminal_event(
    session_id: &str,
    event: BackendEvent,
    output: &mut OutputDecoder,
) -> Option<TerminalEvent> {
    match event {
        BackendEvent::Ready { terminal_id } => Some(TerminalEvent::ready(session_id, &terminal_id)),
        BackendEvent::Output { terminal_id, data } => {
            let text = output.decode(&terminal_id, &data);
            (!text.is_empty()).then(|| {
                TerminalEvent::Output(TerminalOutput {
                    session_id: session_id.to_string(),
                    terminal_id,
                    data: text,
                })
            })
        }
        BackendEvent::Exit {
            terminal_id,
            code,
            signal,
        } => {
            if let Some(signal) = signal {
                tracing::debug!(terminal_id = %terminal_id, signal = %signal, "Terminal ended by signal");
            }
            output.forget(&terminal_id);
            Some(TerminalEvent::Exit(TerminalExit {
                session_id: session_id.to_string(),
                terminal_id,
                code,
            }))
        }
        BackendEvent::Error { terminal_id, error } => {
            Some(TerminalEvent::error(session_id, &terminal_id, error))
        }
    }
}

/// Turns raw terminal bytes into text frames without splitting a multi-byte
/// character across two frames. Invalid sequences become U+FFFD.
#[derive(Default)]
struct OutputDecoder {
    pending: HashMap<String, Vec<u8>>,
}

impl OutputDecoder {
    fn decode(&mut self, terminal_id: &str, data: &[u8]) -> String {
        let mut bytes = self.pending.remove(terminal_id).unwrap_or_default();
        bytes.extend_from_slice(data);

        let tail = bytes.split_off(bytes.len() - incomplete_tail(&bytes));
        if !tail.is_empty() {
            self.pending.insert(terminal_id.to_string(), tail);
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn forget(&mut self, terminal_id: &str) {
        self.pending.remove(terminal_id);
    }
}

/// Length of a truncated UTF-8 sequence at the end of `bytes`.
fn incomplete_tail(bytes: &[u8]) -> usize {
    let start = bytes.len().saturating_sub(3);
    for i in (start..bytes.len()).rev() {
        let byte = bytes[i];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let width = match byte {
            0xC2..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF4 => 4,
            _ => return 0,
        };
        let have = bytes.len() - i;
        return if have < width { have } else { 0 };
    }
    0
}

/// Send a value as a JSON text frame.
async fn send_json<T: Serialize>(
    sink: &mut SplitSink<HubStream, Message>,
    value: &T,
) -> Result<(), tungstenite::Error> {
    let json = serde_json::to_string(value)
        .map_err(|e| tungstenite::Error::Io(std::io::Error::other(e)))?;
    sink.send(Message::Text(json.into())).await
}

/// Read a single text frame and parse as HelloResponse.
async fn read_hello_response(stream: &mut SplitStream<HubStream>) -> Option<HelloResponse> {
    let timeout = tokio::time::timeout(HELLO_TIMEOUT, stream.next()).await;
    match timeout {
        Ok(Some(Ok(Message::Text(text)))) => serde_json::from_str(&text).ok(),
        _ => None,
    }
}
