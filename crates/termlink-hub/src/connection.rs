//! Per-connection handler: identify, register, then route frames.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use termlink_common::protocol::{ConnectionHello, HelloResponse, TerminalEvent, ViewerRequest};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;

use crate::relay::TerminalRelay;
use crate::session::{Role, SessionStore};

/// How long a fresh socket has to identify itself.
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsStream = SplitStream<WebSocketStream<TcpStream>>;

/// Handle a single WebSocket connection.
pub async fn handle_connection(
    ws: WebSocketStream<TcpStream>,
    addr: SocketAddr,
    store: SessionStore,
    relay: Arc<TerminalRelay>,
) {
    let (mut sink, mut stream) = ws.split();

    // 1. Read the hello message to identify this client.
    let Some(hello) = read_hello(&mut stream, addr).await else {
        return;
    };

    // 2. Create our outbound channel and register.
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let registered = match hello {
        ConnectionHello::ViewerHello { namespace } if !namespace.is_empty() => {
            Ok((store.register_viewer(&namespace, tx), Role::Viewer))
        }
        ConnectionHello::AgentHello {
            namespace,
            session_id,
        } if !namespace.is_empty() && !session_id.is_empty() => {
            Ok((store.register_agent(&namespace, &session_id, tx), Role::Agent))
        }
        _ => Err("namespace and session id must not be empty"),
    };
    let (socket_id, role) = match registered {
        Ok(registered) => registered,
        Err(message) => {
            let _ = send_response(
                &mut sink,
                &HelloResponse::Error {
                    message: message.into(),
                },
            )
            .await;
            return;
        }
    };

    tracing::info!(peer = %addr, socket_id = %socket_id, role = ?role, "Client registered");

    // 3. Confirm with the socket id.
    if send_response(
        &mut sink,
        &HelloResponse::Connected {
            socket_id: socket_id.clone(),
        },
    )
    .await
    .is_err()
    {
        disconnect(&store, &relay, &socket_id, role);
        return;
    }

    // 4. Routing loop.
    loop {
        tokio::select! {
            // Frames queued by the relay → this client's WebSocket
            Some(json) = rx.recv() => {
                if sink.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }

            // Frames from this client → relay
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => dispatch(&relay, &socket_id, role, text.as_str()),
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(peer = %addr, error = %e, "WS error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    // 5. Cleanup.
    tracing::info!(peer = %addr, socket_id = %socket_id, role = ?role, "Client disconnected");
    disconnect(&store, &relay, &socket_id, role);
}

fn dispatch(relay: &TerminalRelay, socket_id: &str, role: Role, text: &str) {
    match role {
        Role::Viewer => match serde_json::from_str::<ViewerRequest>(text) {
            Ok(request) => relay.handle_viewer(socket_id, request),
            Err(e) => tracing::warn!(socket_id, error = %e, "Invalid viewer frame"),
        },
        Role::Agent => match serde_json::from_str::<TerminalEvent>(text) {
            Ok(event) => relay.handle_agent_event(socket_id, event),
            Err(e) => tracing::warn!(socket_id, error = %e, "Invalid agent frame"),
        },
    }
}

/// Unregister first so the relay already sees the socket as gone.
fn disconnect(store: &SessionStore, relay: &TerminalRelay, socket_id: &str, role: Role) {
    store.unregister(socket_id);
    match role {
        Role::Viewer => relay.handle_viewer_disconnect(socket_id),
        Role::Agent => relay.handle_agent_disconnect(socket_id),
    }
}

/// Read and parse the first message as a ConnectionHello.
async fn read_hello(stream: &mut WsStream, addr: SocketAddr) -> Option<ConnectionHello> {
    let frame = tokio::time::timeout(HELLO_TIMEOUT, stream.next()).await;

    match frame {
        Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<ConnectionHello>(&text) {
            Ok(hello) => Some(hello),
            Err(e) => {
                tracing::warn!(peer = %addr, error = %e, "Invalid hello message");
                None
            }
        },
        Ok(Some(Ok(_))) => {
            tracing::warn!(peer = %addr, "Expected text hello, got another frame type");
            None
        }
        Ok(Some(Err(e))) => {
            tracing::warn!(peer = %addr, error = %e, "WS error during hello");
            None
        }
        Ok(None) => {
            tracing::debug!(peer = %addr, "Connection closed before hello");
            None
        }
        Err(_) => {
            tracing::warn!(peer = %addr, "Hello timeout ({}s)", HELLO_TIMEOUT.as_secs());
            None
        }
    }
}

/// Send a HelloResponse as a JSON text frame.
async fn send_response(sink: &mut WsSink, response: &HelloResponse) -> Result<(), tungstenite::Error> {
    let json = serde_json::to_string(response)
        .map_err(|e| tungstenite::Error::Io(std::io::Error::other(e)))?;
    sink.send(Message::Text(json.into())).await
}
