//! termlink-hub: WebSocket relay between terminal viewers and agents.
//!
//! Viewers and agents connect, identify themselves with a hello frame, and
//! from then on exchange `terminal:*` frames. The hub owns the terminal
//! registry: who may drive which terminal, and how long an orphaned
//! terminal survives its viewer.

mod connection;
mod registry;
mod relay;
mod session;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_tungstenite::accept_async;

use crate::connection::handle_connection;
use crate::relay::{SessionResolver, SocketDirectory, TerminalRelay};
use crate::session::SessionStore;

/// How often sessions without an agent are checked for expiry.
const REAP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "termlink-hub", about = "WebSocket hub for remote terminals")]
struct Args {
    /// Port to listen on. Overrides `hub.port`.
    #[arg(short, long)]
    port: Option<u16>,

    /// Config file. Defaults to the platform config directory.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Maximum stale session age in seconds (no agent connected).
    #[arg(long)]
    session_ttl: Option<u64>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "termlink_hub=info".into()),
        )
        .init();

    let args = Args::parse();
    let mut hub = match termlink_config::load_config(args.config.as_deref()) {
        Ok(config) => config.hub,
        Err(e) => {
            tracing::error!(error = %e, "Failed to load config");
            std::process::exit(1);
        }
    };
    if let Some(port) = args.port {
        hub.port = port;
    }
    if let Some(ttl) = args.session_ttl {
        hub.session_ttl_secs = ttl;
    }

    let store = SessionStore::new();
    let relay = TerminalRelay::from_config(
        &hub,
        Arc::new(store.clone()) as Arc<dyn SocketDirectory>,
        Arc::new(store.clone()) as Arc<dyn SessionResolver>,
    );

    let addr = format!("0.0.0.0:{}", hub.port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind TCP listener");
            std::process::exit(1);
        }
    };

    tracing::info!(
        keep_alive_ms = hub.keep_alive_ms,
        idle_timeout_ms = hub.idle_timeout_ms,
        "termlink-hub listening on {}",
        addr
    );

    // Spawn stale session reaper.
    let reaper_store = store.clone();
    let reaper_relay = Arc::clone(&relay);
    let ttl = hub.session_ttl();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(REAP_INTERVAL).await;
            let reaped = reaper_store.reap_stale(ttl);
            tracing::debug!(
                reaped,
                sessions = reaper_store.session_count(),
                sockets = reaper_store.socket_count(),
                terminals = reaper_relay.registry().len(),
                "Reaper tick"
            );
        }
    });

    // Accept loop.
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let store = store.clone();
                let relay = Arc::clone(&relay);
                tokio::spawn(async move {
                    match accept_async(stream).await {
                        Ok(ws) => handle_connection(ws, addr, store, relay).await,
                        Err(e) => {
                            tracing::warn!(peer = %addr, error = %e, "WS handshake failed");
                        }
                    }
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "TCP accept error");
            }
        }
    }
}
