//! termlink-agent: serves live shells on this machine to a termlink hub.
//!
//! Connects outbound to the hub, announces the session it serves, and
//! opens, drives, and closes terminals on the hub's behalf.

mod hub_client;

use std::path::PathBuf;

use clap::Parser;
use termlink_config::BackendPreference;
use termlink_terminal::TerminalManager;
use tokio::sync::mpsc;

use crate::hub_client::{run_hub_client, HubClientConfig};

#[derive(Parser)]
#[command(name = "termlink-agent", about = "Terminal agent for a termlink hub")]
struct Args {
    /// Config file. Defaults to the platform config directory.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Hub WebSocket URL. Overrides `agent.hub_url`.
    #[arg(long)]
    hub_url: Option<String>,

    /// Namespace the session belongs to.
    #[arg(short, long, default_value = "default")]
    namespace: String,

    /// Session to serve. A random id is generated when omitted.
    #[arg(short, long)]
    session_id: Option<String>,

    /// Working directory for new shells. Overrides `agent.cwd`.
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Terminal backend: auto, pty or sidecar. Overrides `agent.backend`.
    #[arg(long, value_parser = parse_backend)]
    backend: Option<BackendPreference>,
}

fn parse_backend(value: &str) -> Result<BackendPreference, String> {
    match value {
        "auto" => Ok(BackendPreference::Auto),
        "pty" => Ok(BackendPreference::Pty),
        "sidecar" => Ok(BackendPreference::Sidecar),
        other => Err(format!("unknown backend '{other}' (expected auto, pty or sidecar)")),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "termlink_agent=info,termlink_terminal=info".into()),
        )
        .init();

    let args = Args::parse();
    let mut agent = match termlink_config::load_config(args.config.as_deref()) {
        Ok(config) => config.agent,
        Err(e) => {
            tracing::error!(error = %e, "Failed to load config");
            std::process::exit(1);
        }
    };
    if let Some(url) = args.hub_url {
        agent.hub_url = url;
    }
    if let Some(cwd) = args.cwd {
        agent.cwd = Some(cwd);
    }
    if let Some(backend) = args.backend {
        agent.backend = backend;
    }

    let session_id = args.session_id.unwrap_or_else(termlink_common::new_id);
    tracing::info!(session = %session_id, namespace = %args.namespace, "Serving session");

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let manager = TerminalManager::new(&agent, event_tx);

    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Interrupt received, shutting down");
                let _ = shutdown_tx.send(()).await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Cannot listen for interrupt");
                std::future::pending::<()>().await;
            }
        }
    });

    let config = HubClientConfig {
        hub_url: agent.hub_url,
        namespace: args.namespace,
        session_id,
        env: agent.env,
    };
    run_hub_client(config, manager, event_rx, shutdown_rx).await;
}
