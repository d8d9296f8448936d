pub mod config;
pub mod console;
pub mod engine;
pub mod error;
pub mod events;
pub mod media;
pub mod session;
pub mod signaling;
pub mod state;

#[cfg(test)]
mod testing;

use anyhow::Context;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::{ClientConfig, ServerConfig};
use crate::engine::{run_call_engine, CallCommand, CallEngine};
use crate::events::create_event_bus;
use crate::media::HardwareDevices;
use crate::session::RtcTransport;
use crate::signaling::SignalingIdentityClient;

/// How the client starts out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// Choose interactively.
    Undecided,
    Create,
    Join(String),
}

/// Log to stderr, filtered by `RUST_LOG` (default `info`).
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Run the rendezvous server until the process exits.
pub async fn run_server(config: ServerConfig) -> anyhow::Result<()> {
    signaling::server::start_server(config)
        .await
        .context("rendezvous server stopped")
}

/// Register, then run the call engine with the console front end.
pub async fn run_client(config: ClientConfig, role: Role) -> anyhow::Result<()> {
    let (event_tx, event_rx) = create_event_bus();
    let (signal_tx, signal_rx) = mpsc::channel(64);
    let (peer_tx, peer_rx) = mpsc::channel(256);
    let (cmd_tx, cmd_rx) = mpsc::channel(32);

    let mut client = SignalingIdentityClient::new(config.signaling.clone(), signal_tx);
    let identity = client
        .initialize()
        .await
        .with_context(|| format!("could not register at {}", config.signaling.url()))?;
    let handle = client
        .handle()
        .context("signaling connection closed during startup")?;

    let transport = Arc::new(RtcTransport::new(handle, config.ice_servers.clone(), peer_tx));
    let devices = Arc::new(HardwareDevices::new(config.camera_index));
    let (mut engine, state_rx, background_rx) = CallEngine::new(devices, transport, event_tx);

    tokio::spawn(console::run_console(cmd_tx.clone(), state_rx, event_rx));
    engine.registered(&identity);

    let first = match role {
        Role::Undecided => None,
        Role::Create => Some(CallCommand::CreateRoom),
        Role::Join(room) => Some(CallCommand::JoinRoom(room)),
    };
    if let Some(command) = first {
        cmd_tx.send(command).await.context("call engine not running")?;
    }
    drop(cmd_tx);

    info!("Client ready as {}", identity);
    run_call_engine(engine, client, cmd_rx, signal_rx, peer_rx, background_rx).await;
    Ok(())
}
