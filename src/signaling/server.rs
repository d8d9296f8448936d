use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use super::SignalMessage;
use crate::config::{normalize_path, ServerConfig};

/// Registered ids and the channel that writes to each one's socket.
#[derive(Clone, Default)]
pub struct Registry {
    peers: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<SignalMessage>>>>,
}

impl Registry {
    pub async fn len(&self) -> usize {
        self.peers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.lock().await.is_empty()
    }

    /// Claim `id`. Fails if someone already holds it.
    async fn register(&self, id: &str, tx: mpsc::UnboundedSender<SignalMessage>) -> bool {
        let mut peers = self.peers.lock().await;
        if peers.contains_key(id) {
            return false;
        }
        peers.insert(id.to_string(), tx);
        true
    }

    async fn unregister(&self, id: &str) {
        self.peers.lock().await.remove(id);
    }

    /// Forward a message from `src` to its destination, or tell `src` that
    /// the destination is gone.
    async fn relay(&self, src: &str, message: SignalMessage) {
        let message = message.with_src(src);
        let Some(dst) = message.dst().map(str::to_string) else {
            return;
        };

        let peers = self.peers.lock().await;
        let message = match peers.get(&dst) {
            Some(tx) => match tx.send(message) {
                Ok(()) => return,
                Err(mpsc::error::SendError(message)) => message,
            },
            None => message,
        };

        debug!("Relay from {} to unknown peer {}", src, dst);
        let expire = match message {
            SignalMessage::Offer { connection_id, .. }
            | SignalMessage::Answer { connection_id, .. } => SignalMessage::Expire {
                src: dst,
                dst: src.to_string(),
                connection_id,
            },
            // Nobody to tell that the connection is over.
            _ => return,
        };
        if let Some(tx) = peers.get(src) {
            let _ = tx.send(expire);
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    pub id: Option<String>,
}

pub fn build_router(path: &str, registry: Registry) -> Router {
    let path = normalize_path(path);
    let mut router = Router::new().route(&path, get(ws_handler));
    if path != "/" {
        router = router.route("/", get(server_info));
    }
    router.layer(CorsLayer::permissive()).with_state(registry)
}

/// Bind and serve until the process exits.
pub async fn start_server(config: ServerConfig) -> std::io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(
        "Rendezvous server is running on port {} at {}",
        config.port,
        normalize_path(&config.path)
    );
    serve(listener, &config.path, Registry::default()).await
}

pub async fn serve(listener: TcpListener, path: &str, registry: Registry) -> std::io::Result<()> {
    axum::serve(listener, build_router(path, registry)).await
}

async fn server_info() -> impl IntoResponse {
    Json(serde_json::json!({
        "name": "roomcall rendezvous server",
        "description": "Relays call setup messages between two registered peers",
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(registry): State<Registry>,
) -> impl IntoResponse {
    let requested = params.id.filter(|id| !id.trim().is_empty());
    ws.on_upgrade(move |socket| handle_socket(socket, registry, requested))
}

async fn send(socket: &mut WebSocket, message: &SignalMessage) -> bool {
    match message.to_json() {
        Ok(json) => socket.send(Message::Text(json)).await.is_ok(),
        Err(e) => {
            warn!("Failed to serialize signaling message: {}", e);
            true
        }
    }
}

async fn handle_socket(mut socket: WebSocket, registry: Registry, requested: Option<String>) {
    let id = requested.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let (tx, mut rx) = mpsc::unbounded_channel::<SignalMessage>();

    if !registry.register(&id, tx).await {
        info!("Rejected registration: id {} is taken", id);
        send(&mut socket, &SignalMessage::IdTaken { id }).await;
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    info!("Peer {} registered", id);
    if send(&mut socket, &SignalMessage::Open { id: id.clone() }).await {
        loop {
            tokio::select! {
                outgoing = rx.recv() => {
                    let Some(message) = outgoing else { break };
                    if !send(&mut socket, &message).await {
                        break;
                    }
                }
                incoming = socket.recv() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => match SignalMessage::from_json(&text) {
                            Ok(SignalMessage::Heartbeat) => {}
                            Ok(message) if message.dst().is_some() => {
                                registry.relay(&id, message).await;
                            }
                            Ok(other) => debug!("Ignoring {:?} from {}", other, id),
                            Err(e) => {
                                let reply = SignalMessage::Error { message: e.to_string() };
                                if !send(&mut socket, &reply).await {
                                    break;
                                }
                            }
                        },
                        Some(Ok(Message::Ping(data))) => {
                            if socket.send(Message::Pong(data)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                        Some(Ok(_)) => {}
                    }
                }
            }
        }
    }

    registry.unregister(&id).await;
    info!("Peer {} left", id);
}
