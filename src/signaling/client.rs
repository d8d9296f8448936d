use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::SignalMessage;
use crate::config::SignalingConfig;
use crate::error::{LifecycleError, SignalingError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What the signaling socket reports back to the call engine.
#[derive(Debug)]
pub enum SignalingEvent {
    /// A relayed message addressed to us (offers, answers, leave, expire).
    Inbound(SignalMessage),
    Closed,
    Disconnected,
    Errored(LifecycleError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSession {
    pub identity: String,
    pub is_registered: bool,
}

/// Sending half of the signaling socket, cloned into the transport.
#[derive(Debug, Clone)]
pub struct SignalingHandle {
    tx: mpsc::UnboundedSender<SignalMessage>,
}

impl SignalingHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SignalMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, message: SignalMessage) -> Result<(), SignalingError> {
        self.tx
            .send(message)
            .map_err(|_| SignalingError::NotRegistered)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// One registration with the rendezvous server, for the life of the app.
pub struct SignalingIdentityClient {
    config: SignalingConfig,
    event_tx: mpsc::Sender<SignalingEvent>,
    session: Option<LocalSession>,
    handle: Option<SignalingHandle>,
    shutdown: Option<oneshot::Sender<()>>,
    sender: Option<JoinHandle<()>>,
    background: Vec<JoinHandle<()>>,
}

impl SignalingIdentityClient {
    pub fn new(config: SignalingConfig, event_tx: mpsc::Sender<SignalingEvent>) -> Self {
        Self {
            config,
            event_tx,
            session: None,
            handle: None,
            shutdown: None,
            sender: None,
            background: Vec::new(),
        }
    }

    pub fn session(&self) -> Option<&LocalSession> {
        self.session.as_ref()
    }

    pub fn handle(&self) -> Option<SignalingHandle> {
        self.handle.clone()
    }

    /// Register with the server and return our session identifier.
    ///
    /// Calling this again while registered returns the same identifier
    /// without opening a second socket.
    pub async fn initialize(&mut self) -> Result<String, SignalingError> {
        if let Some(session) = &self.session {
            if session.is_registered {
                return Ok(session.identity.clone());
            }
        }
        self.stop_tasks();

        let url = self.config.url();
        info!("Connecting to signaling server: {}", url);

        let (write, read, identity) =
            match tokio::time::timeout(self.config.register_timeout, Self::register(&url)).await {
                Ok(result) => result?,
                Err(_) => return Err(SignalingError::Timeout),
            };

        let (handle, outbound_rx) = SignalingHandle::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        self.sender = Some(tokio::spawn(Self::sender_task(write, outbound_rx, shutdown_rx)));
        self.background.push(tokio::spawn(Self::receiver_task(
            read,
            self.event_tx.clone(),
        )));
        self.background.push(tokio::spawn(Self::heartbeat_task(
            handle.clone(),
            self.config.heartbeat_interval,
        )));

        self.shutdown = Some(shutdown_tx);
        self.handle = Some(handle);
        self.session = Some(LocalSession {
            identity: identity.clone(),
            is_registered: true,
        });

        info!("Registered with signaling server as {}", identity);
        Ok(identity)
    }

    /// The socket is gone; keep the identity for display but stop claiming it.
    pub fn mark_unregistered(&mut self) {
        if let Some(session) = &mut self.session {
            session.is_registered = false;
        }
        self.handle = None;
    }

    /// Close the socket and free every background task.
    /// Safe without a prior `initialize`, and safe to repeat.
    pub async fn teardown(&mut self) {
        if let Some(session) = self.session.take() {
            info!("Releasing signaling registration {}", session.identity);
        }
        self.handle = None;

        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(sender) = self.sender.take() {
            // Give the close frame a moment to go out.
            if tokio::time::timeout(Duration::from_secs(1), sender).await.is_err() {
                debug!("Signaling sender did not finish in time");
            }
        }
        self.stop_tasks();
    }

    fn stop_tasks(&mut self) {
        self.shutdown = None;
        if let Some(sender) = self.sender.take() {
            sender.abort();
        }
        for task in self.background.drain(..) {
            task.abort();
        }
    }

    /// Open the socket and wait for the server to assign our id.
    async fn register(
        url: &str,
    ) -> Result<(SplitSink<WsStream, Message>, SplitStream<WsStream>, String), SignalingError> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| SignalingError::Connect(e.to_string()))?;
        let (write, mut read) = ws_stream.split();
        let identity = Self::await_open(&mut read).await?;
        Ok((write, read, identity))
    }

    async fn await_open(read: &mut SplitStream<WsStream>) -> Result<String, SignalingError> {
        while let Some(msg) = read.next().await {
            match msg {
                Ok(Message::Text(text)) => match SignalMessage::from_json(&text)? {
                    SignalMessage::Open { id } => return Ok(id),
                    SignalMessage::IdTaken { id } => return Err(SignalingError::IdTaken(id)),
                    SignalMessage::Error { message } => {
                        return Err(SignalingError::Rejected(message))
                    }
                    other => debug!("Ignoring {:?} before registration", other),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => return Err(SignalingError::Connect(e.to_string())),
            }
        }
        Err(SignalingError::Connect(
            "connection closed before registration".to_string(),
        ))
    }

    async fn sender_task(
        mut write: SplitSink<WsStream, Message>,
        mut outbound_rx: mpsc::UnboundedReceiver<SignalMessage>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                msg = outbound_rx.recv() => {
                    let Some(msg) = msg else { break };
                    let json = match msg.to_json() {
                        Ok(json) => json,
                        Err(e) => {
                            warn!("Dropping unserializable signaling message: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = write.send(Message::Text(json)).await {
                        error!("Failed to send signaling message: {}", e);
                        break;
                    }
                }
            }
        }

        if let Err(e) = write.close().await {
            debug!("Signaling socket close failed: {}", e);
        }
        debug!("Signaling sender terminated");
    }

    async fn receiver_task(
        mut read: SplitStream<WsStream>,
        event_tx: mpsc::Sender<SignalingEvent>,
    ) {
        while let Some(msg) = read.next().await {
            match msg {
                Ok(Message::Text(text)) => match SignalMessage::from_json(&text) {
                    Ok(SignalMessage::Error { message }) => {
                        warn!("Signaling server error: {}", message);
                        let _ = event_tx
                            .send(SignalingEvent::Errored(LifecycleError::Socket(message)))
                            .await;
                    }
                    Ok(message) => {
                        if event_tx.send(SignalingEvent::Inbound(message)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!("Failed to handle signaling message: {}", e),
                },
                Ok(Message::Close(_)) => {
                    info!("Signaling connection closed by server");
                    let _ = event_tx.send(SignalingEvent::Closed).await;
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    error!("Signaling socket error: {}", e);
                    let _ = event_tx
                        .send(SignalingEvent::Errored(LifecycleError::Socket(e.to_string())))
                        .await;
                    break;
                }
            }
        }

        let _ = event_tx.send(SignalingEvent::Disconnected).await;
    }

    async fn heartbeat_task(handle: SignalingHandle, every: Duration) {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if handle.send(SignalMessage::Heartbeat).is_err() {
                break;
            }
        }
    }
}

impl Drop for SignalingIdentityClient {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}
