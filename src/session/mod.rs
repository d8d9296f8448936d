pub mod chunk;
pub mod negotiator;
pub mod rtc;

use async_trait::async_trait;

use crate::error::NegotiationError;
use crate::media::{MediaTrackSet, Track, TrackKind};
use crate::signaling::{ConnectionKind, SignalMessage};

pub use negotiator::{NegotiationPhase, SessionNegotiator};
pub use rtc::RtcTransport;

pub type ConnectionId = String;

/// Fresh id for an outbound connection; the prefix tells kinds apart in logs.
pub fn new_connection_id(kind: ConnectionKind) -> ConnectionId {
    let prefix = match kind {
        ConnectionKind::Data => "dc",
        ConnectionKind::Media => "mc",
    };
    format!("{}_{}", prefix, uuid::Uuid::new_v4().simple())
}

/// An offer relayed to us by the rendezvous server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundOffer {
    pub from: String,
    pub connection_id: ConnectionId,
    pub kind: ConnectionKind,
    pub sdp: String,
}

impl InboundOffer {
    pub fn from_signal(message: &SignalMessage) -> Option<Self> {
        match message {
            SignalMessage::Offer {
                src,
                connection_id,
                kind,
                sdp,
                ..
            } => Some(Self {
                from: src.clone(),
                connection_id: connection_id.clone(),
                kind: *kind,
                sdp: sdp.clone(),
            }),
            _ => None,
        }
    }
}

/// Events emitted by the transport back to the call engine.
#[derive(Debug)]
pub enum PeerEvent {
    /// The control channel is open and can carry payloads.
    DataOpen { connection_id: ConnectionId },
    /// A text payload arrived on the control channel.
    Data {
        connection_id: ConnectionId,
        payload: String,
    },
    /// Remote media actually delivered its first frame.
    Stream {
        connection_id: ConnectionId,
        track: Track,
    },
    /// Remote media of `kind` stopped arriving; the connection stays up.
    StreamEnded {
        connection_id: ConnectionId,
        kind: TrackKind,
    },
    Error {
        connection_id: ConnectionId,
        error: NegotiationError,
    },
    Closed { connection_id: ConnectionId },
}

impl PeerEvent {
    pub fn connection_id(&self) -> &str {
        match self {
            PeerEvent::DataOpen { connection_id }
            | PeerEvent::Data { connection_id, .. }
            | PeerEvent::Stream { connection_id, .. }
            | PeerEvent::StreamEnded { connection_id, .. }
            | PeerEvent::Error { connection_id, .. }
            | PeerEvent::Closed { connection_id } => connection_id,
        }
    }
}

/// The real-time transport: sets up direct data/media connections with the
/// remote party. Methods return without waiting on the network; outcomes,
/// including late failures, arrive as [`PeerEvent`]s keyed by connection id.
/// A returned error means the attempt failed before anything was sent.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Open a control channel toward `remote`.
    async fn connect(&self, remote: &str, connection_id: &str) -> Result<(), NegotiationError>;

    /// Offer a media call to `remote`, sending whatever `local` holds.
    async fn call(
        &self,
        remote: &str,
        connection_id: &str,
        local: &MediaTrackSet,
    ) -> Result<(), NegotiationError>;

    async fn accept_connection(&self, offer: &InboundOffer) -> Result<(), NegotiationError>;

    /// Answer a media call with `local`, which may be empty.
    async fn answer(
        &self,
        offer: &InboundOffer,
        local: &MediaTrackSet,
    ) -> Result<(), NegotiationError>;

    async fn send(&self, connection_id: &str, payload: &str) -> Result<(), NegotiationError>;

    /// Start sending a local track on an existing media connection.
    async fn attach_track(&self, connection_id: &str, track: &Track)
        -> Result<(), NegotiationError>;

    /// Close a connection. Unknown ids are ignored.
    async fn close(&self, connection_id: &str);

    /// Apply an `ANSWER`, `LEAVE` or `EXPIRE` for one of our connections.
    async fn handle_signal(&self, message: SignalMessage);
}
