//! Rendezvous wire protocol, plus the client and server that speak it.

pub mod client;
pub mod server;

use serde::{Deserialize, Serialize};

use crate::error::SignalingError;

pub use client::{SignalingEvent, SignalingHandle, SignalingIdentityClient};

/// What an `OFFER` sets up: a control channel or a media call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    Data,
    Media,
}

/// One JSON text frame on the signaling socket.
///
/// `src` on relayed messages is filled in by the server with the sender's
/// registered id; whatever the client puts there is ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING-KEBAB-CASE")]
pub enum SignalMessage {
    Open {
        id: String,
    },
    IdTaken {
        id: String,
    },
    Error {
        message: String,
    },
    Heartbeat,
    Offer {
        #[serde(default)]
        src: String,
        dst: String,
        connection_id: String,
        kind: ConnectionKind,
        sdp: String,
    },
    Answer {
        #[serde(default)]
        src: String,
        dst: String,
        connection_id: String,
        sdp: String,
    },
    Leave {
        #[serde(default)]
        src: String,
        dst: String,
        connection_id: String,
    },
    /// Bounced back by the server: `src` is the unreachable id.
    Expire {
        src: String,
        dst: String,
        connection_id: String,
    },
}

impl SignalMessage {
    pub fn to_json(&self) -> Result<String, SignalingError> {
        serde_json::to_string(self).map_err(|e| SignalingError::Protocol(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, SignalingError> {
        serde_json::from_str(text).map_err(|e| SignalingError::Protocol(e.to_string()))
    }

    /// Destination of a relayed message.
    pub fn dst(&self) -> Option<&str> {
        match self {
            SignalMessage::Offer { dst, .. }
            | SignalMessage::Answer { dst, .. }
            | SignalMessage::Leave { dst, .. } => Some(dst),
            _ => None,
        }
    }

    pub fn connection_id(&self) -> Option<&str> {
        match self {
            SignalMessage::Offer { connection_id, .. }
            | SignalMessage::Answer { connection_id, .. }
            | SignalMessage::Leave { connection_id, .. }
            | SignalMessage::Expire { connection_id, .. } => Some(connection_id),
            _ => None,
        }
    }

    /// Stamp the sender id onto a relayed message.
    pub fn with_src(mut self, sender: &str) -> Self {
        match &mut self {
            SignalMessage::Offer { src, .. }
            | SignalMessage::Answer { src, .. }
            | SignalMessage::Leave { src, .. } => *src = sender.to_string(),
            _ => {}
        }
        self
    }
}
