use serde::Serialize;
use thiserror::Error;

use crate::media::TrackKind;

/// Camera or microphone could not be used. Locally recoverable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("{kind} device unavailable: {reason}")]
    Unavailable { kind: TrackKind, reason: String },
    #[error("no {0} track is currently held")]
    TrackNotHeld(TrackKind),
}

/// Registration with, or messaging through, the rendezvous service failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalingError {
    #[error("failed to connect to signaling server: {0}")]
    Connect(String),
    #[error("timed out waiting for a session identifier")]
    Timeout,
    #[error("session identifier {0} is already taken")]
    IdTaken(String),
    #[error("signaling server rejected registration: {0}")]
    Rejected(String),
    #[error("not registered with the signaling server")]
    NotRegistered,
    #[error("malformed signaling message: {0}")]
    Protocol(String),
}

/// The remote party could not be reached or the handshake broke down.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiationError {
    #[error("peer {0} is not reachable")]
    Unreachable(String),
    #[error("already negotiating with {active}")]
    Busy { active: String },
    #[error("no connection {0}")]
    NoConnection(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

/// The signaling socket went away after registration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("signaling connection closed")]
    Closed,
    #[error("signaling connection lost")]
    Disconnected,
    #[error("signaling socket error: {0}")]
    Socket(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

/// Coarse classification shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Device,
    Signaling,
    Negotiation,
    Lifecycle,
}

impl CallError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CallError::Device(_) => ErrorKind::Device,
            CallError::Signaling(_) => ErrorKind::Signaling,
            CallError::Negotiation(_) => ErrorKind::Negotiation,
            CallError::Lifecycle(_) => ErrorKind::Lifecycle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_follows_variant() {
        let err: CallError = DeviceError::TrackNotHeld(TrackKind::Video).into();
        assert_eq!(err.kind(), ErrorKind::Device);
        assert_eq!(err.to_string(), "no video track is currently held");

        let err: CallError = NegotiationError::Unreachable("A1".into()).into();
        assert_eq!(err.kind(), ErrorKind::Negotiation);
    }
}
