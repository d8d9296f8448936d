use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::{CallError, ErrorKind};
use crate::media::TrackKind;

/// Notable call moments, for the presentation layer.
/// State itself is published separately as `CallState` snapshots.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum CallEvent {
    Registered { identity: String },
    InboundConnection { from: String },
    InboundCall { from: String },
    PayloadReceived { from: String, payload: String },
    RoomOccupied { remote: String },
    LocalTrackStarted { kind: TrackKind },
    LocalTrackStopped { kind: TrackKind },
    RemoteTrackStarted { kind: TrackKind },
    RemoteTrackStopped { kind: TrackKind },
    CallEnded { remote: String },
    Failure { kind: ErrorKind, message: String },
}

impl CallEvent {
    pub fn failure(err: impl Into<CallError>) -> Self {
        let err = err.into();
        CallEvent::Failure {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

pub type EventSender = broadcast::Sender<CallEvent>;
pub type EventReceiver = broadcast::Receiver<CallEvent>;

pub fn create_event_bus() -> (EventSender, EventReceiver) {
    broadcast::channel(256)
}
