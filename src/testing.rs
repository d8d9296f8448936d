//! In-memory stand-ins for the hardware and the WebRTC transport.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;

use crate::error::{DeviceError, NegotiationError};
use crate::media::{MediaConstraints, MediaDevices, MediaTrackSet, Track, TrackKind, TrackOrigin};
use crate::session::{InboundOffer, PeerTransport};
use crate::signaling::{ConnectionKind, SignalMessage};

#[derive(Default)]
pub struct FakeDevices {
    denied: Mutex<HashSet<TrackKind>>,
    requests: Mutex<Vec<MediaConstraints>>,
    attached: Mutex<Vec<Track>>,
}

impl FakeDevices {
    pub fn deny(&self, kind: TrackKind) {
        self.denied.lock().unwrap().insert(kind);
    }

    pub fn allow(&self, kind: TrackKind) {
        self.denied.lock().unwrap().remove(&kind);
    }

    pub fn requests(&self) -> Vec<MediaConstraints> {
        self.requests.lock().unwrap().clone()
    }

    pub fn attached(&self) -> Vec<Track> {
        self.attached.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<MediaTrackSet, DeviceError> {
        self.requests.lock().unwrap().push(constraints);

        let denied = self.denied.lock().unwrap().clone();
        let mut set = MediaTrackSet::default();
        for kind in [TrackKind::Video, TrackKind::Audio] {
            if !constraints.wants(kind) {
                continue;
            }
            if denied.contains(&kind) {
                set.stop_all();
                return Err(DeviceError::Unavailable {
                    kind,
                    reason: "permission denied".into(),
                });
            }
            set.insert(Track::new(kind, TrackOrigin::Local).0);
        }
        Ok(set)
    }

    fn attach_remote(&self, track: &Track) {
        self.attached.lock().unwrap().push(track.clone());
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Connect {
        remote: String,
        connection_id: String,
    },
    Call {
        remote: String,
        connection_id: String,
        kinds: Vec<TrackKind>,
    },
    AcceptConnection {
        connection_id: String,
    },
    Answer {
        connection_id: String,
        kinds: Vec<TrackKind>,
    },
    Send {
        connection_id: String,
        payload: String,
    },
    Attach {
        connection_id: String,
        kind: TrackKind,
    },
    Close {
        connection_id: String,
    },
    Signal(SignalMessage),
}

/// Records every call and succeeds unless told to fail the next one.
#[derive(Default)]
pub struct FakeTransport {
    calls: Mutex<Vec<TransportCall>>,
    fail_next: Mutex<Option<NegotiationError>>,
}

impl FakeTransport {
    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fail_next(&self, error: NegotiationError) {
        *self.fail_next.lock().unwrap() = Some(error);
    }

    /// Id of the most recent outbound connection of `kind`.
    pub fn last_connection(&self, kind: ConnectionKind) -> Option<String> {
        self.calls().into_iter().rev().find_map(|call| match (call, kind) {
            (TransportCall::Connect { connection_id, .. }, ConnectionKind::Data)
            | (TransportCall::Call { connection_id, .. }, ConnectionKind::Media) => {
                Some(connection_id)
            }
            _ => None,
        })
    }

    fn record(&self, call: TransportCall) -> Result<(), NegotiationError> {
        self.calls.lock().unwrap().push(call);
        match self.fail_next.lock().unwrap().take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

fn live_kinds(local: &MediaTrackSet) -> Vec<TrackKind> {
    local.tracks().filter(|t| t.is_live()).map(Track::kind).collect()
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn connect(&self, remote: &str, connection_id: &str) -> Result<(), NegotiationError> {
        self.record(TransportCall::Connect {
            remote: remote.into(),
            connection_id: connection_id.into(),
        })
    }

    async fn call(
        &self,
        remote: &str,
        connection_id: &str,
        local: &MediaTrackSet,
    ) -> Result<(), NegotiationError> {
        self.record(TransportCall::Call {
            remote: remote.into(),
            connection_id: connection_id.into(),
            kinds: live_kinds(local),
        })
    }

    async fn accept_connection(&self, offer: &InboundOffer) -> Result<(), NegotiationError> {
        self.record(TransportCall::AcceptConnection {
            connection_id: offer.connection_id.clone(),
        })
    }

    async fn answer(
        &self,
        offer: &InboundOffer,
        local: &MediaTrackSet,
    ) -> Result<(), NegotiationError> {
        self.record(TransportCall::Answer {
            connection_id: offer.connection_id.clone(),
            kinds: live_kinds(local),
        })
    }

    async fn send(&self, connection_id: &str, payload: &str) -> Result<(), NegotiationError> {
        self.record(TransportCall::Send {
            connection_id: connection_id.into(),
            payload: payload.into(),
        })
    }

    async fn attach_track(
        &self,
        connection_id: &str,
        track: &Track,
    ) -> Result<(), NegotiationError> {
        self.record(TransportCall::Attach {
            connection_id: connection_id.into(),
            kind: track.kind(),
        })
    }

    async fn close(&self, connection_id: &str) {
        self.calls.lock().unwrap().push(TransportCall::Close {
            connection_id: connection_id.into(),
        });
    }

    async fn handle_signal(&self, message: SignalMessage) {
        self.calls.lock().unwrap().push(TransportCall::Signal(message));
    }
}
