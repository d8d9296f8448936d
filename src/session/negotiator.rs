use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{new_connection_id, ConnectionId, InboundOffer, PeerEvent, PeerTransport};
use crate::error::NegotiationError;
use crate::events::{CallEvent, EventSender};
use crate::media::{MediaDeviceController, MediaTrackSet, Track, TrackKind};
use crate::signaling::ConnectionKind;
use crate::state::{CallStore, ModalPhase, RoomOccupancy};

/// Lifecycle of the negotiation with one remote identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationPhase {
    Idle,
    Requesting,
    Connected,
    Ended,
}

/// The readiness message a joiner sends once the control channel opens.
pub fn confirmation_payload(room: &str) -> String {
    format!("Successfully connected to room ({}).", room)
}

#[derive(Debug, Clone)]
struct Channel {
    id: ConnectionId,
    outbound: bool,
}

#[derive(Debug)]
struct Negotiation {
    remote: String,
    phase: NegotiationPhase,
    data: Option<Channel>,
    media: Option<Channel>,
}

impl Negotiation {
    fn new(remote: &str) -> Self {
        Self {
            remote: remote.to_string(),
            phase: NegotiationPhase::Requesting,
            data: None,
            media: None,
        }
    }

    fn owns(&self, connection_id: &str) -> bool {
        self.data.iter().chain(self.media.iter()).any(|c| c.id == connection_id)
    }

    /// Forget a channel that closed. Returns its kind.
    fn drop_channel(&mut self, connection_id: &str) -> Option<ConnectionKind> {
        if self.data.as_ref().is_some_and(|c| c.id == connection_id) {
            self.data = None;
            return Some(ConnectionKind::Data);
        }
        if self.media.as_ref().is_some_and(|c| c.id == connection_id) {
            self.media = None;
            return Some(ConnectionKind::Media);
        }
        None
    }

    fn has_channels(&self) -> bool {
        self.data.is_some() || self.media.is_some()
    }

    fn is_outbound_data(&self, connection_id: &str) -> bool {
        self.data
            .as_ref()
            .map(|c| c.outbound && c.id == connection_id)
            .unwrap_or(false)
    }
}

/// Drives the one active negotiation with one remote party.
///
/// Every method takes the [`CallStore`] and only touches it once the
/// transport has confirmed what happened. Errors are returned to the engine,
/// which reports them; success moments are broadcast from here.
pub struct SessionNegotiator {
    transport: Arc<dyn PeerTransport>,
    events: EventSender,
    active: Option<Negotiation>,
    last_phase: NegotiationPhase,
    remote_tracks: MediaTrackSet,
}

impl SessionNegotiator {
    pub fn new(transport: Arc<dyn PeerTransport>, events: EventSender) -> Self {
        Self {
            transport,
            events,
            active: None,
            last_phase: NegotiationPhase::Idle,
            remote_tracks: MediaTrackSet::default(),
        }
    }

    pub fn phase(&self) -> NegotiationPhase {
        self.active
            .as_ref()
            .map(|n| n.phase)
            .unwrap_or(self.last_phase)
    }

    pub fn remote(&self) -> Option<&str> {
        self.active.as_ref().map(|n| n.remote.as_str())
    }

    pub fn remote_tracks(&self) -> &MediaTrackSet {
        &self.remote_tracks
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }

    /// Open the control channel to `remote` and, once it opens, send the
    /// confirmation payload.
    pub async fn request_join(
        &mut self,
        store: &mut CallStore,
        remote: &str,
    ) -> Result<(), NegotiationError> {
        let remote = self.check_target(store, remote)?;
        self.begin(store, &remote).await;

        let connection_id = new_connection_id(ConnectionKind::Data);
        self.set_channel(store, ConnectionKind::Data, connection_id.clone(), true)
            .await;

        info!("Joining room {} over {}", remote, connection_id);
        if let Err(e) = self.transport.connect(&remote, &connection_id).await {
            warn!("Connection error: {}", e);
            self.end(store).await;
            return Err(e);
        }
        Ok(())
    }

    /// Offer media to `remote`. The local flags go up for every live track
    /// before the offer is sent, so the caller sees themselves whatever the
    /// remote does.
    pub async fn request_call(
        &mut self,
        store: &mut CallStore,
        remote: &str,
        local: &MediaTrackSet,
    ) -> Result<(), NegotiationError> {
        let remote = self.check_target(store, remote)?;
        for track in local.tracks().filter(|t| t.is_live()) {
            store.set_local_active(track.kind(), true);
        }

        self.begin(store, &remote).await;
        let connection_id = new_connection_id(ConnectionKind::Media);
        self.set_channel(store, ConnectionKind::Media, connection_id.clone(), true)
            .await;

        info!("Calling {} over {}", remote, connection_id);
        if let Err(e) = self.transport.call(&remote, &connection_id, local).await {
            warn!("Call error: {}", e);
            self.end(store).await;
            return Err(e);
        }
        Ok(())
    }

    pub async fn accept_inbound_connection(
        &mut self,
        store: &mut CallStore,
        offer: &InboundOffer,
    ) -> Result<(), NegotiationError> {
        self.check_not_busy(offer).await?;
        self.begin(store, &offer.from).await;
        self.set_channel(store, ConnectionKind::Data, offer.connection_id.clone(), false)
            .await;
        self.emit(CallEvent::InboundConnection {
            from: offer.from.clone(),
        });

        info!("Accepting connection {} from {}", offer.connection_id, offer.from);
        if let Err(e) = self.transport.accept_connection(offer).await {
            self.end(store).await;
            return Err(e);
        }
        Ok(())
    }

    /// Answer an inbound call with whatever local media is held, possibly
    /// none. Remote media is still received either way.
    pub async fn accept_inbound_call(
        &mut self,
        store: &mut CallStore,
        offer: &InboundOffer,
        local: &MediaTrackSet,
    ) -> Result<(), NegotiationError> {
        self.check_not_busy(offer).await?;
        self.begin(store, &offer.from).await;
        self.set_channel(store, ConnectionKind::Media, offer.connection_id.clone(), false)
            .await;
        self.emit(CallEvent::InboundCall {
            from: offer.from.clone(),
        });

        info!(
            "Answering call {} from {} with {} local track(s)",
            offer.connection_id,
            offer.from,
            local.tracks().filter(|t| t.is_live()).count()
        );
        if let Err(e) = self.transport.answer(offer, local).await {
            self.end(store).await;
            return Err(e);
        }
        Ok(())
    }

    /// React to something the transport reports. Returns a newly attached
    /// remote track so the caller can present it.
    pub async fn on_peer_event(
        &mut self,
        store: &mut CallStore,
        event: PeerEvent,
    ) -> Result<Option<Track>, NegotiationError> {
        let connection_id = event.connection_id().to_string();
        let (remote, outbound_data) = match &self.active {
            Some(n) if n.owns(&connection_id) => {
                (n.remote.clone(), n.is_outbound_data(&connection_id))
            }
            _ => {
                debug!("Ignoring event for stale connection {}", connection_id);
                if let PeerEvent::Stream { track, .. } = event {
                    track.stop();
                }
                return Ok(None);
            }
        };

        match event {
            PeerEvent::DataOpen { .. } => {
                if !outbound_data {
                    debug!("Inbound control channel {} open", connection_id);
                    return Ok(None);
                }
                let payload = confirmation_payload(&remote);
                match self.transport.send(&connection_id, &payload).await {
                    Ok(()) => {
                        info!("{}", payload);
                        self.mark_connected(store);
                        Ok(None)
                    }
                    Err(e) => {
                        warn!("Connection error: {}", e);
                        self.end(store).await;
                        Err(e)
                    }
                }
            }
            PeerEvent::Data { payload, .. } => {
                info!("{}", payload);
                self.emit(CallEvent::PayloadReceived {
                    from: remote,
                    payload,
                });
                self.mark_connected(store);
                Ok(None)
            }
            PeerEvent::Stream { track, .. } => {
                let kind = track.kind();
                if let Some(previous) = self.remote_tracks.insert(track.clone()) {
                    previous.stop();
                }
                store.set_remote_active(kind, true);
                self.emit(CallEvent::RemoteTrackStarted { kind });
                self.mark_connected(store);
                Ok(Some(track))
            }
            PeerEvent::StreamEnded { kind, .. } => {
                info!("Remote {} from {} stopped", kind, remote);
                if let Some(track) = self.remote_tracks.take(kind) {
                    track.stop();
                }
                if store.get().remote_active(kind) {
                    store.set_remote_active(kind, false);
                    self.emit(CallEvent::RemoteTrackStopped { kind });
                }
                Ok(None)
            }
            PeerEvent::Error { error, .. } => {
                warn!("Connection {} to {} failed: {}", connection_id, remote, error);
                self.end(store).await;
                Err(error)
            }
            PeerEvent::Closed { .. } => {
                info!("Connection {} to {} closed", connection_id, remote);
                self.transport.close(&connection_id).await;
                let Some(negotiation) = self.active.as_mut() else {
                    return Ok(None);
                };
                let kind = negotiation.drop_channel(&connection_id);
                if !negotiation.has_channels() {
                    self.end(store).await;
                } else if kind == Some(ConnectionKind::Media) {
                    self.clear_remote_media(store);
                }
                Ok(None)
            }
        }
    }

    /// Send a track acquired mid-call on the active media connection.
    pub async fn attach_local_track(&self, track: &Track) -> Result<(), NegotiationError> {
        let Some(connection_id) = self
            .active
            .as_ref()
            .and_then(|n| n.media.as_ref())
            .map(|c| c.id.clone())
        else {
            return Ok(());
        };
        self.transport.attach_track(&connection_id, track).await
    }

    /// Stop every local track, close the negotiated connections and return
    /// to the role picker. Safe to repeat.
    pub async fn hang_up(&mut self, store: &mut CallStore, media: &mut MediaDeviceController) {
        media.release_all(store);
        store.set_modal_phase(ModalPhase::ChoosingRole);
        store.bump_generation();
        self.end(store).await;
    }

    /// Tear down the active negotiation, if any.
    pub async fn end(&mut self, store: &mut CallStore) {
        let Some(negotiation) = self.active.take() else {
            return;
        };

        for channel in negotiation.data.iter().chain(negotiation.media.iter()) {
            self.transport.close(&channel.id).await;
        }
        self.remote_tracks.stop_all();
        store.clear_remote();
        self.last_phase = NegotiationPhase::Ended;

        info!("Negotiation with {} ended", negotiation.remote);
        if negotiation.phase == NegotiationPhase::Connected {
            self.emit(CallEvent::CallEnded {
                remote: negotiation.remote,
            });
        }
    }

    fn check_target(&self, store: &CallStore, remote: &str) -> Result<String, NegotiationError> {
        let remote = remote.trim();
        if remote.is_empty() || store.get().local_identity.as_deref() == Some(remote) {
            return Err(NegotiationError::Unreachable(remote.to_string()));
        }
        Ok(remote.to_string())
    }

    async fn check_not_busy(&self, offer: &InboundOffer) -> Result<(), NegotiationError> {
        match &self.active {
            Some(n) if n.remote != offer.from => {
                warn!(
                    "Declining {} from {}: busy with {}",
                    offer.connection_id, offer.from, n.remote
                );
                self.transport.close(&offer.connection_id).await;
                Err(NegotiationError::Busy {
                    active: n.remote.clone(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Make `remote` the active negotiation, ending one with anybody else.
    async fn begin(&mut self, store: &mut CallStore, remote: &str) {
        if matches!(&self.active, Some(n) if n.remote != remote) {
            self.end(store).await;
        }
        if self.active.is_none() {
            self.active = Some(Negotiation::new(remote));
            store.set_remote_identity(Some(remote.to_string()));
        }
    }

    /// Install a channel, closing whatever it replaces.
    async fn set_channel(
        &mut self,
        store: &mut CallStore,
        kind: ConnectionKind,
        id: ConnectionId,
        outbound: bool,
    ) {
        let Some(negotiation) = self.active.as_mut() else {
            return;
        };
        let channel = Channel { id, outbound };
        let replaced = match kind {
            ConnectionKind::Data => negotiation.data.replace(channel),
            ConnectionKind::Media => negotiation.media.replace(channel),
        };

        if let Some(old) = replaced {
            debug!("Replacing connection {}", old.id);
            self.transport.close(&old.id).await;
            if kind == ConnectionKind::Media {
                self.clear_remote_media(store);
            }
        }
    }

    fn clear_remote_media(&mut self, store: &mut CallStore) {
        self.remote_tracks.stop_all();
        store.set_remote_active(TrackKind::Video, false);
        store.set_remote_active(TrackKind::Audio, false);
    }

    fn mark_connected(&mut self, store: &mut CallStore) {
        let Some(negotiation) = self.active.as_mut() else {
            return;
        };
        if negotiation.phase != NegotiationPhase::Connected {
            negotiation.phase = NegotiationPhase::Connected;
            info!("Connected to {}", negotiation.remote);
        }
        if store.get().room_occupancy != RoomOccupancy::Occupied {
            store.set_occupancy(RoomOccupancy::Occupied);
            let remote = negotiation.remote.clone();
            self.emit(CallEvent::RoomOccupied { remote });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::create_event_bus;
    use crate::media::{TrackOrigin, TrackKind};
    use crate::testing::{FakeDevices, FakeTransport, TransportCall};

    struct Harness {
        store: CallStore,
        transport: Arc<FakeTransport>,
        negotiator: SessionNegotiator,
        media: MediaDeviceController,
        events: crate::events::EventReceiver,
    }

    fn harness() -> Harness {
        let (store, _rx) = CallStore::new();
        let (events_tx, events) = create_event_bus();
        let transport = Arc::new(FakeTransport::default());
        let negotiator = SessionNegotiator::new(transport.clone(), events_tx);
        let media = MediaDeviceController::new(Arc::new(FakeDevices::default()));
        Harness {
            store,
            transport,
            negotiator,
            media,
            events,
        }
    }

    fn remote_track(kind: TrackKind) -> Track {
        Track::new(kind, TrackOrigin::Remote).0
    }

    fn offer(from: &str, id: &str, kind: ConnectionKind) -> InboundOffer {
        InboundOffer {
            from: from.into(),
            connection_id: id.into(),
            kind,
            sdp: "{}".into(),
        }
    }

    #[tokio::test]
    async fn join_occupies_room_once_confirmation_is_sent() {
        let mut h = harness();
        h.negotiator.request_join(&mut h.store, "room-42").await.unwrap();
        assert_eq!(h.negotiator.phase(), NegotiationPhase::Requesting);
        assert_eq!(h.store.get().room_occupancy, RoomOccupancy::Empty);
        assert_eq!(h.store.get().remote_identity.as_deref(), Some("room-42"));

        let id = h.transport.last_connection(ConnectionKind::Data).unwrap();
        h.negotiator
            .on_peer_event(&mut h.store, PeerEvent::DataOpen { connection_id: id.clone() })
            .await
            .unwrap();

        assert_eq!(h.store.get().room_occupancy, RoomOccupancy::Occupied);
        assert_eq!(h.negotiator.phase(), NegotiationPhase::Connected);
        assert!(h.transport.calls().contains(&TransportCall::Send {
            connection_id: id,
            payload: "Successfully connected to room (room-42).".into(),
        }));
    }

    #[tokio::test]
    async fn failed_confirmation_leaves_room_empty() {
        let mut h = harness();
        h.negotiator.request_join(&mut h.store, "room-42").await.unwrap();
        let id = h.transport.last_connection(ConnectionKind::Data).unwrap();

        h.transport.fail_next(NegotiationError::Transport("channel closed".into()));
        let result = h
            .negotiator
            .on_peer_event(&mut h.store, PeerEvent::DataOpen { connection_id: id })
            .await;

        assert!(result.is_err());
        assert_eq!(h.store.get().room_occupancy, RoomOccupancy::Empty);
        assert_eq!(h.negotiator.phase(), NegotiationPhase::Ended);
    }

    #[tokio::test]
    async fn unreachable_join_is_reported_not_thrown() {
        let mut h = harness();
        h.transport.fail_next(NegotiationError::Unreachable("ghost".into()));
        let result = h.negotiator.request_join(&mut h.store, "ghost").await;

        assert_eq!(result, Err(NegotiationError::Unreachable("ghost".into())));
        assert_eq!(h.negotiator.phase(), NegotiationPhase::Ended);
        assert_eq!(h.store.get().remote_identity, None);
        assert_eq!(h.store.get().room_occupancy, RoomOccupancy::Empty);
    }

    #[tokio::test]
    async fn blank_or_own_room_id_is_rejected() {
        let mut h = harness();
        h.store.set_local_identity(Some("A1".into()));
        assert!(h.negotiator.request_join(&mut h.store, "  ").await.is_err());
        assert!(h.negotiator.request_join(&mut h.store, "A1").await.is_err());
        assert!(h.transport.calls().is_empty());
        assert_eq!(h.negotiator.phase(), NegotiationPhase::Idle);
    }

    #[tokio::test]
    async fn caller_sees_own_video_before_remote_answers() {
        let mut h = harness();
        h.media.acquire(&mut h.store, true, true).await.unwrap();
        let local = h.media.local_tracks().clone();

        h.negotiator.request_join(&mut h.store, "A1").await.unwrap();
        h.negotiator
            .request_call(&mut h.store, "A1", &local)
            .await
            .unwrap();

        assert!(h.store.get().local_video_active);
        assert!(h.store.get().local_audio_active);
        assert!(!h.store.get().remote_video_active);

        let media_id = h.transport.last_connection(ConnectionKind::Media).unwrap();
        let track = remote_track(TrackKind::Video);
        let attached = h
            .negotiator
            .on_peer_event(
                &mut h.store,
                PeerEvent::Stream {
                    connection_id: media_id,
                    track: track.clone(),
                },
            )
            .await
            .unwrap();

        assert!(attached.unwrap().same_as(&track));
        assert!(h.store.get().remote_video_active);
        assert!(!h.store.get().remote_audio_active);
        assert_eq!(h.store.get().room_occupancy, RoomOccupancy::Occupied);
    }

    #[tokio::test]
    async fn failed_call_keeps_local_preview() {
        let mut h = harness();
        h.media.acquire(&mut h.store, true, false).await.unwrap();
        let local = h.media.local_tracks().clone();

        h.transport.fail_next(NegotiationError::Unreachable("A1".into()));
        assert!(h.negotiator.request_call(&mut h.store, "A1", &local).await.is_err());
        assert!(h.store.get().local_video_active);
        assert_eq!(h.store.get().room_occupancy, RoomOccupancy::Empty);
    }

    #[tokio::test]
    async fn inbound_call_without_local_media_still_receives() {
        let mut h = harness();
        let call = offer("B2", "mc_1", ConnectionKind::Media);
        h.negotiator
            .accept_inbound_call(&mut h.store, &call, &MediaTrackSet::default())
            .await
            .unwrap();
        assert!(h.transport.calls().contains(&TransportCall::Answer {
            connection_id: "mc_1".into(),
            kinds: vec![],
        }));
        // The offer alone does not count as remote video.
        assert!(!h.store.get().remote_video_active);

        h.negotiator
            .on_peer_event(
                &mut h.store,
                PeerEvent::Stream {
                    connection_id: "mc_1".into(),
                    track: remote_track(TrackKind::Video),
                },
            )
            .await
            .unwrap();
        assert!(h.store.get().remote_video_active);
        assert!(!h.store.get().local_video_active);
    }

    #[tokio::test]
    async fn inbound_payload_occupies_room() {
        let mut h = harness();
        let conn = offer("B2", "dc_1", ConnectionKind::Data);
        h.negotiator
            .accept_inbound_connection(&mut h.store, &conn)
            .await
            .unwrap();

        // Our side of an inbound channel never sends the confirmation.
        h.negotiator
            .on_peer_event(&mut h.store, PeerEvent::DataOpen { connection_id: "dc_1".into() })
            .await
            .unwrap();
        assert_eq!(h.store.get().room_occupancy, RoomOccupancy::Empty);

        h.negotiator
            .on_peer_event(
                &mut h.store,
                PeerEvent::Data {
                    connection_id: "dc_1".into(),
                    payload: confirmation_payload("A1"),
                },
            )
            .await
            .unwrap();
        assert_eq!(h.store.get().room_occupancy, RoomOccupancy::Occupied);

        let mut saw_payload = false;
        while let Ok(event) = h.events.try_recv() {
            if let CallEvent::PayloadReceived { from, .. } = event {
                assert_eq!(from, "B2");
                saw_payload = true;
            }
        }
        assert!(saw_payload);
    }

    #[tokio::test]
    async fn second_caller_is_declined_while_busy() {
        let mut h = harness();
        h.negotiator
            .accept_inbound_connection(&mut h.store, &offer("B2", "dc_1", ConnectionKind::Data))
            .await
            .unwrap();

        let result = h
            .negotiator
            .accept_inbound_call(
                &mut h.store,
                &offer("C3", "mc_9", ConnectionKind::Media),
                &MediaTrackSet::default(),
            )
            .await;
        assert_eq!(result, Err(NegotiationError::Busy { active: "B2".into() }));
        assert!(h.transport.calls().contains(&TransportCall::Close {
            connection_id: "mc_9".into()
        }));
        assert_eq!(h.negotiator.remote(), Some("B2"));
    }

    #[tokio::test]
    async fn stale_stream_is_stopped_and_ignored() {
        let mut h = harness();
        let track = remote_track(TrackKind::Video);
        let attached = h
            .negotiator
            .on_peer_event(
                &mut h.store,
                PeerEvent::Stream {
                    connection_id: "mc_old".into(),
                    track: track.clone(),
                },
            )
            .await
            .unwrap();
        assert!(attached.is_none());
        assert!(!track.is_live());
        assert!(!h.store.get().remote_video_active);
    }

    #[tokio::test]
    async fn hang_up_is_idempotent() {
        let mut h = harness();
        h.store.set_modal_phase(ModalPhase::InCall);
        h.media.acquire(&mut h.store, true, true).await.unwrap();
        let held: Vec<Track> = h.media.local_tracks().tracks().cloned().collect();
        let local = h.media.local_tracks().clone();
        h.negotiator.request_call(&mut h.store, "A1", &local).await.unwrap();
        let media_id = h.transport.last_connection(ConnectionKind::Media).unwrap();

        h.negotiator.hang_up(&mut h.store, &mut h.media).await;
        h.negotiator.hang_up(&mut h.store, &mut h.media).await;

        let state = h.store.get();
        assert!(!state.local_video_active);
        assert!(!state.local_audio_active);
        assert_eq!(state.modal_phase, ModalPhase::ChoosingRole);
        assert_eq!(state.room_occupancy, RoomOccupancy::Empty);
        assert!(held.iter().all(|t| !t.is_live()));
        assert_eq!(h.negotiator.phase(), NegotiationPhase::Ended);
        assert_eq!(
            h.transport
                .calls()
                .iter()
                .filter(|c| **c == TransportCall::Close { connection_id: media_id.clone() })
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn hang_up_with_nothing_active() {
        let mut h = harness();
        h.negotiator.hang_up(&mut h.store, &mut h.media).await;
        let state = h.store.get();
        assert!(!state.local_video_active);
        assert!(!state.local_audio_active);
        assert_eq!(state.modal_phase, ModalPhase::ChoosingRole);
        assert_eq!(h.negotiator.phase(), NegotiationPhase::Idle);
    }

    #[tokio::test]
    async fn remote_close_ends_the_call() {
        let mut h = harness();
        h.negotiator
            .accept_inbound_call(
                &mut h.store,
                &offer("B2", "mc_1", ConnectionKind::Media),
                &MediaTrackSet::default(),
            )
            .await
            .unwrap();
        let track = remote_track(TrackKind::Audio);
        h.negotiator
            .on_peer_event(
                &mut h.store,
                PeerEvent::Stream {
                    connection_id: "mc_1".into(),
                    track: track.clone(),
                },
            )
            .await
            .unwrap();
        assert!(h.store.get().remote_audio_active);

        h.negotiator
            .on_peer_event(&mut h.store, PeerEvent::Closed { connection_id: "mc_1".into() })
            .await
            .unwrap();
        assert!(!h.store.get().remote_audio_active);
        assert!(!track.is_live());
        assert_eq!(h.negotiator.phase(), NegotiationPhase::Ended);

        // A fresh attempt starts over.
        h.negotiator.request_join(&mut h.store, "B2").await.unwrap();
        assert_eq!(h.negotiator.phase(), NegotiationPhase::Requesting);
    }

    #[tokio::test]
    async fn remote_stream_end_lowers_only_that_flag() {
        let mut h = harness();
        h.negotiator
            .accept_inbound_call(
                &mut h.store,
                &offer("B2", "mc_1", ConnectionKind::Media),
                &MediaTrackSet::default(),
            )
            .await
            .unwrap();
        let video = remote_track(TrackKind::Video);
        for track in [video.clone(), remote_track(TrackKind::Audio)] {
            h.negotiator
                .on_peer_event(
                    &mut h.store,
                    PeerEvent::Stream {
                        connection_id: "mc_1".into(),
                        track,
                    },
                )
                .await
                .unwrap();
        }

        h.negotiator
            .on_peer_event(
                &mut h.store,
                PeerEvent::StreamEnded {
                    connection_id: "mc_1".into(),
                    kind: TrackKind::Video,
                },
            )
            .await
            .unwrap();

        assert!(!h.store.get().remote_video_active);
        assert!(h.store.get().remote_audio_active);
        assert!(!video.is_live());
        assert!(h.negotiator.remote_tracks().get(TrackKind::Video).is_none());
        assert_eq!(h.negotiator.phase(), NegotiationPhase::Connected);

        let mut stopped = Vec::new();
        while let Ok(event) = h.events.try_recv() {
            if let CallEvent::RemoteTrackStopped { kind } = event {
                stopped.push(kind);
            }
        }
        assert_eq!(stopped, vec![TrackKind::Video]);
    }

    #[tokio::test]
    async fn closing_the_control_channel_keeps_the_media_call() {
        let mut h = harness();
        h.negotiator
            .accept_inbound_connection(&mut h.store, &offer("B2", "dc_1", ConnectionKind::Data))
            .await
            .unwrap();
        h.negotiator
            .accept_inbound_call(
                &mut h.store,
                &offer("B2", "mc_1", ConnectionKind::Media),
                &MediaTrackSet::default(),
            )
            .await
            .unwrap();
        h.negotiator
            .on_peer_event(
                &mut h.store,
                PeerEvent::Stream {
                    connection_id: "mc_1".into(),
                    track: remote_track(TrackKind::Video),
                },
            )
            .await
            .unwrap();

        // The joiner re-joined: its old control channel goes away first.
        h.negotiator
            .on_peer_event(&mut h.store, PeerEvent::Closed { connection_id: "dc_1".into() })
            .await
            .unwrap();
        assert_eq!(h.negotiator.phase(), NegotiationPhase::Connected);
        assert!(h.store.get().remote_video_active);
        assert_eq!(h.store.get().room_occupancy, RoomOccupancy::Occupied);

        h.negotiator
            .accept_inbound_connection(&mut h.store, &offer("B2", "dc_2", ConnectionKind::Data))
            .await
            .unwrap();
        assert_eq!(h.negotiator.remote(), Some("B2"));

        // Losing the media call drops remote media but not the channel.
        h.negotiator
            .on_peer_event(&mut h.store, PeerEvent::Closed { connection_id: "mc_1".into() })
            .await
            .unwrap();
        assert!(!h.store.get().remote_video_active);
        assert_eq!(h.negotiator.phase(), NegotiationPhase::Connected);

        h.negotiator
            .on_peer_event(&mut h.store, PeerEvent::Closed { connection_id: "dc_2".into() })
            .await
            .unwrap();
        assert_eq!(h.negotiator.phase(), NegotiationPhase::Ended);
        assert_eq!(h.store.get().room_occupancy, RoomOccupancy::Empty);
    }

    #[tokio::test]
    async fn rejoining_the_same_room_keeps_the_call() {
        let mut h = harness();
        h.negotiator.request_join(&mut h.store, "A1").await.unwrap();
        let first = h.transport.last_connection(ConnectionKind::Data).unwrap();
        h.negotiator
            .on_peer_event(&mut h.store, PeerEvent::DataOpen { connection_id: first.clone() })
            .await
            .unwrap();
        h.negotiator
            .request_call(&mut h.store, "A1", &MediaTrackSet::default())
            .await
            .unwrap();
        let media = h.transport.last_connection(ConnectionKind::Media).unwrap();

        h.negotiator.request_join(&mut h.store, "A1").await.unwrap();
        assert!(h.transport.calls().contains(&TransportCall::Close {
            connection_id: first
        }));
        assert!(!h.transport.calls().contains(&TransportCall::Close {
            connection_id: media
        }));
        assert_eq!(h.negotiator.phase(), NegotiationPhase::Connected);
        assert_eq!(h.store.get().room_occupancy, RoomOccupancy::Occupied);
    }
}
