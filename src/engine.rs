use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::{CallError, DeviceError, LifecycleError};
use crate::events::{CallEvent, EventSender};
use crate::media::{
    AcquireOutcome, AcquireRequest, MediaDeviceController, MediaDevices, MediaTrackSet, Track,
    TrackKind,
};
use crate::session::{InboundOffer, PeerEvent, PeerTransport, SessionNegotiator};
use crate::signaling::{ConnectionKind, SignalMessage, SignalingEvent, SignalingIdentityClient};
use crate::state::{CallState, CallStore, ModalPhase};

/// User intents forwarded by the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallCommand {
    CreateRoom,
    EnterRoomId,
    GoBack,
    JoinRoom(String),
    ToggleCamera,
    ToggleMic,
    HangUp,
    Shutdown,
}

#[derive(Debug, Clone)]
enum Purpose {
    Toggle,
    /// Place a media call to `remote` with whatever ends up held.
    Call { remote: String },
}

/// A finished hardware request.
pub struct Acquisition {
    request: AcquireRequest,
    purpose: Purpose,
    result: Result<MediaTrackSet, DeviceError>,
}

/// Work finished off the loop, re-entering it.
pub enum Background {
    Acquired(Acquisition),
    /// A local track stopped without being asked to (device unplugged).
    LocalTrackEnded(Track),
}

pub type BackgroundReceiver = mpsc::UnboundedReceiver<Background>;

/// Everything the loop owns. Handlers run one at a time on the loop task.
pub struct CallEngine {
    store: CallStore,
    media: MediaDeviceController,
    negotiator: SessionNegotiator,
    transport: Arc<dyn PeerTransport>,
    events: EventSender,
    background_tx: mpsc::UnboundedSender<Background>,
}

impl CallEngine {
    pub fn new(
        devices: Arc<dyn MediaDevices>,
        transport: Arc<dyn PeerTransport>,
        events: EventSender,
    ) -> (Self, watch::Receiver<CallState>, BackgroundReceiver) {
        let (store, state_rx) = CallStore::new();
        let (background_tx, background_rx) = mpsc::unbounded_channel();
        let engine = Self {
            store,
            media: MediaDeviceController::new(devices),
            negotiator: SessionNegotiator::new(transport.clone(), events.clone()),
            transport,
            events,
            background_tx,
        };
        (engine, state_rx, background_rx)
    }

    pub fn state(&self) -> &CallState {
        self.store.get()
    }

    pub fn registered(&mut self, identity: &str) {
        self.store.set_local_identity(Some(identity.to_string()));
        self.emit(CallEvent::Registered {
            identity: identity.to_string(),
        });
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }

    fn fail(&self, err: impl Into<CallError>) {
        let err = err.into();
        warn!("{}", err);
        self.emit(CallEvent::failure(err));
    }

    /// Returns false once the engine should stop.
    pub async fn handle_command(&mut self, command: CallCommand) -> bool {
        debug!("Command: {:?}", command);
        match command {
            CallCommand::CreateRoom => {
                self.store.set_modal_phase(ModalPhase::InCall);
                match &self.store.get().local_identity {
                    Some(id) => info!("Room {} created; share the id to start a call", id),
                    None => info!("Room created before registration finished"),
                }
            }
            CallCommand::EnterRoomId => self.store.set_modal_phase(ModalPhase::EnteringRoomId),
            CallCommand::GoBack => {
                if self.store.get().modal_phase == ModalPhase::EnteringRoomId {
                    self.store.set_modal_phase(ModalPhase::ChoosingRole);
                }
            }
            CallCommand::JoinRoom(room) => {
                self.store.set_modal_phase(ModalPhase::InCall);
                match self.negotiator.request_join(&mut self.store, &room).await {
                    Ok(()) => self.spawn_acquire(
                        true,
                        true,
                        Purpose::Call {
                            remote: room.trim().to_string(),
                        },
                    ),
                    Err(e) => self.fail(e),
                }
            }
            CallCommand::ToggleCamera => self.toggle(TrackKind::Video),
            CallCommand::ToggleMic => self.toggle(TrackKind::Audio),
            CallCommand::HangUp => {
                self.negotiator.hang_up(&mut self.store, &mut self.media).await;
            }
            CallCommand::Shutdown => {
                self.negotiator.hang_up(&mut self.store, &mut self.media).await;
                return false;
            }
        }
        true
    }

    fn toggle(&mut self, kind: TrackKind) {
        if !self.store.get().local_active(kind) {
            let purpose = Purpose::Toggle;
            match kind {
                TrackKind::Video => self.spawn_acquire(true, false, purpose),
                TrackKind::Audio => self.spawn_acquire(false, true, purpose),
            }
            return;
        }
        match self.media.stop(&mut self.store, kind) {
            Ok(()) => self.emit(CallEvent::LocalTrackStopped { kind }),
            Err(e) => self.fail(e),
        }
    }

    /// Ask the hardware off-loop; the result comes back as an [`Acquisition`].
    fn spawn_acquire(&self, want_video: bool, want_audio: bool, purpose: Purpose) {
        let request = self.media.begin_acquire(&self.store, want_video, want_audio);
        let devices = self.media.devices();
        let tx = self.background_tx.clone();
        tokio::spawn(async move {
            let result = if request.constraints.is_empty() {
                Ok(MediaTrackSet::default())
            } else {
                devices.get_user_media(request.constraints).await
            };
            let _ = tx.send(Background::Acquired(Acquisition {
                request,
                purpose,
                result,
            }));
        });
    }

    /// Report back if `track` ends. Stops we make ourselves come back too
    /// and are ignored, since the track is no longer held by then.
    fn watch_local(&self, track: &Track) {
        let track = track.clone();
        let tx = self.background_tx.clone();
        tokio::spawn(async move {
            track.ended().await;
            let _ = tx.send(Background::LocalTrackEnded(track));
        });
    }

    pub async fn handle_background(&mut self, task: Background) {
        match task {
            Background::Acquired(acquisition) => self.handle_acquired(acquisition).await,
            Background::LocalTrackEnded(track) => {
                if self.media.forget_ended(&mut self.store, &track) {
                    let kind = track.kind();
                    warn!("Local {} stopped unexpectedly", kind);
                    self.emit(CallEvent::LocalTrackStopped { kind });
                }
            }
        }
    }

    async fn handle_acquired(&mut self, acquisition: Acquisition) {
        let Acquisition {
            request,
            purpose,
            result,
        } = acquisition;

        match self.media.complete_acquire(&mut self.store, request, result) {
            Ok(AcquireOutcome::Acquired(tracks)) => {
                for track in &tracks {
                    self.watch_local(track);
                    self.emit(CallEvent::LocalTrackStarted { kind: track.kind() });
                    if matches!(purpose, Purpose::Toggle) {
                        if let Err(e) = self.negotiator.attach_local_track(track).await {
                            self.fail(e);
                        }
                    }
                }
            }
            Ok(AcquireOutcome::Stale) => return,
            // Still call with whatever is held.
            Err(e) => self.fail(e),
        }

        if let Purpose::Call { remote } = purpose {
            if self.negotiator.remote() != Some(remote.as_str()) {
                debug!("Join of {} ended before media was ready", remote);
                return;
            }
            let local = self.media.local_tracks().clone();
            if let Err(e) = self
                .negotiator
                .request_call(&mut self.store, &remote, &local)
                .await
            {
                self.fail(e);
            }
        }
    }

    pub async fn handle_signaling(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::Inbound(message) => self.handle_signal(message).await,
            SignalingEvent::Closed => self.fail(LifecycleError::Closed),
            SignalingEvent::Disconnected => self.fail(LifecycleError::Disconnected),
            SignalingEvent::Errored(e) => self.fail(e),
        }
    }

    async fn handle_signal(&mut self, message: SignalMessage) {
        let Some(offer) = InboundOffer::from_signal(&message) else {
            match message {
                SignalMessage::Answer { .. }
                | SignalMessage::Leave { .. }
                | SignalMessage::Expire { .. } => self.transport.handle_signal(message).await,
                other => debug!("Ignoring signaling message {:?}", other),
            }
            return;
        };

        let result = match offer.kind {
            ConnectionKind::Data => {
                self.negotiator
                    .accept_inbound_connection(&mut self.store, &offer)
                    .await
            }
            ConnectionKind::Media => {
                let local = self.media.local_tracks().clone();
                self.negotiator
                    .accept_inbound_call(&mut self.store, &offer, &local)
                    .await
            }
        };
        if let Err(e) = result {
            self.fail(e);
        }
    }

    pub async fn handle_peer_event(&mut self, event: PeerEvent) {
        match self.negotiator.on_peer_event(&mut self.store, event).await {
            Ok(Some(track)) => self.media.devices().attach_remote(&track),
            Ok(None) => {}
            Err(e) => self.fail(e),
        }
    }
}

/// Run the call engine event loop until a `Shutdown` command arrives or the
/// command channel closes. Releases the signaling registration on the way out.
pub async fn run_call_engine(
    mut engine: CallEngine,
    mut client: SignalingIdentityClient,
    mut cmd_rx: mpsc::Receiver<CallCommand>,
    mut signal_rx: mpsc::Receiver<SignalingEvent>,
    mut peer_rx: mpsc::Receiver<PeerEvent>,
    mut background_rx: BackgroundReceiver,
) {
    info!("Call engine started");

    loop {
        tokio::select! {
            command = cmd_rx.recv() => {
                let command = command.unwrap_or(CallCommand::Shutdown);
                if !engine.handle_command(command).await {
                    break;
                }
            }
            Some(event) = signal_rx.recv() => {
                if matches!(event, SignalingEvent::Closed | SignalingEvent::Disconnected) {
                    client.mark_unregistered();
                }
                engine.handle_signaling(event).await;
            }
            Some(event) = peer_rx.recv() => {
                engine.handle_peer_event(event).await;
            }
            Some(task) = background_rx.recv() => {
                engine.handle_background(task).await;
            }
        }
    }

    client.teardown().await;
    info!("Call engine stopped");
}
