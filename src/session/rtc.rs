use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast::error::RecvError, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::chunk::{Assembled, FrameAssembler, FrameSplitter};
use super::{ConnectionId, InboundOffer, PeerEvent, PeerTransport};
use crate::error::{NegotiationError, SignalingError};
use crate::media::codec::SAMPLE_RATE;
use crate::media::{MediaFrame, MediaTrackSet, Track, TrackFeed, TrackKind, TrackOrigin};
use crate::signaling::{ConnectionKind, SignalMessage, SignalingHandle};

const CONTROL_LABEL: &str = "control";
const FRAMES_LABEL: &str = "media-frames";
/// How long to wait for ICE gathering before sending what we have.
const GATHER_TIMEOUT: Duration = Duration::from_secs(10);
/// Pumps re-check whether their track was stopped at least this often.
const PUMP_IDLE: Duration = Duration::from_millis(500);
const AUDIO_FRAME: Duration = Duration::from_millis(20);
const VIDEO_FRAME: Duration = Duration::from_millis(66);
/// Remote audio with no packets for this long counts as stopped.
const AUDIO_STALL: Duration = Duration::from_secs(2);

type ChannelSlot = Arc<Mutex<Option<Arc<RTCDataChannel>>>>;
type Links = Arc<Mutex<HashMap<ConnectionId, Arc<PeerLink>>>>;

fn fail(context: &str, e: impl Display) -> NegotiationError {
    NegotiationError::Transport(format!("{}: {}", context, e))
}

/// One negotiated peer connection: either a control channel or a media call.
struct PeerLink {
    remote: String,
    pc: Arc<RTCPeerConnection>,
    control: ChannelSlot,
    frames: ChannelSlot,
    /// Outgoing Opus track; only media connections carry one.
    audio: Option<Arc<TrackLocalStaticSample>>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

impl PeerLink {
    async fn shutdown(&self, connection_id: &str) {
        for pump in self.pumps.lock().await.drain(..) {
            pump.abort();
        }
        if let Err(e) = self.pc.close().await {
            warn!("Error closing peer connection {}: {}", connection_id, e);
        }
        info!("Closed peer connection {} to {}", connection_id, self.remote);
    }
}

/// WebRTC implementation of [`PeerTransport`].
///
/// Offers and answers carry complete SDP (ICE gathering finishes before they
/// are sent), so no candidates are trickled through the rendezvous server.
/// Gathering runs on a spawned task; the trait methods return as soon as the
/// local description is set. Audio travels as Opus RTP; video frames are
/// JPEGs on a data channel.
pub struct RtcTransport {
    signaling: SignalingHandle,
    ice_servers: Vec<String>,
    event_tx: mpsc::Sender<PeerEvent>,
    links: Links,
}

impl RtcTransport {
    pub fn new(
        signaling: SignalingHandle,
        ice_servers: Vec<String>,
        event_tx: mpsc::Sender<PeerEvent>,
    ) -> Self {
        Self {
            signaling,
            ice_servers,
            event_tx,
            links: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn link(&self, connection_id: &str) -> Result<Arc<PeerLink>, NegotiationError> {
        self.links
            .lock()
            .await
            .get(connection_id)
            .cloned()
            .ok_or_else(|| NegotiationError::NoConnection(connection_id.to_string()))
    }

    async fn new_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| fail("Failed to register codecs", e))?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| fail("Failed to register interceptors", e))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let mut config = RTCConfiguration::default();
        if !self.ice_servers.is_empty() {
            config.ice_servers = vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }];
        }

        let pc = api
            .new_peer_connection(config)
            .await
            .map_err(|e| fail("Failed to create peer connection", e))?;
        Ok(Arc::new(pc))
    }

    /// Create and register the peer connection for `connection_id`.
    async fn open_link(
        &self,
        remote: &str,
        connection_id: &str,
        kind: ConnectionKind,
    ) -> Result<Arc<PeerLink>, NegotiationError> {
        let pc = self.new_peer_connection().await?;

        let audio = match kind {
            ConnectionKind::Data => None,
            ConnectionKind::Media => {
                let track = Arc::new(TrackLocalStaticSample::new(
                    RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_OPUS.to_string(),
                        clock_rate: SAMPLE_RATE,
                        channels: 1,
                        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                        rtcp_feedback: vec![],
                    },
                    "audio".to_string(),
                    format!("roomcall-{}", connection_id),
                ));
                let rtp_sender = pc
                    .add_track(track.clone() as Arc<dyn TrackLocal + Send + Sync>)
                    .await
                    .map_err(|e| fail("Failed to add audio track", e))?;

                // RTCP has to be drained for the interceptors to work.
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 1500];
                    while rtp_sender.read(&mut buf).await.is_ok() {}
                });
                Some(track)
            }
        };

        let link = Arc::new(PeerLink {
            remote: remote.to_string(),
            pc,
            control: Arc::new(Mutex::new(None)),
            frames: Arc::new(Mutex::new(None)),
            audio,
            pumps: Mutex::new(Vec::new()),
        });
        self.watch(&link, connection_id);
        self.links
            .lock()
            .await
            .insert(connection_id.to_string(), link.clone());

        info!(
            "Created {:?} peer connection {} for {}",
            kind, connection_id, remote
        );
        Ok(link)
    }

    /// Install the peer connection callbacks. They only capture the channel
    /// slots, never the link itself, so dropping the link frees everything.
    fn watch(&self, link: &PeerLink, connection_id: &str) {
        let tx = self.event_tx.clone();
        let id = connection_id.to_string();
        link.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let tx = tx.clone();
                let connection_id = id.clone();
                Box::pin(async move {
                    debug!("Peer connection {} state: {}", connection_id, state);
                    let event = match state {
                        RTCPeerConnectionState::Failed => PeerEvent::Error {
                            connection_id,
                            error: NegotiationError::Transport(
                                "peer connection failed".to_string(),
                            ),
                        },
                        RTCPeerConnectionState::Closed => PeerEvent::Closed { connection_id },
                        _ => return,
                    };
                    let _ = tx.send(event).await;
                })
            }));

        let tx = self.event_tx.clone();
        let id = connection_id.to_string();
        link.pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let tx = tx.clone();
            let connection_id = id.clone();
            Box::pin(async move {
                if track.kind() == RTPCodecType::Audio {
                    tokio::spawn(receive_audio(track, connection_id, tx));
                }
            })
        }));

        let tx = self.event_tx.clone();
        let id = connection_id.to_string();
        let control = link.control.clone();
        let frames = link.frames.clone();
        link.pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let tx = tx.clone();
            let connection_id = id.clone();
            let control = control.clone();
            let frames = frames.clone();
            Box::pin(async move {
                debug!("Data channel '{}' opened by remote on {}", dc.label(), connection_id);
                match dc.label() {
                    CONTROL_LABEL => {
                        setup_control(&dc, &connection_id, &tx);
                        *control.lock().await = Some(dc);
                    }
                    FRAMES_LABEL => {
                        setup_frames(&dc, &connection_id, &tx);
                        *frames.lock().await = Some(dc);
                    }
                    other => debug!("Ignoring data channel '{}'", other),
                }
            })
        }));
    }

    /// Drop a link that never got going; the remote is not told.
    async fn discard(&self, connection_id: &str) {
        let link = self.links.lock().await.remove(connection_id);
        if let Some(link) = link {
            link.shutdown(connection_id).await;
        }
    }

    async fn start_pump(&self, link: &PeerLink, track: &Track) {
        let pump = match track.kind() {
            TrackKind::Audio => {
                let Some(out) = link.audio.clone() else {
                    return;
                };
                tokio::spawn(pump_audio(track.clone(), out))
            }
            TrackKind::Video => tokio::spawn(pump_video(track.clone(), link.frames.clone())),
        };
        link.pumps.lock().await.push(pump);
    }

    async fn send_local(&self, link: &PeerLink, local: &MediaTrackSet) {
        for track in local.tracks().filter(|t| t.is_live()) {
            self.start_pump(link, track).await;
        }
    }

    fn ensure_signaling(&self) -> Result<(), NegotiationError> {
        if self.signaling.is_closed() {
            return Err(SignalingError::NotRegistered.into());
        }
        Ok(())
    }

    /// Wait for ICE gathering off the caller's task, then send the message
    /// built from the complete local SDP. A failure discards the link and is
    /// reported as [`PeerEvent::Error`].
    fn publish<F>(
        &self,
        connection_id: &str,
        link: Arc<PeerLink>,
        gathered: mpsc::Receiver<()>,
        message: F,
    ) where
        F: FnOnce(String) -> SignalMessage + Send + 'static,
    {
        let links = self.links.clone();
        let signaling = self.signaling.clone();
        let tx = self.event_tx.clone();
        let connection_id = connection_id.to_string();

        tokio::spawn(async move {
            let result =
                send_when_gathered(&links, &signaling, &connection_id, &link, gathered, message)
                    .await;
            if let Err(error) = result {
                warn!("Could not send description for {}: {}", connection_id, error);
                let removed = links.lock().await.remove(&connection_id);
                if let Some(link) = removed {
                    link.shutdown(&connection_id).await;
                }
                let _ = tx.send(PeerEvent::Error { connection_id, error }).await;
            }
        });
    }

    async fn offer(
        &self,
        remote: &str,
        connection_id: &str,
        kind: ConnectionKind,
        link: &Arc<PeerLink>,
    ) -> Result<(), NegotiationError> {
        let offer = link
            .pc
            .create_offer(None)
            .await
            .map_err(|e| fail("Failed to create offer", e))?;
        let gathered = set_local(&link.pc, offer).await?;

        let dst = remote.to_string();
        let id = connection_id.to_string();
        self.publish(connection_id, link.clone(), gathered, move |sdp| {
            info!("Sending {:?} offer {} to {}", kind, id, dst);
            SignalMessage::Offer {
                src: String::new(),
                dst,
                connection_id: id,
                kind,
                sdp,
            }
        });
        Ok(())
    }

    async fn answer_offer(
        &self,
        offer: &InboundOffer,
        link: &Arc<PeerLink>,
    ) -> Result<(), NegotiationError> {
        let description: RTCSessionDescription =
            serde_json::from_str(&offer.sdp).map_err(|e| fail("Failed to parse offer SDP", e))?;
        link.pc
            .set_remote_description(description)
            .await
            .map_err(|e| fail("Failed to set remote description", e))?;

        let answer = link
            .pc
            .create_answer(None)
            .await
            .map_err(|e| fail("Failed to create answer", e))?;
        let gathered = set_local(&link.pc, answer).await?;

        let dst = offer.from.clone();
        let id = offer.connection_id.clone();
        self.publish(&offer.connection_id, link.clone(), gathered, move |sdp| {
            info!("Sending answer {} to {}", id, dst);
            SignalMessage::Answer {
                src: String::new(),
                dst,
                connection_id: id,
                sdp,
            }
        });
        Ok(())
    }

    async fn apply_answer(&self, connection_id: &str, sdp: &str) -> Result<(), NegotiationError> {
        let link = self.link(connection_id).await?;
        let description: RTCSessionDescription =
            serde_json::from_str(sdp).map_err(|e| fail("Failed to parse answer SDP", e))?;
        link.pc
            .set_remote_description(description)
            .await
            .map_err(|e| fail("Failed to set remote description", e))?;
        info!("Applied answer for {} from {}", connection_id, link.remote);
        Ok(())
    }

    async fn report(&self, event: PeerEvent) {
        let _ = self.event_tx.send(event).await;
    }
}

/// Apply `description` locally, which starts ICE gathering. The returned
/// receiver fires once gathering is complete.
async fn set_local(
    pc: &RTCPeerConnection,
    description: RTCSessionDescription,
) -> Result<mpsc::Receiver<()>, NegotiationError> {
    let gathered = pc.gathering_complete_promise().await;
    pc.set_local_description(description)
        .await
        .map_err(|e| fail("Failed to set local description", e))?;
    Ok(gathered)
}

/// Send the complete local SDP once gathering is done. Nothing is sent if
/// the link was closed in the meantime.
async fn send_when_gathered<F>(
    links: &Links,
    signaling: &SignalingHandle,
    connection_id: &str,
    link: &Arc<PeerLink>,
    mut gathered: mpsc::Receiver<()>,
    message: F,
) -> Result<(), NegotiationError>
where
    F: FnOnce(String) -> SignalMessage,
{
    if tokio::time::timeout(GATHER_TIMEOUT, gathered.recv())
        .await
        .is_err()
    {
        warn!("ICE gathering timed out on {}; sending partial candidates", connection_id);
    }

    // Held across the send so a concurrent `close` cannot slip its LEAVE in
    // ahead of this message.
    let links = links.lock().await;
    if !links
        .get(connection_id)
        .is_some_and(|current| Arc::ptr_eq(current, link))
    {
        debug!("{} closed before its description was ready", connection_id);
        return Ok(());
    }

    let local = link
        .pc
        .local_description()
        .await
        .ok_or_else(|| NegotiationError::Transport("no local description".to_string()))?;
    let sdp = serde_json::to_string(&local).map_err(|e| fail("Failed to serialize SDP", e))?;
    signaling.send(message(sdp))?;
    Ok(())
}

async fn open_channel(slot: &ChannelSlot) -> Option<Arc<RTCDataChannel>> {
    let dc = slot.lock().await.clone();
    dc.filter(|dc| dc.ready_state() == RTCDataChannelState::Open)
}

fn setup_control(dc: &Arc<RTCDataChannel>, connection_id: &str, tx: &mpsc::Sender<PeerEvent>) {
    let open_tx = tx.clone();
    let open_id = connection_id.to_string();
    dc.on_open(Box::new(move || {
        Box::pin(async move {
            let _ = open_tx
                .send(PeerEvent::DataOpen {
                    connection_id: open_id,
                })
                .await;
        })
    }));

    let tx = tx.clone();
    let id = connection_id.to_string();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let tx = tx.clone();
        let connection_id = id.clone();
        Box::pin(async move {
            let payload = String::from_utf8_lossy(&msg.data).into_owned();
            let _ = tx
                .send(PeerEvent::Data {
                    connection_id,
                    payload,
                })
                .await;
        })
    }));
}

/// Reassemble remote video frames. The remote video track is announced with
/// its first complete frame and ended by the sender's end marker; frames
/// after that start a new track.
fn setup_frames(dc: &Arc<RTCDataChannel>, connection_id: &str, tx: &mpsc::Sender<PeerEvent>) {
    let assembler = Arc::new(Mutex::new(FrameAssembler::default()));
    let feed: Arc<Mutex<Option<TrackFeed>>> = Arc::new(Mutex::new(None));
    let tx = tx.clone();
    let id = connection_id.to_string();

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let tx = tx.clone();
        let connection_id = id.clone();
        let assembler = assembler.clone();
        let feed = feed.clone();
        Box::pin(async move {
            let Some(assembled) = assembler.lock().await.push(&msg.data) else {
                return;
            };

            let mut slot = feed.lock().await;
            match assembled {
                Assembled::Frame(frame) => {
                    if slot.is_none() {
                        let (track, track_feed) =
                            Track::new(TrackKind::Video, TrackOrigin::Remote);
                        *slot = Some(track_feed);
                        info!("First remote video frame on {}", connection_id);
                        let _ = tx.send(PeerEvent::Stream { connection_id, track }).await;
                    }
                    if let Some(feed) = slot.as_ref() {
                        feed.push(MediaFrame {
                            data: frame,
                            duration: VIDEO_FRAME,
                        });
                    }
                }
                Assembled::End => {
                    if let Some(ended) = slot.take() {
                        info!("Remote video on {} ended", connection_id);
                        ended.end();
                        let _ = tx
                            .send(PeerEvent::StreamEnded {
                                connection_id,
                                kind: TrackKind::Video,
                            })
                            .await;
                    }
                }
            }
        })
    }));
}

/// Forward remote Opus packets into remote audio [`Track`]s. A track is
/// announced with its first packet and ended once packets stop for
/// [`AUDIO_STALL`]; if they resume, a new track is announced.
async fn receive_audio(remote: Arc<TrackRemote>, connection_id: String, tx: mpsc::Sender<PeerEvent>) {
    let mut current: Option<TrackFeed> = None;

    loop {
        let packet = match tokio::time::timeout(AUDIO_STALL, remote.read_rtp()).await {
            Ok(Ok((packet, _))) => packet,
            Ok(Err(e)) => {
                debug!("Remote audio on {} ended: {}", connection_id, e);
                break;
            }
            Err(_) => {
                if let Some(feed) = current.take() {
                    info!("Remote audio on {} stalled", connection_id);
                    feed.end();
                    if !report_ended(&tx, &connection_id, TrackKind::Audio).await {
                        return;
                    }
                }
                continue;
            }
        };

        if current.is_none() {
            let (track, feed) = Track::new(TrackKind::Audio, TrackOrigin::Remote);
            info!("First remote audio packet on {}", connection_id);
            let event = PeerEvent::Stream {
                connection_id: connection_id.clone(),
                track,
            };
            if tx.send(event).await.is_err() {
                return;
            }
            current = Some(feed);
        }
        if let Some(feed) = &current {
            if !feed.push(MediaFrame {
                data: packet.payload,
                duration: AUDIO_FRAME,
            }) {
                debug!("Remote audio on {} stopped locally", connection_id);
                return;
            }
        }
    }

    if let Some(feed) = current {
        feed.end();
        report_ended(&tx, &connection_id, TrackKind::Audio).await;
    }
}

async fn report_ended(tx: &mpsc::Sender<PeerEvent>, connection_id: &str, kind: TrackKind) -> bool {
    let event = PeerEvent::StreamEnded {
        connection_id: connection_id.to_string(),
        kind,
    };
    tx.send(event).await.is_ok()
}

async fn pump_audio(track: Track, out: Arc<TrackLocalStaticSample>) {
    let mut frames = track.subscribe();
    while track.is_live() {
        match tokio::time::timeout(PUMP_IDLE, frames.recv()).await {
            Ok(Ok(frame)) => {
                let sample = Sample {
                    data: frame.data,
                    duration: frame.duration,
                    ..Default::default()
                };
                if let Err(e) = out.write_sample(&sample).await {
                    debug!("Failed to write audio sample: {}", e);
                }
            }
            Ok(Err(RecvError::Lagged(n))) => debug!("Audio pump skipped {} frames", n),
            Ok(Err(RecvError::Closed)) => break,
            Err(_) => {}
        }
    }
    debug!("Audio pump for {} stopped", track.id());
}

async fn pump_video(track: Track, channel: ChannelSlot) {
    let mut frames = track.subscribe();
    let mut splitter = FrameSplitter::default();
    while track.is_live() {
        let frame = match tokio::time::timeout(PUMP_IDLE, frames.recv()).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(RecvError::Lagged(n))) => {
                debug!("Video pump skipped {} frames", n);
                continue;
            }
            Ok(Err(RecvError::Closed)) => break,
            Err(_) => continue,
        };

        let Some(dc) = open_channel(&channel).await else {
            continue;
        };
        for message in splitter.split(&frame.data) {
            if let Err(e) = dc.send(&message).await {
                debug!("Failed to send video frame: {}", e);
                break;
            }
        }
    }

    if let Some(dc) = open_channel(&channel).await {
        if let Err(e) = dc.send(&FrameSplitter::end_of_track()).await {
            debug!("Failed to send end of video: {}", e);
        }
    }
    debug!("Video pump for {} stopped", track.id());
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn connect(&self, remote: &str, connection_id: &str) -> Result<(), NegotiationError> {
        self.ensure_signaling()?;
        let link = self.open_link(remote, connection_id, ConnectionKind::Data).await?;

        let result = async {
            let dc = link
                .pc
                .create_data_channel(CONTROL_LABEL, None)
                .await
                .map_err(|e| fail("Failed to create control channel", e))?;
            setup_control(&dc, connection_id, &self.event_tx);
            *link.control.lock().await = Some(dc);
            self.offer(remote, connection_id, ConnectionKind::Data, &link).await
        }
        .await;

        if result.is_err() {
            self.discard(connection_id).await;
        }
        result
    }

    async fn call(
        &self,
        remote: &str,
        connection_id: &str,
        local: &MediaTrackSet,
    ) -> Result<(), NegotiationError> {
        self.ensure_signaling()?;
        let link = self.open_link(remote, connection_id, ConnectionKind::Media).await?;

        let result = async {
            let dc = link
                .pc
                .create_data_channel(FRAMES_LABEL, None)
                .await
                .map_err(|e| fail("Failed to create frames channel", e))?;
            setup_frames(&dc, connection_id, &self.event_tx);
            *link.frames.lock().await = Some(dc);
            self.send_local(&link, local).await;
            self.offer(remote, connection_id, ConnectionKind::Media, &link).await
        }
        .await;

        if result.is_err() {
            self.discard(connection_id).await;
        }
        result
    }

    async fn accept_connection(&self, offer: &InboundOffer) -> Result<(), NegotiationError> {
        self.ensure_signaling()?;
        let link = self
            .open_link(&offer.from, &offer.connection_id, ConnectionKind::Data)
            .await?;
        let result = self.answer_offer(offer, &link).await;
        if result.is_err() {
            self.discard(&offer.connection_id).await;
        }
        result
    }

    async fn answer(
        &self,
        offer: &InboundOffer,
        local: &MediaTrackSet,
    ) -> Result<(), NegotiationError> {
        self.ensure_signaling()?;
        let link = self
            .open_link(&offer.from, &offer.connection_id, ConnectionKind::Media)
            .await?;
        let result = self.answer_offer(offer, &link).await;
        match &result {
            Ok(()) => self.send_local(&link, local).await,
            Err(_) => self.discard(&offer.connection_id).await,
        }
        result
    }

    async fn send(&self, connection_id: &str, payload: &str) -> Result<(), NegotiationError> {
        let link = self.link(connection_id).await?;
        let dc = link
            .control
            .lock()
            .await
            .clone()
            .ok_or_else(|| NegotiationError::NoConnection(connection_id.to_string()))?;
        dc.send_text(payload.to_string())
            .await
            .map_err(|e| fail("Failed to send payload", e))?;
        Ok(())
    }

    async fn attach_track(&self, connection_id: &str, track: &Track) -> Result<(), NegotiationError> {
        let link = self.link(connection_id).await?;
        if track.kind() == TrackKind::Audio && link.audio.is_none() {
            return Err(NegotiationError::NoConnection(connection_id.to_string()));
        }
        self.start_pump(&link, track).await;
        info!("Sending local {} on {}", track.kind(), connection_id);
        Ok(())
    }

    async fn close(&self, connection_id: &str) {
        let link = self.links.lock().await.remove(connection_id);
        let Some(link) = link else {
            return;
        };
        let leave = SignalMessage::Leave {
            src: String::new(),
            dst: link.remote.clone(),
            connection_id: connection_id.to_string(),
        };
        if let Err(e) = self.signaling.send(leave) {
            debug!("Could not tell {} about closing {}: {}", link.remote, connection_id, e);
        }
        link.shutdown(connection_id).await;
    }

    async fn handle_signal(&self, message: SignalMessage) {
        match message {
            SignalMessage::Answer {
                connection_id, sdp, ..
            } => {
                if let Err(error) = self.apply_answer(&connection_id, &sdp).await {
                    warn!("Answer for {} rejected: {}", connection_id, error);
                    self.discard(&connection_id).await;
                    self.report(PeerEvent::Error {
                        connection_id,
                        error,
                    })
                    .await;
                }
            }
            SignalMessage::Leave { connection_id, .. } => {
                info!("Remote closed {}", connection_id);
                self.discard(&connection_id).await;
                self.report(PeerEvent::Closed { connection_id }).await;
            }
            SignalMessage::Expire {
                src, connection_id, ..
            } => {
                info!("Peer {} could not be reached for {}", src, connection_id);
                self.discard(&connection_id).await;
                self.report(PeerEvent::Error {
                    connection_id,
                    error: NegotiationError::Unreachable(src),
                })
                .await;
            }
            other => debug!("Transport ignoring {:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    const WAIT: Duration = Duration::from_secs(20);

    fn transport() -> (
        RtcTransport,
        mpsc::UnboundedReceiver<SignalMessage>,
        mpsc::Receiver<PeerEvent>,
    ) {
        let (handle, signals) = SignalingHandle::channel();
        let (event_tx, events) = mpsc::channel(16);
        (RtcTransport::new(handle, Vec::new(), event_tx), signals, events)
    }

    #[tokio::test]
    async fn connect_sends_complete_offer_and_close_sends_leave() {
        let (transport, mut signals, _events) = transport();
        transport.connect("A1", "dc_test").await.unwrap();

        match signals.recv().await.unwrap() {
            SignalMessage::Offer {
                dst,
                connection_id,
                kind,
                sdp,
                ..
            } => {
                assert_eq!(dst, "A1");
                assert_eq!(connection_id, "dc_test");
                assert_eq!(kind, ConnectionKind::Data);
                let description: RTCSessionDescription = serde_json::from_str(&sdp).unwrap();
                assert!(description.sdp.contains("webrtc-datachannel"));
            }
            other => panic!("unexpected {:?}", other),
        }

        transport.close("dc_test").await;
        assert_eq!(
            signals.recv().await.unwrap(),
            SignalMessage::Leave {
                src: String::new(),
                dst: "A1".into(),
                connection_id: "dc_test".into(),
            }
        );
        // Second close is a no-op.
        transport.close("dc_test").await;
        assert!(signals.try_recv().is_err());
    }

    #[tokio::test]
    async fn expire_reports_unreachable() {
        let (transport, _signals, mut events) = transport();
        transport.connect("ghost", "dc_gone").await.unwrap();

        transport
            .handle_signal(SignalMessage::Expire {
                src: "ghost".into(),
                dst: "me".into(),
                connection_id: "dc_gone".into(),
            })
            .await;

        loop {
            match events.recv().await.unwrap() {
                PeerEvent::Error { connection_id, error } => {
                    assert_eq!(connection_id, "dc_gone");
                    assert_eq!(error, NegotiationError::Unreachable("ghost".into()));
                    break;
                }
                // Closing the peer connection may report first.
                PeerEvent::Closed { .. } => continue,
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(matches!(
            transport.send("dc_gone", "hi").await,
            Err(NegotiationError::NoConnection(_))
        ));
    }

    #[tokio::test]
    async fn unknown_connections_are_errors_or_ignored() {
        let (transport, _signals, _events) = transport();
        let track = Track::new(TrackKind::Video, TrackOrigin::Local).0;
        assert!(matches!(
            transport.attach_track("mc_nope", &track).await,
            Err(NegotiationError::NoConnection(_))
        ));
        transport.close("mc_nope").await;
    }

    #[tokio::test]
    async fn offer_fails_once_signaling_is_gone() {
        let (transport, signals, _events) = transport();
        drop(signals);
        assert!(matches!(
            transport.connect("A1", "dc_x").await,
            Err(NegotiationError::Signaling(_))
        ));
        assert!(transport.links.lock().await.is_empty());
    }

    #[tokio::test]
    async fn description_is_not_sent_for_a_closed_link() {
        let (transport, mut signals, _events) = transport();
        let link = transport
            .open_link("A1", "dc_late", ConnectionKind::Data)
            .await
            .unwrap();
        link.pc
            .create_data_channel(CONTROL_LABEL, None)
            .await
            .unwrap();
        let offer = link.pc.create_offer(None).await.unwrap();
        set_local(&link.pc, offer).await.unwrap();

        let build = |sdp: String| SignalMessage::Offer {
            src: String::new(),
            dst: "A1".into(),
            connection_id: "dc_late".into(),
            kind: ConnectionKind::Data,
            sdp,
        };
        let gathered = || {
            let (tx, rx) = mpsc::channel(1);
            tx.try_send(()).unwrap();
            rx
        };

        // Closed (removed) before gathering finished: stays quiet.
        let removed = transport.links.lock().await.remove("dc_late").unwrap();
        send_when_gathered(
            &transport.links,
            &transport.signaling,
            "dc_late",
            &removed,
            gathered(),
            build,
        )
        .await
        .unwrap();
        assert!(signals.try_recv().is_err());

        // Still registered: the offer goes out.
        transport
            .links
            .lock()
            .await
            .insert("dc_late".into(), removed.clone());
        send_when_gathered(
            &transport.links,
            &transport.signaling,
            "dc_late",
            &removed,
            gathered(),
            build,
        )
        .await
        .unwrap();
        assert!(matches!(
            signals.try_recv(),
            Ok(SignalMessage::Offer { connection_id, .. }) if connection_id == "dc_late"
        ));
        transport.close("dc_late").await;
    }

    struct Peer {
        transport: RtcTransport,
        signals: mpsc::UnboundedReceiver<SignalMessage>,
        events: mpsc::Receiver<PeerEvent>,
    }

    fn peer() -> Peer {
        let (handle, signals) = SignalingHandle::channel();
        let (event_tx, events) = mpsc::channel(256);
        Peer {
            transport: RtcTransport::new(handle, Vec::new(), event_tx),
            signals,
            events,
        }
    }

    /// Next outbound signal, stamped with `from` the way the server relays it.
    async fn relay(signals: &mut mpsc::UnboundedReceiver<SignalMessage>, from: &str) -> SignalMessage {
        tokio::time::timeout(WAIT, signals.recv())
            .await
            .expect("no signal in time")
            .expect("signaling closed")
            .with_src(from)
    }

    async fn wait_for<T>(
        events: &mut mpsc::Receiver<PeerEvent>,
        mut pick: impl FnMut(PeerEvent) -> Option<T>,
    ) -> T {
        tokio::time::timeout(WAIT, async {
            loop {
                let event = events.recv().await.expect("transport events closed");
                if let Some(found) = pick(event) {
                    return found;
                }
            }
        })
        .await
        .expect("timed out waiting for a peer event")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn two_transports_join_and_stream_video() {
        let mut host = peer();
        let mut joiner = peer();

        // Control channel: joiner B2 opens it toward host A1.
        joiner.transport.connect("A1", "dc_1").await.unwrap();
        let offer = InboundOffer::from_signal(&relay(&mut joiner.signals, "B2").await).unwrap();
        assert_eq!(offer.from, "B2");
        assert_eq!(offer.kind, ConnectionKind::Data);
        host.transport.accept_connection(&offer).await.unwrap();
        joiner
            .transport
            .handle_signal(relay(&mut host.signals, "A1").await)
            .await;

        wait_for(&mut joiner.events, |event| match event {
            PeerEvent::DataOpen { connection_id } if connection_id == "dc_1" => Some(()),
            _ => None,
        })
        .await;
        joiner
            .transport
            .send("dc_1", "Successfully connected to room (A1).")
            .await
            .unwrap();
        let payload = wait_for(&mut host.events, |event| match event {
            PeerEvent::Data {
                connection_id,
                payload,
            } if connection_id == "dc_1" => Some(payload),
            _ => None,
        })
        .await;
        assert_eq!(payload, "Successfully connected to room (A1).");

        // Media call carrying the joiner's camera; the host answers with nothing.
        let (camera, camera_feed) = Track::new(TrackKind::Video, TrackOrigin::Local);
        let mut local = MediaTrackSet::default();
        local.insert(camera.clone());
        joiner.transport.call("A1", "mc_1", &local).await.unwrap();
        let offer = InboundOffer::from_signal(&relay(&mut joiner.signals, "B2").await).unwrap();
        assert_eq!(offer.kind, ConnectionKind::Media);
        host.transport
            .answer(&offer, &MediaTrackSet::default())
            .await
            .unwrap();
        joiner
            .transport
            .handle_signal(relay(&mut host.signals, "A1").await)
            .await;

        // The offer alone announces nothing.
        tokio::time::sleep(Duration::from_millis(500)).await;
        while let Ok(event) = host.events.try_recv() {
            assert!(
                !matches!(event, PeerEvent::Stream { .. }),
                "remote stream announced before any frame"
            );
        }

        let pusher = tokio::spawn(async move {
            let mut n = 0u8;
            while camera_feed.push(MediaFrame {
                data: Bytes::from(vec![n; 256]),
                duration: VIDEO_FRAME,
            }) {
                n = n.wrapping_add(1);
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        });

        let remote = wait_for(&mut host.events, |event| match event {
            PeerEvent::Stream {
                connection_id,
                track,
            } if connection_id == "mc_1" => Some(track),
            _ => None,
        })
        .await;
        assert_eq!(remote.kind(), TrackKind::Video);
        assert_eq!(remote.origin(), TrackOrigin::Remote);
        assert!(remote.is_live());

        // Stopping the camera ends the host's copy without closing the call.
        camera.stop();
        let ended = wait_for(&mut host.events, |event| match event {
            PeerEvent::StreamEnded {
                connection_id,
                kind,
            } if connection_id == "mc_1" => Some(kind),
            PeerEvent::Closed { connection_id } if connection_id == "mc_1" => {
                panic!("media connection closed instead of ending the stream")
            }
            _ => None,
        })
        .await;
        assert_eq!(ended, TrackKind::Video);
        assert!(!remote.is_live());
        pusher.await.unwrap();

        joiner.transport.close("dc_1").await;
        joiner.transport.close("mc_1").await;
        for _ in 0..2 {
            host.transport
                .handle_signal(relay(&mut joiner.signals, "B2").await)
                .await;
        }
        assert!(host.transport.links.lock().await.is_empty());
    }
}
