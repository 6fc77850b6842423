//! WebRTC peer connection management.
//!
//! Each [`WebRtcPeer`] wraps one `RTCPeerConnection`. Callbacks registered on
//! the connection (state, tracks, data channels, ICE) are turned into
//! [`PeerEvent`] values and pushed onto the transport's event channel; no
//! callback touches transport state directly.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_PCMU};
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
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::pcmu::{self, PcmuPacketizer, FRAME_MILLIS, PCMU_CLOCK_RATE};
use crate::config::AppConfig;
use crate::error::{SessionError, SessionResult};
use crate::platform::{
    DataChannel, MediaTrack, PcmChunk, PcmTap, PeerConnection, PeerConnectionFactory, PeerEvent,
    PeerEventSender, PeerState, SessionDescription, TrackKind, PCM_TAP_CAPACITY,
};

const GATHER_TIMEOUT: Duration = Duration::from_secs(3);
const LOCAL_STREAM_ID: &str = "voice-session";

fn pcmu_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_PCMU.to_owned(),
        clock_rate: PCMU_CLOCK_RATE,
        channels: 1,
        sdp_fmtp_line: String::new(),
        rtcp_feedback: vec![],
    }
}

pub fn peer_state_from(state: RTCPeerConnectionState) -> PeerState {
    match state {
        RTCPeerConnectionState::New => PeerState::New,
        RTCPeerConnectionState::Connecting => PeerState::Connecting,
        RTCPeerConnectionState::Connected => PeerState::Connected,
        RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
        RTCPeerConnectionState::Failed => PeerState::Failed,
        RTCPeerConnectionState::Closed => PeerState::Closed,
        _ => PeerState::New,
    }
}

/// Builds peer connections with PCMU audio and the configured ICE servers.
#[derive(Debug, Clone)]
pub struct WebRtcFactory {
    ice_servers: Vec<String>,
}

impl WebRtcFactory {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.rtc.ice_servers.clone())
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcFactory {
    async fn create(&self, events: PeerEventSender) -> SessionResult<Arc<dyn PeerConnection>> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: pcmu_capability(),
                payload_type: 0,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: self
                .ice_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(rtc_config).await?);
        install_handlers(&pc, &events);
        info!(ice_servers = ?self.ice_servers, "Peer connection created");

        Ok(Arc::new(WebRtcPeer {
            pc,
            events,
            outbound: Mutex::new(None),
        }))
    }
}

fn install_handlers(pc: &Arc<RTCPeerConnection>, events: &PeerEventSender) {
    let tx = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let peer_state = peer_state_from(state);
        debug!(state = ?peer_state, "Peer connection state changed");
        let _ = tx.send(PeerEvent::ConnectionState(peer_state));
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        let candidate = candidate.and_then(|c| c.to_json().ok().map(|j| j.candidate));
        let _ = tx.send(PeerEvent::IceCandidate(candidate));
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
        let tx = tx.clone();
        Box::pin(async move {
            let remote = Arc::new(RemoteTrack::new(&track));
            info!(
                track_id = %remote.id,
                kind = ?remote.kind,
                codec = %track.codec().capability.mime_type,
                "Remote track received"
            );
            let _ = tx.send(PeerEvent::Track(remote.clone() as Arc<dyn MediaTrack>));
            tokio::spawn(read_remote(track, remote, tx));
        })
    }));

    let tx = events.clone();
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let tx = tx.clone();
        Box::pin(async move {
            debug!(label = %dc.label(), "Remote data channel announced");
            wire_channel(&dc, &tx);
            let _ = tx.send(PeerEvent::DataChannel(Arc::new(WebRtcChannel { dc })));
        })
    }));
}

fn wire_channel(dc: &Arc<RTCDataChannel>, events: &PeerEventSender) {
    let label = dc.label().to_owned();

    let (tx, l) = (events.clone(), label.clone());
    dc.on_open(Box::new(move || {
        let _ = tx.send(PeerEvent::ChannelOpen { label: l });
        Box::pin(async {})
    }));

    let (tx, l) = (events.clone(), label.clone());
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let event = match String::from_utf8(msg.data.to_vec()) {
            Ok(text) => PeerEvent::ChannelMessage { label: l.clone(), text },
            Err(_) => PeerEvent::ChannelError {
                label: l.clone(),
                error: "non-UTF-8 payload".to_string(),
            },
        };
        let _ = tx.send(event);
        Box::pin(async {})
    }));

    let (tx, l) = (events.clone(), label.clone());
    dc.on_close(Box::new(move || {
        let _ = tx.send(PeerEvent::ChannelClosed { label: l.clone() });
        Box::pin(async {})
    }));

    let (tx, l) = (events.clone(), label);
    dc.on_error(Box::new(move |err: webrtc::Error| {
        let _ = tx.send(PeerEvent::ChannelError {
            label: l.clone(),
            error: err.to_string(),
        });
        Box::pin(async {})
    }));
}

async fn read_remote(track: Arc<TrackRemote>, remote: Arc<RemoteTrack>, events: PeerEventSender) {
    let decodable = remote.kind == TrackKind::Audio
        && track
            .codec()
            .capability
            .mime_type
            .eq_ignore_ascii_case(MIME_TYPE_PCMU);

    loop {
        match track.read_rtp().await {
            Ok((packet, _attributes)) => {
                if !decodable || packet.payload.is_empty() {
                    continue;
                }
                let samples: PcmChunk = Arc::from(pcmu::decode_payload(&packet.payload));
                let _ = remote.tx.send(samples);
            }
            Err(e) => {
                debug!(track_id = %remote.id, error = %e, "Remote track read ended");
                break;
            }
        }
    }

    remote.live.store(false, Ordering::SeqCst);
    let _ = events.send(PeerEvent::TrackEnded {
        track_id: remote.id.clone(),
    });
}

/// Decoded view of a remote track.
#[derive(Debug)]
struct RemoteTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    live: AtomicBool,
    tx: broadcast::Sender<PcmChunk>,
}

impl RemoteTrack {
    fn new(track: &TrackRemote) -> Self {
        let kind = match track.kind() {
            RTPCodecType::Audio => TrackKind::Audio,
            _ => TrackKind::Video,
        };
        let (tx, _) = broadcast::channel(PCM_TAP_CAPACITY);
        Self {
            id: track.id(),
            kind,
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
            tx,
        }
    }
}

impl MediaTrack for RemoteTrack {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn sample_rate(&self) -> u32 {
        PCMU_CLOCK_RATE
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    fn subscribe(&self) -> PcmTap {
        self.tx.subscribe()
    }
}

pub struct WebRtcChannel {
    dc: Arc<RTCDataChannel>,
}

impl std::fmt::Debug for WebRtcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcChannel")
            .field("label", &self.dc.label())
            .field("state", &self.dc.ready_state())
            .finish()
    }
}

#[async_trait]
impl DataChannel for WebRtcChannel {
    fn label(&self) -> String {
        self.dc.label().to_owned()
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: String) -> SessionResult<()> {
        if !self.is_open() {
            return Err(SessionError::ChannelNotOpen(self.label()));
        }
        self.dc.send_text(text).await?;
        Ok(())
    }
}

struct OutboundAudio {
    source: watch::Sender<Option<Arc<dyn MediaTrack>>>,
    token: CancellationToken,
}

pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    events: PeerEventSender,
    outbound: Mutex<Option<OutboundAudio>>,
}

impl WebRtcPeer {
    fn stop_outbound(&self) {
        if let Some(outbound) = self.outbound.lock().unwrap().take() {
            outbound.token.cancel();
        }
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn add_audio_transceiver(&self, track: Arc<dyn MediaTrack>) -> SessionResult<()> {
        if let Some(outbound) = self.outbound.lock().unwrap().as_ref() {
            outbound.source.send_replace(Some(track));
            return Ok(());
        }

        let sample_track = Arc::new(TrackLocalStaticSample::new(
            pcmu_capability(),
            "audio".to_owned(),
            LOCAL_STREAM_ID.to_owned(),
        ));

        self.pc
            .add_transceiver_from_track(
                sample_track.clone() as Arc<dyn TrackLocal + Send + Sync>,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Sendrecv,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|e| SessionError::TrackAttach(e.to_string()))?;

        let (source, source_rx) = watch::channel(Some(track));
        let token = CancellationToken::new();
        tokio::spawn(pump_outbound(sample_track, source_rx, token.clone()));
        *self.outbound.lock().unwrap() = Some(OutboundAudio { source, token });
        Ok(())
    }

    async fn replace_audio_track(&self, track: Arc<dyn MediaTrack>) -> SessionResult<bool> {
        match self.outbound.lock().unwrap().as_ref() {
            Some(outbound) => {
                debug!(track_id = %track.id(), "Replacing outbound audio source");
                outbound.source.send_replace(Some(track));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn create_data_channel(&self, label: &str) -> SessionResult<Arc<dyn DataChannel>> {
        let dc = self.pc.create_data_channel(label, None).await?;
        wire_channel(&dc, &self.events);
        Ok(Arc::new(WebRtcChannel { dc }))
    }

    async fn create_offer(&self) -> SessionResult<SessionDescription> {
        let offer = self.pc.create_offer(None).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    /// Applies the description and waits (bounded) for ICE gathering, so the
    /// description sent to the server already lists local candidates.
    async fn set_local_description(&self, description: SessionDescription) -> SessionResult<()> {
        let rtc = to_rtc_description(description)?;
        let mut gathered = self.pc.gathering_complete_promise().await;
        self.pc.set_local_description(rtc).await?;
        if tokio::time::timeout(GATHER_TIMEOUT, gathered.recv()).await.is_err() {
            warn!("ICE gathering did not finish in time; sending partial candidates");
        }
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.pc.local_description().await.map(|d| SessionDescription {
            sdp: d.sdp,
            sdp_type: d.sdp_type.to_string(),
        })
    }

    async fn set_remote_description(&self, description: SessionDescription) -> SessionResult<()> {
        let rtc = to_rtc_description(description)?;
        self.pc.set_remote_description(rtc).await?;
        Ok(())
    }

    async fn close(&self) -> SessionResult<()> {
        self.stop_outbound();
        self.pc.close().await?;
        Ok(())
    }
}

impl Drop for WebRtcPeer {
    fn drop(&mut self) {
        self.stop_outbound();
    }
}

fn to_rtc_description(description: SessionDescription) -> SessionResult<RTCSessionDescription> {
    let rtc = match description.sdp_type.as_str() {
        "offer" => RTCSessionDescription::offer(description.sdp)?,
        "answer" => RTCSessionDescription::answer(description.sdp)?,
        "pranswer" => RTCSessionDescription::pranswer(description.sdp)?,
        other => {
            return Err(SessionError::Peer(format!(
                "unsupported description type '{}'",
                other
            )))
        }
    };
    Ok(rtc)
}

/// Forwards the current source's samples to the outbound sample track until
/// cancelled. Swapping the source only changes which tap is read.
async fn pump_outbound(
    sample_track: Arc<TrackLocalStaticSample>,
    mut source_rx: watch::Receiver<Option<Arc<dyn MediaTrack>>>,
    token: CancellationToken,
) {
    let frame_duration = Duration::from_millis(FRAME_MILLIS);

    loop {
        let current = source_rx.borrow_and_update().clone();
        let Some(track) = current else {
            tokio::select! {
                _ = token.cancelled() => return,
                changed = source_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
            continue;
        };

        debug!(track_id = %track.id(), "Outbound audio source active");
        let mut tap = track.subscribe();
        let mut packetizer = PcmuPacketizer::new(track.sample_rate());

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                changed = source_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    break;
                }
                chunk = tap.recv() => match chunk {
                    Ok(chunk) => {
                        for frame in packetizer.push(&chunk, track.is_enabled()) {
                            let sample = Sample {
                                data: Bytes::from(frame),
                                duration: frame_duration,
                                ..Default::default()
                            };
                            if let Err(e) = sample_track.write_sample(&sample).await {
                                debug!(error = %e, "Dropping outbound audio frame");
                            }
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Outbound audio lagged behind capture");
                    }
                    Err(RecvError::Closed) => {
                        // Source ended; idle until it is replaced.
                        tokio::select! {
                            _ = token.cancelled() => return,
                            changed = source_rx.changed() => {
                                if changed.is_err() {
                                    return;
                                }
                                break;
                            }
                        }
                    }
                },
            }
        }
    }
}
