//! # Session Transport
//!
//! Owns one voice session's connection: the peer connection, the local
//! microphone track, the remote (bot) tracks and the control channel. Drives
//! the connection state machine and publishes everything that happens as
//! [`TransportEvent`]s.
//!
//! ## State Machine:
//! ```text
//! disconnected ──► initializing ──► initialized ──► connecting ──► connected
//!      ▲                                               │              │
//!      │                                               ▼              ▼
//!      └──────────────── disconnecting ◄───────── error ◄──────── (failure)
//! ```
//! Every transition emits `StateChange`; setting the current state again is a
//! no-op. `error` is always followed by a forced `disconnected`.
//!
//! ## Concurrency Model:
//! - Peer callbacks arrive as [`PeerEvent`]s on an unbounded channel and are
//!   applied one at a time by a pump task, in arrival order.
//! - Each peer connection gets a generation number; events from a connection
//!   that has since been closed or replaced are dropped.
//! - All mutation happens inside short critical sections that queue events;
//!   the queued events are dispatched after the state lock is released, in
//!   the order they were produced.
//!
//! ## Caller Contract:
//! - Do not run two `connect()` calls concurrently on one transport.
//! - Listeners must not call mutating transport methods synchronously from
//!   inside a callback; spawn a task instead.

use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::error::{SessionError, SessionResult};
use crate::events::{BusEvent, EventBus, ListenerId};
use crate::platform::{
    DataChannel, InputDevice, MediaDevices, MediaTrack, PeerConnection, PeerConnectionFactory,
    PeerEvent, PeerState, TrackKind,
};
use crate::signaling::{NegotiationRequest, SessionNegotiator};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    #[default]
    Disconnected,
    Initializing,
    Initialized,
    Connecting,
    Connected,
    Disconnecting,
    Error,
}

impl TransportState {
    /// A session is being set up, running or torn down.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            TransportState::Connecting | TransportState::Connected | TransportState::Disconnecting
        )
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportState::Disconnected => "disconnected",
            TransportState::Initializing => "initializing",
            TransportState::Initialized => "initialized",
            TransportState::Connecting => "connecting",
            TransportState::Connected => "connected",
            TransportState::Disconnecting => "disconnecting",
            TransportState::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    StateChange(TransportState),
    /// A remote audio track arrived.
    Track(Arc<dyn MediaTrack>),
    BotStartedSpeaking,
    BotStoppedSpeaking,
    /// Connected with the control channel usable. Once per connection.
    BotReady,
    Error(SessionError),
    IceCandidate(String),
    AvailableMicsUpdated(Vec<InputDevice>),
    MicUpdated(Option<InputDevice>),
    /// The local capture track was acquired, replaced or released.
    LocalTrackChanged(Option<Arc<dyn MediaTrack>>),
    /// Verbatim JSON text received on the control channel.
    ControlFrame(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportEventKind {
    StateChange,
    Track,
    BotStartedSpeaking,
    BotStoppedSpeaking,
    BotReady,
    Error,
    IceCandidate,
    AvailableMicsUpdated,
    MicUpdated,
    LocalTrackChanged,
    ControlFrame,
}

impl TransportEventKind {
    pub const ALL: [TransportEventKind; 11] = [
        TransportEventKind::StateChange,
        TransportEventKind::Track,
        TransportEventKind::BotStartedSpeaking,
        TransportEventKind::BotStoppedSpeaking,
        TransportEventKind::BotReady,
        TransportEventKind::Error,
        TransportEventKind::IceCandidate,
        TransportEventKind::AvailableMicsUpdated,
        TransportEventKind::MicUpdated,
        TransportEventKind::LocalTrackChanged,
        TransportEventKind::ControlFrame,
    ];
}

impl BusEvent for TransportEvent {
    type Kind = TransportEventKind;

    fn kind(&self) -> TransportEventKind {
        match self {
            TransportEvent::StateChange(_) => TransportEventKind::StateChange,
            TransportEvent::Track(_) => TransportEventKind::Track,
            TransportEvent::BotStartedSpeaking => TransportEventKind::BotStartedSpeaking,
            TransportEvent::BotStoppedSpeaking => TransportEventKind::BotStoppedSpeaking,
            TransportEvent::BotReady => TransportEventKind::BotReady,
            TransportEvent::Error(_) => TransportEventKind::Error,
            TransportEvent::IceCandidate(_) => TransportEventKind::IceCandidate,
            TransportEvent::AvailableMicsUpdated(_) => TransportEventKind::AvailableMicsUpdated,
            TransportEvent::MicUpdated(_) => TransportEventKind::MicUpdated,
            TransportEvent::LocalTrackChanged(_) => TransportEventKind::LocalTrackChanged,
            TransportEvent::ControlFrame(_) => TransportEventKind::ControlFrame,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub control_channel_label: String,
    pub create_control_channel: bool,
    /// Wait for an open control channel before `BotReady`, whichever side
    /// opens it.
    pub await_control_channel: bool,
    pub default_language: String,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            control_channel_label: "rtvi-ai".to_string(),
            create_control_channel: true,
            await_control_channel: true,
            default_language: "en".to_string(),
        }
    }
}

impl TransportOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            control_channel_label: config.rtc.control_channel_label.clone(),
            create_control_channel: config.rtc.create_control_channel,
            await_control_channel: config.rtc.await_control_channel,
            default_language: config.signaling.default_language.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConnectParams {
    pub language: Option<String>,
}

impl ConnectParams {
    pub fn language(language: impl Into<String>) -> Self {
        Self {
            language: Some(language.into()),
        }
    }
}

/// Current local and bot audio tracks.
#[derive(Debug, Clone, Default)]
pub struct TrackSet {
    pub local_audio: Option<Arc<dyn MediaTrack>>,
    pub bot_audio: Option<Arc<dyn MediaTrack>>,
}

#[derive(Default)]
struct Inner {
    state: TransportState,
    generation: u64,
    peer: Option<Arc<dyn PeerConnection>>,
    peer_connected: bool,
    expects_channel: bool,
    control_channel: Option<Arc<dyn DataChannel>>,
    channel_open: bool,
    bot_ready_sent: bool,
    local_track: Option<Arc<dyn MediaTrack>>,
    remote_tracks: Vec<Arc<dyn MediaTrack>>,
    live_bot_audio: HashSet<String>,
    devices: Vec<InputDevice>,
    selected_device: Option<InputDevice>,
}

type Events = Vec<TransportEvent>;

impl Inner {
    fn state(&self) -> TransportState {
        self.state
    }

    fn set_state(&mut self, next: TransportState, out: &mut Events) {
        let current = self.state;
        if current == next {
            return;
        }
        info!(from = %current, to = %next, "Transport state changed");
        self.state = next;
        out.push(TransportEvent::StateChange(next));
    }

    fn maybe_bot_ready(&mut self, out: &mut Events) {
        let channel_ready = !self.expects_channel || self.channel_open;
        if !self.bot_ready_sent
            && self.peer_connected
            && self.state() == TransportState::Connected
            && channel_ready
        {
            self.bot_ready_sent = true;
            info!("Bot ready");
            out.push(TransportEvent::BotReady);
        }
    }

    fn replace_local_track(&mut self, track: Option<Arc<dyn MediaTrack>>, out: &mut Events) {
        if let Some(old) = self.local_track.take() {
            old.stop();
        }
        self.local_track = track.clone();
        out.push(TransportEvent::LocalTrackChanged(track));
    }

    fn reset_connection(&mut self, out: &mut Events) {
        self.peer_connected = false;
        self.control_channel = None;
        self.channel_open = false;
        self.bot_ready_sent = false;
        self.remote_tracks.clear();
        if !self.live_bot_audio.is_empty() {
            self.live_bot_audio.clear();
            out.push(TransportEvent::BotStoppedSpeaking);
        }
    }

    /// Drop every connection resource. Returns the peer for the caller to close.
    fn teardown(&mut self, out: &mut Events) -> Option<Arc<dyn PeerConnection>> {
        let peer = self.peer.take();
        self.generation += 1;
        self.reset_connection(out);
        if self.local_track.is_some() {
            self.replace_local_track(None, out);
        }
        self.selected_device = None;
        peer
    }

    fn select_existing(&mut self, out: &mut Events) {
        let keep = self
            .selected_device
            .as_ref()
            .is_some_and(|sel| self.devices.iter().any(|d| d.id == sel.id));
        if self.selected_device.is_some() && !keep {
            self.selected_device = None;
            out.push(TransportEvent::MicUpdated(None));
        }
    }
}

pub struct Transport {
    inner: Mutex<Inner>,
    // Serialises event dispatch so listeners observe transitions in order.
    dispatch: Mutex<()>,
    bus: EventBus<TransportEvent>,
    devices: Arc<dyn MediaDevices>,
    factory: Arc<dyn PeerConnectionFactory>,
    negotiator: Arc<dyn SessionNegotiator>,
    options: TransportOptions,
    self_ref: Weak<Transport>,
}

impl Transport {
    pub fn new(
        devices: Arc<dyn MediaDevices>,
        factory: Arc<dyn PeerConnectionFactory>,
        negotiator: Arc<dyn SessionNegotiator>,
        options: TransportOptions,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            inner: Mutex::new(Inner::default()),
            dispatch: Mutex::new(()),
            bus: EventBus::new(),
            devices,
            factory,
            negotiator,
            options,
            self_ref: self_ref.clone(),
        })
    }

    pub fn on<F>(&self, kind: TransportEventKind, callback: F) -> ListenerId
    where
        F: Fn(&TransportEvent) + Send + Sync + 'static,
    {
        self.bus.on(kind, callback)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.bus.off(id)
    }

    pub fn options(&self) -> &TransportOptions {
        &self.options
    }

    pub fn state(&self) -> TransportState {
        self.inner.lock().unwrap().state()
    }

    pub fn devices(&self) -> Vec<InputDevice> {
        self.inner.lock().unwrap().devices.clone()
    }

    pub fn selected_device(&self) -> Option<InputDevice> {
        self.inner.lock().unwrap().selected_device.clone()
    }

    pub fn local_track(&self) -> Option<Arc<dyn MediaTrack>> {
        self.inner.lock().unwrap().local_track.clone()
    }

    pub fn tracks(&self) -> TrackSet {
        let inner = self.inner.lock().unwrap();
        TrackSet {
            local_audio: inner.local_track.clone(),
            bot_audio: inner
                .remote_tracks
                .iter()
                .find(|t| t.kind() == TrackKind::Audio)
                .cloned(),
        }
    }

    pub fn is_control_channel_open(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.channel_open && inner.control_channel.is_some()
    }

    pub fn has_peer(&self) -> bool {
        self.inner.lock().unwrap().peer.is_some()
    }

    #[cfg(test)]
    pub(crate) fn generation(&self) -> u64 {
        self.inner.lock().unwrap().generation
    }

    fn transact<R>(&self, f: impl FnOnce(&mut Inner, &mut Events) -> R) -> R {
        let _order = self.dispatch.lock().unwrap();
        let mut events = Events::new();
        let result = {
            let mut inner = self.inner.lock().unwrap();
            f(&mut inner, &mut events)
        };
        for event in &events {
            self.bus.emit(event);
        }
        result
    }

    fn close_in_background(peer: Arc<dyn PeerConnection>) {
        tokio::spawn(async move {
            if let Err(e) = peer.close().await {
                warn!(error = %e, "Failed to close peer connection");
            }
        });
    }

    async fn create_peer(&self) -> SessionResult<Arc<dyn PeerConnection>> {
        let generation = {
            let mut inner = self.inner.lock().unwrap();
            inner.generation += 1;
            inner.generation
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let peer = self.factory.create(tx).await?;
        self.spawn_event_pump(generation, rx);

        let stale = {
            let mut inner = self.inner.lock().unwrap();
            if inner.generation == generation {
                inner.peer = Some(peer.clone());
                false
            } else {
                true
            }
        };
        if stale {
            Self::close_in_background(peer);
            return Err(SessionError::Peer("peer connection superseded".to_string()));
        }
        debug!(generation, "Peer connection ready");
        Ok(peer)
    }

    fn spawn_event_pump(&self, generation: u64, mut rx: mpsc::UnboundedReceiver<PeerEvent>) {
        let weak = self.self_ref.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(transport) = weak.upgrade() else { break };
                transport.handle_peer_event(generation, event);
            }
            debug!(generation, "Peer event pump finished");
        });
    }

    /// Close any previous peer connection and create a fresh one.
    pub async fn initialize(&self) -> SessionResult<()> {
        let previous = self.transact(|inner, out| {
            let previous = inner.peer.take();
            inner.generation += 1;
            inner.reset_connection(out);
            inner.set_state(TransportState::Disconnected, out);
            previous
        });
        if let Some(previous) = previous {
            if let Err(e) = previous.close().await {
                warn!(error = %e, "Failed to close previous peer connection");
            }
        }
        self.create_peer().await?;
        Ok(())
    }

    /// Enumerate inputs, select the first one and try to open it.
    ///
    /// A capture failure is logged and leaves the session without a local
    /// track; `connect` retries once. Only an enumeration failure is an error.
    pub async fn init_devices(&self) -> SessionResult<()> {
        self.transact(|inner, out| inner.set_state(TransportState::Initializing, out));

        let devices = match self.devices.enumerate_input_devices().await {
            Ok(devices) => devices,
            Err(e) => {
                warn!(error = %e, "Input device enumeration failed");
                self.transact(|inner, out| {
                    out.push(TransportEvent::Error(e.clone()));
                    inner.set_state(TransportState::Disconnected, out);
                });
                return Err(e);
            }
        };

        let selected = self.transact(|inner, out| {
            inner.devices = devices.clone();
            out.push(TransportEvent::AvailableMicsUpdated(devices.clone()));
            if let Some(first) = devices.first() {
                inner.selected_device = Some(first.clone());
                out.push(TransportEvent::MicUpdated(Some(first.clone())));
            }
            inner.selected_device.clone()
        });

        if let Some(device) = selected {
            match self.devices.acquire_audio_track(Some(&device.id)).await {
                Ok(track) => {
                    info!(device = %device.label, track_id = %track.id(), "Local audio track acquired");
                    self.transact(|inner, out| inner.replace_local_track(Some(track), out));
                }
                Err(e) => {
                    warn!(device = %device.label, error = %e, "Could not acquire local audio track");
                }
            }
        }

        self.transact(|inner, out| inner.set_state(TransportState::Initialized, out));
        Ok(())
    }

    /// Re-enumerate inputs. Clears the selection if its device disappeared.
    pub async fn refresh_devices(&self) -> SessionResult<Vec<InputDevice>> {
        let devices = self.devices.enumerate_input_devices().await?;
        self.transact(|inner, out| {
            inner.devices = devices.clone();
            out.push(TransportEvent::AvailableMicsUpdated(devices.clone()));
            inner.select_existing(out);
        });
        Ok(devices)
    }

    pub async fn start(&self) -> SessionResult<()> {
        self.initialize().await?;
        self.init_devices().await
    }

    pub async fn stop(&self) -> SessionResult<()> {
        self.disconnect().await
    }

    /// Negotiate a session with the server.
    ///
    /// Returns once the remote answer is applied; `connected` is reported
    /// later by the peer connection. On failure the transport passes through
    /// `error`, tears down, lands in `disconnected`, emits `Error` and returns
    /// the error.
    pub async fn connect(&self, params: ConnectParams) -> SessionResult<()> {
        let language = params
            .language
            .filter(|l| !l.trim().is_empty())
            .unwrap_or_else(|| self.options.default_language.clone());

        self.transact(|inner, out| {
            inner.expects_channel =
                self.options.create_control_channel || self.options.await_control_channel;
            inner.set_state(TransportState::Connecting, out);
        });

        match self.establish(&language).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(error = %e, "Connect failed");
                self.fail(e.clone()).await;
                Err(e)
            }
        }
    }

    async fn establish(&self, language: &str) -> SessionResult<()> {
        let existing = self.inner.lock().unwrap().peer.clone();
        let peer = match existing {
            Some(peer) => peer,
            None => self.create_peer().await?,
        };

        let track = self.ensure_local_track().await?;

        peer.add_audio_transceiver(track).await.map_err(|e| match e {
            SessionError::TrackAttach(_) => e,
            other => SessionError::TrackAttach(other.to_string()),
        })?;

        if self.options.create_control_channel {
            let channel = peer
                .create_data_channel(&self.options.control_channel_label)
                .await?;
            let open = channel.is_open();
            self.transact(|inner, _| {
                inner.control_channel = Some(channel);
                inner.channel_open = open;
            });
        }

        let offer = peer.create_offer().await?;
        peer.set_local_description(offer.clone()).await?;
        let local = peer.local_description().await.unwrap_or(offer);

        let answer = self
            .negotiator
            .negotiate(NegotiationRequest::new(local, language))
            .await?;
        peer.set_remote_description(answer).await?;
        info!(language, "Session negotiated, waiting for connection");
        Ok(())
    }

    async fn ensure_local_track(&self) -> SessionResult<Arc<dyn MediaTrack>> {
        let (existing, selected) = {
            let inner = self.inner.lock().unwrap();
            (inner.local_track.clone(), inner.selected_device.clone())
        };
        if let Some(track) = existing {
            return Ok(track);
        }

        let device_id = selected.as_ref().map(|d| d.id.as_str());
        match self.devices.acquire_audio_track(device_id).await {
            Ok(track) => {
                info!(track_id = %track.id(), "Local audio track acquired on connect");
                self.transact(|inner, out| inner.replace_local_track(Some(track.clone()), out));
                Ok(track)
            }
            Err(e) => {
                warn!(error = %e, "Fallback audio acquisition failed");
                Err(SessionError::NoLocalTrack)
            }
        }
    }

    async fn fail(&self, error: SessionError) {
        let peer = self.transact(|inner, out| {
            inner.set_state(TransportState::Error, out);
            out.push(TransportEvent::Error(error));
            let peer = inner.teardown(out);
            inner.set_state(TransportState::Disconnected, out);
            peer
        });
        if let Some(peer) = peer {
            if let Err(e) = peer.close().await {
                warn!(error = %e, "Failed to close peer connection after error");
            }
        }
    }

    /// Close the connection and release local capture. No-op without a peer.
    pub async fn disconnect(&self) -> SessionResult<()> {
        let peer = self.transact(|inner, out| {
            let peer = inner.peer.take()?;
            inner.generation += 1;
            inner.set_state(TransportState::Disconnecting, out);
            Some(peer)
        });
        let Some(peer) = peer else {
            debug!("Disconnect requested without a peer connection");
            return Ok(());
        };

        if let Err(e) = peer.close().await {
            warn!(error = %e, "Failed to close peer connection");
        }

        self.transact(|inner, out| {
            inner.teardown(out);
            inner.set_state(TransportState::Disconnected, out);
        });
        Ok(())
    }

    /// Mute or unmute the local track without renegotiating. Returns false
    /// when there is no local track.
    pub fn enable_mic(&self, enabled: bool) -> bool {
        let track = self.inner.lock().unwrap().local_track.clone();
        match track {
            Some(track) => {
                track.set_enabled(enabled);
                debug!(enabled, track_id = %track.id(), "Local track toggled");
                true
            }
            None => false,
        }
    }

    /// Switch capture to `device_id`, or release capture with `None`.
    ///
    /// With an established audio sender the new track is swapped in without
    /// renegotiation; a rejected swap stops the new track, keeps the old one
    /// and returns `TrackAttach`.
    pub async fn update_mic(&self, device_id: Option<&str>) -> SessionResult<()> {
        let Some(device_id) = device_id else {
            self.transact(|inner, out| {
                if let Some(track) = inner.local_track.take() {
                    track.set_enabled(false);
                    track.stop();
                    out.push(TransportEvent::LocalTrackChanged(None));
                }
                inner.selected_device = None;
                out.push(TransportEvent::MicUpdated(None));
            });
            return Ok(());
        };

        let track = self.devices.acquire_audio_track(Some(device_id)).await?;

        let peer = self.inner.lock().unwrap().peer.clone();
        if let Some(peer) = peer {
            match peer.replace_audio_track(track.clone()).await {
                Ok(true) => debug!(track_id = %track.id(), "Audio sender now uses new track"),
                Ok(false) => debug!("No audio sender yet; track will attach on connect"),
                Err(e) => {
                    track.stop();
                    let e = match e {
                        SessionError::TrackAttach(_) => e,
                        other => SessionError::TrackAttach(other.to_string()),
                    };
                    warn!(error = %e, "Audio sender rejected the new track");
                    return Err(e);
                }
            }
        }

        self.transact(|inner, out| {
            track.set_enabled(true);
            inner.replace_local_track(Some(track), out);
            inner.selected_device = inner.devices.iter().find(|d| d.id == device_id).cloned();
            info!(device = %device_id, "Microphone switched");
            out.push(TransportEvent::MicUpdated(inner.selected_device.clone()));
        });
        Ok(())
    }

    /// Send one text frame on the control channel.
    pub async fn send_control(&self, text: String) -> SessionResult<()> {
        let channel = {
            let inner = self.inner.lock().unwrap();
            match (&inner.control_channel, inner.channel_open) {
                (Some(channel), true) => channel.clone(),
                _ => {
                    return Err(SessionError::ChannelNotOpen(
                        self.options.control_channel_label.clone(),
                    ))
                }
            }
        };
        channel.send_text(text).await
    }

    /// Apply one peer callback. Events from superseded connections are ignored.
    pub(crate) fn handle_peer_event(&self, generation: u64, event: PeerEvent) {
        let label = self.options.control_channel_label.as_str();

        let dead_peer = self.transact(|inner, out| {
            if inner.generation != generation {
                debug!(generation, current = inner.generation, "Ignoring event from stale peer");
                return None;
            }

            match event {
                PeerEvent::ConnectionState(state) => {
                    debug!(state = ?state, "Peer state");
                    match state {
                        PeerState::New => {}
                        PeerState::Connecting => {
                            if inner.state() != TransportState::Connected {
                                inner.set_state(TransportState::Connecting, out);
                            }
                        }
                        PeerState::Connected => {
                            inner.peer_connected = true;
                            inner.set_state(TransportState::Connected, out);
                            inner.maybe_bot_ready(out);
                        }
                        PeerState::Disconnected | PeerState::Closed => {
                            if matches!(inner.state(), TransportState::Connecting | TransportState::Connected) {
                                let peer = inner.teardown(out);
                                inner.set_state(TransportState::Disconnected, out);
                                return peer;
                            }
                        }
                        PeerState::Failed => {
                            if matches!(inner.state(), TransportState::Connecting | TransportState::Connected) {
                                inner.set_state(TransportState::Error, out);
                                out.push(TransportEvent::Error(SessionError::Peer(
                                    "peer connection failed".to_string(),
                                )));
                                let peer = inner.teardown(out);
                                inner.set_state(TransportState::Disconnected, out);
                                return peer;
                            }
                        }
                    }
                }
                PeerEvent::Track(track) => {
                    inner.remote_tracks.push(track.clone());
                    if track.kind() == TrackKind::Audio {
                        info!(track_id = %track.id(), "Bot audio track received");
                        out.push(TransportEvent::Track(track.clone()));
                        inner.live_bot_audio.insert(track.id());
                        if inner.live_bot_audio.len() == 1 {
                            out.push(TransportEvent::BotStartedSpeaking);
                        }
                    } else {
                        info!(track_id = %track.id(), kind = ?track.kind(), "Ignoring non-audio remote track");
                    }
                }
                PeerEvent::TrackEnded { track_id } => {
                    inner.remote_tracks.retain(|t| t.id() != track_id);
                    if inner.live_bot_audio.remove(&track_id) {
                        info!(track_id = %track_id, "Bot audio track ended");
                        if inner.live_bot_audio.is_empty() {
                            out.push(TransportEvent::BotStoppedSpeaking);
                        }
                    }
                }
                PeerEvent::DataChannel(channel) => {
                    let channel_label = channel.label();
                    if channel_label == label {
                        info!(label = %channel_label, "Control channel announced by remote");
                        let open = channel.is_open();
                        inner.control_channel = Some(channel);
                        inner.expects_channel = true;
                        if open {
                            inner.channel_open = true;
                            inner.maybe_bot_ready(out);
                        }
                    } else {
                        info!(label = %channel_label, "Ignoring data channel");
                    }
                }
                PeerEvent::ChannelOpen { label: channel_label } => {
                    if channel_label == label {
                        info!(label = %channel_label, "Control channel open");
                        inner.channel_open = true;
                        inner.maybe_bot_ready(out);
                    } else {
                        debug!(label = %channel_label, "Data channel opened");
                    }
                }
                PeerEvent::ChannelMessage { label: channel_label, text } => {
                    if channel_label != label {
                        debug!(label = %channel_label, text = %text, "Message on ignored channel");
                    } else if let Err(e) = serde_json::from_str::<serde_json::Value>(&text) {
                        warn!(error = %e, "Dropping malformed control frame");
                    } else {
                        out.push(TransportEvent::ControlFrame(text));
                    }
                }
                PeerEvent::ChannelClosed { label: channel_label } => {
                    if channel_label == label {
                        info!(label = %channel_label, "Control channel closed");
                        inner.channel_open = false;
                    } else {
                        debug!(label = %channel_label, "Data channel closed");
                    }
                }
                PeerEvent::ChannelError { label: channel_label, error } => {
                    warn!(label = %channel_label, error = %error, "Data channel error");
                }
                PeerEvent::IceCandidate(Some(candidate)) => {
                    out.push(TransportEvent::IceCandidate(candidate));
                }
                PeerEvent::IceCandidate(None) => {
                    debug!("ICE gathering complete");
                }
            }
            None
        });

        if let Some(peer) = dead_peer {
            Self::close_in_background(peer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::testing::{FakeChannel, FakeDevices, FakeFactory, FakeNegotiator, FakeTrack};
    use std::sync::atomic::Ordering;

    struct Harness {
        transport: Arc<Transport>,
        devices: Arc<FakeDevices>,
        factory: Arc<FakeFactory>,
        negotiator: Arc<FakeNegotiator>,
        events: Arc<Mutex<Vec<TransportEvent>>>,
    }

    fn harness_with(devices: Arc<FakeDevices>, negotiator: Arc<FakeNegotiator>) -> Harness {
        harness_with_options(devices, negotiator, TransportOptions::default())
    }

    fn harness_with_options(
        devices: Arc<FakeDevices>,
        negotiator: Arc<FakeNegotiator>,
        options: TransportOptions,
    ) -> Harness {
        let factory = FakeFactory::new();
        let transport = Transport::new(devices.clone(), factory.clone(), negotiator.clone(), options);
        let events = Arc::new(Mutex::new(Vec::new()));
        for kind in TransportEventKind::ALL {
            let sink = events.clone();
            transport.on(kind, move |e| sink.lock().unwrap().push(e.clone()));
        }
        Harness {
            transport,
            devices,
            factory,
            negotiator,
            events,
        }
    }

    fn harness(device_ids: &[&str]) -> Harness {
        harness_with(FakeDevices::with_devices(device_ids), FakeNegotiator::new())
    }

    impl Harness {
        fn take_events(&self) -> Vec<TransportEvent> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }

        fn states(&self) -> Vec<TransportState> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter_map(|e| match e {
                    TransportEvent::StateChange(s) => Some(*s),
                    _ => None,
                })
                .collect()
        }

        fn feed(&self, event: PeerEvent) {
            self.transport.handle_peer_event(self.transport.generation(), event);
        }

        async fn connected(&self) {
            self.transport.start().await.unwrap();
            self.transport.connect(ConnectParams::default()).await.unwrap();
            self.feed(PeerEvent::ConnectionState(PeerState::Connected));
            self.feed(PeerEvent::ChannelOpen { label: "rtvi-ai".into() });
        }
    }

    fn kinds(events: &[TransportEvent]) -> Vec<TransportEventKind> {
        events.iter().map(|e| e.kind()).collect()
    }

    #[tokio::test]
    async fn test_init_devices_selects_first_even_when_capture_fails() {
        let h = harness(&["usb", "builtin"]);
        h.devices.fail_acquire.store(true, Ordering::SeqCst);

        h.transport.start().await.unwrap();

        assert_eq!(h.transport.state(), TransportState::Initialized);
        assert_eq!(h.transport.selected_device().unwrap().id, "usb");
        assert!(h.transport.local_track().is_none());
        let events = h.take_events();
        assert!(events.iter().any(|e| matches!(
            e,
            TransportEvent::MicUpdated(Some(d)) if d.id == "usb"
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            TransportEvent::AvailableMicsUpdated(list) if list.len() == 2
        )));
    }

    #[tokio::test]
    async fn test_init_devices_acquires_first_device() {
        let h = harness(&["usb"]);
        h.transport.start().await.unwrap();
        let track = h.transport.local_track().unwrap();
        assert_eq!(track.device_id().as_deref(), Some("usb"));
        assert_eq!(
            h.states(),
            vec![TransportState::Initializing, TransportState::Initialized]
        );
    }

    #[tokio::test]
    async fn test_connect_without_any_track_fails_with_no_local_track() {
        let h = harness(&[]);
        h.transport.start().await.unwrap();
        h.take_events();

        let err = h.transport.connect(ConnectParams::default()).await.unwrap_err();

        assert_eq!(err, SessionError::NoLocalTrack);
        assert_eq!(h.transport.state(), TransportState::Disconnected);
        assert_eq!(
            h.states(),
            vec![
                TransportState::Connecting,
                TransportState::Error,
                TransportState::Disconnected
            ]
        );
        assert!(h
            .take_events()
            .iter()
            .any(|e| matches!(e, TransportEvent::Error(SessionError::NoLocalTrack))));
        assert!(h.factory.last_peer().unwrap().closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_connect_negotiates_in_order() {
        let h = harness(&["usb"]);
        h.transport.start().await.unwrap();
        h.transport.connect(ConnectParams::language("ta")).await.unwrap();

        let peer = h.factory.last_peer().unwrap();
        assert_eq!(
            peer.calls(),
            vec![
                "add_transceiver:local-0".to_string(),
                "data_channel:rtvi-ai".to_string(),
                "create_offer".to_string(),
                "set_local:offer".to_string(),
                "set_remote:answer".to_string(),
            ]
        );
        let requests = h.negotiator.requests.lock().unwrap();
        assert_eq!(requests[0].language, "ta");
        assert_eq!(requests[0].sdp_type, "offer");
        assert_eq!(h.transport.state(), TransportState::Connecting);
    }

    #[tokio::test]
    async fn test_negotiation_failure_tears_down() {
        let h = harness_with(FakeDevices::with_devices(&["usb"]), FakeNegotiator::failing(500));
        h.transport.start().await.unwrap();

        let err = h.transport.connect(ConnectParams::default()).await.unwrap_err();

        assert!(matches!(err, SessionError::Negotiation(_)));
        assert_eq!(h.transport.state(), TransportState::Disconnected);
        assert!(!h.transport.has_peer());
        assert!(h.transport.local_track().is_none());
        assert!(!h.devices.last_track().unwrap().is_live());
    }

    #[tokio::test]
    async fn test_attach_failure_is_explicit() {
        let h = harness(&["usb"]);
        h.factory.fail_attach.store(true, Ordering::SeqCst);
        h.transport.start().await.unwrap();

        let err = h.transport.connect(ConnectParams::default()).await.unwrap_err();
        assert!(matches!(err, SessionError::TrackAttach(_)));
        assert_eq!(h.transport.state(), TransportState::Disconnected);
    }

    #[tokio::test]
    async fn test_bot_ready_once_after_connected_and_channel_open() {
        let h = harness(&["usb"]);
        h.transport.start().await.unwrap();
        h.transport.connect(ConnectParams::default()).await.unwrap();
        h.take_events();

        h.feed(PeerEvent::ConnectionState(PeerState::Connected));
        assert_eq!(
            kinds(&h.take_events()),
            vec![TransportEventKind::StateChange]
        );

        h.feed(PeerEvent::ChannelOpen { label: "rtvi-ai".into() });
        h.feed(PeerEvent::ConnectionState(PeerState::Connected));
        assert_eq!(kinds(&h.take_events()), vec![TransportEventKind::BotReady]);
        assert!(h.transport.is_control_channel_open());
    }

    #[tokio::test]
    async fn test_disconnect_twice_is_silent_the_second_time() {
        let h = harness(&["usb"]);
        h.connected().await;

        h.transport.disconnect().await.unwrap();
        assert_eq!(h.transport.state(), TransportState::Disconnected);
        let first = h.take_events();
        assert!(first
            .iter()
            .any(|e| matches!(e, TransportEvent::StateChange(TransportState::Disconnecting))));

        h.transport.disconnect().await.unwrap();
        assert!(h.take_events().is_empty());
        assert_eq!(h.transport.state(), TransportState::Disconnected);
    }

    #[tokio::test]
    async fn test_update_mic_none_releases_capture() {
        let h = harness(&["usb"]);
        h.connected().await;
        let track = h.transport.local_track().unwrap();
        h.take_events();

        h.transport.update_mic(None).await.unwrap();

        assert!(!track.is_live());
        assert!(!track.is_enabled());
        assert!(h.transport.selected_device().is_none());
        assert!(h.transport.local_track().is_none());
        let events = h.take_events();
        assert!(matches!(events.last(), Some(TransportEvent::MicUpdated(None))));
    }

    #[tokio::test]
    async fn test_update_mic_swaps_sender_track() {
        let h = harness(&["usb", "headset"]);
        h.connected().await;
        let old = h.transport.local_track().unwrap();

        h.transport.update_mic(Some("headset")).await.unwrap();

        let new = h.transport.local_track().unwrap();
        assert_eq!(new.device_id().as_deref(), Some("headset"));
        assert!(!old.is_live());
        assert_eq!(h.transport.selected_device().unwrap().id, "headset");
        let peer = h.factory.last_peer().unwrap();
        assert!(peer.calls().contains(&format!("replace:{}", new.id())));
    }

    #[tokio::test]
    async fn test_rejected_swap_keeps_old_track() {
        let h = harness(&["usb", "headset"]);
        h.connected().await;
        let old = h.transport.local_track().unwrap();
        h.factory.last_peer().unwrap().fail_replace.store(true, Ordering::SeqCst);

        let err = h.transport.update_mic(Some("headset")).await.unwrap_err();

        assert!(matches!(err, SessionError::TrackAttach(_)));
        assert!(old.is_live());
        assert_eq!(h.transport.local_track().unwrap().id(), old.id());
        assert!(!h.devices.last_track().unwrap().is_live());
    }

    #[tokio::test]
    async fn test_bot_speaking_follows_audio_tracks_only() {
        let h = harness(&["usb"]);
        h.connected().await;
        h.take_events();

        let audio = FakeTrack::audio("bot-audio", None);
        let video = FakeTrack::video("bot-video");
        h.feed(PeerEvent::Track(audio.clone()));
        h.feed(PeerEvent::Track(video.clone()));
        h.feed(PeerEvent::TrackEnded { track_id: "bot-video".into() });
        h.feed(PeerEvent::TrackEnded { track_id: "bot-audio".into() });

        assert_eq!(
            kinds(&h.take_events()),
            vec![
                TransportEventKind::Track,
                TransportEventKind::BotStartedSpeaking,
                TransportEventKind::BotStoppedSpeaking,
            ]
        );
    }

    #[tokio::test]
    async fn test_control_frames_are_filtered() {
        let h = harness(&["usb"]);
        h.connected().await;
        h.take_events();

        h.feed(PeerEvent::ChannelMessage {
            label: "rtvi-ai".into(),
            text: r#"{"label":"rtvi-ai","type":"bot-llm-started"}"#.into(),
        });
        h.feed(PeerEvent::ChannelMessage {
            label: "rtvi-ai".into(),
            text: "{not json".into(),
        });
        h.feed(PeerEvent::ChannelMessage {
            label: "chat".into(),
            text: r#"{"type":"x"}"#.into(),
        });

        let events = h.take_events();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], TransportEvent::ControlFrame(t) if t.contains("bot-llm-started")));
    }

    #[tokio::test]
    async fn test_remote_announced_channel_is_adopted() {
        let h = harness(&["usb"]);
        h.transport.start().await.unwrap();
        h.transport.connect(ConnectParams::default()).await.unwrap();

        h.feed(PeerEvent::DataChannel(FakeChannel::new("metrics", true)));
        assert!(!h.transport.is_control_channel_open());
        h.feed(PeerEvent::DataChannel(FakeChannel::new("rtvi-ai", true)));
        assert!(h.transport.is_control_channel_open());

        h.transport.send_control("{}".into()).await.unwrap();
    }

    #[tokio::test]
    async fn test_bot_ready_waits_for_remote_announced_channel() {
        let h = harness_with_options(
            FakeDevices::with_devices(&["usb"]),
            FakeNegotiator::new(),
            TransportOptions {
                create_control_channel: false,
                ..TransportOptions::default()
            },
        );
        h.transport.start().await.unwrap();
        h.transport.connect(ConnectParams::default()).await.unwrap();
        assert!(h.factory.last_peer().unwrap().channels.lock().unwrap().is_empty());
        h.take_events();

        h.feed(PeerEvent::ConnectionState(PeerState::Connected));
        assert!(!kinds(&h.take_events()).contains(&TransportEventKind::BotReady));

        h.feed(PeerEvent::DataChannel(FakeChannel::new("rtvi-ai", true)));
        assert_eq!(kinds(&h.take_events()), vec![TransportEventKind::BotReady]);
    }

    #[tokio::test]
    async fn test_bot_ready_on_connected_when_no_channel_awaited() {
        let h = harness_with_options(
            FakeDevices::with_devices(&["usb"]),
            FakeNegotiator::new(),
            TransportOptions {
                create_control_channel: false,
                await_control_channel: false,
                ..TransportOptions::default()
            },
        );
        h.transport.start().await.unwrap();
        h.transport.connect(ConnectParams::default()).await.unwrap();
        h.take_events();

        h.feed(PeerEvent::ConnectionState(PeerState::Connected));
        assert_eq!(
            kinds(&h.take_events()),
            vec![TransportEventKind::StateChange, TransportEventKind::BotReady]
        );
    }

    #[tokio::test]
    async fn test_send_control_requires_open_channel() {
        let h = harness(&["usb"]);
        h.transport.start().await.unwrap();
        let err = h.transport.send_control("{}".into()).await.unwrap_err();
        assert_eq!(err, SessionError::ChannelNotOpen("rtvi-ai".into()));
    }

    #[tokio::test]
    async fn test_peer_failure_forces_disconnect() {
        let h = harness(&["usb"]);
        h.connected().await;
        h.take_events();

        h.feed(PeerEvent::ConnectionState(PeerState::Failed));

        assert_eq!(h.transport.state(), TransportState::Disconnected);
        let events = h.take_events();
        assert!(matches!(events[0], TransportEvent::StateChange(TransportState::Error)));
        assert!(matches!(events[1], TransportEvent::Error(SessionError::Peer(_))));
        assert!(matches!(
            events.last(),
            Some(TransportEvent::StateChange(TransportState::Disconnected))
        ));
    }

    #[tokio::test]
    async fn test_events_from_replaced_peer_are_ignored() {
        let h = harness(&["usb"]);
        h.transport.start().await.unwrap();
        let stale = h.transport.generation();
        h.transport.initialize().await.unwrap();
        h.take_events();

        h.transport
            .handle_peer_event(stale, PeerEvent::ConnectionState(PeerState::Connected));

        assert!(h.take_events().is_empty());
        assert_eq!(h.factory.created(), 2);
    }
}
