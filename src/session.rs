//! # Voice Session Façade
//!
//! The view-model a presentation layer binds to. Owns one [`Transport`], one
//! [`ProtocolClient`] and the audio analysis attached to the session's
//! tracks, and folds everything they report into a [`SessionView`] plus a
//! stream of [`SessionEvent`]s.
//!
//! ## Wiring:
//! - local track changes feed the activity detector and the local visualizer
//! - remote audio tracks feed the bot visualizer
//! - transport state drives the session timer, readiness and cleanup
//! - protocol events update metrics and the last transcript
//!
//! ## Key Rust Concepts Used:
//! - **Arc::new_cyclic**: listener closures capture a `Weak<VoiceSession>`
//!   so the transport's listener table does not keep the session alive
//! - **watch channels**: waveform frames and page visibility
//! - **Scoped locking**: view state is updated inside short blocks and
//!   released before any loop is cancelled

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::audio::{ActivityDetector, AmplitudeVisualizer, AudioContext, FrameTask, WaveformFrame};
use crate::config::AppConfig;
use crate::error::SessionResult;
use crate::events::{BusEvent, EventBus, ListenerId};
use crate::platform::{InputDevice, MediaDevices, PeerConnectionFactory};
use crate::protocol::{MetricsSnapshot, ProtocolClient, ProtocolEvent, ProtocolEventKind, Transcript};
use crate::signaling::SessionNegotiator;
use crate::transport::{
    ConnectParams, Transport, TransportEvent, TransportEventKind, TransportOptions, TransportState,
};

const TIMER_TICK: Duration = Duration::from_secs(1);

/// Format a session duration the way the timer displays it.
pub fn format_elapsed(secs: u64) -> String {
    format!("{}m {}s", secs / 60, secs % 60)
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub speaking_threshold: f32,
    pub fft_size: usize,
    pub frame_interval: Duration,
    pub visualizer_width: u32,
    pub visualizer_height: u32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            speaking_threshold: crate::audio::DEFAULT_SPEAKING_THRESHOLD,
            fft_size: crate::audio::context::DEFAULT_FFT_SIZE,
            frame_interval: Duration::from_millis(16),
            visualizer_width: 80,
            visualizer_height: 40,
        }
    }
}

impl SessionOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            speaking_threshold: config.audio.speaking_threshold,
            fft_size: config.audio.fft_size,
            frame_interval: Duration::from_millis(config.audio.frame_interval_ms),
            visualizer_width: config.audio.visualizer_width,
            visualizer_height: config.audio.visualizer_height,
        }
    }
}

/// Snapshot of everything a UI shows for the session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub connection_status: TransportState,
    pub metrics: Option<MetricsSnapshot>,
    pub timer: String,
    pub is_ready: bool,
    pub bot_is_talking: bool,
    pub user_is_speaking: bool,
    pub mic_enabled: bool,
    pub selected_device: Option<InputDevice>,
    pub available_devices: Vec<InputDevice>,
    pub last_transcript: Option<Transcript>,
    pub language: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Status { status: TransportState },
    Ready,
    BotTalking { talking: bool },
    UserSpeaking { speaking: bool },
    Transcript { transcript: Transcript },
    Metrics { metrics: MetricsSnapshot },
    MicEnabled { enabled: bool },
    DeviceSelected { device: Option<InputDevice> },
    DevicesUpdated { devices: Vec<InputDevice> },
    Timer { elapsed: String },
    Error { kind: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEventKind {
    Status,
    Ready,
    BotTalking,
    UserSpeaking,
    Transcript,
    Metrics,
    MicEnabled,
    DeviceSelected,
    DevicesUpdated,
    Timer,
    Error,
}

impl SessionEventKind {
    pub const ALL: [SessionEventKind; 11] = [
        SessionEventKind::Status,
        SessionEventKind::Ready,
        SessionEventKind::BotTalking,
        SessionEventKind::UserSpeaking,
        SessionEventKind::Transcript,
        SessionEventKind::Metrics,
        SessionEventKind::MicEnabled,
        SessionEventKind::DeviceSelected,
        SessionEventKind::DevicesUpdated,
        SessionEventKind::Timer,
        SessionEventKind::Error,
    ];
}

impl BusEvent for SessionEvent {
    type Kind = SessionEventKind;

    fn kind(&self) -> SessionEventKind {
        match self {
            SessionEvent::Status { .. } => SessionEventKind::Status,
            SessionEvent::Ready => SessionEventKind::Ready,
            SessionEvent::BotTalking { .. } => SessionEventKind::BotTalking,
            SessionEvent::UserSpeaking { .. } => SessionEventKind::UserSpeaking,
            SessionEvent::Transcript { .. } => SessionEventKind::Transcript,
            SessionEvent::Metrics { .. } => SessionEventKind::Metrics,
            SessionEvent::MicEnabled { .. } => SessionEventKind::MicEnabled,
            SessionEvent::DeviceSelected { .. } => SessionEventKind::DeviceSelected,
            SessionEvent::DevicesUpdated { .. } => SessionEventKind::DevicesUpdated,
            SessionEvent::Timer { .. } => SessionEventKind::Timer,
            SessionEvent::Error { .. } => SessionEventKind::Error,
        }
    }
}

struct ViewState {
    status: TransportState,
    metrics: Option<MetricsSnapshot>,
    connected_at: Option<Instant>,
    is_ready: bool,
    bot_is_talking: bool,
    user_is_speaking: bool,
    mic_enabled: bool,
    last_transcript: Option<Transcript>,
    language: Option<String>,
}

impl Default for ViewState {
    fn default() -> Self {
        Self {
            status: TransportState::Disconnected,
            metrics: None,
            connected_at: None,
            is_ready: false,
            bot_is_talking: false,
            user_is_speaking: false,
            mic_enabled: true,
            last_transcript: None,
            language: None,
        }
    }
}

impl ViewState {
    fn timer(&self) -> String {
        let secs = self.connected_at.map(|t| t.elapsed().as_secs()).unwrap_or(0);
        format_elapsed(secs)
    }
}

pub struct VoiceSession {
    transport: Arc<Transport>,
    protocol: Arc<ProtocolClient>,
    context: Arc<AudioContext>,
    detector: ActivityDetector,
    local_visualizer: AmplitudeVisualizer,
    bot_visualizer: AmplitudeVisualizer,
    view: Mutex<ViewState>,
    bus: EventBus<SessionEvent>,
    visibility: watch::Sender<bool>,
    loops_running: AtomicBool,
    frame_interval: Mutex<Duration>,
    timer: Mutex<Option<FrameTask>>,
    options: SessionOptions,
    subscriptions: Mutex<Vec<ListenerId>>,
    self_ref: Weak<VoiceSession>,
}

impl VoiceSession {
    /// Wire a session around an existing transport.
    pub fn new(transport: Arc<Transport>, context: Arc<AudioContext>, options: SessionOptions) -> Arc<Self> {
        let protocol = ProtocolClient::attach(transport.clone());
        let (visibility, _) = watch::channel(true);

        let session = Arc::new_cyclic(|weak: &Weak<VoiceSession>| {
            let detector_ref = weak.clone();
            let detector = ActivityDetector::new(
                context.clone(),
                options.speaking_threshold,
                options.fft_size,
                move |speaking| {
                    if let Some(session) = detector_ref.upgrade() {
                        session.on_user_speaking(speaking);
                    }
                },
            );
            Self {
                transport: transport.clone(),
                protocol: protocol.clone(),
                context: context.clone(),
                detector,
                local_visualizer: AmplitudeVisualizer::new(
                    context.clone(),
                    options.fft_size,
                    options.visualizer_width,
                    options.visualizer_height,
                ),
                bot_visualizer: AmplitudeVisualizer::new(
                    context.clone(),
                    options.fft_size,
                    options.visualizer_width,
                    options.visualizer_height,
                ),
                view: Mutex::new(ViewState::default()),
                bus: EventBus::new(),
                visibility,
                loops_running: AtomicBool::new(false),
                frame_interval: Mutex::new(options.frame_interval),
                timer: Mutex::new(None),
                options: options.clone(),
                subscriptions: Mutex::new(Vec::new()),
                self_ref: weak.clone(),
            }
        });

        session.subscribe_transport();
        session.subscribe_protocol();
        session
    }

    /// Build the transport from its collaborators and wire a session on the
    /// process-wide audio context.
    pub fn from_config(
        config: &AppConfig,
        devices: Arc<dyn MediaDevices>,
        factory: Arc<dyn PeerConnectionFactory>,
        negotiator: Arc<dyn SessionNegotiator>,
    ) -> Arc<Self> {
        let transport = Transport::new(devices, factory, negotiator, TransportOptions::from_config(config));
        Self::new(transport, AudioContext::shared(), SessionOptions::from_config(config))
    }

    fn subscribe_transport(&self) {
        let mut ids = Vec::new();
        for kind in [
            TransportEventKind::StateChange,
            TransportEventKind::Track,
            TransportEventKind::BotStartedSpeaking,
            TransportEventKind::BotStoppedSpeaking,
            TransportEventKind::BotReady,
            TransportEventKind::Error,
            TransportEventKind::AvailableMicsUpdated,
            TransportEventKind::MicUpdated,
            TransportEventKind::LocalTrackChanged,
        ] {
            let weak = self.self_ref.clone();
            ids.push(self.transport.on(kind, move |event| {
                if let Some(session) = weak.upgrade() {
                    session.on_transport_event(event);
                }
            }));
        }
        self.subscriptions.lock().unwrap().extend(ids);
    }

    fn subscribe_protocol(&self) {
        for kind in ProtocolEventKind::ALL {
            let weak = self.self_ref.clone();
            self.protocol.on(kind, move |event| {
                if let Some(session) = weak.upgrade() {
                    session.on_protocol_event(event);
                }
            });
        }
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn protocol(&self) -> &Arc<ProtocolClient> {
        &self.protocol
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn on<F>(&self, kind: SessionEventKind, callback: F) -> ListenerId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.bus.on(kind, callback)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.bus.off(id)
    }

    /// Subscribe `callback` to every session event. Returns one id per kind.
    pub fn on_any<F>(&self, callback: F) -> Vec<ListenerId>
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        let callback = Arc::new(callback);
        SessionEventKind::ALL
            .iter()
            .map(|kind| {
                let callback = callback.clone();
                self.bus.on(*kind, move |event| callback(event))
            })
            .collect()
    }

    pub fn local_waveform(&self) -> watch::Receiver<WaveformFrame> {
        self.local_visualizer.frames()
    }

    pub fn bot_waveform(&self) -> watch::Receiver<WaveformFrame> {
        self.bot_visualizer.frames()
    }

    /// Pause or resume the frame loops, as when a window is hidden.
    pub fn set_visible(&self, visible: bool) {
        self.visibility.send_replace(visible);
    }

    pub fn is_visible(&self) -> bool {
        *self.visibility.borrow()
    }

    pub fn set_speaking_threshold(&self, threshold: f32) {
        self.detector.set_threshold(threshold);
    }

    /// Change the analysis cadence. Running loops are restarted at the new rate.
    pub fn set_frame_interval(&self, interval: Duration) {
        *self.frame_interval.lock().unwrap() = interval;
        if self.loops_running.load(Ordering::SeqCst) {
            self.spawn_loops(interval);
        }
    }

    pub fn frame_interval(&self) -> Duration {
        *self.frame_interval.lock().unwrap()
    }

    pub fn snapshot(&self) -> SessionView {
        let view = self.view.lock().unwrap();
        SessionView {
            connection_status: view.status,
            metrics: view.metrics.clone(),
            timer: view.timer(),
            is_ready: view.is_ready,
            bot_is_talking: view.bot_is_talking,
            user_is_speaking: view.user_is_speaking,
            mic_enabled: view.mic_enabled,
            selected_device: self.transport.selected_device(),
            available_devices: self.transport.devices(),
            last_transcript: view.last_transcript.clone(),
            language: view.language.clone(),
        }
    }

    /// Create the peer connection, pick a microphone and start the analysis
    /// loops.
    pub async fn start(&self) -> SessionResult<()> {
        self.transport.start().await?;
        self.start_loops();
        Ok(())
    }

    pub async fn connect(&self, language: Option<String>) -> SessionResult<()> {
        if self.context.resume() {
            debug!(context = %self.context.id(), "Audio context resumed");
        }
        self.view.lock().unwrap().language = language.clone();
        self.start_loops();
        self.transport.connect(ConnectParams { language }).await
    }

    pub async fn end_session(&self) -> SessionResult<()> {
        self.transport.disconnect().await
    }

    pub fn set_mic_enabled(&self, enabled: bool) -> bool {
        self.view.lock().unwrap().mic_enabled = enabled;
        let applied = self.transport.enable_mic(enabled);
        info!(enabled, applied, "Microphone toggled");
        self.bus.emit(&SessionEvent::MicEnabled { enabled });
        applied
    }

    /// Flip the microphone. Returns the new state.
    pub fn toggle_mic(&self) -> bool {
        let enabled = !self.view.lock().unwrap().mic_enabled;
        self.set_mic_enabled(enabled);
        enabled
    }

    pub async fn select_device(&self, device_id: Option<&str>) -> SessionResult<()> {
        self.transport.update_mic(device_id).await?;
        let enabled = self.view.lock().unwrap().mic_enabled;
        if !enabled {
            self.transport.enable_mic(false);
        }
        Ok(())
    }

    pub async fn refresh_devices(&self) -> SessionResult<Vec<InputDevice>> {
        self.transport.refresh_devices().await
    }

    /// Disconnect, stop every loop and release the audio context.
    pub async fn shutdown(&self) -> SessionResult<()> {
        let result = self.transport.disconnect().await;
        self.stop_loops();
        self.stop_timer();
        self.protocol.detach();
        for id in self.subscriptions.lock().unwrap().drain(..) {
            self.transport.off(id);
        }
        AudioContext::release(&self.context);
        info!("Voice session shut down");
        result
    }

    fn start_loops(&self) {
        if self.loops_running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.spawn_loops(self.frame_interval());
    }

    fn spawn_loops(&self, interval: Duration) {
        self.detector.start(interval, Some(self.visibility.subscribe()));
        self.local_visualizer.start(interval, Some(self.visibility.subscribe()));
        self.bot_visualizer.start(interval, Some(self.visibility.subscribe()));
        debug!(interval_ms = interval.as_millis() as u64, "Analysis loops started");
    }

    fn stop_loops(&self) {
        if !self.loops_running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.detector.stop();
        self.local_visualizer.stop();
        self.bot_visualizer.stop();
        debug!("Analysis loops stopped");
    }

    fn start_timer(&self) {
        let weak = self.self_ref.clone();
        let task = FrameTask::spawn(TIMER_TICK, None, move || {
            if let Some(session) = weak.upgrade() {
                let elapsed = session.view.lock().unwrap().timer();
                session.bus.emit(&SessionEvent::Timer { elapsed });
            }
        });
        let previous = self.timer.lock().unwrap().replace(task);
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    fn stop_timer(&self) {
        let task = self.timer.lock().unwrap().take();
        if let Some(task) = task {
            task.cancel();
        }
    }

    fn set_bot_talking(&self, talking: bool) {
        let changed = {
            let mut view = self.view.lock().unwrap();
            let changed = view.bot_is_talking != talking;
            view.bot_is_talking = talking;
            changed
        };
        if changed {
            self.bus.emit(&SessionEvent::BotTalking { talking });
        }
    }

    fn on_user_speaking(&self, speaking: bool) {
        self.view.lock().unwrap().user_is_speaking = speaking;
        debug!(speaking, "User speaking changed");
        self.bus.emit(&SessionEvent::UserSpeaking { speaking });
    }

    fn on_transport_event(&self, event: &TransportEvent) {
        match event {
            TransportEvent::StateChange(state) => self.on_state_change(*state),
            TransportEvent::Track(track) => {
                self.bot_visualizer.attach(Some(track.clone()));
            }
            TransportEvent::BotStartedSpeaking => self.set_bot_talking(true),
            TransportEvent::BotStoppedSpeaking => self.set_bot_talking(false),
            TransportEvent::BotReady => {
                self.view.lock().unwrap().is_ready = true;
                self.bus.emit(&SessionEvent::Ready);
            }
            TransportEvent::Error(e) => {
                self.bus.emit(&SessionEvent::Error {
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                });
            }
            TransportEvent::AvailableMicsUpdated(devices) => {
                self.bus.emit(&SessionEvent::DevicesUpdated {
                    devices: devices.clone(),
                });
            }
            TransportEvent::MicUpdated(device) => {
                self.bus.emit(&SessionEvent::DeviceSelected {
                    device: device.clone(),
                });
            }
            TransportEvent::LocalTrackChanged(track) => {
                self.detector.attach(track.clone());
                self.local_visualizer.attach(track.clone());
            }
            TransportEvent::IceCandidate(_) | TransportEvent::ControlFrame(_) => {}
        }
    }

    fn on_state_change(&self, state: TransportState) {
        let bot_was_talking = {
            let mut view = self.view.lock().unwrap();
            view.status = state;
            match state {
                TransportState::Connected => {
                    view.connected_at = Some(Instant::now());
                    false
                }
                TransportState::Disconnected => {
                    view.connected_at = None;
                    view.is_ready = false;
                    std::mem::replace(&mut view.bot_is_talking, false)
                }
                _ => false,
            }
        };
        self.bus.emit(&SessionEvent::Status { status: state });

        match state {
            TransportState::Connected => self.start_timer(),
            TransportState::Disconnected => {
                self.stop_timer();
                self.bot_visualizer.attach(None);
                self.stop_loops();
                if bot_was_talking {
                    self.bus.emit(&SessionEvent::BotTalking { talking: false });
                }
                self.bus.emit(&SessionEvent::Timer {
                    elapsed: format_elapsed(0),
                });
            }
            _ => {}
        }
    }

    fn on_protocol_event(&self, event: &ProtocolEvent) {
        match event {
            ProtocolEvent::Metrics(metrics) => {
                self.view.lock().unwrap().metrics = Some(metrics.clone());
                self.bus.emit(&SessionEvent::Metrics {
                    metrics: metrics.clone(),
                });
            }
            ProtocolEvent::UserTranscript(transcript) => {
                info!(text = %transcript.text, "User transcript");
                self.view.lock().unwrap().last_transcript = Some(transcript.clone());
                self.bus.emit(&SessionEvent::Transcript {
                    transcript: transcript.clone(),
                });
            }
            ProtocolEvent::BotStartedSpeaking => {
                self.set_bot_talking(true);
                if self.transport.is_control_channel_open() {
                    let protocol = self.protocol.clone();
                    tokio::spawn(async move {
                        protocol.send_test().await;
                    });
                }
            }
            ProtocolEvent::BotStoppedSpeaking => self.set_bot_talking(false),
            other => debug!(event = ?other.kind(), "Protocol event"),
        }
    }
}
