//! In-memory doubles for the platform traits, with call recording.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

use super::*;
use crate::signaling::{NegotiationRequest, SessionNegotiator};

#[derive(Debug)]
pub struct FakeTrack {
    id: String,
    kind: TrackKind,
    device_id: Option<String>,
    enabled: AtomicBool,
    live: AtomicBool,
    tx: broadcast::Sender<PcmChunk>,
}

impl FakeTrack {
    pub fn audio(id: &str, device_id: Option<&str>) -> Arc<Self> {
        Self::build(id, TrackKind::Audio, device_id)
    }

    pub fn video(id: &str) -> Arc<Self> {
        Self::build(id, TrackKind::Video, None)
    }

    fn build(id: &str, kind: TrackKind, device_id: Option<&str>) -> Arc<Self> {
        let (tx, _) = broadcast::channel(PCM_TAP_CAPACITY);
        Arc::new(Self {
            id: id.to_string(),
            kind,
            device_id: device_id.map(str::to_string),
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
            tx,
        })
    }

    pub fn push(&self, samples: &[f32]) {
        let _ = self.tx.send(Arc::from(samples));
    }
}

impl MediaTrack for FakeTrack {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn device_id(&self) -> Option<String> {
        self.device_id.clone()
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

#[derive(Default)]
pub struct FakeDevices {
    pub devices: Mutex<Vec<InputDevice>>,
    pub fail_enumerate: AtomicBool,
    pub fail_acquire: AtomicBool,
    pub acquired: Mutex<Vec<Arc<FakeTrack>>>,
    counter: AtomicUsize,
}

impl FakeDevices {
    pub fn with_devices(ids: &[&str]) -> Arc<Self> {
        let devices = ids
            .iter()
            .map(|id| InputDevice {
                id: id.to_string(),
                label: format!("Mic {}", id),
            })
            .collect();
        Arc::new(Self {
            devices: Mutex::new(devices),
            ..Default::default()
        })
    }

    pub fn last_track(&self) -> Option<Arc<FakeTrack>> {
        self.acquired.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn enumerate_input_devices(&self) -> SessionResult<Vec<InputDevice>> {
        if self.fail_enumerate.load(Ordering::SeqCst) {
            return Err(SessionError::DeviceAcquisition("enumeration denied".into()));
        }
        Ok(self.devices.lock().unwrap().clone())
    }

    async fn acquire_audio_track(&self, device_id: Option<&str>) -> SessionResult<Arc<dyn MediaTrack>> {
        if self.fail_acquire.load(Ordering::SeqCst) {
            return Err(SessionError::DeviceAcquisition("permission denied".into()));
        }
        let devices = self.devices.lock().unwrap();
        let device = match device_id {
            Some(id) => devices.iter().find(|d| d.id == id),
            None => devices.first(),
        };
        let Some(device) = device else {
            return Err(SessionError::DeviceAcquisition("no such device".into()));
        };
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let track = FakeTrack::audio(&format!("local-{}", n), Some(&device.id));
        self.acquired.lock().unwrap().push(track.clone());
        Ok(track)
    }
}

#[derive(Debug)]
pub struct FakeChannel {
    label: String,
    pub open: AtomicBool,
    pub sent: Mutex<Vec<String>>,
}

impl FakeChannel {
    pub fn new(label: &str, open: bool) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            open: AtomicBool::new(open),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl DataChannel for FakeChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send_text(&self, text: String) -> SessionResult<()> {
        if !self.is_open() {
            return Err(SessionError::ChannelNotOpen(self.label.clone()));
        }
        self.sent.lock().unwrap().push(text);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakePeer {
    pub calls: Mutex<Vec<String>>,
    pub channels: Mutex<Vec<Arc<FakeChannel>>>,
    pub closed: AtomicBool,
    pub has_sender: AtomicBool,
    pub fail_attach: AtomicBool,
    pub fail_replace: AtomicBool,
}

impl FakePeer {
    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn add_audio_transceiver(&self, track: Arc<dyn MediaTrack>) -> SessionResult<()> {
        if self.fail_attach.load(Ordering::SeqCst) {
            return Err(SessionError::TrackAttach("transceiver rejected".into()));
        }
        self.record(format!("add_transceiver:{}", track.id()));
        self.has_sender.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn replace_audio_track(&self, track: Arc<dyn MediaTrack>) -> SessionResult<bool> {
        if self.fail_replace.load(Ordering::SeqCst) {
            return Err(SessionError::TrackAttach("replace rejected".into()));
        }
        if !self.has_sender.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.record(format!("replace:{}", track.id()));
        Ok(true)
    }

    async fn create_data_channel(&self, label: &str) -> SessionResult<Arc<dyn DataChannel>> {
        self.record(format!("data_channel:{}", label));
        let channel = FakeChannel::new(label, false);
        self.channels.lock().unwrap().push(channel.clone());
        Ok(channel)
    }

    async fn create_offer(&self) -> SessionResult<SessionDescription> {
        self.record("create_offer");
        Ok(SessionDescription::offer("v=0 fake-offer"))
    }

    async fn set_local_description(&self, description: SessionDescription) -> SessionResult<()> {
        self.record(format!("set_local:{}", description.sdp_type));
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> SessionResult<()> {
        self.record(format!("set_remote:{}", description.sdp_type));
        Ok(())
    }

    async fn close(&self) -> SessionResult<()> {
        self.record("close");
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeFactory {
    pub peers: Mutex<Vec<Arc<FakePeer>>>,
    pub senders: Mutex<Vec<PeerEventSender>>,
    pub fail_attach: AtomicBool,
}

impl FakeFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn last_peer(&self) -> Option<Arc<FakePeer>> {
        self.peers.lock().unwrap().last().cloned()
    }

    pub fn created(&self) -> usize {
        self.peers.lock().unwrap().len()
    }
}

#[async_trait]
impl PeerConnectionFactory for FakeFactory {
    async fn create(&self, events: PeerEventSender) -> SessionResult<Arc<dyn PeerConnection>> {
        let peer = Arc::new(FakePeer::default());
        peer.fail_attach
            .store(self.fail_attach.load(Ordering::SeqCst), Ordering::SeqCst);
        self.peers.lock().unwrap().push(peer.clone());
        self.senders.lock().unwrap().push(events);
        Ok(peer)
    }
}

#[derive(Default)]
pub struct FakeNegotiator {
    pub requests: Mutex<Vec<NegotiationRequest>>,
    pub fail_with_status: Mutex<Option<u16>>,
}

impl FakeNegotiator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(status: u16) -> Arc<Self> {
        Arc::new(Self {
            fail_with_status: Mutex::new(Some(status)),
            ..Default::default()
        })
    }
}

#[async_trait]
impl SessionNegotiator for FakeNegotiator {
    async fn negotiate(&self, request: NegotiationRequest) -> SessionResult<SessionDescription> {
        self.requests.lock().unwrap().push(request);
        if let Some(status) = *self.fail_with_status.lock().unwrap() {
            return Err(SessionError::Negotiation(format!("Server responded with {}", status)));
        }
        Ok(SessionDescription::answer("v=0 fake-answer"))
    }
}
