//! # Platform Seams
//!
//! The session logic never talks to a sound card or a WebRTC stack directly.
//! It talks to the traits in this module, and concrete adapters plug in:
//!
//! - [`crate::rtc`]: webrtc-rs implementation of [`PeerConnection`]
//! - [`native`] (feature `native-audio`): cpal implementation of [`MediaDevices`]
//! - [`NullMediaDevices`]: a device layer with no inputs, used when native
//!   capture is not compiled in
//!
//! ## Key Rust Concepts Used:
//! - **async-trait**: object-safe async methods so adapters can live behind `Arc<dyn ...>`
//! - **Trait objects**: the transport holds `Arc<dyn PeerConnection>` and does
//!   not know which implementation it drives
//! - **Channels**: adapters report callbacks as [`PeerEvent`] values over an
//!   unbounded mpsc sender instead of calling back into the transport

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

use crate::error::{SessionError, SessionResult};

#[cfg(feature = "native-audio")]
pub mod native;

#[cfg(test)]
pub mod testing;

/// Mono f32 sample chunks in `[-1.0, 1.0]`, as produced by a track.
pub type PcmChunk = Arc<[f32]>;

/// Subscriber end of a track's sample stream.
pub type PcmTap = broadcast::Receiver<PcmChunk>;

/// Capacity of per-track sample broadcast channels. Slow subscribers lose
/// the oldest chunks rather than stalling capture.
pub const PCM_TAP_CAPACITY: usize = 64;

/// An audio input as reported by enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputDevice {
    pub id: String,
    pub label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// A live media track, local or remote.
///
/// Mirrors the capabilities the session needs from a track: identity, the
/// enabled flag (muting without renegotiation), lifecycle and access to the
/// decoded samples.
pub trait MediaTrack: Send + Sync + Debug {
    fn id(&self) -> String;

    fn kind(&self) -> TrackKind;

    /// Device the track was captured from. `None` for remote tracks.
    fn device_id(&self) -> Option<String> {
        None
    }

    /// Rate of the samples delivered by [`subscribe`](Self::subscribe).
    fn sample_rate(&self) -> u32 {
        48_000
    }

    fn is_enabled(&self) -> bool;

    fn set_enabled(&self, enabled: bool);

    /// False once the track has been stopped or its source ended.
    fn is_live(&self) -> bool;

    /// Release the underlying source. Idempotent.
    fn stop(&self);

    /// Subscribe to the decoded sample stream. Every call yields an
    /// independent receiver.
    fn subscribe(&self) -> PcmTap;
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn enumerate_input_devices(&self) -> SessionResult<Vec<InputDevice>>;

    /// Open a capture track. `None` selects the system default input.
    async fn acquire_audio_track(&self, device_id: Option<&str>) -> SessionResult<Arc<dyn MediaTrack>>;
}

/// Session description exchanged during negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,
    #[serde(rename = "type")]
    pub sdp_type: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            sdp_type: "offer".to_string(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            sdp_type: "answer".to_string(),
        }
    }
}

/// Connection state as reported by the peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// A reliable, ordered message channel negotiated alongside the media.
#[async_trait]
pub trait DataChannel: Send + Sync + Debug {
    fn label(&self) -> String;

    fn is_open(&self) -> bool;

    async fn send_text(&self, text: String) -> SessionResult<()>;
}

/// Callback notifications from a peer connection, delivered in order.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    ConnectionState(PeerState),
    Track(Arc<dyn MediaTrack>),
    TrackEnded { track_id: String },
    /// A channel announced by the remote side.
    DataChannel(Arc<dyn DataChannel>),
    ChannelOpen { label: String },
    ChannelMessage { label: String, text: String },
    ChannelClosed { label: String },
    ChannelError { label: String, error: String },
    /// `None` marks the end of candidate gathering.
    IceCandidate(Option<String>),
}

pub type PeerEventSender = mpsc::UnboundedSender<PeerEvent>;

#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Attach `track` through a send/receive audio transceiver.
    async fn add_audio_transceiver(&self, track: Arc<dyn MediaTrack>) -> SessionResult<()>;

    /// Swap the track feeding the established audio sender without
    /// renegotiating. Returns `Ok(false)` when no audio sender exists yet.
    async fn replace_audio_track(&self, track: Arc<dyn MediaTrack>) -> SessionResult<bool>;

    async fn create_data_channel(&self, label: &str) -> SessionResult<Arc<dyn DataChannel>>;

    async fn create_offer(&self) -> SessionResult<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> SessionResult<()>;

    /// The applied local description, including any gathered candidates.
    async fn local_description(&self) -> Option<SessionDescription> {
        None
    }

    async fn set_remote_description(&self, description: SessionDescription) -> SessionResult<()>;

    async fn close(&self) -> SessionResult<()>;
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    /// Build a new connection that reports its callbacks on `events`.
    async fn create(&self, events: PeerEventSender) -> SessionResult<Arc<dyn PeerConnection>>;
}

/// Device layer with no inputs.
///
/// Enumeration succeeds with an empty list; acquisition always fails. Used by
/// builds without native capture so the rest of the client still runs.
#[derive(Debug, Default, Clone)]
pub struct NullMediaDevices;

#[async_trait]
impl MediaDevices for NullMediaDevices {
    async fn enumerate_input_devices(&self) -> SessionResult<Vec<InputDevice>> {
        Ok(Vec::new())
    }

    async fn acquire_audio_track(&self, device_id: Option<&str>) -> SessionResult<Arc<dyn MediaTrack>> {
        Err(SessionError::DeviceAcquisition(format!(
            "no capture backend available (requested {})",
            device_id.unwrap_or("default")
        )))
    }
}

/// Whether this build can capture from real microphones.
pub const fn has_capture_backend() -> bool {
    cfg!(feature = "native-audio")
}

/// Build the device layer for this build configuration.
pub fn default_media_devices() -> Arc<dyn MediaDevices> {
    #[cfg(feature = "native-audio")]
    {
        Arc::new(native::CpalDevices::new())
    }
    #[cfg(not(feature = "native-audio"))]
    {
        Arc::new(NullMediaDevices)
    }
}
