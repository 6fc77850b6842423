//! # WebRTC Adapter
//!
//! webrtc-rs implementation of the peer connection seams in
//! [`crate::platform`]. Audio is carried as PCMU (G.711 µ-law, 8 kHz):
//! local capture is resampled and packetised in [`pcmu`], remote RTP payloads
//! are decoded back into sample chunks for the analysers.

pub mod pcmu;
pub mod peer;

pub use peer::{WebRtcFactory, WebRtcPeer};

use crate::error::SessionError;

impl From<webrtc::Error> for SessionError {
    fn from(err: webrtc::Error) -> Self {
        SessionError::Peer(err.to_string())
    }
}
