//! # Voice Session Client
//!
//! Client side of a real-time voice assistant session: captures the local
//! microphone, negotiates a WebRTC session with the assistant server over
//! HTTP, speaks the assistant's control protocol on a data channel and turns
//! both audio directions into UI signals (speaking flags, waveform bars, a
//! call timer, per-turn metrics and transcripts).
//!
//! ## Layers (bottom to top):
//! - **platform**: traits over media devices, peer connections and data
//!   channels, with in-memory fakes for tests
//! - **rtc** / **signaling**: the `webrtc` and `reqwest` implementations
//! - **transport**: connection state machine and event source
//! - **protocol**: typed control frames on top of the transport
//! - **audio**: activity detection and visualisation loops
//! - **session**: the façade a UI binds to
//! - **handlers** / **websocket** / **health**: the local control API

pub mod audio;
pub mod config;
pub mod error;
pub mod events;
pub mod handlers;
pub mod health;
pub mod middleware;
pub mod platform;
pub mod protocol;
pub mod rtc;
pub mod session;
pub mod signaling;
pub mod state;
pub mod transport;
pub mod websocket;
