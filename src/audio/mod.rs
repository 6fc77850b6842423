//! # Audio Activity Pipeline
//!
//! Turns live sample streams into the two UI signals the session exposes:
//! a debounced speaking flag and per-frame amplitude bars.
//!
//! ## Key Components:
//! - **Audio Context**: process-wide graph root with running/suspended/closed
//!   state; hands out analysers and track sources
//! - **Frame Loop**: cancellable fixed-cadence task that pauses while hidden
//! - **Activity Detector**: RMS of time-domain bytes against a threshold
//! - **Amplitude Visualizer**: frequency bytes laid out as bar geometry
//!
//! ## Signal Format:
//! Tracks deliver mono `f32` chunks in `[-1.0, 1.0]`. Analysers expose the
//! usual byte views: time-domain bytes centred on 128, frequency bytes scaled
//! from decibels into `0..=255`.

pub mod context;
pub mod detector;
pub mod frame_loop;
pub mod visualizer;

pub use context::{AnalyserNode, AudioContext, ContextState, MediaStreamSource};
pub use detector::{rms, ActivityClassifier, ActivityDetector, DEFAULT_SPEAKING_THRESHOLD};
pub use frame_loop::FrameTask;
pub use visualizer::{layout_bars, AmplitudeVisualizer, Bar, WaveformFrame};
