//! # Audio Context and Analyser Nodes
//!
//! A minimal audio graph: one process-wide [`AudioContext`] that gates
//! processing, [`MediaStreamSource`] nodes that feed a track's samples into an
//! [`AnalyserNode`], and the analyser itself, which exposes the same two
//! readings a browser analyser does:
//!
//! - **time domain**: the last `fft_size` samples mapped to bytes (128 = silence)
//! - **frequency domain**: `fft_size / 2` magnitude bins in dB, mapped to bytes
//!
//! ## Key Rust Concepts Used:
//! - **static Mutex<Option<Arc<T>>>**: a lazily created, explicitly disposed
//!   singleton with no global-state crate
//! - **watch channel**: context state changes observable from other tasks
//! - **VecDeque ring buffer**: fixed-size sliding window of recent samples
//! - **Planned FFT**: each analyser plans one `realfft` forward transform and
//!   reuses it, with its buffers, for every frame

use std::collections::VecDeque;
use std::f32::consts::PI;
use realfft::num_complex::Complex;
use realfft::{RealFftPlanner, RealToComplex};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

use crate::platform::{MediaTrack, PcmTap};

pub const DEFAULT_FFT_SIZE: usize = 256;
pub const DEFAULT_SMOOTHING: f32 = 0.8;
pub const MIN_DECIBELS: f32 = -100.0;
pub const MAX_DECIBELS: f32 = -30.0;

static SHARED_CONTEXT: Mutex<Option<Arc<AudioContext>>> = Mutex::new(None);

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextState {
    Running,
    Suspended,
    Closed,
}

/// Gate for all audio processing in the process.
///
/// Analysers read nothing while the context is not `Running`. Contexts start
/// suspended, as a browser context does before a user gesture, and are
/// resumed on connect.
#[derive(Debug)]
pub struct AudioContext {
    id: Uuid,
    state: watch::Sender<ContextState>,
}

impl AudioContext {
    /// A standalone context, not registered as the shared one.
    pub fn new() -> Arc<Self> {
        let (state, _) = watch::channel(ContextState::Suspended);
        Arc::new(Self {
            id: Uuid::new_v4(),
            state,
        })
    }

    /// The process-wide context, created on first use.
    ///
    /// A closed shared context is replaced by a fresh one.
    pub fn shared() -> Arc<Self> {
        let mut slot = SHARED_CONTEXT.lock().unwrap();
        match slot.as_ref() {
            Some(ctx) if ctx.state() != ContextState::Closed => ctx.clone(),
            _ => {
                let ctx = Self::new();
                info!(context_id = %ctx.id, "Audio context created");
                *slot = Some(ctx.clone());
                ctx
            }
        }
    }

    /// Close and forget the process-wide context, if any.
    pub fn dispose() {
        if let Some(ctx) = SHARED_CONTEXT.lock().unwrap().take() {
            ctx.close();
            info!(context_id = %ctx.id, "Audio context disposed");
        }
    }

    /// Close `ctx`, and forget it if it is the process-wide context.
    pub fn release(ctx: &Arc<AudioContext>) {
        ctx.close();
        let mut slot = SHARED_CONTEXT.lock().unwrap();
        if slot.as_ref().is_some_and(|shared| Arc::ptr_eq(shared, ctx)) {
            *slot = None;
            info!(context_id = %ctx.id, "Audio context disposed");
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> ContextState {
        *self.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ContextState::Running
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ContextState> {
        self.state.subscribe()
    }

    pub fn resume(&self) -> bool {
        self.transition(ContextState::Running)
    }

    pub fn suspend(&self) -> bool {
        self.transition(ContextState::Suspended)
    }

    pub fn close(&self) {
        self.transition(ContextState::Closed);
    }

    // Closed is terminal.
    fn transition(&self, next: ContextState) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if *current == ContextState::Closed || *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            debug!(context_id = %self.id, state = ?next, "Audio context state changed");
        }
        changed
    }

    pub fn create_analyser(&self, fft_size: usize) -> AnalyserNode {
        AnalyserNode::new(fft_size)
    }

    pub fn create_media_stream_source(&self, track: Arc<dyn MediaTrack>) -> MediaStreamSource {
        MediaStreamSource::new(track)
    }
}

/// Windowed sample analyser.
pub struct AnalyserNode {
    fft_size: usize,
    smoothing: f32,
    window: VecDeque<f32>,
    smoothed: Vec<f32>,
    blackman: Vec<f32>,
    fft: Arc<dyn RealToComplex<f32>>,
    fft_input: Vec<f32>,
    fft_output: Vec<Complex<f32>>,
    fft_scratch: Vec<Complex<f32>>,
    input: Option<PcmTap>,
}

impl AnalyserNode {
    /// `fft_size` must be a power of two; other sizes are rounded up.
    pub fn new(fft_size: usize) -> Self {
        let fft_size = fft_size.max(2).next_power_of_two();
        let blackman = (0..fft_size)
            .map(|i| {
                let a = 2.0 * PI * i as f32 / fft_size as f32;
                0.42 - 0.5 * a.cos() + 0.08 * (2.0 * a).cos()
            })
            .collect();
        let fft = RealFftPlanner::<f32>::new().plan_fft_forward(fft_size);

        Self {
            fft_size,
            smoothing: DEFAULT_SMOOTHING,
            window: VecDeque::from(vec![0.0; fft_size]),
            smoothed: vec![0.0; fft_size / 2],
            blackman,
            fft_input: fft.make_input_vec(),
            fft_output: fft.make_output_vec(),
            fft_scratch: fft.make_scratch_vec(),
            fft,
            input: None,
        }
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    pub fn frequency_bin_count(&self) -> usize {
        self.fft_size / 2
    }

    pub fn set_smoothing(&mut self, smoothing: f32) {
        self.smoothing = smoothing.clamp(0.0, 1.0);
    }

    pub fn is_connected(&self) -> bool {
        self.input.is_some()
    }

    /// Append samples directly, bypassing any connected source.
    pub fn push_samples(&mut self, samples: &[f32]) {
        for &s in samples {
            if self.window.len() == self.fft_size {
                self.window.pop_front();
            }
            self.window.push_back(s);
        }
    }

    fn connect_input(&mut self, tap: PcmTap) {
        self.input = Some(tap);
    }

    fn disconnect_input(&mut self) {
        self.input = None;
        self.window.iter_mut().for_each(|s| *s = 0.0);
        self.smoothed.iter_mut().for_each(|m| *m = 0.0);
    }

    // Drain whatever the source produced since the last read.
    fn pull(&mut self) {
        loop {
            let Some(tap) = self.input.as_mut() else { return };
            match tap.try_recv() {
                Ok(chunk) => self.push_samples(&chunk),
                Err(TryRecvError::Lagged(skipped)) => {
                    debug!(skipped, "Analyser lagged behind its source");
                }
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Closed) => {
                    self.input = None;
                    return;
                }
            }
        }
    }

    /// Most recent `fft_size` samples as floats.
    pub fn float_time_domain_data(&mut self, out: &mut [f32]) {
        self.pull();
        for (dst, src) in out.iter_mut().zip(self.window.iter()) {
            *dst = *src;
        }
    }

    /// Most recent samples as bytes: `128 * (1 + s)`, clamped to `0..=255`.
    pub fn byte_time_domain_data(&mut self, out: &mut [u8]) {
        self.pull();
        for (dst, src) in out.iter_mut().zip(self.window.iter()) {
            *dst = (128.0 * (1.0 + src)).floor().clamp(0.0, 255.0) as u8;
        }
    }

    /// Smoothed spectrum, `frequency_bin_count` bytes scaled between
    /// [`MIN_DECIBELS`] and [`MAX_DECIBELS`].
    pub fn byte_frequency_data(&mut self, out: &mut [u8]) {
        self.pull();
        let n = self.fft_size as f32;
        for ((dst, s), w) in self
            .fft_input
            .iter_mut()
            .zip(self.window.iter())
            .zip(self.blackman.iter())
        {
            *dst = s * w;
        }

        if let Err(e) = self.fft.process_with_scratch(
            &mut self.fft_input,
            &mut self.fft_output,
            &mut self.fft_scratch,
        ) {
            debug!(error = %e, "Forward FFT failed");
            return;
        }

        for (smoothed, bin) in self.smoothed.iter_mut().zip(self.fft_output.iter()) {
            let magnitude = bin.norm() / n;
            *smoothed = self.smoothing * *smoothed + (1.0 - self.smoothing) * magnitude;
        }

        let range = MAX_DECIBELS - MIN_DECIBELS;
        for (dst, m) in out.iter_mut().zip(self.smoothed.iter()) {
            let db = if *m > 0.0 { 20.0 * m.log10() } else { f32::NEG_INFINITY };
            let scaled = 255.0 * (db - MIN_DECIBELS) / range;
            *dst = scaled.floor().clamp(0.0, 255.0) as u8;
        }
    }
}

impl std::fmt::Debug for AnalyserNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalyserNode")
            .field("fft_size", &self.fft_size)
            .field("connected", &self.input.is_some())
            .finish()
    }
}

/// Feeds one track's samples into an analyser.
#[derive(Debug)]
pub struct MediaStreamSource {
    track: Arc<dyn MediaTrack>,
}

impl MediaStreamSource {
    pub fn new(track: Arc<dyn MediaTrack>) -> Self {
        Self { track }
    }

    pub fn track_id(&self) -> String {
        self.track.id()
    }

    pub fn track(&self) -> &Arc<dyn MediaTrack> {
        &self.track
    }

    pub fn connect(&self, analyser: &mut AnalyserNode) {
        analyser.connect_input(self.track.subscribe());
    }

    /// Detach from the analyser and clear its buffered state.
    pub fn disconnect(&self, analyser: &mut AnalyserNode) {
        analyser.disconnect_input();
    }
}
