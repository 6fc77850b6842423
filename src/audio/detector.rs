//! # Activity Detector
//!
//! Turns a track's audio into a debounced `speaking` flag.
//!
//! Every frame the detector reads the analyser's time-domain bytes, computes
//! their RMS energy and compares it against a threshold. Listeners hear about
//! the flag only when it flips.
//!
//! ```text
//! track ──► MediaStreamSource ──► AnalyserNode ──► rms() ──► ActivityClassifier ──► on_change(bool)
//! ```
//!
//! The sampling path is rebuilt whenever the attached track changes. A
//! removed, disabled or ended track, or a context that is not running, reads
//! as silence.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

use super::context::{AnalyserNode, AudioContext, MediaStreamSource, DEFAULT_FFT_SIZE};
use super::frame_loop::FrameTask;
use crate::platform::MediaTrack;

pub const DEFAULT_SPEAKING_THRESHOLD: f32 = 0.02;

/// RMS of unsigned time-domain bytes, each mapped to `b / 128 - 1`.
pub fn rms(bytes: &[u8]) -> f32 {
    if bytes.is_empty() {
        return 0.0;
    }
    let sum: f32 = bytes
        .iter()
        .map(|&b| {
            let v = b as f32 / 128.0 - 1.0;
            v * v
        })
        .sum();
    (sum / bytes.len() as f32).sqrt()
}

/// Value-debounced threshold comparator.
///
/// Starts out "not speaking"; [`observe`](Self::observe) returns the new
/// value only when it differs from the previous one.
#[derive(Debug, Clone)]
pub struct ActivityClassifier {
    threshold: f32,
    speaking: bool,
}

impl ActivityClassifier {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            speaking: false,
        }
    }

    pub fn observe(&mut self, rms: f32) -> Option<bool> {
        self.set(rms > self.threshold)
    }

    /// Force a value, e.g. `false` when the source disappears.
    pub fn set(&mut self, speaking: bool) -> Option<bool> {
        if speaking == self.speaking {
            return None;
        }
        self.speaking = speaking;
        Some(speaking)
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn set_threshold(&mut self, threshold: f32) {
        self.threshold = threshold;
    }
}

pub type ActivityCallback = Arc<dyn Fn(bool) + Send + Sync>;

struct DetectorState {
    analyser: AnalyserNode,
    source: Option<MediaStreamSource>,
    track: Option<Arc<dyn MediaTrack>>,
    classifier: ActivityClassifier,
    scratch: Vec<u8>,
}

impl DetectorState {
    fn release_source(&mut self) {
        if let Some(source) = self.source.take() {
            source.disconnect(&mut self.analyser);
            debug!(track_id = %source.track_id(), "Activity source released");
        }
    }

    fn ensure_source(&mut self, context: &AudioContext) {
        let Some(track) = self.track.clone() else { return };
        let current = self.source.as_ref().map(|s| s.track_id());
        if current.as_deref() == Some(track.id().as_str()) {
            return;
        }
        self.release_source();
        let source = context.create_media_stream_source(track);
        source.connect(&mut self.analyser);
        debug!(track_id = %source.track_id(), "Activity source connected");
        self.source = Some(source);
    }
}

struct DetectorShared {
    context: Arc<AudioContext>,
    state: Mutex<DetectorState>,
    on_change: ActivityCallback,
}

impl DetectorShared {
    fn sample(&self) -> Option<bool> {
        let mut state = self.state.lock().unwrap();

        if !self.context.is_running() {
            return state.classifier.set(false);
        }

        let usable = state
            .track
            .as_ref()
            .map(|t| t.is_enabled() && t.is_live());
        match usable {
            None => {
                state.release_source();
                state.classifier.set(false)
            }
            Some(false) => {
                state.release_source();
                state.classifier.set(false)
            }
            Some(true) => {
                state.ensure_source(&self.context);
                let state = &mut *state;
                state.analyser.byte_time_domain_data(&mut state.scratch);
                let level = rms(&state.scratch);
                state.classifier.observe(level)
            }
        }
    }

    fn notify(&self, change: Option<bool>) {
        if let Some(speaking) = change {
            debug!(speaking, "Activity changed");
            (self.on_change)(speaking);
        }
    }
}

/// Speech activity detector for one track at a time.
pub struct ActivityDetector {
    shared: Arc<DetectorShared>,
    task: Mutex<Option<FrameTask>>,
}

impl ActivityDetector {
    pub fn new<F>(context: Arc<AudioContext>, threshold: f32, fft_size: usize, on_change: F) -> Self
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let analyser = context.create_analyser(fft_size);
        let scratch = vec![128u8; analyser.fft_size()];
        let state = DetectorState {
            analyser,
            source: None,
            track: None,
            classifier: ActivityClassifier::new(threshold),
            scratch,
        };
        Self {
            shared: Arc::new(DetectorShared {
                context,
                state: Mutex::new(state),
                on_change: Arc::new(on_change),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn with_defaults<F>(context: Arc<AudioContext>, on_change: F) -> Self
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        Self::new(context, DEFAULT_SPEAKING_THRESHOLD, DEFAULT_FFT_SIZE, on_change)
    }

    /// Point the detector at `track`, or at nothing.
    ///
    /// Replacing or removing the track releases the previous source at once;
    /// removal also reports `false` if the detector was reporting speech.
    pub fn attach(&self, track: Option<Arc<dyn MediaTrack>>) {
        let change = {
            let mut state = self.shared.state.lock().unwrap();
            let same = match (&state.track, &track) {
                (Some(old), Some(new)) => old.id() == new.id(),
                (None, None) => true,
                _ => false,
            };
            if same {
                None
            } else {
                state.release_source();
                match &track {
                    Some(t) => info!(track_id = %t.id(), "Activity detector attached"),
                    None => info!("Activity detector detached"),
                }
                let removed = track.is_none();
                state.track = track;
                if removed {
                    state.classifier.set(false)
                } else {
                    None
                }
            }
        };
        self.shared.notify(change);
    }

    /// Run one detection step and notify on a flip. Returns the flip, if any.
    pub fn sample(&self) -> Option<bool> {
        let change = self.shared.sample();
        self.shared.notify(change);
        change
    }

    /// Sample on a frame loop until [`stop`](Self::stop).
    pub fn start(&self, interval: Duration, visibility: Option<watch::Receiver<bool>>) {
        let shared = self.shared.clone();
        let task = FrameTask::spawn(interval, visibility, move || {
            let change = shared.sample();
            shared.notify(change);
        });
        if let Some(previous) = self.task.lock().unwrap().replace(task) {
            previous.cancel();
        }
    }

    /// Cancel the loop, release the source and report silence.
    pub fn stop(&self) {
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            task.cancel();
        }
        let change = {
            let mut state = self.shared.state.lock().unwrap();
            state.release_source();
            state.classifier.set(false)
        };
        self.shared.notify(change);
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|t| !t.is_cancelled())
    }

    pub fn is_speaking(&self) -> bool {
        self.shared.state.lock().unwrap().classifier.is_speaking()
    }

    pub fn set_threshold(&self, threshold: f32) {
        self.shared.state.lock().unwrap().classifier.set_threshold(threshold);
    }

    pub fn has_source(&self) -> bool {
        self.shared.state.lock().unwrap().source.is_some()
    }
}

impl Drop for ActivityDetector {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.cancel();
        }
    }
}
