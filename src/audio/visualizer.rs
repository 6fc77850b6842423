//! # Amplitude Visualizer
//!
//! Converts an analyser's frequency bytes into bar geometry once per frame and
//! publishes the result on a `watch` channel, so any presentation layer can
//! draw the latest frame without polling the audio graph itself.
//!
//! Layout for `n` bins on a `width × height` surface:
//! - bar width `(width / n) * 1.5`
//! - bar height `value / 255 * height`, drawn from the bottom edge
//! - one pixel gap between bars; bars that start past the right edge are dropped

use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

use super::context::{AnalyserNode, AudioContext, MediaStreamSource};
use super::frame_loop::FrameTask;
use crate::platform::MediaTrack;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Bar {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WaveformFrame {
    pub width: u32,
    pub height: u32,
    pub bars: Vec<Bar>,
}

impl WaveformFrame {
    pub fn blank(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            bars: Vec::new(),
        }
    }

    /// Tallest bar height in pixels.
    pub fn peak(&self) -> f32 {
        self.bars.iter().map(|b| b.height).fold(0.0, f32::max)
    }
}

pub fn layout_bars(data: &[u8], width: u32, height: u32) -> Vec<Bar> {
    if data.is_empty() {
        return Vec::new();
    }
    let width_f = width as f32;
    let height_f = height as f32;
    let bar_width = (width_f / data.len() as f32) * 1.5;

    let mut bars = Vec::new();
    let mut x = 0.0f32;
    for &value in data {
        if x >= width_f {
            break;
        }
        let bar_height = value as f32 / 255.0 * height_f;
        bars.push(Bar {
            x,
            y: height_f - bar_height,
            width: bar_width,
            height: bar_height,
        });
        x += bar_width + 1.0;
    }
    bars
}

struct VisualizerState {
    analyser: AnalyserNode,
    source: Option<MediaStreamSource>,
    scratch: Vec<u8>,
}

struct VisualizerShared {
    context: Arc<AudioContext>,
    width: u32,
    height: u32,
    state: Mutex<VisualizerState>,
    frames: watch::Sender<WaveformFrame>,
}

impl VisualizerShared {
    fn render(&self) -> WaveformFrame {
        let mut state = self.state.lock().unwrap();
        if state.source.is_none() || !self.context.is_running() {
            return WaveformFrame::blank(self.width, self.height);
        }
        let state = &mut *state;
        state.analyser.byte_frequency_data(&mut state.scratch);
        WaveformFrame {
            width: self.width,
            height: self.height,
            bars: layout_bars(&state.scratch, self.width, self.height),
        }
    }

    fn publish(&self) {
        let frame = self.render();
        self.frames.send_replace(frame);
    }
}

/// Per-track frequency bar renderer.
pub struct AmplitudeVisualizer {
    shared: Arc<VisualizerShared>,
    task: Mutex<Option<FrameTask>>,
}

impl AmplitudeVisualizer {
    pub fn new(context: Arc<AudioContext>, fft_size: usize, width: u32, height: u32) -> Self {
        let analyser = context.create_analyser(fft_size);
        let scratch = vec![0u8; analyser.frequency_bin_count()];
        let (frames, _) = watch::channel(WaveformFrame::blank(width, height));
        Self {
            shared: Arc::new(VisualizerShared {
                context,
                width,
                height,
                state: Mutex::new(VisualizerState {
                    analyser,
                    source: None,
                    scratch,
                }),
                frames,
            }),
            task: Mutex::new(None),
        }
    }

    /// Feed from `track`, replacing any previous source.
    pub fn attach(&self, track: Option<Arc<dyn MediaTrack>>) {
        let mut state = self.shared.state.lock().unwrap();
        let state = &mut *state;
        let current = state.source.as_ref().map(|s| s.track_id());
        if current == track.as_ref().map(|t| t.id()) {
            return;
        }
        if let Some(old) = state.source.take() {
            old.disconnect(&mut state.analyser);
        }
        if let Some(track) = track {
            debug!(track_id = %track.id(), "Visualizer attached");
            let source = self.shared.context.create_media_stream_source(track);
            source.connect(&mut state.analyser);
            state.source = Some(source);
        }
    }

    pub fn render(&self) -> WaveformFrame {
        self.shared.render()
    }

    pub fn frames(&self) -> watch::Receiver<WaveformFrame> {
        self.shared.frames.subscribe()
    }

    pub fn latest(&self) -> WaveformFrame {
        self.shared.frames.borrow().clone()
    }

    pub fn start(&self, interval: Duration, visibility: Option<watch::Receiver<bool>>) {
        let shared = self.shared.clone();
        let task = FrameTask::spawn(interval, visibility, move || shared.publish());
        if let Some(previous) = self.task.lock().unwrap().replace(task) {
            previous.cancel();
        }
    }

    /// Cancel the loop, drop the source and publish a blank frame.
    pub fn stop(&self) {
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            task.cancel();
        }
        self.attach(None);
        self.shared
            .frames
            .send_replace(WaveformFrame::blank(self.shared.width, self.shared.height));
    }

    pub fn is_attached(&self) -> bool {
        self.shared.state.lock().unwrap().source.is_some()
    }
}

impl Drop for AmplitudeVisualizer {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::testing::FakeTrack;

    #[test]
    fn test_bar_geometry() {
        let bars = layout_bars(&[255, 0, 51], 80, 40);
        let w = (80.0 / 3.0) * 1.5;
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0], Bar { x: 0.0, y: 0.0, width: w, height: 40.0 });
        assert_eq!(bars[1].x, w + 1.0);
        assert_eq!(bars[1].height, 0.0);
        assert_eq!(bars[1].y, 40.0);
    }

    #[test]
    fn test_bars_clip_at_right_edge() {
        let data = vec![128u8; 128];
        let bars = layout_bars(&data, 80, 40);
        // 0.9375 px bars + 1 px gap: 42 start inside an 80 px surface.
        assert_eq!(bars.len(), 42);
        assert!(bars.iter().all(|b| b.x < 80.0));
    }

    #[test]
    fn test_detached_renders_blank() {
        let ctx = AudioContext::new();
        ctx.resume();
        let viz = AmplitudeVisualizer::new(ctx, 256, 80, 30);
        let frame = viz.render();
        assert!(frame.bars.is_empty());
        assert_eq!(frame.height, 30);
    }

    #[test]
    fn test_loud_tone_raises_bars() {
        let ctx = AudioContext::new();
        ctx.resume();
        let viz = AmplitudeVisualizer::new(ctx, 256, 80, 40);
        let track = FakeTrack::audio("bot", None);
        viz.attach(Some(track.clone()));
        assert!(viz.is_attached());

        let tone: Vec<f32> = (0..256)
            .map(|i| 0.5 * (2.0 * std::f32::consts::PI * 4.0 * i as f32 / 256.0).sin())
            .collect();
        track.push(&tone);
        let frame = viz.render();
        assert_eq!(frame.bars.len(), 42);
        assert!(frame.peak() > 0.0);

        viz.attach(None);
        assert!(viz.render().bars.is_empty());
    }

    #[tokio::test]
    async fn test_published_frames_follow_loop() {
        let ctx = AudioContext::new();
        ctx.resume();
        let viz = AmplitudeVisualizer::new(ctx, 256, 80, 40);
        let track = FakeTrack::audio("bot", None);
        viz.attach(Some(track.clone()));
        let mut frames = viz.frames();
        viz.start(Duration::from_millis(5), None);

        frames.changed().await.unwrap();
        assert_eq!(frames.borrow().bars.len(), 42);

        viz.stop();
        assert!(viz.latest().bars.is_empty());
        assert!(!viz.is_attached());
    }
}
