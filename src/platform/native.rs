//! cpal-backed microphone access.
//!
//! Device ids are the names cpal reports. Each acquired track owns a capture
//! thread: the cpal `Stream` is not `Send` on every platform, so it is built,
//! played and dropped on that thread. Samples are mixed down to mono and
//! broadcast as `f32` chunks.

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, StreamConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use super::{InputDevice, MediaDevices, MediaTrack, PcmChunk, PcmTap, TrackKind, PCM_TAP_CAPACITY};
use crate::error::{SessionError, SessionResult};

#[derive(Debug, Default, Clone)]
pub struct CpalDevices;

impl CpalDevices {
    pub fn new() -> Self {
        Self
    }
}

fn find_device(device_id: Option<&str>) -> SessionResult<Device> {
    let host = cpal::default_host();
    match device_id {
        None => host
            .default_input_device()
            .ok_or_else(|| SessionError::DeviceAcquisition("no default input device".to_string())),
        Some(id) => host
            .input_devices()
            .map_err(|e| SessionError::DeviceAcquisition(e.to_string()))?
            .find(|d| d.name().map(|n| n == id).unwrap_or(false))
            .ok_or_else(|| SessionError::DeviceAcquisition(format!("input device '{}' not found", id))),
    }
}

#[async_trait]
impl MediaDevices for CpalDevices {
    async fn enumerate_input_devices(&self) -> SessionResult<Vec<InputDevice>> {
        tokio::task::spawn_blocking(|| {
            let host = cpal::default_host();
            let devices = host
                .input_devices()
                .map_err(|e| SessionError::DeviceAcquisition(e.to_string()))?;
            Ok(devices
                .filter_map(|d| d.name().ok())
                .map(|name| InputDevice {
                    id: name.clone(),
                    label: name,
                })
                .collect())
        })
        .await
        .map_err(|e| SessionError::DeviceAcquisition(e.to_string()))?
    }

    async fn acquire_audio_track(&self, device_id: Option<&str>) -> SessionResult<Arc<dyn MediaTrack>> {
        let device_id = device_id.map(str::to_string);
        let track = tokio::task::spawn_blocking(move || CaptureTrack::open(device_id))
            .await
            .map_err(|e| SessionError::DeviceAcquisition(e.to_string()))??;
        Ok(track)
    }
}

#[derive(Debug)]
struct CaptureTrack {
    id: String,
    device_id: String,
    sample_rate: u32,
    enabled: Arc<AtomicBool>,
    live: Arc<AtomicBool>,
    tx: broadcast::Sender<PcmChunk>,
    // Dropping the sender ends the capture thread.
    stop_tx: Mutex<Option<std_mpsc::Sender<()>>>,
}

impl CaptureTrack {
    fn open(device_id: Option<String>) -> SessionResult<Arc<dyn MediaTrack>> {
        let device = find_device(device_id.as_deref())?;
        let name = device.name().unwrap_or_else(|_| "unknown".to_string());
        let supported = device
            .default_input_config()
            .map_err(|e| SessionError::DeviceAcquisition(e.to_string()))?;
        let format = supported.sample_format();
        let config: StreamConfig = supported.into();
        let sample_rate = config.sample_rate.0;

        let (tx, _) = broadcast::channel(PCM_TAP_CAPACITY);
        let enabled = Arc::new(AtomicBool::new(true));
        let live = Arc::new(AtomicBool::new(true));
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<SessionResult<()>>();

        let thread_tx = tx.clone();
        let thread_enabled = enabled.clone();
        let thread_live = live.clone();
        thread::spawn(move || {
            let stream = match build_stream(&device, &config, format, thread_tx, thread_enabled) {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(SessionError::DeviceAcquisition(e.to_string())));
                return;
            }
            let _ = ready_tx.send(Ok(()));
            // Blocks until the track is stopped or dropped.
            let _ = stop_rx.recv();
            drop(stream);
            thread_live.store(false, Ordering::SeqCst);
        });

        ready_rx
            .recv()
            .map_err(|_| SessionError::DeviceAcquisition("capture thread exited".to_string()))??;

        info!(device = %name, sample_rate, channels = config.channels, "Microphone capture started");
        Ok(Arc::new(CaptureTrack {
            id: Uuid::new_v4().to_string(),
            device_id: name,
            sample_rate,
            enabled,
            live,
            tx,
            stop_tx: Mutex::new(Some(stop_tx)),
        }))
    }
}

fn build_stream(
    device: &Device,
    config: &StreamConfig,
    format: SampleFormat,
    tx: broadcast::Sender<PcmChunk>,
    enabled: Arc<AtomicBool>,
) -> SessionResult<cpal::Stream> {
    let channels = config.channels.max(1) as usize;
    let on_error = |err: cpal::StreamError| warn!(error = %err, "Capture stream error");

    let stream = match format {
        SampleFormat::F32 => device.build_input_stream(
            config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                publish(data, channels, &enabled, &tx, |s| s);
            },
            on_error,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                publish(data, channels, &enabled, &tx, |s| s as f32 / 32_768.0);
            },
            on_error,
            None,
        ),
        SampleFormat::U16 => device.build_input_stream(
            config,
            move |data: &[u16], _: &cpal::InputCallbackInfo| {
                publish(data, channels, &enabled, &tx, |s| (s as f32 - 32_768.0) / 32_768.0);
            },
            on_error,
            None,
        ),
        other => {
            return Err(SessionError::DeviceAcquisition(format!(
                "unsupported sample format {:?}",
                other
            )))
        }
    };
    stream.map_err(|e| SessionError::DeviceAcquisition(e.to_string()))
}

fn publish<T: Copy>(
    data: &[T],
    channels: usize,
    enabled: &AtomicBool,
    tx: &broadcast::Sender<PcmChunk>,
    to_f32: impl Fn(T) -> f32,
) {
    let muted = !enabled.load(Ordering::Relaxed);
    let mono: Vec<f32> = data
        .chunks(channels)
        .map(|frame| {
            if muted {
                0.0
            } else {
                frame.iter().map(|s| to_f32(*s)).sum::<f32>() / frame.len() as f32
            }
        })
        .collect();
    let _ = tx.send(Arc::from(mono));
}

impl MediaTrack for CaptureTrack {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> TrackKind {
        TrackKind::Audio
    }

    fn device_id(&self) -> Option<String> {
        Some(self.device_id.clone())
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
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
        if self.stop_tx.lock().unwrap().take().is_some() {
            self.live.store(false, Ordering::SeqCst);
            info!(track_id = %self.id, device = %self.device_id, "Microphone capture stopped");
        }
    }

    fn subscribe(&self) -> PcmTap {
        self.tx.subscribe()
    }
}

impl Drop for CaptureTrack {
    fn drop(&mut self) {
        self.stop();
    }
}
