//! G.711 µ-law (PCMU) sample conversion and 20 ms packetisation.

use rubato::{FftFixedIn, Resampler};
use tracing::warn;

pub const PCMU_CLOCK_RATE: u32 = 8_000;
/// Samples per 20 ms PCMU frame.
pub const FRAME_SAMPLES: usize = 160;
pub const FRAME_MILLIS: u64 = 20;
/// Encoded digital silence.
pub const SILENCE: u8 = 0xFF;

const BIAS: i32 = 0x84;
const CLIP: i32 = 32_635;

pub fn encode_sample(sample: i16) -> u8 {
    let mut s = sample as i32;
    let sign = if s < 0 {
        s = -s;
        0x80
    } else {
        0
    };
    s = s.min(CLIP) + BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && s & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (s >> (exponent + 3)) & 0x0F;
    !(sign | (exponent << 4) | mantissa) as u8
}

pub fn decode_sample(byte: u8) -> i16 {
    let u = !byte;
    let sign = u & 0x80;
    let exponent = ((u >> 4) & 0x07) as i32;
    let mantissa = (u & 0x0F) as i32;
    let magnitude = (((mantissa << 3) + BIAS) << exponent) - BIAS;
    if sign != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

pub fn encode_f32(sample: f32) -> u8 {
    encode_sample((sample.clamp(-1.0, 1.0) * 32_767.0) as i16)
}

pub fn decode_payload(payload: &[u8]) -> Vec<f32> {
    payload
        .iter()
        .map(|b| decode_sample(*b) as f32 / 32_768.0)
        .collect()
}

/// Resamples mono f32 input to 8 kHz and cuts it into 20 ms PCMU frames.
///
/// Input at another rate goes through a band-limited FFT resampler fed in
/// 20 ms chunks; 8 kHz input is encoded as is. Partial chunks and frames
/// carry over to the next call.
pub struct PcmuPacketizer {
    resampler: Option<FftFixedIn<f32>>,
    input: Vec<f32>,
    pending: Vec<u8>,
}

impl PcmuPacketizer {
    pub fn new(source_rate: u32) -> Self {
        let source_rate = source_rate.max(1);
        let resampler = if source_rate != PCMU_CLOCK_RATE {
            let chunk_size = (source_rate as usize / 50).max(1);
            match FftFixedIn::new(
                source_rate as usize,
                PCMU_CLOCK_RATE as usize,
                chunk_size,
                2,
                1,
            ) {
                Ok(r) => Some(r),
                Err(e) => {
                    warn!(source_rate, "Failed to create resampler: {}, using passthrough", e);
                    None
                }
            }
        } else {
            None
        };

        Self {
            resampler,
            input: Vec::new(),
            pending: Vec::with_capacity(FRAME_SAMPLES),
        }
    }

    /// Feed samples; returns every complete frame. A disabled source is
    /// encoded as silence at the same cadence.
    pub fn push(&mut self, samples: &[f32], enabled: bool) -> Vec<Vec<u8>> {
        let gated = samples.iter().map(|s| if enabled { *s } else { 0.0 });

        let Some(resampler) = self.resampler.as_mut() else {
            let encoded: Vec<u8> = gated.map(encode_f32).collect();
            return self.frame(&encoded);
        };

        self.input.extend(gated);
        let mut encoded = Vec::new();
        loop {
            let needed = resampler.input_frames_next();
            if self.input.len() < needed {
                break;
            }
            let chunk = vec![self.input.drain(..needed).collect::<Vec<f32>>()];
            match resampler.process(&chunk, None) {
                Ok(out) => {
                    if let Some(channel) = out.first() {
                        encoded.extend(channel.iter().map(|s| encode_f32(*s)));
                    }
                }
                Err(e) => warn!("Resample error: {}", e),
            }
        }
        self.frame(&encoded)
    }

    fn frame(&mut self, encoded: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        for byte in encoded {
            self.pending.push(*byte);
            if self.pending.len() == FRAME_SAMPLES {
                frames.push(std::mem::replace(
                    &mut self.pending,
                    Vec::with_capacity(FRAME_SAMPLES),
                ));
            }
        }
        frames
    }
}

impl std::fmt::Debug for PcmuPacketizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PcmuPacketizer")
            .field("resampling", &self.resampler.is_some())
            .field("buffered", &self.input.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}
