//! # Configuration Management
//!
//! Loads the client configuration from layered sources:
//! - Built-in defaults (the `Default` impl below)
//! - An optional `config.toml` / `config.json` next to the binary
//! - Environment variables with the `APP_` prefix
//!
//! ## Key Rust Concepts Used:
//! - **Serde derive**: the same structs are deserialized from TOML, env and JSON
//! - **Builder pattern**: `config::Config::builder()` stacks the sources
//! - **Result<T, E>**: every loading step can fail and is propagated with `?`
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms)
//! 2. `APP_` variables, sections separated by a double underscore:
//!    `APP_SIGNALING__SERVER_URL=http://10.0.0.5:7860`
//! 3. `config.toml`
//! 4. Defaults

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub signaling: SignalingConfig,
    pub rtc: RtcConfig,
    pub audio: AudioConfig,
}

/// Local control API listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Where and how the session offer is negotiated.
///
/// ## Fields:
/// - `server_url`: base URL of the voice-assistant server
/// - `offer_path`: path appended to `server_url` for the offer POST
/// - `request_timeout_secs`: whole-request timeout for the negotiation call
/// - `default_language`: language sent with the offer when the caller gives none
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    pub server_url: String,
    pub offer_path: String,
    pub request_timeout_secs: u64,
    pub default_language: String,
}

/// Peer connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtcConfig {
    pub ice_servers: Vec<String>,
    /// Label of the data channel carrying the event protocol.
    pub control_channel_label: String,
    /// Open the control channel from the client side before the offer.
    pub create_control_channel: bool,
    /// Hold back bot-ready until the control channel is open, even when the
    /// remote is the side that announces it.
    pub await_control_channel: bool,
}

/// Activity detection and visualisation tuning.
///
/// ## Fields:
/// - `speaking_threshold`: RMS level above which the signal counts as speech
/// - `fft_size`: analyser window; the visualiser gets `fft_size / 2` bins
/// - `frame_interval_ms`: frame loop cadence (16 ms ≈ one display frame)
/// - `visualizer_width` / `visualizer_height`: drawing surface in pixels
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub speaking_threshold: f32,
    pub fft_size: usize,
    pub frame_interval_ms: u64,
    pub visualizer_width: u32,
    pub visualizer_height: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8089,
            },
            signaling: SignalingConfig {
                server_url: "http://localhost:7860".to_string(),
                offer_path: "/api/offer".to_string(),
                request_timeout_secs: 10,
                default_language: "en".to_string(),
            },
            rtc: RtcConfig {
                ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
                control_channel_label: "rtvi-ai".to_string(),
                create_control_channel: true,
                await_control_channel: true,
            },
            audio: AudioConfig {
                speaking_threshold: 0.02,
                fft_size: 256,
                frame_interval_ms: 16,
                visualizer_width: 80,
                visualizer_height: 40,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.*` and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SIGNALING__SERVER_URL=https://bot.example.com`
    /// - `APP_AUDIO__SPEAKING_THRESHOLD=0.05`
    /// - `APP_RTC__ICE_SERVERS=stun:a:3478,stun:b:3478` (comma separated)
    /// - `PORT=9000`
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("rtc.ice_servers")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject values that would break the client at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.signaling.server_url.trim().is_empty() {
            return Err(anyhow::anyhow!("Signaling server URL cannot be empty"));
        }

        if !self.signaling.offer_path.starts_with('/') {
            return Err(anyhow::anyhow!("Offer path must start with '/'"));
        }

        if self.signaling.request_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Request timeout must be greater than 0"));
        }

        if self.rtc.control_channel_label.is_empty() {
            return Err(anyhow::anyhow!("Control channel label cannot be empty"));
        }

        // Same bounds as a browser AnalyserNode.
        let fft = self.audio.fft_size;
        if !(32..=32768).contains(&fft) || !fft.is_power_of_two() {
            return Err(anyhow::anyhow!(
                "FFT size must be a power of two between 32 and 32768, got {}",
                fft
            ));
        }

        if !(self.audio.speaking_threshold > 0.0 && self.audio.speaking_threshold < 1.0) {
            return Err(anyhow::anyhow!("Speaking threshold must be in (0, 1)"));
        }

        if self.audio.frame_interval_ms == 0 {
            return Err(anyhow::anyhow!("Frame interval must be greater than 0"));
        }

        if self.audio.visualizer_width == 0 || self.audio.visualizer_height == 0 {
            return Err(anyhow::anyhow!("Visualizer dimensions must be non-zero"));
        }

        Ok(())
    }

    /// Apply a partial JSON update at runtime.
    ///
    /// Only the fields that are safe to change while the process runs are
    /// honoured: the signaling target, the default language and the detector
    /// tuning. Everything else requires a restart.
    ///
    /// ```json
    /// {"signaling": {"default_language": "ta"}, "audio": {"speaking_threshold": 0.05}}
    /// ```
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial: serde_json::Value = serde_json::from_str(json_str)?;
        let mut updated = self.clone();

        if let Some(signaling) = partial.get("signaling") {
            if let Some(url) = signaling.get("server_url").and_then(|v| v.as_str()) {
                updated.signaling.server_url = url.to_string();
            }
            if let Some(lang) = signaling.get("default_language").and_then(|v| v.as_str()) {
                updated.signaling.default_language = lang.to_string();
            }
            if let Some(timeout) = signaling.get("request_timeout_secs").and_then(|v| v.as_u64()) {
                updated.signaling.request_timeout_secs = timeout;
            }
        }

        if let Some(audio) = partial.get("audio") {
            if let Some(threshold) = audio.get("speaking_threshold").and_then(|v| v.as_f64()) {
                updated.audio.speaking_threshold = threshold as f32;
            }
            if let Some(interval) = audio.get("frame_interval_ms").and_then(|v| v.as_u64()) {
                updated.audio.frame_interval_ms = interval;
            }
        }

        updated.validate()?;
        *self = updated;
        Ok(())
    }

    /// Full URL of the offer endpoint.
    pub fn offer_url(&self) -> String {
        format!(
            "{}{}",
            self.signaling.server_url.trim_end_matches('/'),
            self.signaling.offer_path
        )
    }
}
