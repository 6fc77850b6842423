//! # Application State Management
//!
//! Shared state handed to every control API handler: the configuration, the
//! one voice session this process drives, and request accounting.
//!
//! ## Key Rust Concepts Used:
//!
//! ### Arc<RwLock<T>>
//! - **Arc**: every actix worker holds a clone of `AppState`; the data behind
//!   it is shared, not copied
//! - **RwLock**: many handlers can read the configuration at once, an update
//!   takes the lock exclusively
//!
//! ### Arc<VoiceSession>
//! The session does its own locking internally, so handlers share it through
//! a plain `Arc` and call its `&self` methods concurrently.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::info;

use crate::config::AppConfig;
use crate::session::VoiceSession;
use crate::signaling::HttpNegotiator;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<AppConfig>>,
    pub session: Arc<VoiceSession>,
    /// Present when negotiation goes over HTTP, so config updates can retarget it.
    pub negotiator: Option<Arc<HttpNegotiator>>,
    pub metrics: Arc<RwLock<AppMetrics>>,
    pub start_time: Instant,
    connecting: Arc<AtomicBool>,
}

/// Held for the whole of one connect request. Dropping it lets the next
/// connect through.
#[derive(Debug)]
pub struct ConnectGuard {
    connecting: Arc<AtomicBool>,
}

impl Drop for ConnectGuard {
    fn drop(&mut self) {
        self.connecting.store(false, Ordering::SeqCst);
    }
}

/// Request accounting for the control API.
///
/// ## Fields:
/// - `request_count` / `error_count`: totals since start
/// - `event_streams`: websocket clients currently subscribed to session events
/// - `endpoint_metrics`: per `"METHOD /path"` statistics
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    pub event_streams: u32,
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig, session: Arc<VoiceSession>) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            session,
            negotiator: None,
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
            connecting: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_negotiator(mut self, negotiator: Arc<HttpNegotiator>) -> Self {
        self.negotiator = Some(negotiator);
        self
    }

    /// Copy of the current configuration; the lock is released on return.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    /// Validate and store `new_config`, then push the runtime-tunable parts
    /// into the live session and negotiator.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;

        self.session
            .set_speaking_threshold(new_config.audio.speaking_threshold);
        self.session
            .set_frame_interval(Duration::from_millis(new_config.audio.frame_interval_ms));
        if let Some(negotiator) = &self.negotiator {
            negotiator.retarget_from_config(&new_config);
        }

        *self.config.write().unwrap() = new_config;
        info!("Configuration updated");
        Ok(())
    }

    /// Claim the right to connect. `None` while another connect from the REST
    /// API or an event stream is still in flight.
    pub fn begin_connect(&self) -> Option<ConnectGuard> {
        if self.connecting.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(ConnectGuard {
            connecting: self.connecting.clone(),
        })
    }

    /// Language for a connect request that did not name one.
    pub fn default_language(&self) -> String {
        self.config.read().unwrap().signaling.default_language.clone()
    }

    pub fn increment_request_count(&self) {
        self.metrics.write().unwrap().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics.write().unwrap().error_count += 1;
    }

    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// The first subscriber makes the session visible, resuming its frame loops.
    pub fn stream_opened(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.event_streams += 1;
        if metrics.event_streams == 1 {
            self.session.set_visible(true);
        }
    }

    /// Saturates at zero. The last subscriber leaving hides the session.
    pub fn stream_closed(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.event_streams = metrics.event_streams.saturating_sub(1);
        if metrics.event_streams == 0 {
            self.session.set_visible(false);
        }
    }

    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().unwrap().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of requests that failed, `0.0..=1.0`.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::fake_state;
    use super::*;

    #[tokio::test]
    async fn test_endpoint_metrics() {
        let (state, _) = fake_state(&[]);
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let snapshot = state.get_metrics_snapshot();
        let metric = &snapshot.endpoint_metrics["GET /health"];
        assert_eq!(metric.request_count, 2);
        assert!((metric.average_duration_ms() - 20.0).abs() < f64::EPSILON);
        assert!((metric.error_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_stream_counter_saturates() {
        let (state, _) = fake_state(&[]);
        state.stream_opened();
        state.stream_closed();
        state.stream_closed();
        assert_eq!(state.get_metrics_snapshot().event_streams, 0);
    }

    #[tokio::test]
    async fn test_connect_guard_is_exclusive() {
        let (state, _) = fake_state(&[]);
        let guard = state.begin_connect().unwrap();
        assert!(state.clone().begin_connect().is_none());
        drop(guard);
        assert!(state.begin_connect().is_some());
    }

    #[tokio::test]
    async fn test_visibility_follows_event_streams() {
        let (state, _) = fake_state(&[]);
        state.session.set_visible(false);

        state.stream_opened();
        assert!(state.session.is_visible());
        state.stream_opened();
        state.stream_closed();
        assert!(state.session.is_visible());

        state.stream_closed();
        assert!(!state.session.is_visible());
        assert_eq!(state.get_metrics_snapshot().event_streams, 0);
    }

    #[tokio::test]
    async fn test_update_config_rejects_invalid() {
        let (state, _) = fake_state(&[]);
        let mut config = state.get_config();
        config.audio.fft_size = 100;
        assert!(state.update_config(config).is_err());
        assert_eq!(state.get_config().audio.fft_size, 256);

        let mut config = state.get_config();
        config.signaling.default_language = "ta".into();
        config.audio.frame_interval_ms = 33;
        assert!(state.update_config(config).is_ok());
        assert_eq!(state.default_language(), "ta");
        assert_eq!(state.session.frame_interval(), Duration::from_millis(33));
    }
}
