//! # Error Handling
//!
//! Error types for the voice session client, split along the two ways a
//! failure can surface:
//!
//! - **SessionError**: returned to callers of transport and façade operations
//!   (`connect`, `update_mic`, ...). These are the failures a user can act on.
//! - **ProtocolError**: produced while classifying inbound control frames.
//!   Those are never propagated; the caller logs them and moves on.
//! - **AppError**: the HTTP face of both, converted into JSON responses for
//!   the local control API.
//!
//! ## Key Rust Concepts Used:
//! - **enum with data**: each variant carries the context needed for a log line
//! - **Display + std::error::Error**: lets the errors flow through `?` and `anyhow`
//! - **From conversions**: library errors (reqwest, serde_json, config) become
//!   our variants automatically at the `?` site

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Failures of session-level operations.
///
/// ## Variants:
/// - `DeviceAcquisition`: the capture device could not be opened (permission
///   denied, unplugged, busy). Recoverable during device initialisation.
/// - `NoLocalTrack`: `connect` found no local track and the fallback
///   acquisition failed as well.
/// - `Negotiation`: the offer/answer exchange with the server failed.
/// - `Peer`: the peer connection rejected an operation (offer creation,
///   description, close).
/// - `TrackAttach`: the local track could not be attached to, or swapped into,
///   the outbound audio sender.
/// - `ChannelNotOpen`: an outbound control message was sent while the control
///   channel was closed.
/// - `Config`: invalid runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    DeviceAcquisition(String),
    NoLocalTrack,
    Negotiation(String),
    Peer(String),
    TrackAttach(String),
    ChannelNotOpen(String),
    Config(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::DeviceAcquisition(msg) => write!(f, "Device acquisition failed: {}", msg),
            SessionError::NoLocalTrack => write!(f, "No local audio track available"),
            SessionError::Negotiation(msg) => write!(f, "Session negotiation failed: {}", msg),
            SessionError::Peer(msg) => write!(f, "Peer connection error: {}", msg),
            SessionError::TrackAttach(msg) => write!(f, "Track attach failed: {}", msg),
            SessionError::ChannelNotOpen(label) => write!(f, "Control channel '{}' is not open", label),
            SessionError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for SessionError {}

impl SessionError {
    /// Short machine-readable name, used in event payloads and API errors.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::DeviceAcquisition(_) => "device_acquisition",
            SessionError::NoLocalTrack => "no_local_track",
            SessionError::Negotiation(_) => "negotiation",
            SessionError::Peer(_) => "peer",
            SessionError::TrackAttach(_) => "track_attach",
            SessionError::ChannelNotOpen(_) => "channel_not_open",
            SessionError::Config(_) => "config",
        }
    }
}

/// Transport-level HTTP failures during negotiation (connection refused,
/// timeout, undecodable body).
impl From<reqwest::Error> for SessionError {
    fn from(err: reqwest::Error) -> Self {
        SessionError::Negotiation(err.to_string())
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        SessionError::Negotiation(format!("malformed answer: {}", err))
    }
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Why an inbound control frame was not turned into a typed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Payload is not JSON, or a known kind carried unusable data.
    Malformed(String),
    /// Frame parsed but belongs to another protocol.
    UnexpectedLabel(Option<String>),
    /// Well-formed frame of a kind this client does not handle.
    UnrecognizedKind(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Malformed(msg) => write!(f, "Malformed control frame: {}", msg),
            ProtocolError::UnexpectedLabel(Some(label)) => write!(f, "Unexpected frame label: {}", label),
            ProtocolError::UnexpectedLabel(None) => write!(f, "Control frame has no label"),
            ProtocolError::UnrecognizedKind(kind) => write!(f, "Unrecognized message type: {}", kind),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Errors returned by the local control API.
///
/// ## HTTP Status Code Mapping:
/// - `Internal`/`ConfigError` → 500
/// - `BadRequest`/`ValidationError` → 400
/// - `NotFound` → 404
/// - `Session` → depends on the session failure (see `error_response`)
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    ConfigError(String),
    ValidationError(String),
    Session(SessionError),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::Session(err) => write!(f, "{}", err),
        }
    }
}

/// Every error body has the same shape:
/// ```json
/// { "error": { "type": "negotiation", "message": "...", "timestamp": "..." } }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        use actix_web::http::StatusCode;

        let (status, error_type) = match self {
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            AppError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            AppError::ConfigError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error"),
            AppError::ValidationError(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            AppError::Session(err) => {
                let status = match err {
                    SessionError::Negotiation(_) => StatusCode::BAD_GATEWAY,
                    SessionError::NoLocalTrack | SessionError::DeviceAcquisition(_) => {
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                    SessionError::ChannelNotOpen(_) => StatusCode::CONFLICT,
                    SessionError::Config(_) => StatusCode::BAD_REQUEST,
                    SessionError::Peer(_) | SessionError::TrackAttach(_) => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, err.kind())
            }
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": self.to_string(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        AppError::Session(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
