//! # Session Negotiation
//!
//! Sends the local offer to the voice server and returns its answer.
//!
//! Wire format (JSON over `POST {server_url}/api/offer`):
//! ```json
//! request:  { "sdp": "v=0...", "type": "offer", "language": "en" }
//! response: { "sdp": "v=0...", "type": "answer", "pc_id": "..." }
//! ```
//! Extra response fields are ignored. A non-2xx status, a network failure or
//! a body without a usable answer all map to `SessionError::Negotiation`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::error::{SessionError, SessionResult};
use crate::platform::SessionDescription;

/// Body of the offer request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NegotiationRequest {
    pub sdp: String,
    #[serde(rename = "type")]
    pub sdp_type: String,
    pub language: String,
}

impl NegotiationRequest {
    pub fn new(offer: SessionDescription, language: impl Into<String>) -> Self {
        Self {
            sdp: offer.sdp,
            sdp_type: offer.sdp_type,
            language: language.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AnswerBody {
    sdp: Option<String>,
    #[serde(rename = "type")]
    sdp_type: Option<String>,
    #[serde(default)]
    pc_id: Option<String>,
}

#[async_trait]
pub trait SessionNegotiator: Send + Sync {
    async fn negotiate(&self, request: NegotiationRequest) -> SessionResult<SessionDescription>;
}

#[derive(Debug, Clone)]
struct Target {
    offer_url: String,
    timeout: Duration,
}

/// reqwest-backed negotiator. The target can be changed between sessions.
pub struct HttpNegotiator {
    client: reqwest::Client,
    target: RwLock<Target>,
}

impl HttpNegotiator {
    pub fn new(offer_url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            target: RwLock::new(Target {
                offer_url: offer_url.into(),
                timeout,
            }),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.offer_url(),
            Duration::from_secs(config.signaling.request_timeout_secs),
        )
    }

    pub fn offer_url(&self) -> String {
        self.target.read().unwrap().offer_url.clone()
    }

    /// Point later negotiations at a new endpoint and timeout.
    pub fn retarget(&self, offer_url: impl Into<String>, timeout: Duration) {
        let offer_url = offer_url.into();
        info!(url = %offer_url, timeout_secs = timeout.as_secs(), "Negotiation target updated");
        *self.target.write().unwrap() = Target { offer_url, timeout };
    }

    pub fn retarget_from_config(&self, config: &AppConfig) {
        self.retarget(
            config.offer_url(),
            Duration::from_secs(config.signaling.request_timeout_secs),
        );
    }
}

#[async_trait]
impl SessionNegotiator for HttpNegotiator {
    async fn negotiate(&self, request: NegotiationRequest) -> SessionResult<SessionDescription> {
        let target = self.target.read().unwrap().clone();
        info!(url = %target.offer_url, language = %request.language, "Sending session offer");

        let response = self
            .client
            .post(&target.offer_url)
            .timeout(target.timeout)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, body = %body, "Offer rejected by server");
            return Err(SessionError::Negotiation(format!(
                "Server responded with {}",
                status.as_u16()
            )));
        }

        let bytes = response.bytes().await?;
        parse_answer(&bytes)
    }
}

/// Decode an answer body. The description type must be `answer`.
pub fn parse_answer(body: &[u8]) -> SessionResult<SessionDescription> {
    let answer: AnswerBody = serde_json::from_slice(body)?;

    let sdp = answer
        .sdp
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| SessionError::Negotiation("answer has no sdp".to_string()))?;

    match answer.sdp_type.as_deref() {
        Some("answer") => {}
        other => {
            return Err(SessionError::Negotiation(format!(
                "expected an answer description, got {:?}",
                other
            )))
        }
    }

    if let Some(pc_id) = answer.pc_id {
        debug!(pc_id = %pc_id, "Server assigned peer connection id");
    }

    Ok(SessionDescription::answer(sdp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{web, App, HttpResponse, HttpServer};

    #[test]
    fn test_request_wire_shape() {
        let req = NegotiationRequest::new(SessionDescription::offer("v=0"), "ta");
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json, serde_json::json!({"sdp": "v=0", "type": "offer", "language": "ta"}));
    }

    #[test]
    fn test_parse_answer_ignores_extra_fields() {
        let body = br#"{"sdp": "v=0 answer", "type": "answer", "pc_id": "abc", "extra": 1}"#;
        let answer = parse_answer(body).unwrap();
        assert_eq!(answer, SessionDescription::answer("v=0 answer"));
    }

    #[test]
    fn test_parse_answer_rejects_malformed_bodies() {
        assert!(matches!(parse_answer(b"not json"), Err(SessionError::Negotiation(_))));
        assert!(matches!(
            parse_answer(br#"{"type": "answer"}"#),
            Err(SessionError::Negotiation(_))
        ));
        assert!(matches!(
            parse_answer(br#"{"sdp": "v=0", "type": "offer"}"#),
            Err(SessionError::Negotiation(_))
        ));
    }

    async fn offer_ok(body: web::Json<serde_json::Value>) -> HttpResponse {
        assert_eq!(body["type"], "offer");
        HttpResponse::Ok().json(serde_json::json!({
            "sdp": format!("answer-for-{}", body["language"].as_str().unwrap_or("")),
            "type": "answer",
            "pc_id": "pc-1"
        }))
    }

    async fn offer_unavailable() -> HttpResponse {
        HttpResponse::ServiceUnavailable().body("busy")
    }

    #[actix_web::test]
    async fn test_http_negotiation_round_trip() {
        let server = HttpServer::new(|| {
            App::new()
                .route("/api/offer", web::post().to(offer_ok))
                .route("/down/api/offer", web::post().to(offer_unavailable))
        })
        .workers(1)
        .bind(("127.0.0.1", 0))
        .unwrap();
        let addr = server.addrs()[0];
        let server = server.run();
        let handle = server.handle();
        actix_web::rt::spawn(server);

        let negotiator = HttpNegotiator::new(
            format!("http://{}/api/offer", addr),
            Duration::from_secs(5),
        );
        let answer = negotiator
            .negotiate(NegotiationRequest::new(SessionDescription::offer("v=0"), "en"))
            .await
            .unwrap();
        assert_eq!(answer.sdp, "answer-for-en");

        let failing = HttpNegotiator::new(
            format!("http://{}/down/api/offer", addr),
            Duration::from_secs(5),
        );
        let err = failing
            .negotiate(NegotiationRequest::new(SessionDescription::offer("v=0"), "en"))
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::Negotiation("Server responded with 503".into()));

        failing.retarget(format!("http://{}/api/offer", addr), Duration::from_secs(5));
        assert!(failing
            .negotiate(NegotiationRequest::new(SessionDescription::offer("v=0"), "ta"))
            .await
            .is_ok());

        handle.stop(false).await;
    }
}
