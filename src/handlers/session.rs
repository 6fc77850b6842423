//! # Session Control REST API Handlers
//!
//! HTTP endpoints that drive the voice session: connecting to the assistant,
//! ending the call, muting and switching microphones.
//!
//! ## Available Endpoints:
//! - `GET /api/v1/session` - Current session view (status, timer, metrics, devices)
//! - `POST /api/v1/session/connect` - Negotiate a session, optional `{"language": "ta"}`
//! - `POST /api/v1/session/disconnect` - End the session and release capture
//! - `POST /api/v1/session/mic` - Enable or mute the microphone
//! - `PUT /api/v1/session/device` - Switch capture device, `null` releases capture
//! - `GET /api/v1/devices` - Re-enumerate audio inputs

use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

/// Request body for `POST /session/connect`. The whole body is optional.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectRequest {
    pub language: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MicRequest {
    pub enabled: bool,
}

/// `device_id: null` releases capture.
#[derive(Debug, Deserialize)]
pub struct DeviceRequest {
    pub device_id: Option<String>,
}

pub async fn get_session(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "session": state.session.snapshot()
    }))
}

/// Start a session with the assistant.
///
/// ## Endpoint: `POST /api/v1/session/connect`
///
/// Returns once the answer is applied; the session reports `connected` on the
/// event stream when media flows. A connect while a session is already being
/// set up or running is rejected with `409`.
///
/// ## Errors:
/// - `503 no_local_track`: no microphone could be opened
/// - `502 negotiation`: the server rejected or never answered the offer
pub async fn connect(
    state: web::Data<AppState>,
    body: Option<web::Json<ConnectRequest>>,
) -> Result<HttpResponse, AppError> {
    let _guard = state
        .begin_connect()
        .ok_or_else(|| AppError::Conflict("A connect is already in progress".to_string()))?;
    let current = state.session.transport().state();
    if current.is_active() {
        return Err(AppError::Conflict(format!("Session is already {}", current)));
    }

    let language = body
        .and_then(|b| b.into_inner().language)
        .filter(|l| !l.trim().is_empty())
        .unwrap_or_else(|| state.default_language());

    info!(language = %language, "Connect requested");
    state.session.connect(Some(language.clone())).await?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "connecting",
        "language": language,
        "session": state.session.snapshot()
    })))
}

pub async fn disconnect(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    state.session.end_session().await?;
    Ok(HttpResponse::Ok().json(json!({
        "status": "disconnected",
        "session": state.session.snapshot()
    })))
}

/// ## Endpoint: `POST /api/v1/session/mic`
///
/// `applied` is false when there is no local track yet; the preference is
/// still stored and honoured once capture starts.
pub async fn set_mic(
    state: web::Data<AppState>,
    body: web::Json<MicRequest>,
) -> Result<HttpResponse, AppError> {
    let enabled = body.enabled;
    let applied = state.session.set_mic_enabled(enabled);
    Ok(HttpResponse::Ok().json(json!({
        "mic_enabled": enabled,
        "applied": applied
    })))
}

pub async fn select_device(
    state: web::Data<AppState>,
    body: web::Json<DeviceRequest>,
) -> Result<HttpResponse, AppError> {
    let device_id = body.into_inner().device_id;
    if let Some(id) = &device_id {
        let known = state.session.transport().devices().iter().any(|d| &d.id == id);
        if !known {
            return Err(AppError::NotFound(format!("Unknown input device: {}", id)));
        }
    }

    state.session.select_device(device_id.as_deref()).await?;
    Ok(HttpResponse::Ok().json(json!({
        "selected_device": state.session.transport().selected_device()
    })))
}

pub async fn list_devices(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let devices = state.session.refresh_devices().await?;
    Ok(HttpResponse::Ok().json(json!({
        "devices": devices,
        "selected_device": state.session.transport().selected_device()
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testing::fake_state;
    use actix_web::{http::StatusCode, test, App};

    macro_rules! session_app {
        ($state:expr) => {
            test::init_service(
                App::new()
                    .app_data(web::Data::new($state))
                    .route("/session", web::get().to(get_session))
                    .route("/session/connect", web::post().to(connect))
                    .route("/session/disconnect", web::post().to(disconnect))
                    .route("/session/mic", web::post().to(set_mic))
                    .route("/session/device", web::put().to(select_device))
                    .route("/devices", web::get().to(list_devices)),
            )
            .await
        };
    }

    #[actix_web::test]
    async fn test_connect_request_parsing() {
        let request: ConnectRequest = serde_json::from_str(r#"{"language": "ta"}"#).unwrap();
        assert_eq!(request.language.as_deref(), Some("ta"));

        let request: ConnectRequest = serde_json::from_str("{}").unwrap();
        assert!(request.language.is_none());
    }

    #[actix_web::test]
    async fn test_connect_without_microphone() {
        let (state, _) = fake_state(&[]);
        let app = session_app!(state);

        let req = test::TestRequest::post().uri("/session/connect").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["error"]["type"], "no_local_track");
    }

    #[actix_web::test]
    async fn test_connect_twice_conflicts() {
        let (state, factory) = fake_state(&["usb"]);
        let app = session_app!(state.clone());

        let req = test::TestRequest::post()
            .uri("/session/connect")
            .set_json(json!({"language": "ta"}))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["language"], "ta");
        assert_eq!(body["session"]["connection_status"], "connecting");
        assert_eq!(factory.created(), 1);

        let req = test::TestRequest::post().uri("/session/connect").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let req = test::TestRequest::post().uri("/session/disconnect").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["session"]["connection_status"], "disconnected");
    }

    #[actix_web::test]
    async fn test_connect_rejected_while_another_is_in_flight() {
        let (state, factory) = fake_state(&["usb"]);
        let app = session_app!(state.clone());

        let guard = state.begin_connect().unwrap();
        let req = test::TestRequest::post().uri("/session/connect").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(factory.created(), 0);

        drop(guard);
        let req = test::TestRequest::post().uri("/session/connect").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(factory.created(), 1);
    }

    #[actix_web::test]
    async fn test_mic_toggle_without_track() {
        let (state, _) = fake_state(&["usb"]);
        let app = session_app!(state.clone());

        let req = test::TestRequest::post()
            .uri("/session/mic")
            .set_json(json!({"enabled": false}))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["mic_enabled"], false);
        assert_eq!(body["applied"], false);
        assert!(!state.session.snapshot().mic_enabled);
    }

    #[actix_web::test]
    async fn test_select_unknown_device() {
        let (state, _) = fake_state(&["usb"]);
        state.session.refresh_devices().await.unwrap();
        let app = session_app!(state);

        let req = test::TestRequest::put()
            .uri("/session/device")
            .set_json(json!({"device_id": "hdmi"}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let req = test::TestRequest::put()
            .uri("/session/device")
            .set_json(json!({"device_id": "usb"}))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["selected_device"]["id"], "usb");
    }

    #[actix_web::test]
    async fn test_list_devices() {
        let (state, _) = fake_state(&["usb", "hdmi"]);
        let app = session_app!(state);

        let req = test::TestRequest::get().uri("/devices").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["devices"].as_array().unwrap().len(), 2);
        assert_eq!(body["devices"][1]["label"], "Mic hdmi");
    }
}
