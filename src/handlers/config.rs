use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "offer_url": config.offer_url(),
        "config": config
    })))
}

/// Apply a partial update. Only the runtime-tunable fields are honoured, see
/// `AppConfig::update_from_json`.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": current_config
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testing::fake_state;
    use actix_web::{http::StatusCode, test, App};

    #[actix_web::test]
    async fn test_update_config_roundtrip() {
        let (state, _) = fake_state(&[]);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/config", web::get().to(get_config))
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({"audio": {"speaking_threshold": 0.05}, "signaling": {"default_language": "ta"}}))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "success");
        assert_eq!(body["updated_config"]["signaling"]["default_language"], "ta");
        assert_eq!(state.default_language(), "ta");

        let req = test::TestRequest::get().uri("/config").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["offer_url"], "http://localhost:7860/api/offer");
    }

    #[actix_web::test]
    async fn test_update_config_rejects_invalid_threshold() {
        let (state, _) = fake_state(&[]);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({"audio": {"speaking_threshold": -1.0}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
