//! Per-endpoint request accounting for the control API.

use crate::state::AppState;
use actix_web::{
    body::MessageBody,
    dev::{ServiceRequest, ServiceResponse},
    middleware::Next,
    web, Error,
};
use std::time::Instant;

/// Count every request and record its duration under `"METHOD /path"`.
///
/// Responses with a 4xx/5xx status, and requests that fail before producing
/// a response, count as errors.
pub async fn track_requests(
    req: ServiceRequest,
    next: Next<impl MessageBody>,
) -> Result<ServiceResponse<impl MessageBody>, Error> {
    let start_time = Instant::now();
    let endpoint = format!("{} {}", req.method(), req.path());
    let state = req.app_data::<web::Data<AppState>>().cloned();

    if let Some(state) = &state {
        state.increment_request_count();
    }

    let result = next.call(req).await;

    let is_error = match &result {
        Ok(response) => response.status().is_client_error() || response.status().is_server_error(),
        Err(_) => true,
    };
    if let Some(state) = state {
        let duration_ms = start_time.elapsed().as_millis() as u64;
        state.record_endpoint_request(&endpoint, duration_ms, is_error);
        if is_error {
            state.increment_error_count();
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testing::fake_state;
    use actix_web::{middleware::from_fn, test, App, HttpResponse};

    #[actix_web::test]
    async fn test_requests_are_counted() {
        let (state, _) = fake_state(&[]);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .wrap(from_fn(track_requests))
                .route("/ok", web::get().to(|| async { HttpResponse::Ok().finish() }))
                .route("/bad", web::get().to(|| async { HttpResponse::BadRequest().finish() })),
        )
        .await;

        test::call_service(&app, test::TestRequest::get().uri("/ok").to_request()).await;
        test::call_service(&app, test::TestRequest::get().uri("/bad").to_request()).await;

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.request_count, 2);
        assert_eq!(metrics.error_count, 1);
        assert_eq!(metrics.endpoint_metrics["GET /ok"].request_count, 1);
    }
}
