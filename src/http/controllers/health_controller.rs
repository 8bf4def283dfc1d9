use crate::http::models::HealthResponse;
use axum::{http::StatusCode, Json};

/// Handler for GET /health
pub async fn health_handler() -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".to_string(),
            service: "webcounter".to_string(),
        }),
    )
}
