use axum::{response::Html, Json};
use serde::Serialize;

/// Served when no site directory is configured
pub async fn placeholder_page() -> Html<&'static str> {
    Html("<!doctype html><html><head><title>Welcome</title></head><body><p>Welcome.</p></body></html>")
}

/// Health check endpoint
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "OK".to_string(),
    })
}

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
}
