use axum::{middleware, routing::get, Router};
use std::sync::Arc;
use tower_http::{services::ServeDir, trace::TraceLayer};

use crate::gate::{gate_request, GateState};

use super::handlers::{health_check, placeholder_page};

/// Router for the protected site. Every request, static files included, is
/// gated first.
pub fn create_site_router(gate: Arc<GateState>, static_dir: Option<&str>) -> Router {
    let router = Router::new().route("/healthz", get(health_check));

    let router = match static_dir {
        Some(dir) => router.fallback_service(ServeDir::new(dir)),
        None => router.fallback(placeholder_page),
    };

    router
        .layer(middleware::from_fn_with_state(gate, gate_request))
        .layer(TraceLayer::new_for_http())
}
