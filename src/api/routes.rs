use axum::{
    middleware,
    routing::{delete, get, put},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::auth::{auth_middleware, AuthService};
use crate::gate::{gate_request, GateState};
use crate::storage::Storage;

use super::handlers::{
    get_policy, health_check, list_stats, reset_admin_country, update_blocked_countries,
    AppState,
};

pub fn create_api_router(
    storage: Arc<dyn Storage>,
    auth_service: Arc<AuthService>,
    gate: Arc<GateState>,
) -> Router {
    let state = Arc::new(AppState { storage });

    let protected_routes = Router::new()
        .route("/stats", get(list_stats))
        .route("/policy", get(get_policy))
        .route("/policy/blocked", put(update_blocked_countries))
        .route("/policy/admin-country", delete(reset_admin_country))
        .route_layer(middleware::from_fn_with_state(auth_service, auth_middleware))
        .with_state(state);

    let api = Router::new()
        .route("/health", get(health_check))
        .merge(protected_routes);

    Router::new()
        .nest("/api", api)
        .layer(middleware::from_fn_with_state(gate, gate_request))
        .layer(TraceLayer::new_for_http())
}
