use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

use crate::auth::AuthService;
use crate::config::ProxyConfig;
use crate::gate::ip_extractor::extract_client_ip;
use crate::gate::pipeline::{GateDecision, GatePipeline, RequestScope, Visitor};

pub const BLOCK_MESSAGE: &str = "Sorry, you are not allowed to access this page.";

pub struct GateState {
    pub pipeline: Arc<GatePipeline>,
    pub auth: Arc<AuthService>,
    pub proxy: ProxyConfig,
}

/// Run the gating pipeline before the rest of the request.
/// Denied requests end here with a 403.
pub async fn gate_request(
    State(state): State<Arc<GateState>>,
    mut request: Request,
    next: Next,
) -> Response {
    // Without a peer address the visitor is unknown and classified internal
    let ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| extract_client_ip(request.headers(), addr.ip(), &state.proxy))
        .map(|ip| ip.to_string())
        .unwrap_or_default();

    let visitor = Visitor {
        ip,
        privileged: state.auth.is_privileged(request.headers()),
        request_uri: request.uri().to_string(),
    };

    let mut scope = request
        .extensions_mut()
        .remove::<RequestScope>()
        .unwrap_or_default();
    let decision = state.pipeline.evaluate(&mut scope, &visitor).await;
    request.extensions_mut().insert(scope);

    match decision {
        GateDecision::Deny(_) => (StatusCode::FORBIDDEN, BLOCK_MESSAGE).into_response(),
        GateDecision::Allow(reason) => {
            debug!(ip = %visitor.ip, reason = %reason, "access allowed");
            next.run(request).await
        }
    }
}
