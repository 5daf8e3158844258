use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use subtle::ConstantTimeEq;

use crate::config::{AuthConfig, AuthMode};

pub const API_KEY_HEADER: &str = "x-api-key";

pub struct AuthService {
    mode: AuthMode,
    api_keys: Arc<Vec<String>>,
}

impl AuthService {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            mode: config.mode,
            api_keys: Arc::new(config.api_keys.clone()),
        }
    }

    pub fn mode(&self) -> AuthMode {
        self.mode
    }

    pub fn validate_key(&self, key: &str) -> bool {
        if key.is_empty() {
            return false;
        }

        self.api_keys
            .iter()
            .any(|k| bool::from(k.as_bytes().ct_eq(key.as_bytes())))
    }

    /// Whether the request may use the admin API
    pub fn authorize(&self, headers: &HeaderMap) -> bool {
        match self.mode {
            AuthMode::None => true,
            AuthMode::ApiKey => self.validate_key(presented_key(headers)),
        }
    }

    /// Whether the caller holds administrative privilege. Requires a valid
    /// key; nobody is privileged when authentication is disabled.
    pub fn is_privileged(&self, headers: &HeaderMap) -> bool {
        self.mode == AuthMode::ApiKey && self.validate_key(presented_key(headers))
    }
}

fn presented_key(headers: &HeaderMap) -> &str {
    headers
        .get(API_KEY_HEADER)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("")
}

pub async fn auth_middleware(
    State(auth_service): State<Arc<AuthService>>,
    request: Request,
    next: Next,
) -> Response {
    if auth_service.authorize(request.headers()) {
        next.run(request).await
    } else {
        (StatusCode::UNAUTHORIZED, "Invalid or missing API key").into_response()
    }
}
