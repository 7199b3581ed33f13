//! Shared-secret bearer authentication for agent and requester endpoints.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use secrecy::{ExposeSecret, SecretString};
use subtle::ConstantTimeEq;

use crate::error::FabricError;

/// Token every authenticated request must present.
#[derive(Clone)]
pub struct AuthState {
    token: Arc<SecretString>,
}

impl AuthState {
    pub fn new(token: SecretString) -> Self {
        Self {
            token: Arc::new(token),
        }
    }

    /// Constant-time comparison against the configured token.
    pub fn validate(&self, presented: &str) -> bool {
        let expected = self.token.expose_secret();
        !expected.is_empty() && bool::from(expected.as_bytes().ct_eq(presented.as_bytes()))
    }
}

/// Pull the token out of an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Axum middleware rejecting requests without the shared token.
///
/// Wire up with `axum::middleware::from_fn_with_state(auth, require_token)`.
pub async fn require_token(State(auth): State<AuthState>, request: Request, next: Next) -> Response {
    let token = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token);

    match token {
        Some(token) if auth.validate(token) => next.run(request).await,
        Some(_) => {
            tracing::warn!(path = %request.uri().path(), "Rejected request with invalid token");
            FabricError::Auth("invalid token".to_string()).into_response()
        }
        None => FabricError::Auth("missing bearer token".to_string()).into_response(),
    }
}
