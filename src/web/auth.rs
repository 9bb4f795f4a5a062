//! Bearer-token middleware for the protected API routes.

use axum::{
    extract::{Request, State},
    http::{StatusCode, header},
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;

#[derive(Clone)]
pub struct AuthState {
    pub token: String,
}

fn bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

/// Reject requests whose bearer token does not match. Comparison is
/// constant-time.
pub async fn auth_middleware(
    State(auth): State<AuthState>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(presented) = bearer_token(&request) else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    if presented.as_bytes().ct_eq(auth.token.as_bytes()).into() {
        Ok(next.run(request).await)
    } else {
        tracing::debug!(path = %request.uri().path(), "Rejected request with invalid token");
        Err(StatusCode::UNAUTHORIZED)
    }
}
