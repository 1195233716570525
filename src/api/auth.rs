//! Management authentication: a shared `X-API-Key` header, compared in
//! constant time. Health checks and the sandbox proxy are mounted outside
//! this middleware; the proxy's backing sandbox validates its own session
//! key header.

use axum::{extract::Request, extract::State, middleware::Next, response::Response};
use subtle::ConstantTimeEq;

use super::error::ApiError;
use super::state::AppState;

pub const API_KEY_HEADER: &str = "x-api-key";

pub async fn require_api_key(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let provided = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");

    if provided.is_empty() || !keys_match(provided, &state.config.api_key) {
        log::debug!("rejecting request to {} with bad management key", req.uri().path());
        return Err(ApiError::unauthorized("Invalid or missing API key"));
    }

    Ok(next.run(req).await)
}

fn keys_match(provided: &str, expected: &str) -> bool {
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}
