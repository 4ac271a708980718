use axum::{
    extract::{Request, State},
    http::{StatusCode, header},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

use crate::AppState;

/// Identity proven by the bearer credential, inserted into request extensions.
#[derive(Debug, Clone, Copy)]
pub struct AuthIdentity(pub Uuid);

/// Verify the bearer credential with the same verifier the WebSocket
/// handshake uses.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let identity = state
        .gateway
        .verifier()
        .verify(token)
        .ok_or(StatusCode::UNAUTHORIZED)?;

    req.extensions_mut().insert(AuthIdentity(identity));
    Ok(next.run(req).await)
}
