use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::{error, info};
use uuid::Uuid;

use caremesh_crypto::keys::public_key_from_base64;
use caremesh_gateway::audit::{AuditAction, AuditEvent};
use caremesh_gateway::store::{KeyUpdate, blocking, read_with_retry};
use caremesh_types::api::{PublicKeyResponse, PublishKeyRequest};

use crate::AppState;
use crate::middleware::AuthIdentity;

/// Publish (or replace) the caller's public key. The private half never
/// reaches this endpoint.
pub async fn publish_key(
    State(state): State<AppState>,
    Extension(AuthIdentity(identity)): Extension<AuthIdentity>,
    Json(req): Json<PublishKeyRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    public_key_from_base64(&req.public_key).map_err(|_| StatusCode::BAD_REQUEST)?;

    let key = req.public_key.trim().to_string();
    let stored = key.clone();
    let update = blocking(state.gateway.store(), move |s| s.set_public_key(identity, &key))
        .await
        .map_err(|e| {
            error!(%identity, "Failed to store public key: {}", e);
            StatusCode::SERVICE_UNAVAILABLE
        })?;

    let action = match update {
        KeyUpdate::Registered => AuditAction::KeyRegistered,
        KeyUpdate::Rotated => AuditAction::KeyRotated,
        KeyUpdate::UnknownIdentity => return Err(StatusCode::NOT_FOUND),
    };
    info!(%identity, action = action.as_str(), "Public key published");
    state.gateway.audit().emit(AuditEvent::new(
        Some(identity),
        action,
        Some(format!("identity:{identity}")),
    ));

    Ok(Json(PublicKeyResponse {
        user_id: identity,
        public_key: Some(stored),
    }))
}

pub async fn get_public_key(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<impl IntoResponse, StatusCode> {
    let identity = read_with_retry(
        state.gateway.store(),
        state.gateway.config().read_retry_attempts,
        move |s| s.get_identity(user_id),
    )
    .await
    .map_err(|e| {
        error!(%user_id, "Failed to load identity: {}", e);
        StatusCode::SERVICE_UNAVAILABLE
    })?
    .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(PublicKeyResponse {
        user_id,
        public_key: identity.public_key,
    }))
}
