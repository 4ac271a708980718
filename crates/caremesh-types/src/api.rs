use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Role;

// -- Credentials --

/// Bearer credential claims, issued by the external auth service and shared
/// by the gateway handshake and the HTTP middleware.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub role: Role,
    pub exp: usize,
}

// -- Keys --

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PublishKeyRequest {
    pub public_key: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyResponse {
    pub user_id: Uuid,
    pub public_key: Option<String>,
}
