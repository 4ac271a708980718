use jsonwebtoken::{DecodingKey, Validation, decode};
use uuid::Uuid;

use caremesh_types::api::Claims;

/// Turns a bearer credential into the identity it names. Issuing credentials
/// happens elsewhere.
pub trait CredentialVerifier: Send + Sync + 'static {
    fn verify(&self, token: &str) -> Option<Uuid>;
}

/// HS256 JWTs signed with a shared secret. Expiry is enforced.
pub struct JwtVerifier {
    key: DecodingKey,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }
}

impl CredentialVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Option<Uuid> {
        decode::<Claims>(token, &self.key, &Validation::default())
            .ok()
            .map(|data| data.claims.sub)
    }
}
