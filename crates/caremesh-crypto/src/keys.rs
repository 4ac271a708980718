use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use x25519_dalek::PublicKey;

use caremesh_types::models::PUBLIC_KEY_LEN;

use crate::error::CryptoError;

/// Encode a key to base64 for publishing.
pub fn key_to_base64(key: &[u8; PUBLIC_KEY_LEN]) -> String {
    BASE64.encode(key)
}

/// Decode a base64 key.
pub fn key_from_base64(encoded: &str) -> Result<[u8; PUBLIC_KEY_LEN], CryptoError> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey(format!("expected {PUBLIC_KEY_LEN} bytes, got {len}")))
}

/// Parse a published X25519 public key.
pub fn public_key_from_base64(encoded: &str) -> Result<PublicKey, CryptoError> {
    key_from_base64(encoded).map(PublicKey::from)
}

#[cfg(feature = "client")]
pub use pair::{KeyPair, StoredKeyPair};

#[cfg(feature = "client")]
mod pair {
    use std::fmt;

    use rand_core::OsRng;
    use serde::{Deserialize, Serialize};
    use x25519_dalek::{PublicKey, StaticSecret};

    use super::{key_from_base64, key_to_base64};
    use crate::error::CryptoError;

    /// Long-term X25519 key pair of the local identity.
    #[derive(Clone)]
    pub struct KeyPair {
        secret: StaticSecret,
        public: PublicKey,
    }

    /// On-disk form of a [`KeyPair`].
    #[derive(Clone, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct StoredKeyPair {
        pub public_key: String,
        pub secret_key: String,
    }

    impl KeyPair {
        /// Generate a new pair from the OS RNG. Never touches the network.
        pub fn generate() -> Self {
            let secret = StaticSecret::random_from_rng(OsRng);
            let public = PublicKey::from(&secret);
            Self { secret, public }
        }

        pub fn from_secret_bytes(secret: [u8; 32]) -> Self {
            let secret = StaticSecret::from(secret);
            let public = PublicKey::from(&secret);
            Self { secret, public }
        }

        pub fn public_key(&self) -> &PublicKey {
            &self.public
        }

        /// The form other identities encrypt to.
        pub fn public_key_base64(&self) -> String {
            key_to_base64(self.public.as_bytes())
        }

        pub(crate) fn secret(&self) -> &StaticSecret {
            &self.secret
        }

        pub fn to_stored(&self) -> StoredKeyPair {
            StoredKeyPair {
                public_key: self.public_key_base64(),
                secret_key: key_to_base64(self.secret.as_bytes()),
            }
        }

        /// Restore from storage, rejecting a record whose halves do not match.
        pub fn from_stored(stored: &StoredKeyPair) -> Result<Self, CryptoError> {
            let pair = Self::from_secret_bytes(key_from_base64(&stored.secret_key)?);
            if pair.public_key_base64() != stored.public_key.trim() {
                return Err(CryptoError::InvalidKey(
                    "stored public key does not match secret".into(),
                ));
            }
            Ok(pair)
        }
    }

    impl fmt::Debug for KeyPair {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("KeyPair")
                .field("public", &self.public_key_base64())
                .finish_non_exhaustive()
        }
    }
}

#[cfg(all(test, feature = "client"))]
mod tests {
    use super::*;

    #[test]
    fn stored_pair_round_trips() {
        let pair = KeyPair::generate();
        let restored = KeyPair::from_stored(&pair.to_stored()).unwrap();
        assert_eq!(restored.public_key().as_bytes(), pair.public_key().as_bytes());
    }

    #[test]
    fn mismatched_stored_pair_is_rejected() {
        let mut stored = KeyPair::generate().to_stored();
        stored.public_key = KeyPair::generate().public_key_base64();
        assert!(matches!(
            KeyPair::from_stored(&stored),
            Err(CryptoError::InvalidKey(_))
        ));
    }

    #[test]
    fn key_from_base64_checks_length() {
        assert!(key_from_base64(&BASE64.encode([0u8; 16])).is_err());
        assert!(key_from_base64("%%%").is_err());
        let pair = KeyPair::generate();
        let parsed = public_key_from_base64(&pair.public_key_base64()).unwrap();
        assert_eq!(parsed.as_bytes(), pair.public_key().as_bytes());
    }

    #[test]
    fn debug_output_hides_secret() {
        let pair = KeyPair::generate();
        let shown = format!("{pair:?}");
        assert!(!shown.contains(&pair.to_stored().secret_key));
    }
}
