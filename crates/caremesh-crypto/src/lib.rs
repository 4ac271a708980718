//! Client-side key management for caremesh.
//!
//! Each identity owns a long-term X25519 key pair that never leaves local
//! storage. Every message is sealed to the recipient's public key under a
//! fresh ephemeral key pair (X25519 + HKDF-SHA256 + AES-256-GCM), so the
//! relay only ever sees an opaque `{ciphertext, ephemeralPublicKey, nonce}`.
//!
//! The `server` feature exposes key parsing only; sealing, opening and the
//! key manager are behind `client`.

pub mod error;
pub mod keys;

#[cfg(feature = "client")]
pub mod encrypt;
#[cfg(feature = "client")]
pub mod manager;
#[cfg(feature = "client")]
pub mod storage;

pub use error::CryptoError;

#[cfg(feature = "client")]
pub use manager::KeyManager;
