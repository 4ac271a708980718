use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit},
};
use hkdf::Hkdf;
use rand_core::{OsRng, RngCore};
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey};

use caremesh_types::models::{EncryptedPayload, NONCE_LEN, PUBLIC_KEY_LEN};

use crate::error::CryptoError;
use crate::keys::KeyPair;

const HKDF_INFO: &[u8] = b"caremesh/e2e/v1";

/// Seal `plaintext` to `recipient` under a fresh ephemeral key pair.
///
/// The ephemeral secret is consumed by the key agreement and dropped before
/// this returns; only its public half travels with the payload.
pub fn encrypt_message(
    plaintext: &[u8],
    recipient: &PublicKey,
) -> Result<EncryptedPayload, CryptoError> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);

    let shared = ephemeral.diffie_hellman(recipient);
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidKey("low-order recipient key".into()));
    }

    let key = derive_message_key(
        shared.as_bytes(),
        ephemeral_public.as_bytes(),
        recipient.as_bytes(),
    )
    .ok_or(CryptoError::EncryptionFailed)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    Ok(EncryptedPayload::from_bytes(
        &ciphertext,
        ephemeral_public.as_bytes(),
        &nonce_bytes,
    ))
}

/// Open a payload sealed to `key_pair`. Any structural or authentication
/// failure is reported as [`CryptoError::DecryptionFailed`]; no partial
/// plaintext is ever returned.
pub fn decrypt_message(payload: &EncryptedPayload, key_pair: &KeyPair) -> Result<Vec<u8>, CryptoError> {
    let bytes = payload.decode().map_err(|_| CryptoError::DecryptionFailed)?;
    let ephemeral_public = PublicKey::from(bytes.ephemeral_public_key);

    let shared = key_pair.secret().diffie_hellman(&ephemeral_public);
    if !shared.was_contributory() {
        return Err(CryptoError::DecryptionFailed);
    }

    let key = derive_message_key(
        shared.as_bytes(),
        &bytes.ephemeral_public_key,
        key_pair.public_key().as_bytes(),
    )
    .ok_or(CryptoError::DecryptionFailed)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));

    cipher
        .decrypt(Nonce::from_slice(&bytes.nonce), bytes.ciphertext.as_slice())
        .map_err(|_| CryptoError::DecryptionFailed)
}

// Both public keys go into the salt so that any change to the ephemeral key
// bytes, including ones X25519 itself ignores, changes the message key.
fn derive_message_key(
    shared: &[u8; 32],
    ephemeral_public: &[u8; PUBLIC_KEY_LEN],
    recipient_public: &[u8; PUBLIC_KEY_LEN],
) -> Option<[u8; 32]> {
    let mut salt = [0u8; PUBLIC_KEY_LEN * 2];
    salt[..PUBLIC_KEY_LEN].copy_from_slice(ephemeral_public);
    salt[PUBLIC_KEY_LEN..].copy_from_slice(recipient_public);

    let hk = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut okm = [0u8; 32];
    hk.expand(HKDF_INFO, &mut okm).ok()?;
    Some(okm)
}
