use std::sync::{Mutex, MutexGuard};

use tracing::info;

use caremesh_types::models::EncryptedPayload;

use crate::encrypt::{decrypt_message, encrypt_message};
use crate::error::CryptoError;
use crate::keys::{KeyPair, public_key_from_base64};
use crate::storage::KeyStorage;

/// Owns the local identity's long-term key pair.
///
/// The private half only ever lives in `storage` and in this process; none
/// of the methods here touch the network.
pub struct KeyManager<S: KeyStorage> {
    storage: S,
    current: Mutex<Option<KeyPair>>,
}

impl<S: KeyStorage> KeyManager<S> {
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            current: Mutex::new(None),
        }
    }

    /// Return the stored pair, generating and persisting one if none exists.
    pub fn initialize_keys(&self) -> Result<KeyPair, CryptoError> {
        let mut current = self.lock()?;
        if let Some(pair) = current.as_ref() {
            return Ok(pair.clone());
        }

        let pair = match self.storage.load()? {
            Some(stored) => KeyPair::from_stored(&stored)?,
            None => {
                let pair = KeyPair::generate();
                self.storage.save(&pair.to_stored())?;
                info!("Generated new identity key pair");
                pair
            }
        };

        *current = Some(pair.clone());
        Ok(pair)
    }

    /// Seal `plaintext` to a published base64 public key.
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        recipient_public_key: &str,
    ) -> Result<EncryptedPayload, CryptoError> {
        let recipient = public_key_from_base64(recipient_public_key)?;
        encrypt_message(plaintext, &recipient)
    }

    /// Open a payload addressed to the local identity.
    pub fn decrypt(&self, payload: &EncryptedPayload) -> Result<Vec<u8>, CryptoError> {
        let pair = self.loaded_pair()?;
        decrypt_message(payload, &pair)
    }

    /// Like [`decrypt`](Self::decrypt), for text messages.
    pub fn decrypt_text(&self, payload: &EncryptedPayload) -> Result<String, CryptoError> {
        String::from_utf8(self.decrypt(payload)?).map_err(|_| CryptoError::DecryptionFailed)
    }

    /// Replace the current pair with a fresh one. Messages sealed to the old
    /// public key can no longer be opened; the caller republishes the new key.
    pub fn rotate_keys(&self) -> Result<KeyPair, CryptoError> {
        let mut current = self.lock()?;
        let pair = KeyPair::generate();
        self.storage.save(&pair.to_stored())?;
        *current = Some(pair.clone());
        info!("Rotated identity key pair");
        Ok(pair)
    }

    /// Erase local key material (logout).
    pub fn clear_keys(&self) -> Result<(), CryptoError> {
        let mut current = self.lock()?;
        self.storage.clear()?;
        *current = None;
        info!("Cleared identity key pair");
        Ok(())
    }

    pub fn public_key(&self) -> Result<Option<String>, CryptoError> {
        match self.loaded_pair() {
            Ok(pair) => Ok(Some(pair.public_key_base64())),
            Err(CryptoError::NoKeyPair) => Ok(None),
            Err(e) => Err(e),
        }
    }

    // Cached pair, else the stored one. Never generates.
    fn loaded_pair(&self) -> Result<KeyPair, CryptoError> {
        let mut current = self.lock()?;
        if let Some(pair) = current.as_ref() {
            return Ok(pair.clone());
        }
        let stored = self.storage.load()?.ok_or(CryptoError::NoKeyPair)?;
        let pair = KeyPair::from_stored(&stored)?;
        *current = Some(pair.clone());
        Ok(pair)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<KeyPair>>, CryptoError> {
        self.current
            .lock()
            .map_err(|_| CryptoError::Storage("key cache lock poisoned".into()))
    }
}
