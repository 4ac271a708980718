use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::CryptoError;
use crate::keys::StoredKeyPair;

/// Well-known local key the long-term key pair is stored under.
pub const KEYPAIR_STORAGE_KEY: &str = "caremesh.keypair";

/// Local, device-only storage for the long-term key pair.
pub trait KeyStorage: Send + Sync {
    fn load(&self) -> Result<Option<StoredKeyPair>, CryptoError>;
    fn save(&self, pair: &StoredKeyPair) -> Result<(), CryptoError>;
    fn clear(&self) -> Result<(), CryptoError>;
}

/// Stores the key pair as JSON in `<dir>/caremesh.keypair`.
pub struct FileKeyStorage {
    path: PathBuf,
}

impl FileKeyStorage {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(KEYPAIR_STORAGE_KEY),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyStorage for FileKeyStorage {
    fn load(&self) -> Result<Option<StoredKeyPair>, CryptoError> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CryptoError::Storage(e.to_string())),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| CryptoError::Storage(format!("corrupt key file: {e}")))
    }

    fn save(&self, pair: &StoredKeyPair) -> Result<(), CryptoError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| CryptoError::Storage(e.to_string()))?;
        }
        let json = serde_json::to_vec(pair).map_err(|e| CryptoError::Storage(e.to_string()))?;

        // The key file is replaced atomically, never written in place.
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json).map_err(|e| CryptoError::Storage(e.to_string()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))
                .map_err(|e| CryptoError::Storage(e.to_string()))?;
        }
        fs::rename(&tmp, &self.path).map_err(|e| CryptoError::Storage(e.to_string()))
    }

    fn clear(&self) -> Result<(), CryptoError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CryptoError::Storage(e.to_string())),
        }
    }
}

/// In-memory storage, for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryKeyStorage {
    slot: Mutex<Option<StoredKeyPair>>,
}

impl MemoryKeyStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStorage for MemoryKeyStorage {
    fn load(&self) -> Result<Option<StoredKeyPair>, CryptoError> {
        let slot = self
            .slot
            .lock()
            .map_err(|_| CryptoError::Storage("key slot lock poisoned".into()))?;
        Ok(slot.clone())
    }

    fn save(&self, pair: &StoredKeyPair) -> Result<(), CryptoError> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| CryptoError::Storage("key slot lock poisoned".into()))?;
        *slot = Some(pair.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), CryptoError> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| CryptoError::Storage("key slot lock poisoned".into()))?;
        *slot = None;
        Ok(())
    }
}
