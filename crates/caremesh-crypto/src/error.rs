use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    /// The seal did not verify: wrong key, corrupted ciphertext or tampering.
    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("No local key pair; initialize keys first")]
    NoKeyPair,

    #[error("Key storage error: {0}")]
    Storage(String),
}
