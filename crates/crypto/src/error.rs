use pow::PowError;
use thiserror::Error;

/// Errors emitted by cryptographic helpers.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("proof of work failed: {0}")]
    Pow(#[from] PowError),
    #[error("message authentication failed")]
    MacMismatch,
    #[error("decryption failed")]
    Decryption,
    #[error("encryption failed")]
    Encryption,
    #[error("key derivation failed")]
    KeyDerivation,
    #[error("malformed key material")]
    InvalidKey,
}
