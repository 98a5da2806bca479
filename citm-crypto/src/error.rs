/// Crypto-layer errors.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// The envelope did not parse.
    #[error("malformed envelope: {0}")]
    Envelope(String),

    /// The envelope parsed but no recipient entry matches our
    /// fingerprint.  Recoverable: the storage layer keeps the
    /// ciphertext and injects a diagnostic message instead.
    #[error("message is not encrypted to this account's key")]
    NotForMe,

    /// Decryption or authentication failed.
    #[error("decryption failed: {0}")]
    Decrypt(String),

    #[error("invalid parameter: {0}")]
    Param(String),

    #[error("key handling failed: {0}")]
    Key(#[from] rsa::Error),

    #[error("PEM handling failed: {0}")]
    Pem(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CryptoError {
    pub fn is_not_for_me(&self) -> bool {
        matches!(self, CryptoError::NotForMe)
    }
}
