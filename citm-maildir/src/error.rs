/// Storage-layer errors.  Corrupted local state is not recovered from:
/// we fail fast and the owner tears the folder down.
#[derive(Debug, thiserror::Error)]
pub enum MaildirError {
    #[error("log error: {0}")]
    Log(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid parameter: {0}")]
    Param(String),

    /// A semantic precondition was violated.
    #[error("{0}")]
    Value(String),

    /// The folder is shutting down or has failed; no new accessors.
    #[error("mailbox is not accessible: {0}")]
    NotAccessible(String),

    /// Message content did not decrypt and was kept as ciphertext.
    #[error(transparent)]
    Crypto(#[from] citm_crypto::CryptoError),

    #[error("internal invariant violated: {0}")]
    Internal(String),
}
