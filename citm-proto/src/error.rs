use citm_crypto::CryptoError;
use citm_imap::ImapError;
use citm_maildir::MaildirError;

/// TLS failures, classified for operator-readable reporting.  None of
/// these are ever retried silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsFailure {
    Handshake,
    CaUnknown,
    CertExpired,
    HostnameMismatch,
    NoCertPresented,
    Other,
}

impl TlsFailure {
    pub fn describe(self) -> &'static str {
        match self {
            TlsFailure::Handshake => "TLS handshake failed",
            TlsFailure::CaUnknown => "certificate authority is not trusted",
            TlsFailure::CertExpired => "certificate is expired",
            TlsFailure::HostnameMismatch => "certificate does not match the hostname",
            TlsFailure::NoCertPresented => "peer presented no certificate",
            TlsFailure::Other => "TLS failure",
        }
    }
}

/// Session-layer errors.
///
/// Recoverable vs fatal: command `Syntax` errors never reach this type
/// (the server connection demotes them to untagged BAD); a `Response`
/// error on an issued command is fatal to its bridge; `NotForMe` never
/// escapes the storage layer; `Canceled` is the graceful outcome.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    /// A peer sent bytes that do not parse.  Fatal for client-side
    /// (upstream) sessions.
    #[error("protocol syntax error: {0}")]
    Syntax(#[source] ImapError),

    /// Syntactically valid but semantically impossible peer behavior.
    #[error("unexpected peer response: {0}")]
    Response(String),

    #[error("invalid parameter: {0}")]
    Param(String),

    #[error("{0}")]
    Value(String),

    #[error("{}", .0.describe())]
    Tls(TlsFailure),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Maildir(#[from] MaildirError),

    #[error(transparent)]
    Os(#[from] std::io::Error),

    #[error("internal invariant violated: {0}")]
    Internal(String),

    #[error("canceled")]
    Canceled,

    /// The peer hung up.
    #[error("connection closed by peer")]
    ConnClosed,
}

impl From<ImapError> for ProtoError {
    fn from(e: ImapError) -> ProtoError {
        match e {
            ImapError::Syntax { .. } => ProtoError::Syntax(e),
            ImapError::Param(p) => ProtoError::Param(p),
            ImapError::Value(v) => ProtoError::Value(v),
            ImapError::ExtensionDisabled(_) => ProtoError::Param(e.to_string()),
        }
    }
}

impl ProtoError {
    /// Should the whole session die for this?
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ProtoError::Canceled)
    }
}
