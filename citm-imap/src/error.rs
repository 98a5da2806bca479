use crate::extensions::Ext;

/// Typed codec errors.
///
/// `Syntax` is recoverable for a server (the connection answers with an
/// untagged `BAD` and keeps going); every other variant is a caller bug
/// or a peer protocol violation and is fatal to the session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ImapError {
    #[error("syntax error parsing {what}: {near}")]
    Syntax { what: &'static str, near: String },

    /// A construct gated behind an extension the peer forbade.
    #[error("{0} is disabled on this session")]
    ExtensionDisabled(Ext),

    /// Invalid argument at an API boundary (bad tag characters, an
    /// out-of-range time, a `*` in a UID sequence set, ...).
    #[error("invalid parameter: {0}")]
    Param(String),

    /// A semantic precondition was violated (empty STORE set, VANISHED
    /// without CHANGEDSINCE, ...).
    #[error("invalid value: {0}")]
    Value(String),
}

impl ImapError {
    pub(crate) fn syntax(what: &'static str, near: &[u8]) -> Self {
        let shown = &near[..near.len().min(32)];
        ImapError::Syntax {
            what,
            near: String::from_utf8_lossy(shown).into_owned(),
        }
    }
}
