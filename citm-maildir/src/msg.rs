use citm_imap::types::flag::{FetchFlags, Flags};

/// The system flags we track per message.  Keywords are not mirrored;
/// the upstream server owns them and passthrough commands see them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MsgFlags {
    pub answered: bool,
    pub flagged: bool,
    pub deleted: bool,
    pub seen: bool,
    pub draft: bool,
}

impl MsgFlags {
    pub fn from_fetch(f: &FetchFlags) -> MsgFlags {
        MsgFlags {
            answered: f.answered,
            flagged: f.flagged,
            deleted: f.deleted,
            seen: f.seen,
            draft: f.draft,
        }
    }

    pub fn from_flags(f: &Flags) -> MsgFlags {
        MsgFlags {
            answered: f.answered,
            flagged: f.flagged,
            deleted: f.deleted,
            seen: f.seen,
            draft: f.draft,
        }
    }

    pub fn to_fetch(self, recent: bool) -> FetchFlags {
        FetchFlags {
            answered: self.answered,
            flagged: self.flagged,
            deleted: self.deleted,
            seen: self.seen,
            draft: self.draft,
            recent,
            ..FetchFlags::default()
        }
    }

    pub fn to_flags(self) -> Flags {
        Flags {
            answered: self.answered,
            flagged: self.flagged,
            deleted: self.deleted,
            seen: self.seen,
            draft: self.draft,
            ..Flags::default()
        }
    }

    /// Compact persisted form.
    pub fn encode(self) -> String {
        let mut s = String::new();
        if self.answered {
            s.push('a');
        }
        if self.flagged {
            s.push('f');
        }
        if self.deleted {
            s.push('d');
        }
        if self.seen {
            s.push('s');
        }
        if self.draft {
            s.push('t');
        }
        s
    }

    pub fn decode(s: &str) -> MsgFlags {
        MsgFlags {
            answered: s.contains('a'),
            flagged: s.contains('f'),
            deleted: s.contains('d'),
            seen: s.contains('s'),
            draft: s.contains('t'),
        }
    }
}

/// Whether the message body is on disk, and what it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgState {
    /// Metadata known; content not yet downloaded.
    Unfilled,
    /// Content file present and decrypted.
    Filled,
    /// Content file present but it is ciphertext we could not read
    /// (the envelope named no recipient entry of ours).
    NotForMe,
}

impl MsgState {
    pub fn downloaded(self) -> bool {
        !matches!(self, MsgState::Unfilled)
    }

    pub fn encode(self) -> i64 {
        match self {
            MsgState::Unfilled => 0,
            MsgState::Filled => 1,
            MsgState::NotForMe => 2,
        }
    }

    pub fn decode(v: i64) -> MsgState {
        match v {
            1 => MsgState::Filled,
            2 => MsgState::NotForMe,
            _ => MsgState::Unfilled,
        }
    }
}

/// One message's metadata, keyed by upstream UID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Msg {
    pub uid: u32,
    pub modseq: u64,
    pub flags: MsgFlags,
    /// Seconds since the epoch.
    pub internaldate: i64,
    pub rfc822_size: u32,
    pub state: MsgState,
}

/// A UID that no longer exists, with the modseq of its removal
/// (QRESYNC answers `VANISHED (EARLIER)` from these).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expunge {
    pub uid: u32,
    pub modseq: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_codec() {
        let f = MsgFlags { answered: true, seen: true, ..MsgFlags::default() };
        assert_eq!(MsgFlags::decode(&f.encode()), f);
        assert_eq!(MsgFlags::decode(""), MsgFlags::default());
    }

    #[test]
    fn state_codec() {
        for s in [MsgState::Unfilled, MsgState::Filled, MsgState::NotForMe] {
            assert_eq!(MsgState::decode(s.encode()), s);
        }
    }
}
