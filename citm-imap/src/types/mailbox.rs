use std::fmt;

use crate::types::core::IString;

/// A mailbox name.  INBOX is matched case-insensitively on input and
/// always written back out in uppercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Mailbox {
    Inbox,
    Other(IString),
}

impl Mailbox {
    pub fn new(name: IString) -> Mailbox {
        if name.as_bytes().eq_ignore_ascii_case(b"INBOX") {
            Mailbox::Inbox
        } else {
            Mailbox::Other(name)
        }
    }

    pub fn is_inbox(&self) -> bool {
        matches!(self, Mailbox::Inbox)
    }

    /// The canonical name bytes (INBOX uppercased).
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Mailbox::Inbox => b"INBOX",
            Mailbox::Other(name) => name.as_bytes(),
        }
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(self.as_bytes()).into_owned()
    }
}

impl From<&str> for Mailbox {
    fn from(s: &str) -> Self {
        Mailbox::new(IString::from(s))
    }
}

impl fmt::Display for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_lossy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbox_case_insensitive() {
        assert!(Mailbox::from("inbox").is_inbox());
        assert!(Mailbox::from("InBoX").is_inbox());
        assert_eq!(Mailbox::from("inbox").as_bytes(), b"INBOX");
        assert!(!Mailbox::from("INBOX/sub").is_inbox());
    }
}
