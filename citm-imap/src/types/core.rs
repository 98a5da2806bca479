use std::fmt;

use crate::error::ImapError;

/// Longest string we will emit in quoted form; anything bigger becomes a
/// literal even if every byte is quotable.
pub const MAX_QUOTED_LEN: usize = 72;

pub fn is_atom_char(b: u8) -> bool {
    // ATOM-CHAR = <any CHAR except atom-specials>
    // atom-specials = "(" / ")" / "{" / SP / CTL / "%" / "*" / DQUOTE / "\" / "]"
    match b {
        b'(' | b')' | b'{' | b' ' | b'%' | b'*' | b'"' | b'\\' | b']' => false,
        0..=0x1f | 0x7f.. => false,
        _ => true,
    }
}

pub fn is_astring_char(b: u8) -> bool {
    // ASTRING-CHAR = ATOM-CHAR / resp-specials
    is_atom_char(b) || b == b']'
}

pub fn is_quotable(b: u8) -> bool {
    !matches!(b, b'\r' | b'\n' | 0)
}

pub fn is_tag_char(b: u8) -> bool {
    is_astring_char(b) && b != b'+'
}

pub fn is_text_char(b: u8) -> bool {
    !matches!(b, b'\r' | b'\n' | 0)
}

/// A string with its wire form.
///
/// Parsing preserves the form found on the wire; writing re-classifies
/// (see [`IString::classify`]), so two `IString`s with equal bytes are
/// interchangeable for everything but byte-exact echo tests.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IString {
    Atom(String),
    Quoted(String),
    Literal(Vec<u8>),
}

impl IString {
    /// Pick the wire form the writer will use for `bytes`:
    /// raw atom if nonempty and atom-safe, quoted if short and free of
    /// CR/LF/NUL, literal otherwise.
    pub fn classify(bytes: &[u8]) -> IString {
        if !bytes.is_empty() && bytes.iter().all(|&b| is_atom_char(b)) {
            // unwrap ok: atom chars are ascii
            return IString::Atom(String::from_utf8(bytes.to_vec()).unwrap());
        }
        if bytes.len() <= MAX_QUOTED_LEN && bytes.iter().all(|&b| is_quotable(b)) {
            if let Ok(s) = String::from_utf8(bytes.to_vec()) {
                return IString::Quoted(s);
            }
        }
        IString::Literal(bytes.to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            IString::Atom(s) | IString::Quoted(s) => s.as_bytes(),
            IString::Literal(v) => v,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    /// Lossy utf-8 view, for logging and comparisons.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(self.as_bytes()).into_owned()
    }

    /// Same bytes, canonical (write-time) form.
    pub fn canonicalize(&self) -> IString {
        IString::classify(self.as_bytes())
    }
}

impl From<&str> for IString {
    fn from(s: &str) -> Self {
        IString::classify(s.as_bytes())
    }
}

impl From<String> for IString {
    fn from(s: String) -> Self {
        IString::classify(s.as_bytes())
    }
}

impl fmt::Display for IString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_lossy())
    }
}

/// NIL or a string.
pub type NString = Option<IString>;

/// A command tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tag(String);

impl Tag {
    pub fn new(s: impl Into<String>) -> Result<Tag, ImapError> {
        let s = s.into();
        if s.is_empty() || !s.bytes().all(is_tag_char) {
            return Err(ImapError::Param(format!("invalid tag: {s:?}")));
        }
        Ok(Tag(s))
    }

    /// For strings already validated by the parser.
    pub(crate) fn new_unchecked(s: String) -> Tag {
        Tag(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Monotonic tag source for one session's outgoing commands.
#[derive(Debug, Clone)]
pub struct TagGen {
    prefix: &'static str,
    count: u64,
}

impl TagGen {
    pub fn new(prefix: &'static str) -> TagGen {
        TagGen { prefix, count: 0 }
    }

    pub fn next(&mut self) -> Tag {
        self.count += 1;
        Tag(format!("{}{}", self.prefix, self.count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert_eq!(IString::classify(b"box"), IString::Atom("box".into()));
        assert_eq!(
            IString::classify(b"two words"),
            IString::Quoted("two words".into())
        );
        assert_eq!(IString::classify(b""), IString::Quoted("".into()));
        assert_eq!(
            IString::classify(b"line\r\nbreak"),
            IString::Literal(b"line\r\nbreak".to_vec())
        );
        let long = vec![b'a'; MAX_QUOTED_LEN + 1];
        assert!(matches!(IString::classify(&long), IString::Literal(_)));
        // exactly 72 quotable bytes stays quoted
        let edge = vec![b' '; MAX_QUOTED_LEN];
        assert!(matches!(IString::classify(&edge), IString::Quoted(_)));
    }

    #[test]
    fn tags() {
        assert!(Tag::new("a001").is_ok());
        assert!(Tag::new("").is_err());
        assert!(Tag::new("a+b").is_err());
        assert!(Tag::new("has space").is_err());
    }
}
