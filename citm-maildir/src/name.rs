//! Mailbox-name to filesystem-path encoding.
//!
//! Folder names come off the wire and may contain separators or bytes
//! the filesystem would mangle.  Alphanumerics and a few safe
//! characters pass through; everything else becomes `%XX`.

/// Encode a mailbox name for use as a single directory name.
pub fn encode(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for &b in name.as_bytes() {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' => out.push(b as char),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// Inverse of [`encode`]; bad escapes pass through verbatim.
pub fn decode(encoded: &str) -> String {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let (Some(hi), Some(lo)) = (
                bytes.get(i + 1).and_then(|b| (*b as char).to_digit(16)),
                bytes.get(i + 2).and_then(|b| (*b as char).to_digit(16)),
            ) {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        for name in ["INBOX", "Archive/2024", "weird name!", "box%20", "日本語"] {
            assert_eq!(decode(&encode(name)), name, "name={name}");
        }
    }

    #[test]
    fn encoded_form_is_path_safe() {
        let enc = encode("a/b\\c d");
        assert!(!enc.contains('/'));
        assert!(!enc.contains('\\'));
        assert!(!enc.contains(' '));
    }
}
