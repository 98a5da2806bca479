//! From-header extraction for RFC 5322 messages.
//!
//! This is deliberately not a MIME parser: we scan the header block,
//! unfold the From field, and pull out mailbox entries.  Enough for
//! local-message injection and key-notice attribution, nothing more.

use nom::branch::alt;
use nom::bytes::complete::{tag, take_while, take_while1};
use nom::combinator::{map, opt};
use nom::multi::{many1, separated_list1};
use nom::sequence::{delimited, pair, preceded};
use nom::IResult;

use crate::error::ImapError;

/// One mailbox from a From header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FromAddr {
    pub name: Option<String>,
    pub addr: String,
}

/// Locate the From header in a message and parse its mailboxes.
pub fn from_header(msg: &[u8]) -> Result<Vec<FromAddr>, ImapError> {
    let value = find_header(msg, b"from")
        .ok_or_else(|| ImapError::Value("message has no From header".into()))?;
    parse_mailbox_list(&value)
}

/// Scan the header block for `name:`, unfolding continuation lines.
/// Search is case-insensitive; the header block ends at the first empty
/// line.
pub fn find_header(msg: &[u8], name: &[u8]) -> Option<Vec<u8>> {
    let mut rest = msg;
    loop {
        let line_end = rest.iter().position(|&b| b == b'\n')?;
        let line = trim_cr(&rest[..line_end]);
        if line.is_empty() {
            // end of headers
            return None;
        }
        rest = &rest[line_end + 1..];
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            continue;
        };
        if !line[..colon].trim_ascii().eq_ignore_ascii_case(name) {
            continue;
        }
        let mut value = line[colon + 1..].to_vec();
        // unfold: a following line starting with WSP continues the value
        while rest.first().is_some_and(|&b| b == b' ' || b == b'\t') {
            let line_end = rest.iter().position(|&b| b == b'\n').unwrap_or(rest.len());
            value.push(b' ');
            value.extend_from_slice(trim_cr(&rest[..line_end]).trim_ascii());
            rest = rest.get(line_end + 1..).unwrap_or(b"");
        }
        return Some(value);
    }
}

fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn parse_mailbox_list(value: &[u8]) -> Result<Vec<FromAddr>, ImapError> {
    match mailbox_list(value) {
        Ok((_rest, list)) => Ok(list),
        Err(_) => Err(ImapError::syntax("From header", value)),
    }
}

// ---- the address grammar, complete-input combinators ----

fn cfws(input: &[u8]) -> IResult<&[u8], ()> {
    // whitespace and comments, nesting ignored for sanity
    let mut rest = input;
    loop {
        let trimmed = match rest.iter().position(|&b| !matches!(b, b' ' | b'\t')) {
            Some(n) => &rest[n..],
            None => b"",
        };
        if trimmed.first() == Some(&b'(') {
            match trimmed.iter().position(|&b| b == b')') {
                Some(close) => rest = &trimmed[close + 1..],
                None => return Ok((b"", ())),
            }
        } else {
            return Ok((trimmed, ()));
        }
    }
}

fn is_atext(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || matches!(
            b,
            b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'/' | b'='
                | b'?' | b'^' | b'_' | b'`' | b'{' | b'|' | b'}' | b'~' | b'.'
        )
}

fn word_atom(input: &[u8]) -> IResult<&[u8], String> {
    preceded(
        cfws,
        map(take_while1(is_atext), |w: &[u8]| {
            String::from_utf8_lossy(w).into_owned()
        }),
    )(input)
}

fn quoted_string(input: &[u8]) -> IResult<&[u8], String> {
    let inner = map(
        take_while(|b: u8| b != b'"' && b != b'\\'),
        |v: &[u8]| String::from_utf8_lossy(v).into_owned(),
    );
    preceded(cfws, delimited(tag(b"\""), inner, tag(b"\"")))(input)
}

fn display_name(input: &[u8]) -> IResult<&[u8], String> {
    map(many1(alt((quoted_string, word_atom))), |words| {
        words.join(" ")
    })(input)
}

/// `addr-spec = local-part "@" domain`
fn addr_spec(input: &[u8]) -> IResult<&[u8], String> {
    let local = alt((quoted_string, word_atom));
    map(
        pair(local, preceded(tag(b"@"), word_atom)),
        |(local, domain)| format!("{local}@{domain}"),
    )(input)
}

fn angle_addr(input: &[u8]) -> IResult<&[u8], String> {
    preceded(cfws, delimited(tag(b"<"), addr_spec, tag(b">")))(input)
}

/// `mailbox = name-addr / addr-spec`
fn mailbox(input: &[u8]) -> IResult<&[u8], FromAddr> {
    alt((
        map(pair(opt(display_name), angle_addr), |(name, addr)| FromAddr {
            name: name.filter(|n| !n.is_empty()),
            addr,
        }),
        map(addr_spec, |addr| FromAddr { name: None, addr }),
    ))(input)
}

fn mailbox_list(input: &[u8]) -> IResult<&[u8], Vec<FromAddr>> {
    separated_list1(preceded(cfws, tag(b",")), mailbox)(input)
}
