//! Leaf parsers shared by the command and response grammars, one
//! function per ABNF rule.  Everything is written against
//! `nom::*::streaming` so a partial buffer yields `Incomplete`, never a
//! false syntax error.

use nom::branch::alt;
use nom::bytes::streaming::{tag, take, take_while1, take_while_m_n};
use nom::character::streaming::digit1;
use nom::combinator::{map, map_res, opt, value};
use nom::sequence::{delimited, pair, preceded, terminated, tuple};
use nom::IResult;

use crate::types::core::{is_astring_char, is_atom_char, is_tag_char, IString, Tag};
use crate::types::datetime::{ImapTime, MONTHS};
use crate::types::mailbox::Mailbox;
use crate::types::sequence::{SeqRange, SeqSet};

pub fn sp(input: &[u8]) -> IResult<&[u8], ()> {
    value((), tag(b" "))(input)
}

pub fn crlf(input: &[u8]) -> IResult<&[u8], ()> {
    value((), tag(b"\r\n"))(input)
}

/// `number = 1*DIGIT`
pub fn number(input: &[u8]) -> IResult<&[u8], u32> {
    map_res(digit1, |d: &[u8]| {
        std::str::from_utf8(d).unwrap_or("").parse::<u32>()
    })(input)
}

/// `nz-number = digit-nz *DIGIT`
pub fn nz_number(input: &[u8]) -> IResult<&[u8], u32> {
    map_res(number, |n| if n == 0 { Err(()) } else { Ok(n) })(input)
}

/// 64-bit variant for modseq values.
pub fn number64(input: &[u8]) -> IResult<&[u8], u64> {
    map_res(digit1, |d: &[u8]| {
        std::str::from_utf8(d).unwrap_or("").parse::<u64>()
    })(input)
}

/// `tag = 1*<any ASTRING-CHAR except "+">`
pub fn imap_tag(input: &[u8]) -> IResult<&[u8], Tag> {
    map(take_while1(is_tag_char), |t: &[u8]| {
        Tag::new_unchecked(String::from_utf8_lossy(t).into_owned())
    })(input)
}

/// `atom = 1*ATOM-CHAR`
pub fn atom(input: &[u8]) -> IResult<&[u8], String> {
    map(take_while1(is_atom_char), |a: &[u8]| {
        String::from_utf8_lossy(a).into_owned()
    })(input)
}

/// An atom that may also contain `]` (ASTRING-CHAR).
pub fn astring_atom(input: &[u8]) -> IResult<&[u8], String> {
    map(take_while1(is_astring_char), |a: &[u8]| {
        String::from_utf8_lossy(a).into_owned()
    })(input)
}

fn quoted_inner(input: &[u8]) -> IResult<&[u8], Vec<u8>> {
    // QUOTED-CHAR = <any TEXT-CHAR except quoted-specials> /
    //               "\" quoted-specials
    let mut out = Vec::new();
    let mut i = 0;
    while i < input.len() {
        match input[i] {
            b'"' => {
                return Ok((&input[i..], out));
            }
            b'\\' => {
                if i + 1 >= input.len() {
                    return Err(nom::Err::Incomplete(nom::Needed::new(1)));
                }
                match input[i + 1] {
                    c @ (b'"' | b'\\') => out.push(c),
                    _ => {
                        return Err(nom::Err::Error(nom::error::Error::new(
                            &input[i..],
                            nom::error::ErrorKind::Escaped,
                        )))
                    }
                }
                i += 2;
            }
            b'\r' | b'\n' | 0 => {
                return Err(nom::Err::Error(nom::error::Error::new(
                    &input[i..],
                    nom::error::ErrorKind::Char,
                )))
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    Err(nom::Err::Incomplete(nom::Needed::new(1)))
}

/// `quoted = DQUOTE *QUOTED-CHAR DQUOTE`
pub fn quoted(input: &[u8]) -> IResult<&[u8], IString> {
    map(delimited(tag(b"\""), quoted_inner, tag(b"\"")), |v| {
        IString::Quoted(String::from_utf8_lossy(&v).into_owned())
    })(input)
}

/// `literal = "{" number ["+"] "}" CRLF *CHAR8`
///
/// The length header steals exactly N bytes from the stream regardless
/// of their content.  The `+` form is LITERAL+.
pub fn literal(input: &[u8]) -> IResult<&[u8], IString> {
    let (input, (len, _plus)) = literal_header(input)?;
    let (input, body) = take(len as usize)(input)?;
    Ok((input, IString::Literal(body.to_vec())))
}

/// Just the `{N[+]}CRLF` header.
pub fn literal_header(input: &[u8]) -> IResult<&[u8], (u32, bool)> {
    terminated(
        delimited(
            tag(b"{"),
            pair(number, map(opt(tag(b"+")), |p| p.is_some())),
            tag(b"}"),
        ),
        crlf,
    )(input)
}

/// `string = quoted / literal`
pub fn string(input: &[u8]) -> IResult<&[u8], IString> {
    alt((quoted, literal))(input)
}

/// `astring = 1*ASTRING-CHAR / string`
pub fn astring(input: &[u8]) -> IResult<&[u8], IString> {
    alt((string, map(astring_atom, IString::Atom)))(input)
}

/// `nstring = string / "NIL"`
pub fn nstring(input: &[u8]) -> IResult<&[u8], Option<IString>> {
    alt((value(None, tag_no_case_nil), map(string, Some)))(input)
}

fn tag_no_case_nil(input: &[u8]) -> IResult<&[u8], ()> {
    value((), nom::bytes::streaming::tag_no_case(b"NIL"))(input)
}

/// `mailbox = "INBOX" / astring`
pub fn mailbox(input: &[u8]) -> IResult<&[u8], Mailbox> {
    map(astring, Mailbox::new)(input)
}

/// `list-mailbox = 1*list-char / string` — like an atom but `%` and `*`
/// are allowed.
pub fn list_mailbox(input: &[u8]) -> IResult<&[u8], IString> {
    fn is_list_char(b: u8) -> bool {
        is_atom_char(b) || matches!(b, b'%' | b'*' | b']')
    }
    alt((
        string,
        map(take_while1(is_list_char), |a: &[u8]| {
            IString::Atom(String::from_utf8_lossy(a).into_owned())
        }),
    ))(input)
}

/// `seq-number = nz-number / "*"` with `*` encoded as 0.
fn seq_number(input: &[u8]) -> IResult<&[u8], u32> {
    alt((value(0, tag(b"*")), nz_number))(input)
}

/// `seq-range = seq-number ":" seq-number / seq-number`
fn seq_range(input: &[u8]) -> IResult<&[u8], SeqRange> {
    map(
        pair(seq_number, opt(preceded(tag(b":"), seq_number))),
        |(a, b)| SeqRange { a, b: b.unwrap_or(a) },
    )(input)
}

/// `sequence-set = seq-range *("," seq-range)`
pub fn seq_set(input: &[u8]) -> IResult<&[u8], SeqSet> {
    map_res(
        nom::multi::separated_list1(tag(b","), seq_range),
        |ranges| SeqSet::new(ranges).map_err(|_| ()),
    )(input)
}

fn two_digit(input: &[u8]) -> IResult<&[u8], u32> {
    map_res(take_while_m_n(2, 2, |b: u8| b.is_ascii_digit()), |d| {
        std::str::from_utf8(d).unwrap_or("").parse::<u32>()
    })(input)
}

fn four_digit(input: &[u8]) -> IResult<&[u8], u32> {
    map_res(take_while_m_n(4, 4, |b: u8| b.is_ascii_digit()), |d| {
        std::str::from_utf8(d).unwrap_or("").parse::<u32>()
    })(input)
}

/// `date-month = "Jan" / "Feb" / ...` (case-sensitive per RFC, but we
/// accept any case the way real servers do)
fn date_month(input: &[u8]) -> IResult<&[u8], u32> {
    if input.len() < 3 {
        return Err(nom::Err::Incomplete(nom::Needed::new(3 - input.len())));
    }
    let name = &input[..3];
    for (i, m) in MONTHS.iter().enumerate() {
        if name.eq_ignore_ascii_case(m.as_bytes()) {
            return Ok((&input[3..], (i + 1) as u32));
        }
    }
    Err(nom::Err::Error(nom::error::Error::new(
        input,
        nom::error::ErrorKind::Alt,
    )))
}

/// `date-time = DQUOTE date-day-fixed "-" date-month "-" date-year SP
///              time SP zone DQUOTE`
pub fn date_time(input: &[u8]) -> IResult<&[u8], ImapTime> {
    let day_fixed = alt((
        preceded(tag(b" "), map(take_while_m_n(1, 1, |b: u8| b.is_ascii_digit()), digit_val)),
        two_digit,
        map(take_while_m_n(1, 1, |b: u8| b.is_ascii_digit()), digit_val),
    ));
    let zone = pair(
        alt((value(1i32, tag(b"+")), value(-1i32, tag(b"-")))),
        pair(two_digit, two_digit),
    );
    map(
        delimited(
            tag(b"\""),
            tuple((
                day_fixed,
                preceded(tag(b"-"), date_month),
                preceded(tag(b"-"), four_digit),
                preceded(sp, tuple((two_digit, preceded(tag(b":"), two_digit), preceded(tag(b":"), two_digit)))),
                preceded(sp, zone),
            )),
            tag(b"\""),
        ),
        |(day, month, year, (hour, min, sec), (sign, (zh, zm)))| ImapTime {
            year,
            month,
            day,
            hour,
            min,
            sec,
            z_hour: sign * zh as i32,
            z_min: zm,
        },
    )(input)
}

fn digit_val(d: &[u8]) -> u32 {
    (d[0] - b'0') as u32
}

/// `date = date-day "-" date-month "-" date-year` (no quotes variant
/// also accepted, per the grammar)
pub fn search_date(input: &[u8]) -> IResult<&[u8], crate::types::search::SearchDate> {
    let inner = |input| {
        map(
            tuple((
                alt((two_digit, map(take_while_m_n(1, 1, |b: u8| b.is_ascii_digit()), digit_val))),
                preceded(tag(b"-"), date_month),
                preceded(tag(b"-"), four_digit),
            )),
            |(day, month, year)| crate::types::search::SearchDate { year, month, day },
        )(input)
    };
    alt((delimited(tag(b"\""), inner, tag(b"\"")), inner))(input)
}

/// `flag = "\Answered" / "\Flagged" / ... / "\" atom / atom`
/// Returned as (name-without-backslash, had-backslash).
pub fn flag(input: &[u8]) -> IResult<&[u8], (String, bool)> {
    alt((
        map(preceded(tag(b"\\"), alt((atom, map(tag(b"*"), |_| "*".to_string())))), |name| (name, true)),
        map(atom, |name| (name, false)),
    ))(input)
}

/// Text running to CRLF (the human-readable part of a status response).
pub fn text_to_crlf(input: &[u8]) -> IResult<&[u8], String> {
    let mut i = 0;
    loop {
        if i + 1 < input.len() {
            if input[i] == b'\r' && input[i + 1] == b'\n' {
                break;
            }
            i += 1;
        } else {
            return Err(nom::Err::Incomplete(nom::Needed::new(1)));
        }
    }
    let (text, rest) = input.split_at(i);
    Ok((
        &rest[2..],
        String::from_utf8_lossy(text).into_owned(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    // trailing space/garbage in the inputs below keeps streaming
    // parsers from reporting Incomplete at end-of-buffer
    fn full<'a, T>(r: IResult<&'a [u8], T>) -> T {
        let (_rest, v) = r.expect("parse");
        v
    }

    #[test]
    fn atoms_and_strings() {
        assert_eq!(full(atom(b"hello ")), "hello".to_string());
        assert_eq!(
            full(quoted(b"\"hi \\\"there\\\"\"")),
            IString::Quoted("hi \"there\"".into())
        );
        assert_eq!(
            full(literal(b"{5}\r\nhello")),
            IString::Literal(b"hello".to_vec())
        );
        // literal consumes exactly N bytes even if they look like syntax
        assert_eq!(
            full(literal(b"{4}\r\n\r\n\r\n")),
            IString::Literal(b"\r\n\r\n".to_vec())
        );
    }

    #[test]
    fn partial_input_is_incomplete() {
        assert!(matches!(atom(b""), Err(nom::Err::Incomplete(_))));
        assert!(matches!(quoted(b"\"abc"), Err(nom::Err::Incomplete(_))));
        assert!(matches!(literal(b"{10}\r\nabc"), Err(nom::Err::Incomplete(_))));
    }

    #[test]
    fn sequence_sets() {
        let s = full(seq_set(b"1:3,7,9:* "));
        assert_eq!(s.to_string(), "1:3,7,9:*");
    }

    #[test]
    fn datetimes() {
        let t = full(date_time(b"\"17-Jul-1996 02:44:25 -0700\""));
        assert_eq!((t.year, t.month, t.day), (1996, 7, 17));
        assert_eq!(t.z_hour, -7);
        let t = full(date_time(b"\" 1-Jan-2024 00:00:00 +0000\""));
        assert_eq!(t.day, 1);
    }

    #[test]
    fn flags() {
        assert_eq!(full(flag(b"\\Seen ")), ("Seen".to_string(), true));
        assert_eq!(full(flag(b"$Junk ")), ("$Junk".to_string(), false));
        assert_eq!(full(flag(b"\\* ")), ("*".to_string(), true));
    }
}
