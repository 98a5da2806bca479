//! The server-to-client grammar.

use nom::branch::alt;
use nom::bytes::streaming::{tag, tag_no_case};
use nom::combinator::{map, opt, value};
use nom::multi::{many0, separated_list0, separated_list1};
use nom::sequence::{delimited, pair, preceded, terminated, tuple};
use nom::IResult;

use crate::parse::core::*;
use crate::parse::command::section;
use crate::types::core::IString;
use crate::types::flag::{FetchFlags, Flags, MailboxFlags, PermFlags};
use crate::types::response::{
    BodyStructure, Capa, Code, MsgAttr, Response, ResponseData, ResponseStatus, StatusAttrValue,
    StatusKind, XkeySyncResp,
};

/// `response = continue-req / response-data / response-tagged`
pub fn response(input: &[u8]) -> IResult<&[u8], Response> {
    alt((continue_req, response_untagged, response_tagged))(input)
}

/// `continue-req = "+" SP (resp-text / base64) CRLF`
fn continue_req(input: &[u8]) -> IResult<&[u8], Response> {
    map(
        delimited(
            alt((tag(b"+ "), tag(b"+"))),
            pair(opt(resp_code), text_to_crlf_raw),
            nothing,
        ),
        |(code, text)| Response::Plus { code, text },
    )(input)
}

fn nothing(input: &[u8]) -> IResult<&[u8], ()> {
    Ok((input, ()))
}

// text_to_crlf consumes the CRLF itself, so continue_req/status wrap it
// with a no-op terminator.
fn text_to_crlf_raw(input: &[u8]) -> IResult<&[u8], String> {
    text_to_crlf(input)
}

fn status_kind(input: &[u8]) -> IResult<&[u8], StatusKind> {
    alt((
        value(StatusKind::Ok, tag_no_case(b"OK")),
        value(StatusKind::No, tag_no_case(b"NO")),
        value(StatusKind::Bad, tag_no_case(b"BAD")),
        value(StatusKind::Preauth, tag_no_case(b"PREAUTH")),
        value(StatusKind::Bye, tag_no_case(b"BYE")),
    ))(input)
}

/// `response-tagged = tag SP resp-cond-state CRLF`
fn response_tagged(input: &[u8]) -> IResult<&[u8], Response> {
    map(
        tuple((
            terminated(imap_tag, sp),
            terminated(status_kind, sp),
            opt(resp_code),
            text_to_crlf_raw,
        )),
        |(tag, kind, code, text)| {
            Response::Status(ResponseStatus { tag: Some(tag), kind, code, text })
        },
    )(input)
}

/// `response-data = "*" SP (resp-cond-state / mailbox-data /
///                  message-data / capability-data) CRLF`
fn response_untagged(input: &[u8]) -> IResult<&[u8], Response> {
    preceded(
        tag(b"* "),
        alt((
            untagged_status,
            numbered_data,
            capability_data,
            list_data,
            status_data,
            flags_data,
            search_data,
            enabled_data,
            vanished_data,
            xkeysync_data,
        )),
    )(input)
}

fn untagged_status(input: &[u8]) -> IResult<&[u8], Response> {
    map(
        tuple((terminated(status_kind, sp), opt(resp_code), text_to_crlf_raw)),
        |(kind, code, text)| {
            Response::Status(ResponseStatus { tag: None, kind, code, text })
        },
    )(input)
}

/// `"[" resp-text-code "] "` — the probe for whether `[` begins a code.
fn resp_code(input: &[u8]) -> IResult<&[u8], Code> {
    terminated(delimited(tag(b"["), code_inner, tag(b"]")), opt(sp))(input)
}

fn code_inner(input: &[u8]) -> IResult<&[u8], Code> {
    alt((
        value(Code::Alert, tag_no_case(b"ALERT")),
        value(Code::Parse, tag_no_case(b"PARSE")),
        map(
            preceded(tag_no_case(b"CAPABILITY "), separated_list1(sp, capa)),
            Code::Capability,
        ),
        map(
            preceded(tag_no_case(b"PERMANENTFLAGS "), perm_flag_list),
            Code::PermanentFlags,
        ),
        value(Code::ReadOnly, tag_no_case(b"READ-ONLY")),
        value(Code::ReadWrite, tag_no_case(b"READ-WRITE")),
        value(Code::TryCreate, tag_no_case(b"TRYCREATE")),
        map(preceded(tag_no_case(b"UIDNEXT "), nz_number), Code::UidNext),
        map(
            preceded(tag_no_case(b"UIDVALIDITY "), nz_number),
            Code::UidValidity,
        ),
        map(preceded(tag_no_case(b"UNSEEN "), nz_number), Code::Unseen),
        map(
            preceded(
                tag_no_case(b"APPENDUID "),
                pair(terminated(nz_number, sp), nz_number),
            ),
            |(uidvalidity, uid)| Code::AppendUid { uidvalidity, uid },
        ),
        map(
            preceded(
                tag_no_case(b"COPYUID "),
                tuple((terminated(nz_number, sp), terminated(seq_set, sp), seq_set)),
            ),
            |(uidvalidity, src, dst)| Code::CopyUid { uidvalidity, src, dst },
        ),
        value(Code::NoModSeq, tag_no_case(b"NOMODSEQ")),
        map(
            preceded(tag_no_case(b"HIGHESTMODSEQ "), number64),
            Code::HighestModSeq,
        ),
        map(preceded(tag_no_case(b"MODIFIED "), seq_set), Code::Modified),
        value(Code::Closed, tag_no_case(b"CLOSED")),
        atom_code,
    ))(input)
}

/// Unknown codes are kept verbatim: `atom [SP text-until-bracket]`.
fn atom_code(input: &[u8]) -> IResult<&[u8], Code> {
    let text_chars = nom::bytes::streaming::take_while1(|b: u8| !matches!(b, b']' | b'\r' | b'\n'));
    map(
        pair(
            atom,
            opt(preceded(
                sp,
                map(text_chars, |t: &[u8]| String::from_utf8_lossy(t).into_owned()),
            )),
        ),
        |(name, text)| Code::Atom { name, text },
    )(input)
}

fn capa(input: &[u8]) -> IResult<&[u8], Capa> {
    map(atom, |a| Capa::from_token(&a))(input)
}

fn capability_data(input: &[u8]) -> IResult<&[u8], Response> {
    map(
        terminated(
            preceded(tag_no_case(b"CAPABILITY "), separated_list1(sp, capa)),
            crlf,
        ),
        |capas| Response::Data(ResponseData::Capability(capas)),
    )(input)
}

/// `* N EXISTS / RECENT / EXPUNGE / FETCH msg-att`
fn numbered_data(input: &[u8]) -> IResult<&[u8], Response> {
    let (input, num) = terminated(number, sp)(input)?;
    alt((
        value(
            Response::Data(ResponseData::Exists(num)),
            terminated(tag_no_case(b"EXISTS"), crlf),
        ),
        value(
            Response::Data(ResponseData::Recent(num)),
            terminated(tag_no_case(b"RECENT"), crlf),
        ),
        value(
            Response::Data(ResponseData::Expunge(num)),
            terminated(tag_no_case(b"EXPUNGE"), crlf),
        ),
        map(
            delimited(
                tag_no_case(b"FETCH ("),
                separated_list0(sp, msg_attr),
                terminated(tag(b")"), crlf),
            ),
            move |attrs| Response::Data(ResponseData::Fetch { num, attrs }),
        ),
    ))(input)
}

fn fetch_flag_list(input: &[u8]) -> IResult<&[u8], FetchFlags> {
    map(
        delimited(tag(b"("), separated_list0(sp, flag), tag(b")")),
        |pairs| {
            let mut flags = FetchFlags::default();
            for (name, backslash) in pairs {
                flags.add(&name, backslash);
            }
            flags
        },
    )(input)
}

fn perm_flag_list(input: &[u8]) -> IResult<&[u8], PermFlags> {
    map(
        delimited(tag(b"("), separated_list0(sp, flag), tag(b")")),
        |pairs| {
            let mut flags = PermFlags::default();
            for (name, backslash) in pairs {
                flags.add(&name, backslash);
            }
            flags
        },
    )(input)
}

fn msg_attr(input: &[u8]) -> IResult<&[u8], MsgAttr> {
    alt((
        map(preceded(tag_no_case(b"FLAGS "), fetch_flag_list), MsgAttr::Flags),
        map(preceded(tag_no_case(b"UID "), nz_number), MsgAttr::Uid),
        map(
            preceded(tag_no_case(b"INTERNALDATE "), date_time),
            MsgAttr::InternalDate,
        ),
        map(
            preceded(tag_no_case(b"RFC822.SIZE "), number),
            MsgAttr::Rfc822Size,
        ),
        map(
            preceded(
                tag_no_case(b"MODSEQ ("),
                terminated(number64, tag(b")")),
            ),
            MsgAttr::ModSeq,
        ),
        map(preceded(tag_no_case(b"RFC822 "), nstring), |s| {
            MsgAttr::Rfc822(s.map(|v| v.as_bytes().to_vec()).unwrap_or_default())
        }),
        map(
            tuple((
                preceded(tag_no_case(b"BODY"), section),
                opt(delimited(tag(b"<"), number, tag(b">"))),
                preceded(sp, nstring),
            )),
            |(section, origin, data)| MsgAttr::BodySection {
                section,
                origin,
                data: data.map(|v| v.as_bytes().to_vec()),
            },
        ),
        map(
            preceded(tag_no_case(b"BODYSTRUCTURE "), body_structure),
            MsgAttr::BodyStructure,
        ),
    ))(input)
}

/// Single-part `body-type-1part`, the only shape we emit.
fn body_structure(input: &[u8]) -> IResult<&[u8], BodyStructure> {
    let param_list = alt((
        value(Vec::new(), tag_no_case(b"NIL")),
        delimited(
            tag(b"("),
            separated_list0(sp, pair(terminated(string, sp), string)),
            tag(b")"),
        ),
    ));
    map(
        delimited(
            tag(b"("),
            tuple((
                terminated(string, sp),
                terminated(string, sp),
                terminated(param_list, sp),
                terminated(nstring, sp),
                terminated(nstring, sp),
                terminated(string, sp),
                number,
                opt(preceded(sp, number)),
            )),
            tag(b")"),
        ),
        |(content_type, subtype, params, id, description, encoding, size, lines)| BodyStructure {
            content_type,
            subtype,
            params,
            id,
            description,
            encoding,
            size,
            lines,
        },
    )(input)
}

/// `* LIST (flags) sep mailbox` (and LSUB)
fn list_data(input: &[u8]) -> IResult<&[u8], Response> {
    let mflags = |input| {
        map(
            delimited(tag(b"("), separated_list0(sp, flag), tag(b")")),
            |pairs| {
                let mut flags = MailboxFlags::default();
                for (name, _backslash) in pairs {
                    flags.add(&name);
                }
                flags
            },
        )(input)
    };
    let sep = alt((
        value(None, tag_no_case(b"NIL")),
        map(delimited(tag(b"\""), quoted_sep, tag(b"\"")), Some),
    ));
    map(
        terminated(
            tuple((
                alt((
                    value(true, tag_no_case(b"LIST ")),
                    value(false, tag_no_case(b"LSUB ")),
                )),
                terminated(mflags, sp),
                terminated(sep, sp),
                mailbox,
            )),
            crlf,
        ),
        |(is_list, flags, sep, mailbox)| {
            if is_list {
                Response::Data(ResponseData::List { flags, sep, mailbox })
            } else {
                Response::Data(ResponseData::Lsub { flags, sep, mailbox })
            }
        },
    )(input)
}

fn quoted_sep(input: &[u8]) -> IResult<&[u8], char> {
    if input.is_empty() {
        return Err(nom::Err::Incomplete(nom::Needed::new(1)));
    }
    if input[0] == b'\\' {
        if input.len() < 2 {
            return Err(nom::Err::Incomplete(nom::Needed::new(1)));
        }
        return Ok((&input[2..], input[1] as char));
    }
    Ok((&input[1..], input[0] as char))
}

/// `* STATUS mailbox (att-val ...)`
fn status_data(input: &[u8]) -> IResult<&[u8], Response> {
    let att_val = alt((
        map(preceded(tag_no_case(b"MESSAGES "), number), StatusAttrValue::Messages),
        map(preceded(tag_no_case(b"RECENT "), number), StatusAttrValue::Recent),
        map(preceded(tag_no_case(b"UIDNEXT "), number), StatusAttrValue::UidNext),
        map(
            preceded(tag_no_case(b"UIDVALIDITY "), number),
            StatusAttrValue::UidValidity,
        ),
        map(preceded(tag_no_case(b"UNSEEN "), number), StatusAttrValue::Unseen),
        map(
            preceded(tag_no_case(b"HIGHESTMODSEQ "), number64),
            StatusAttrValue::HighestModSeq,
        ),
    ));
    map(
        terminated(
            preceded(
                tag_no_case(b"STATUS "),
                pair(
                    terminated(mailbox, sp),
                    delimited(tag(b"("), separated_list0(sp, att_val), tag(b")")),
                ),
            ),
            crlf,
        ),
        |(mailbox, attrs)| Response::Data(ResponseData::Status { mailbox, attrs }),
    )(input)
}

fn flags_data(input: &[u8]) -> IResult<&[u8], Response> {
    let flist = map(
        delimited(tag(b"("), separated_list0(sp, flag), tag(b")")),
        |pairs| {
            let mut flags = Flags::default();
            for (name, backslash) in pairs {
                flags.add(&name, backslash);
            }
            flags
        },
    );
    map(
        terminated(preceded(tag_no_case(b"FLAGS "), flist), crlf),
        |flags| Response::Data(ResponseData::Flags(flags)),
    )(input)
}

/// `* SEARCH *(SP nz-number) [SP "(MODSEQ" SP n ")"]`
fn search_data(input: &[u8]) -> IResult<&[u8], Response> {
    map(
        terminated(
            preceded(
                tag_no_case(b"SEARCH"),
                pair(
                    many0(preceded(sp, nz_number)),
                    opt(preceded(
                        sp,
                        delimited(tag_no_case(b"(MODSEQ "), number64, tag(b")")),
                    )),
                ),
            ),
            crlf,
        ),
        |(nums, modseq)| Response::Data(ResponseData::Search { nums, modseq }),
    )(input)
}

fn enabled_data(input: &[u8]) -> IResult<&[u8], Response> {
    map(
        terminated(
            preceded(tag_no_case(b"ENABLED"), many0(preceded(sp, capa))),
            crlf,
        ),
        |capas| Response::Data(ResponseData::Enabled(capas)),
    )(input)
}

/// `* VANISHED [(EARLIER) ]known-uids`
fn vanished_data(input: &[u8]) -> IResult<&[u8], Response> {
    map(
        terminated(
            preceded(
                tag_no_case(b"VANISHED "),
                pair(
                    map(opt(tag_no_case(b"(EARLIER) ")), |e| e.is_some()),
                    seq_set,
                ),
            ),
            crlf,
        ),
        |(earlier, uids)| Response::Data(ResponseData::Vanished { earlier, uids }),
    )(input)
}

/// `* XKEYSYNC (CREATED pem / DELETED fpr / OK)`
fn xkeysync_data(input: &[u8]) -> IResult<&[u8], Response> {
    map(
        terminated(
            preceded(
                tag_no_case(b"XKEYSYNC "),
                alt((
                    map(
                        preceded(tag_no_case(b"CREATED "), alt((literal, quoted))),
                        XkeySyncResp::Created,
                    ),
                    map(
                        preceded(tag_no_case(b"DELETED "), map(atom, IString::Atom)),
                        XkeySyncResp::Deleted,
                    ),
                    value(XkeySyncResp::Ok, tag_no_case(b"OK")),
                )),
            ),
            crlf,
        ),
        |resp| Response::Data(ResponseData::Xkeysync(resp)),
    )(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::mailbox::Mailbox;

    fn parse(line: &[u8]) -> Response {
        let (rest, resp) = response(line).expect("parse");
        assert!(rest.is_empty(), "unparsed: {rest:?}");
        resp
    }

    #[test]
    fn tagged_status_with_code() {
        let r = parse(b"a1 OK [APPENDUID 123 42] APPEND completed\r\n");
        match r {
            Response::Status(st) => {
                assert_eq!(st.kind, StatusKind::Ok);
                assert_eq!(
                    st.code,
                    Some(Code::AppendUid { uidvalidity: 123, uid: 42 })
                );
                assert_eq!(st.text, "APPEND completed");
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn untagged_statuses() {
        let r = parse(b"* OK [UIDVALIDITY 123] UIDs valid\r\n");
        match r {
            Response::Status(st) => {
                assert_eq!(st.tag, None);
                assert_eq!(st.code, Some(Code::UidValidity(123)));
            }
            other => panic!("{other:?}"),
        }
        let r = parse(b"* OK [HIGHESTMODSEQ 7] Highest\r\n");
        assert!(matches!(
            r,
            Response::Status(ResponseStatus { code: Some(Code::HighestModSeq(7)), .. })
        ));
        let r = parse(b"* OK [CLOSED] Previous mailbox closed\r\n");
        assert!(matches!(
            r,
            Response::Status(ResponseStatus { code: Some(Code::Closed), .. })
        ));
    }

    #[test]
    fn copyuid_code() {
        let r = parse(b"a2 OK [COPYUID 38505 304,319:320 3956:3958] Done\r\n");
        match r {
            Response::Status(st) => match st.code {
                Some(Code::CopyUid { uidvalidity, src, dst }) => {
                    assert_eq!(uidvalidity, 38505);
                    assert_eq!(src.to_string(), "304,319:320");
                    assert_eq!(dst.to_string(), "3956:3958");
                }
                other => panic!("{other:?}"),
            },
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn numbered_responses() {
        assert_eq!(
            parse(b"* 3 EXISTS\r\n"),
            Response::Data(ResponseData::Exists(3))
        );
        assert_eq!(
            parse(b"* 0 RECENT\r\n"),
            Response::Data(ResponseData::Recent(0))
        );
        assert_eq!(
            parse(b"* 5 EXPUNGE\r\n"),
            Response::Data(ResponseData::Expunge(5))
        );
    }

    #[test]
    fn fetch_response() {
        let r = parse(b"* 14 FETCH (UID 1305 FLAGS (\\Seen \\Deleted) MODSEQ (17))\r\n");
        match r {
            Response::Data(ResponseData::Fetch { num, attrs }) => {
                assert_eq!(num, 14);
                assert_eq!(attrs.len(), 3);
                assert!(matches!(attrs[0], MsgAttr::Uid(1305)));
                assert!(matches!(attrs[2], MsgAttr::ModSeq(17)));
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn fetch_with_literal_body() {
        let r = parse(b"* 1 FETCH (RFC822 {5}\r\nhello)\r\n");
        match r {
            Response::Data(ResponseData::Fetch { attrs, .. }) => {
                assert_eq!(attrs, vec![MsgAttr::Rfc822(b"hello".to_vec())]);
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn list_response() {
        let r = parse(b"* LIST (\\HasNoChildren) \"/\" \"INBOX\"\r\n");
        match r {
            Response::Data(ResponseData::List { flags, sep, mailbox }) => {
                assert_eq!(flags.extensions, vec!["HasNoChildren"]);
                assert_eq!(sep, Some('/'));
                assert_eq!(mailbox, Mailbox::Inbox);
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn vanished_earlier() {
        let r = parse(b"* VANISHED (EARLIER) 3,5\r\n");
        match r {
            Response::Data(ResponseData::Vanished { earlier, uids }) => {
                assert!(earlier);
                assert_eq!(uids.to_string(), "3,5");
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn xkeysync_responses() {
        let r = parse(b"* XKEYSYNC CREATED {10}\r\n0123456789\r\n");
        assert!(matches!(
            r,
            Response::Data(ResponseData::Xkeysync(XkeySyncResp::Created(_)))
        ));
        let r = parse(b"* XKEYSYNC DELETED aabbccdd\r\n");
        assert!(matches!(
            r,
            Response::Data(ResponseData::Xkeysync(XkeySyncResp::Deleted(_)))
        ));
        let r = parse(b"* XKEYSYNC OK\r\n");
        assert!(matches!(
            r,
            Response::Data(ResponseData::Xkeysync(XkeySyncResp::Ok))
        ));
    }

    #[test]
    fn continuation() {
        let r = parse(b"+ OK\r\n");
        assert!(matches!(r, Response::Plus { .. }));
        let r = parse(b"+ \r\n");
        assert!(matches!(r, Response::Plus { .. }));
    }

    #[test]
    fn enabled() {
        let r = parse(b"* ENABLED CONDSTORE QRESYNC\r\n");
        match r {
            Response::Data(ResponseData::Enabled(capas)) => {
                assert_eq!(capas, vec![Capa::Condstore, Capa::Qresync]);
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn search_with_modseq() {
        let r = parse(b"* SEARCH 2 5 6 (MODSEQ 917162500)\r\n");
        match r {
            Response::Data(ResponseData::Search { nums, modseq }) => {
                assert_eq!(nums, vec![2, 5, 6]);
                assert_eq!(modseq, Some(917162500));
            }
            other => panic!("{other:?}"),
        }
    }
}
