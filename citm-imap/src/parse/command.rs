//! The client-to-server grammar.

use nom::branch::alt;
use nom::bytes::streaming::{tag, tag_no_case};
use nom::combinator::{map, map_res, opt, value};
use nom::multi::{many0, separated_list0, separated_list1};
use nom::sequence::{delimited, pair, preceded, terminated, tuple};
use nom::IResult;

use crate::parse::core::*;
use crate::types::command::{Command, CommandBody, QresyncParam, StatusAttr};
use crate::types::core::IString;
use crate::types::fetch::{
    FetchAttr, FetchMods, FetchSpec, Partial, Section, SectionText, StoreSign,
};
use crate::types::flag::Flags;
use crate::types::search::{ModseqEntry, ModseqEntryKind, SearchKey};

/// `command = tag SP command-body CRLF`
pub fn command(input: &[u8]) -> IResult<&[u8], Command> {
    map(
        terminated(pair(terminated(imap_tag, sp), command_body), crlf),
        |(tag, body)| Command::new(tag, body),
    )(input)
}

/// The bare `DONE` line terminating IDLE or XKEYSYNC.
pub fn done_line(input: &[u8]) -> IResult<&[u8], ()> {
    value((), terminated(tag_no_case(b"DONE"), crlf))(input)
}

fn command_body(input: &[u8]) -> IResult<&[u8], CommandBody> {
    // two alts because nom's tuple-impl caps out at 21 branches
    alt((
        value(CommandBody::Capability, tag_no_case(b"CAPABILITY")),
        value(CommandBody::Noop, tag_no_case(b"NOOP")),
        value(CommandBody::Logout, tag_no_case(b"LOGOUT")),
        value(CommandBody::StartTls, tag_no_case(b"STARTTLS")),
        login,
        select_like,
        map(preceded(tag_no_case(b"CREATE "), mailbox), CommandBody::Create),
        map(preceded(tag_no_case(b"DELETE "), mailbox), CommandBody::Delete),
        rename,
        map(preceded(tag_no_case(b"SUBSCRIBE "), mailbox), CommandBody::Subscribe),
        map(preceded(tag_no_case(b"UNSUBSCRIBE "), mailbox), CommandBody::Unsubscribe),
        list_like,
        status,
        append,
        value(CommandBody::Check, tag_no_case(b"CHECK")),
        value(CommandBody::Close, tag_no_case(b"CLOSE")),
        alt((
            value(CommandBody::Expunge, tag_no_case(b"EXPUNGE")),
            uid_prefixed,
            search(false),
            fetch(false),
            store(false),
            copy(false),
            enable,
            value(CommandBody::Unselect, tag_no_case(b"UNSELECT")),
            value(CommandBody::Idle, tag_no_case(b"IDLE")),
            xkeyadd,
            xkeysync,
        )),
    ))(input)
}

/// `login = "LOGIN" SP userid SP password`
fn login(input: &[u8]) -> IResult<&[u8], CommandBody> {
    map(
        preceded(
            tag_no_case(b"LOGIN "),
            pair(terminated(astring, sp), astring),
        ),
        |(user, pass)| CommandBody::Login { user, pass },
    )(input)
}

/// `rename = "RENAME" SP mailbox SP mailbox`
fn rename(input: &[u8]) -> IResult<&[u8], CommandBody> {
    map(
        preceded(
            tag_no_case(b"RENAME "),
            pair(terminated(mailbox, sp), mailbox),
        ),
        |(from, to)| CommandBody::Rename { from, to },
    )(input)
}

/// `select = "SELECT" SP mailbox [SP "(QRESYNC (" ... "))"]`
fn select_like(input: &[u8]) -> IResult<&[u8], CommandBody> {
    map(
        tuple((
            alt((
                value(true, tag_no_case(b"SELECT ")),
                value(false, tag_no_case(b"EXAMINE ")),
            )),
            mailbox,
            opt(preceded(sp, qresync_param)),
        )),
        |(is_select, mailbox, qresync)| {
            if is_select {
                CommandBody::Select { mailbox, qresync }
            } else {
                CommandBody::Examine { mailbox, qresync }
            }
        },
    )(input)
}

/// `"(QRESYNC (" uidvalidity SP mod-sequence-value
///   [SP known-uids] [SP "(" seq-match-data ")"] "))"`
fn qresync_param(input: &[u8]) -> IResult<&[u8], QresyncParam> {
    map(
        delimited(
            tag_no_case(b"(QRESYNC ("),
            tuple((
                nz_number,
                preceded(sp, number64),
                opt(preceded(sp, seq_set)),
                opt(preceded(
                    sp,
                    delimited(tag(b"("), pair(terminated(seq_set, sp), seq_set), tag(b")")),
                )),
            )),
            tag(b"))"),
        ),
        |(uidvalidity, modseq, known_uids, seq_match)| QresyncParam {
            uidvalidity,
            modseq,
            known_uids,
            seq_match,
        },
    )(input)
}

/// `list = "LIST" SP mailbox SP list-mailbox` (and LSUB)
fn list_like(input: &[u8]) -> IResult<&[u8], CommandBody> {
    map(
        tuple((
            alt((
                value(true, tag_no_case(b"LIST ")),
                value(false, tag_no_case(b"LSUB ")),
            )),
            terminated(mailbox, sp),
            list_mailbox,
        )),
        |(is_list, reference, pattern)| {
            if is_list {
                CommandBody::List { reference, pattern }
            } else {
                CommandBody::Lsub { reference, pattern }
            }
        },
    )(input)
}

fn status_attr(input: &[u8]) -> IResult<&[u8], StatusAttr> {
    alt((
        value(StatusAttr::Messages, tag_no_case(b"MESSAGES")),
        value(StatusAttr::Recent, tag_no_case(b"RECENT")),
        value(StatusAttr::UidNext, tag_no_case(b"UIDNEXT")),
        value(StatusAttr::UidValidity, tag_no_case(b"UIDVALIDITY")),
        value(StatusAttr::Unseen, tag_no_case(b"UNSEEN")),
        value(StatusAttr::HighestModSeq, tag_no_case(b"HIGHESTMODSEQ")),
    ))(input)
}

/// `status = "STATUS" SP mailbox SP "(" status-att *(SP status-att) ")"`
fn status(input: &[u8]) -> IResult<&[u8], CommandBody> {
    map(
        preceded(
            tag_no_case(b"STATUS "),
            pair(
                terminated(mailbox, sp),
                delimited(tag(b"("), separated_list1(sp, status_attr), tag(b")")),
            ),
        ),
        |(mailbox, attrs)| CommandBody::Status { mailbox, attrs },
    )(input)
}

fn flag_list(input: &[u8]) -> IResult<&[u8], Flags> {
    map(
        delimited(tag(b"("), separated_list0(sp, flag), tag(b")")),
        |pairs| {
            let mut flags = Flags::default();
            for (name, backslash) in pairs {
                flags.add(&name, backslash);
            }
            flags
        },
    )(input)
}

/// `append = "APPEND" SP mailbox [SP flag-list] [SP date-time] SP literal`
fn append(input: &[u8]) -> IResult<&[u8], CommandBody> {
    map(
        preceded(
            tag_no_case(b"APPEND "),
            tuple((
                mailbox,
                opt(preceded(sp, flag_list)),
                opt(preceded(sp, date_time)),
                preceded(sp, literal),
            )),
        ),
        |(mailbox, flags, time, message)| CommandBody::Append {
            mailbox,
            flags: flags.unwrap_or_default(),
            time,
            message: message.as_bytes().to_vec(),
        },
    )(input)
}

/// `"UID" SP (copy / fetch / search / store / expunge)`
fn uid_prefixed(input: &[u8]) -> IResult<&[u8], CommandBody> {
    preceded(
        tag_no_case(b"UID "),
        alt((
            map_res(
                preceded(tag_no_case(b"EXPUNGE "), seq_set),
                |set| -> Result<CommandBody, ()> {
                    if set.contains_star() {
                        return Err(());
                    }
                    Ok(CommandBody::UidExpunge(set))
                },
            ),
            search(true),
            fetch(true),
            store(true),
            copy(true),
        )),
    )(input)
}

/// `search = "SEARCH" [SP "CHARSET" SP astring] 1*(SP search-key)`
fn search(uid: bool) -> impl Fn(&[u8]) -> IResult<&[u8], CommandBody> {
    move |input| {
        map(
            preceded(
                tag_no_case(b"SEARCH "),
                pair(
                    opt(terminated(
                        preceded(tag_no_case(b"CHARSET "), astring),
                        sp,
                    )),
                    separated_list1(sp, search_key),
                ),
            ),
            move |(charset, mut keys)| CommandBody::Search {
                uid,
                charset,
                keys: if keys.len() == 1 {
                    keys.remove(0)
                } else {
                    SearchKey::Group(keys)
                },
            },
        )(input)
    }
}

fn search_key(input: &[u8]) -> IResult<&[u8], SearchKey> {
    alt((
        search_key_flags,
        search_key_strings,
        search_key_dates,
        search_key_misc,
    ))(input)
}

fn search_key_flags(input: &[u8]) -> IResult<&[u8], SearchKey> {
    alt((
        value(SearchKey::All, tag_no_case(b"ALL")),
        value(SearchKey::Answered, tag_no_case(b"ANSWERED")),
        value(SearchKey::Deleted, tag_no_case(b"DELETED")),
        value(SearchKey::Flagged, tag_no_case(b"FLAGGED")),
        value(SearchKey::New, tag_no_case(b"NEW")),
        value(SearchKey::Old, tag_no_case(b"OLD")),
        value(SearchKey::Recent, tag_no_case(b"RECENT")),
        value(SearchKey::Unanswered, tag_no_case(b"UNANSWERED")),
        value(SearchKey::Undeleted, tag_no_case(b"UNDELETED")),
        value(SearchKey::Unflagged, tag_no_case(b"UNFLAGGED")),
        value(SearchKey::Unseen, tag_no_case(b"UNSEEN")),
        value(SearchKey::Undraft, tag_no_case(b"UNDRAFT")),
        value(SearchKey::Seen, tag_no_case(b"SEEN")),
        value(SearchKey::Draft, tag_no_case(b"DRAFT")),
    ))(input)
}

fn search_key_strings(input: &[u8]) -> IResult<&[u8], SearchKey> {
    alt((
        map(preceded(tag_no_case(b"BCC "), astring), SearchKey::Bcc),
        map(preceded(tag_no_case(b"BODY "), astring), SearchKey::Body),
        map(preceded(tag_no_case(b"CC "), astring), SearchKey::Cc),
        map(preceded(tag_no_case(b"FROM "), astring), SearchKey::From),
        map(preceded(tag_no_case(b"SUBJECT "), astring), SearchKey::Subject),
        map(preceded(tag_no_case(b"TEXT "), astring), SearchKey::Text),
        map(preceded(tag_no_case(b"TO "), astring), SearchKey::To),
        map(
            preceded(tag_no_case(b"HEADER "), pair(terminated(astring, sp), astring)),
            |(field, value)| SearchKey::Header(field, value),
        ),
        map(preceded(tag_no_case(b"UNKEYWORD "), atom), SearchKey::Unkeyword),
        map(preceded(tag_no_case(b"KEYWORD "), atom), SearchKey::Keyword),
    ))(input)
}

fn search_key_dates(input: &[u8]) -> IResult<&[u8], SearchKey> {
    alt((
        map(preceded(tag_no_case(b"BEFORE "), search_date), SearchKey::Before),
        map(preceded(tag_no_case(b"ON "), search_date), SearchKey::On),
        map(preceded(tag_no_case(b"SINCE "), search_date), SearchKey::Since),
        map(preceded(tag_no_case(b"SENTBEFORE "), search_date), SearchKey::SentBefore),
        map(preceded(tag_no_case(b"SENTON "), search_date), SearchKey::SentOn),
        map(preceded(tag_no_case(b"SENTSINCE "), search_date), SearchKey::SentSince),
    ))(input)
}

fn search_key_misc(input: &[u8]) -> IResult<&[u8], SearchKey> {
    alt((
        map(preceded(tag_no_case(b"LARGER "), number), SearchKey::Larger),
        map(preceded(tag_no_case(b"SMALLER "), number), SearchKey::Smaller),
        map(preceded(tag_no_case(b"UID "), seq_set), SearchKey::Uid),
        map(
            preceded(tag_no_case(b"NOT "), search_key),
            |k| SearchKey::Not(Box::new(k)),
        ),
        map(
            preceded(tag_no_case(b"OR "), pair(terminated(search_key, sp), search_key)),
            |(a, b)| SearchKey::Or(Box::new(a), Box::new(b)),
        ),
        search_modseq,
        map(
            delimited(tag(b"("), separated_list1(sp, search_key), tag(b")")),
            SearchKey::Group,
        ),
        map(seq_set, SearchKey::SeqSet),
    ))(input)
}

/// `search-key =/ "MODSEQ" [SP entry-name SP entry-type-req] SP
///                mod-sequence-valzer`
fn search_modseq(input: &[u8]) -> IResult<&[u8], SearchKey> {
    let entry = map(
        pair(
            terminated(quoted, sp),
            alt((
                value(ModseqEntryKind::Priv, tag_no_case(b"priv")),
                value(ModseqEntryKind::Shared, tag_no_case(b"shared")),
                value(ModseqEntryKind::All, tag_no_case(b"all")),
            )),
        ),
        |(name, kind)| ModseqEntry { name, kind },
    );
    map(
        preceded(
            tag_no_case(b"MODSEQ "),
            pair(opt(terminated(entry, sp)), number64),
        ),
        |(entry, modseq)| SearchKey::Modseq(entry, modseq),
    )(input)
}

fn section_text(input: &[u8]) -> IResult<&[u8], SectionText> {
    let headers = |input| {
        delimited(
            tag(b"("),
            separated_list1(sp, astring),
            tag(b")"),
        )(input)
    };
    alt((
        map(
            preceded(tag_no_case(b"HEADER.FIELDS.NOT "), headers),
            SectionText::HeaderFieldsNot,
        ),
        map(
            preceded(tag_no_case(b"HEADER.FIELDS "), headers),
            SectionText::HeaderFields,
        ),
        value(SectionText::Header, tag_no_case(b"HEADER")),
        value(SectionText::Text, tag_no_case(b"TEXT")),
        value(SectionText::Mime, tag_no_case(b"MIME")),
    ))(input)
}

/// `section = "[" [section-spec] "]"`
pub(crate) fn section(input: &[u8]) -> IResult<&[u8], Section> {
    map(
        delimited(
            tag(b"["),
            opt(alt((
                map(
                    pair(
                        separated_list1(tag(b"."), nz_number),
                        opt(preceded(tag(b"."), section_text)),
                    ),
                    |(part, text)| Section { part, text },
                ),
                map(section_text, |text| Section { part: vec![], text: Some(text) }),
            ))),
            tag(b"]"),
        ),
        Option::unwrap_or_default,
    )(input)
}

fn fetch_attr(input: &[u8]) -> IResult<&[u8], FetchAttr> {
    let partial = map(
        delimited(
            tag(b"<"),
            pair(number, preceded(tag(b"."), nz_number)),
            tag(b">"),
        ),
        |(offset, count)| Partial { offset, count },
    );
    alt((
        value(FetchAttr::Envelope, tag_no_case(b"ENVELOPE")),
        value(FetchAttr::Flags, tag_no_case(b"FLAGS")),
        value(FetchAttr::InternalDate, tag_no_case(b"INTERNALDATE")),
        value(FetchAttr::Rfc822Header, tag_no_case(b"RFC822.HEADER")),
        value(FetchAttr::Rfc822Size, tag_no_case(b"RFC822.SIZE")),
        value(FetchAttr::Rfc822Text, tag_no_case(b"RFC822.TEXT")),
        value(FetchAttr::Rfc822, tag_no_case(b"RFC822")),
        value(FetchAttr::BodyStructure, tag_no_case(b"BODYSTRUCTURE")),
        map(
            tuple((
                alt((
                    value(true, tag_no_case(b"BODY.PEEK")),
                    value(false, tag_no_case(b"BODY")),
                )),
                section,
                opt(partial),
            )),
            |(peek, section, partial)| FetchAttr::BodySection { peek, section, partial },
        ),
        value(FetchAttr::Body, tag_no_case(b"BODY")),
        value(FetchAttr::Uid, tag_no_case(b"UID")),
        value(FetchAttr::ModSeq, tag_no_case(b"MODSEQ")),
    ))(input)
}

/// `fetch = "FETCH" SP sequence-set SP ("ALL" / "FULL" / "FAST" /
///          fetch-att / "(" ... ")") [SP "(" fetch-mod *(SP fetch-mod) ")"]`
fn fetch(uid: bool) -> impl Fn(&[u8]) -> IResult<&[u8], CommandBody> {
    move |input| {
        let spec = alt((
            value(FetchSpec::All, tag_no_case(b"ALL")),
            value(FetchSpec::Full, tag_no_case(b"FULL")),
            value(FetchSpec::Fast, tag_no_case(b"FAST")),
            map(
                delimited(tag(b"("), separated_list1(sp, fetch_attr), tag(b")")),
                FetchSpec::Attrs,
            ),
            map(fetch_attr, |a| FetchSpec::Attrs(vec![a])),
        ));
        let fetch_mod = alt((
            map(
                preceded(tag_no_case(b"CHANGEDSINCE "), number64),
                FetchModArg::ChangedSince,
            ),
            value(FetchModArg::Vanished, tag_no_case(b"VANISHED")),
        ));
        map(
            preceded(
                tag_no_case(b"FETCH "),
                tuple((
                    terminated(seq_set, sp),
                    spec,
                    opt(preceded(
                        sp,
                        delimited(tag(b"("), separated_list1(sp, fetch_mod), tag(b")")),
                    )),
                )),
            ),
            move |(set, spec, mod_args)| {
                let mut mods = FetchMods::default();
                for m in mod_args.into_iter().flatten() {
                    match m {
                        FetchModArg::ChangedSince(n) => mods.changedsince = Some(n),
                        FetchModArg::Vanished => mods.vanished = true,
                    }
                }
                CommandBody::Fetch { uid, set, spec, mods }
            },
        )(input)
    }
}

#[derive(Clone)]
enum FetchModArg {
    ChangedSince(u64),
    Vanished,
}

/// `store = "STORE" SP sequence-set [SP "(UNCHANGEDSINCE" SP n ")"] SP
///          store-att-flags`
fn store(uid: bool) -> impl Fn(&[u8]) -> IResult<&[u8], CommandBody> {
    move |input| {
        let sign = alt((
            value(StoreSign::Add, tag(b"+")),
            value(StoreSign::Remove, tag(b"-")),
        ));
        map(
            preceded(
                tag_no_case(b"STORE "),
                tuple((
                    seq_set,
                    opt(preceded(
                        sp,
                        delimited(
                            tag_no_case(b"(UNCHANGEDSINCE "),
                            number64,
                            tag(b")"),
                        ),
                    )),
                    preceded(sp, opt(sign)),
                    tag_no_case(b"FLAGS"),
                    map(opt(tag_no_case(b".SILENT")), |s| s.is_some()),
                    preceded(sp, alt((flag_list, bare_flags))),
                )),
            ),
            move |(set, unchangedsince, sign, _, silent, flags)| CommandBody::Store {
                uid,
                set,
                unchangedsince,
                sign: sign.unwrap_or(StoreSign::Replace),
                silent,
                flags,
            },
        )(input)
    }
}

fn bare_flags(input: &[u8]) -> IResult<&[u8], Flags> {
    map(separated_list1(sp, flag), |pairs| {
        let mut flags = Flags::default();
        for (name, backslash) in pairs {
            flags.add(&name, backslash);
        }
        flags
    })(input)
}

/// `copy = "COPY" SP sequence-set SP mailbox`
fn copy(uid: bool) -> impl Fn(&[u8]) -> IResult<&[u8], CommandBody> {
    move |input| {
        map(
            preceded(
                tag_no_case(b"COPY "),
                pair(terminated(seq_set, sp), mailbox),
            ),
            move |(set, mailbox)| CommandBody::Copy { uid, set, mailbox },
        )(input)
    }
}

/// `enable = "ENABLE" 1*(SP capability)`
fn enable(input: &[u8]) -> IResult<&[u8], CommandBody> {
    map(
        preceded(tag_no_case(b"ENABLE "), separated_list1(sp, atom)),
        CommandBody::Enable,
    )(input)
}

/// `xkeysync = "XKEYSYNC" *(SP fingerprint)`
fn xkeysync(input: &[u8]) -> IResult<&[u8], CommandBody> {
    map(
        preceded(
            tag_no_case(b"XKEYSYNC"),
            many0(preceded(sp, map(atom, IString::Atom))),
        ),
        CommandBody::XkeySync,
    )(input)
}

/// `xkeyadd = "XKEYADD" SP literal`
fn xkeyadd(input: &[u8]) -> IResult<&[u8], CommandBody> {
    map(preceded(tag_no_case(b"XKEYADD "), astring), CommandBody::XkeyAdd)(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::mailbox::Mailbox;

    fn parse(line: &[u8]) -> Command {
        let (rest, cmd) = command(line).expect("parse");
        assert!(rest.is_empty(), "unparsed: {rest:?}");
        cmd
    }

    #[test]
    fn simple_commands() {
        assert_eq!(parse(b"a1 CAPABILITY\r\n").body, CommandBody::Capability);
        assert_eq!(parse(b"a2 NOOP\r\n").body, CommandBody::Noop);
        assert_eq!(parse(b"a3 CLOSE\r\n").body, CommandBody::Close);
        assert_eq!(parse(b"a4 IDLE\r\n").body, CommandBody::Idle);
    }

    #[test]
    fn login_forms() {
        let cmd = parse(b"a1 LOGIN alice \"pass word\"\r\n");
        match cmd.body {
            CommandBody::Login { user, pass } => {
                assert_eq!(user.as_bytes(), b"alice");
                assert_eq!(pass.as_bytes(), b"pass word");
            }
            other => panic!("{other:?}"),
        }
        let cmd = parse(b"a2 LOGIN {5}\r\nalice {2}\r\npw\r\n");
        match cmd.body {
            CommandBody::Login { user, pass } => {
                assert_eq!(user.as_bytes(), b"alice");
                assert_eq!(pass.as_bytes(), b"pw");
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn select_with_qresync() {
        let cmd = parse(b"a1 SELECT INBOX (QRESYNC (67890007 20050715194045000 41,43:211))\r\n");
        match cmd.body {
            CommandBody::Select { mailbox, qresync } => {
                assert_eq!(mailbox, Mailbox::Inbox);
                let q = qresync.unwrap();
                assert_eq!(q.uidvalidity, 67890007);
                assert_eq!(q.modseq, 20050715194045000);
                assert_eq!(q.known_uids.unwrap().to_string(), "41,43:211");
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn append_with_flags_and_literal() {
        let cmd = parse(b"a1 APPEND saved (\\Seen) {11}\r\nhello world\r\n");
        match cmd.body {
            CommandBody::Append { mailbox, flags, message, .. } => {
                assert_eq!(mailbox, Mailbox::from("saved"));
                assert!(flags.seen);
                assert_eq!(message, b"hello world");
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn uid_fetch_with_mods() {
        let cmd = parse(b"a1 UID FETCH 1:* (FLAGS) (CHANGEDSINCE 7 VANISHED)\r\n");
        match cmd.body {
            CommandBody::Fetch { uid, set, mods, .. } => {
                assert!(uid);
                assert_eq!(set.to_string(), "1:*");
                assert_eq!(mods.changedsince, Some(7));
                assert!(mods.vanished);
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn store_variants() {
        let cmd = parse(b"a1 STORE 1:3 +FLAGS.SILENT (\\Deleted)\r\n");
        match cmd.body {
            CommandBody::Store { sign, silent, flags, .. } => {
                assert_eq!(sign, StoreSign::Add);
                assert!(silent);
                assert!(flags.deleted);
            }
            other => panic!("{other:?}"),
        }
        let cmd = parse(b"a2 UID STORE 5 (UNCHANGEDSINCE 12) FLAGS \\Seen\r\n");
        match cmd.body {
            CommandBody::Store { uid, unchangedsince, sign, flags, .. } => {
                assert!(uid);
                assert_eq!(unchangedsince, Some(12));
                assert_eq!(sign, StoreSign::Replace);
                assert!(flags.seen);
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn uid_expunge_needs_a_set() {
        let cmd = parse(b"a1 UID EXPUNGE 4:7\r\n");
        assert!(matches!(cmd.body, CommandBody::UidExpunge(_)));
        // a '*' in a UID set is refused
        assert!(command(b"a2 UID EXPUNGE 4:*\r\n").is_err());
    }

    #[test]
    fn search_keys() {
        let cmd = parse(b"a1 SEARCH UNSEEN FROM \"alice\" OR SMALLER 500 LARGER 100\r\n");
        match cmd.body {
            CommandBody::Search { keys: SearchKey::Group(keys), .. } => {
                assert_eq!(keys.len(), 3);
                assert!(matches!(keys[2], SearchKey::Or(..)));
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn xkey_commands() {
        let cmd = parse(b"a1 XKEYSYNC aabbcc ddeeff\r\n");
        match cmd.body {
            CommandBody::XkeySync(fprs) => assert_eq!(fprs.len(), 2),
            other => panic!("{other:?}"),
        }
        assert!(matches!(
            parse(b"a2 XKEYSYNC\r\n").body,
            CommandBody::XkeySync(ref v) if v.is_empty()
        ));
        let cmd = parse(b"a3 XKEYADD {14}\r\n-----BEGIN----\r\n");
        assert!(matches!(cmd.body, CommandBody::XkeyAdd(_)));
    }

    #[test]
    fn done_is_its_own_line() {
        assert!(done_line(b"DONE\r\n").is_ok());
        assert!(done_line(b"a1 DONE\r\n").is_err());
    }

    #[test]
    fn body_sections() {
        let cmd = parse(b"a1 FETCH 1 BODY.PEEK[HEADER.FIELDS (From Subject)]\r\n");
        match cmd.body {
            CommandBody::Fetch { spec: FetchSpec::Attrs(attrs), .. } => {
                match &attrs[0] {
                    FetchAttr::BodySection { peek, section, .. } => {
                        assert!(*peek);
                        assert!(matches!(
                            section.text,
                            Some(SectionText::HeaderFields(ref f)) if f.len() == 2
                        ));
                    }
                    other => panic!("{other:?}"),
                }
            }
            other => panic!("{other:?}"),
        }
    }
}
