use crate::extensions::Ext;
use crate::types::core::{IString, NString, Tag};
use crate::types::datetime::ImapTime;
use crate::types::fetch::Section;
use crate::types::flag::{FetchFlags, Flags, MailboxFlags, PermFlags};
use crate::types::mailbox::Mailbox;
use crate::types::sequence::SeqSet;

/// A capability token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capa {
    Imap4rev1,
    Uidplus,
    Enable,
    Condstore,
    Qresync,
    Unselect,
    Idle,
    LiteralPlus,
    Xkey,
    Other(String),
}

impl Capa {
    pub fn token(&self) -> &str {
        match self {
            Capa::Imap4rev1 => "IMAP4rev1",
            Capa::Uidplus => "UIDPLUS",
            Capa::Enable => "ENABLE",
            Capa::Condstore => "CONDSTORE",
            Capa::Qresync => "QRESYNC",
            Capa::Unselect => "UNSELECT",
            Capa::Idle => "IDLE",
            Capa::LiteralPlus => "LITERAL+",
            Capa::Xkey => "XKEY",
            Capa::Other(s) => s,
        }
    }

    pub fn from_token(s: &str) -> Capa {
        if s.eq_ignore_ascii_case("IMAP4rev1") {
            Capa::Imap4rev1
        } else if s.eq_ignore_ascii_case("UIDPLUS") {
            Capa::Uidplus
        } else if s.eq_ignore_ascii_case("ENABLE") {
            Capa::Enable
        } else if s.eq_ignore_ascii_case("CONDSTORE") {
            Capa::Condstore
        } else if s.eq_ignore_ascii_case("QRESYNC") {
            Capa::Qresync
        } else if s.eq_ignore_ascii_case("UNSELECT") {
            Capa::Unselect
        } else if s.eq_ignore_ascii_case("IDLE") {
            Capa::Idle
        } else if s.eq_ignore_ascii_case("LITERAL+") {
            Capa::LiteralPlus
        } else if s.eq_ignore_ascii_case("XKEY") {
            Capa::Xkey
        } else {
            Capa::Other(s.to_string())
        }
    }

    pub fn to_ext(&self) -> Option<Ext> {
        match self {
            Capa::Uidplus => Some(Ext::Uidplus),
            Capa::Enable => Some(Ext::Enable),
            Capa::Condstore => Some(Ext::Condstore),
            Capa::Qresync => Some(Ext::Qresync),
            Capa::Unselect => Some(Ext::Unselect),
            Capa::Idle => Some(Ext::Idle),
            Capa::LiteralPlus => Some(Ext::LiteralPlus),
            Capa::Xkey => Some(Ext::Xkey),
            _ => None,
        }
    }
}

/// A status-type response's severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Ok,
    No,
    Bad,
    Preauth,
    Bye,
}

impl StatusKind {
    pub fn token(self) -> &'static str {
        match self {
            StatusKind::Ok => "OK",
            StatusKind::No => "NO",
            StatusKind::Bad => "BAD",
            StatusKind::Preauth => "PREAUTH",
            StatusKind::Bye => "BYE",
        }
    }
}

/// A `[...]` status code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Code {
    Alert,
    Parse,
    Capability(Vec<Capa>),
    PermanentFlags(PermFlags),
    ReadOnly,
    ReadWrite,
    TryCreate,
    UidNext(u32),
    UidValidity(u32),
    Unseen(u32),
    /// UIDPLUS: `APPENDUID uidvalidity uid`.
    AppendUid { uidvalidity: u32, uid: u32 },
    /// UIDPLUS: `COPYUID uidvalidity src-uids dst-uids`.
    CopyUid {
        uidvalidity: u32,
        src: SeqSet,
        dst: SeqSet,
    },
    /// CONDSTORE.
    NoModSeq,
    HighestModSeq(u64),
    Modified(SeqSet),
    /// QRESYNC: boundary between old- and new-mailbox responses.
    Closed,
    /// Unrecognized code, kept verbatim.
    Atom { name: String, text: Option<String> },
}

impl Code {
    pub fn required_ext(&self) -> Option<Ext> {
        match self {
            Code::AppendUid { .. } | Code::CopyUid { .. } => Some(Ext::Uidplus),
            Code::NoModSeq | Code::HighestModSeq(_) | Code::Modified(_) => Some(Ext::Condstore),
            Code::Closed => Some(Ext::Qresync),
            _ => None,
        }
    }
}

/// A tagged or untagged status-type response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseStatus {
    pub tag: Option<Tag>,
    pub kind: StatusKind,
    pub code: Option<Code>,
    pub text: String,
}

impl ResponseStatus {
    pub fn ok(tag: Option<Tag>, code: Option<Code>, text: impl Into<String>) -> ResponseStatus {
        ResponseStatus { tag, kind: StatusKind::Ok, code, text: text.into() }
    }

    pub fn no(tag: Option<Tag>, code: Option<Code>, text: impl Into<String>) -> ResponseStatus {
        ResponseStatus { tag, kind: StatusKind::No, code, text: text.into() }
    }

    pub fn bad(tag: Option<Tag>, code: Option<Code>, text: impl Into<String>) -> ResponseStatus {
        ResponseStatus { tag, kind: StatusKind::Bad, code, text: text.into() }
    }

    pub fn bye(text: impl Into<String>) -> ResponseStatus {
        ResponseStatus { tag: None, kind: StatusKind::Bye, code: None, text: text.into() }
    }
}

/// One STATUS response attribute-value pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusAttrValue {
    Messages(u32),
    Recent(u32),
    UidNext(u32),
    UidValidity(u32),
    Unseen(u32),
    HighestModSeq(u64),
}

/// Minimal single-part BODYSTRUCTURE, enough for the clients we front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyStructure {
    pub content_type: IString,
    pub subtype: IString,
    pub params: Vec<(IString, IString)>,
    pub id: NString,
    pub description: NString,
    pub encoding: IString,
    pub size: u32,
    /// Present for text/* parts.
    pub lines: Option<u32>,
}

/// One FETCH response attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MsgAttr {
    Flags(FetchFlags),
    Uid(u32),
    InternalDate(ImapTime),
    Rfc822Size(u32),
    ModSeq(u64),
    /// `RFC822 {N}...` — the whole message.
    Rfc822(Vec<u8>),
    BodySection {
        section: Section,
        origin: Option<u32>,
        data: Option<Vec<u8>>,
    },
    BodyStructure(BodyStructure),
}

/// XKEYSYNC streaming responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XkeySyncResp {
    /// `* XKEYSYNC CREATED {N}<pem>`.
    Created(IString),
    /// `* XKEYSYNC DELETED <fpr>`.
    Deleted(IString),
    /// `* XKEYSYNC OK` — the stream is being shut down.
    Ok,
}

/// An untagged data response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseData {
    Capability(Vec<Capa>),
    List {
        flags: MailboxFlags,
        sep: Option<char>,
        mailbox: Mailbox,
    },
    Lsub {
        flags: MailboxFlags,
        sep: Option<char>,
        mailbox: Mailbox,
    },
    Status {
        mailbox: Mailbox,
        attrs: Vec<StatusAttrValue>,
    },
    Flags(Flags),
    Exists(u32),
    Recent(u32),
    Expunge(u32),
    Fetch {
        num: u32,
        attrs: Vec<MsgAttr>,
    },
    Search {
        nums: Vec<u32>,
        /// CONDSTORE: trailing `(MODSEQ n)`.
        modseq: Option<u64>,
    },
    Enabled(Vec<Capa>),
    /// QRESYNC: `VANISHED [(EARLIER)] uids`.
    Vanished {
        earlier: bool,
        uids: SeqSet,
    },
    Xkeysync(XkeySyncResp),
}

/// Any server-to-client message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Status(ResponseStatus),
    Data(ResponseData),
    /// `+` continuation; always untagged.
    Plus { code: Option<Code>, text: String },
}

impl Response {
    /// Extensions this response's constructs require, for gating.
    pub fn required_exts(&self) -> Vec<Ext> {
        let mut out = Vec::new();
        match self {
            Response::Status(st) => {
                if let Some(code) = &st.code {
                    if let Some(ext) = code.required_ext() {
                        out.push(ext);
                    }
                }
            }
            Response::Data(ResponseData::Enabled(_)) => out.push(Ext::Enable),
            Response::Data(ResponseData::Vanished { .. }) => out.push(Ext::Qresync),
            Response::Data(ResponseData::Xkeysync(_)) => out.push(Ext::Xkey),
            Response::Data(ResponseData::Fetch { attrs, .. }) => {
                if attrs.iter().any(|a| matches!(a, MsgAttr::ModSeq(_))) {
                    out.push(Ext::Condstore);
                }
            }
            Response::Data(ResponseData::Status { attrs, .. }) => {
                if attrs
                    .iter()
                    .any(|a| matches!(a, StatusAttrValue::HighestModSeq(_)))
                {
                    out.push(Ext::Condstore);
                }
            }
            Response::Data(ResponseData::Search { modseq: Some(_), .. }) => {
                out.push(Ext::Condstore)
            }
            _ => {}
        }
        out
    }

    /// The tag, if this is a tagged status response.
    pub fn tag(&self) -> Option<&Tag> {
        match self {
            Response::Status(st) => st.tag.as_ref(),
            _ => None,
        }
    }
}
