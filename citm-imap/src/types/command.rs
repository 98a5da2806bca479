use crate::error::ImapError;
use crate::extensions::Ext;
use crate::types::core::{IString, Tag};
use crate::types::datetime::ImapTime;
use crate::types::fetch::{FetchMods, FetchSpec, StoreSign};
use crate::types::flag::Flags;
use crate::types::mailbox::Mailbox;
use crate::types::search::SearchKey;
use crate::types::sequence::SeqSet;

/// STATUS attributes a client may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusAttr {
    Messages,
    Recent,
    UidNext,
    UidValidity,
    Unseen,
    HighestModSeq,
}

/// QRESYNC parameter to SELECT/EXAMINE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QresyncParam {
    pub uidvalidity: u32,
    pub modseq: u64,
    pub known_uids: Option<SeqSet>,
    /// `(known-sequence-set known-uid-set)`
    pub seq_match: Option<(SeqSet, SeqSet)>,
}

/// One complete client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub tag: Tag,
    pub body: CommandBody,
}

impl Command {
    pub fn new(tag: Tag, body: CommandBody) -> Command {
        Command { tag, body }
    }

    /// Cross-field invariants that the type system does not carry.
    pub fn validate(&self) -> Result<(), ImapError> {
        match &self.body {
            CommandBody::Fetch { uid, mods, .. } => mods.validate(*uid),
            _ => Ok(()),
        }
    }

    /// Extensions this command's constructs require, for gating.
    pub fn required_exts(&self) -> Vec<Ext> {
        let mut out = Vec::new();
        match &self.body {
            CommandBody::Enable(_) => out.push(Ext::Enable),
            CommandBody::UidExpunge(_) => out.push(Ext::Uidplus),
            CommandBody::Unselect => out.push(Ext::Unselect),
            CommandBody::Idle | CommandBody::IdleDone => out.push(Ext::Idle),
            CommandBody::XkeySync(_) | CommandBody::XkeySyncDone | CommandBody::XkeyAdd(_) => {
                out.push(Ext::Xkey)
            }
            CommandBody::Select { qresync: Some(_), .. }
            | CommandBody::Examine { qresync: Some(_), .. } => out.push(Ext::Qresync),
            CommandBody::Fetch { mods, .. } => {
                if mods.changedsince.is_some() {
                    out.push(Ext::Condstore);
                }
                if mods.vanished {
                    out.push(Ext::Qresync);
                }
            }
            CommandBody::Store { unchangedsince, .. } => {
                if unchangedsince.is_some() {
                    out.push(Ext::Condstore);
                }
            }
            CommandBody::Status { attrs, .. } => {
                if attrs.contains(&StatusAttr::HighestModSeq) {
                    out.push(Ext::Condstore);
                }
            }
            CommandBody::Search { keys, .. } => {
                if search_uses_modseq(keys) {
                    out.push(Ext::Condstore);
                }
            }
            _ => {}
        }
        out
    }
}

fn search_uses_modseq(key: &SearchKey) -> bool {
    match key {
        SearchKey::Modseq(..) => true,
        SearchKey::Not(k) => search_uses_modseq(k),
        SearchKey::Or(a, b) => search_uses_modseq(a) || search_uses_modseq(b),
        SearchKey::Group(ks) => ks.iter().any(search_uses_modseq),
        _ => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandBody {
    Capability,
    Noop,
    Logout,
    StartTls,
    Login {
        user: IString,
        pass: IString,
    },
    Select {
        mailbox: Mailbox,
        qresync: Option<QresyncParam>,
    },
    Examine {
        mailbox: Mailbox,
        qresync: Option<QresyncParam>,
    },
    Create(Mailbox),
    Delete(Mailbox),
    Rename {
        from: Mailbox,
        to: Mailbox,
    },
    Subscribe(Mailbox),
    Unsubscribe(Mailbox),
    List {
        reference: Mailbox,
        pattern: IString,
    },
    Lsub {
        reference: Mailbox,
        pattern: IString,
    },
    Status {
        mailbox: Mailbox,
        attrs: Vec<StatusAttr>,
    },
    Append {
        mailbox: Mailbox,
        flags: Flags,
        time: Option<ImapTime>,
        message: Vec<u8>,
    },
    Check,
    Close,
    /// EXPUNGE carries no set; the UIDPLUS form is [`CommandBody::UidExpunge`].
    Expunge,
    /// UID EXPUNGE; the set is nonempty by construction.
    UidExpunge(SeqSet),
    Search {
        uid: bool,
        charset: Option<IString>,
        keys: SearchKey,
    },
    Fetch {
        uid: bool,
        set: SeqSet,
        spec: FetchSpec,
        mods: FetchMods,
    },
    Store {
        uid: bool,
        set: SeqSet,
        unchangedsince: Option<u64>,
        sign: StoreSign,
        silent: bool,
        flags: Flags,
    },
    Copy {
        uid: bool,
        set: SeqSet,
        mailbox: Mailbox,
    },
    Enable(Vec<String>),
    Unselect,
    Idle,
    /// The bare `DONE` line terminating IDLE (and XKEYSYNC).
    IdleDone,
    /// XKEYSYNC with the already-known fingerprints.
    XkeySync(Vec<IString>),
    XkeySyncDone,
    /// XKEYADD with the PEM of the key to publish.
    XkeyAdd(IString),
}

impl CommandBody {
    /// Human name for logs and error text.
    pub fn name(&self) -> &'static str {
        match self {
            CommandBody::Capability => "CAPABILITY",
            CommandBody::Noop => "NOOP",
            CommandBody::Logout => "LOGOUT",
            CommandBody::StartTls => "STARTTLS",
            CommandBody::Login { .. } => "LOGIN",
            CommandBody::Select { .. } => "SELECT",
            CommandBody::Examine { .. } => "EXAMINE",
            CommandBody::Create(_) => "CREATE",
            CommandBody::Delete(_) => "DELETE",
            CommandBody::Rename { .. } => "RENAME",
            CommandBody::Subscribe(_) => "SUBSCRIBE",
            CommandBody::Unsubscribe(_) => "UNSUBSCRIBE",
            CommandBody::List { .. } => "LIST",
            CommandBody::Lsub { .. } => "LSUB",
            CommandBody::Status { .. } => "STATUS",
            CommandBody::Append { .. } => "APPEND",
            CommandBody::Check => "CHECK",
            CommandBody::Close => "CLOSE",
            CommandBody::Expunge => "EXPUNGE",
            CommandBody::UidExpunge(_) => "UID EXPUNGE",
            CommandBody::Search { .. } => "SEARCH",
            CommandBody::Fetch { .. } => "FETCH",
            CommandBody::Store { .. } => "STORE",
            CommandBody::Copy { .. } => "COPY",
            CommandBody::Enable(_) => "ENABLE",
            CommandBody::Unselect => "UNSELECT",
            CommandBody::Idle => "IDLE",
            CommandBody::IdleDone => "DONE",
            CommandBody::XkeySync(_) => "XKEYSYNC",
            CommandBody::XkeySyncDone => "DONE",
            CommandBody::XkeyAdd(_) => "XKEYADD",
        }
    }
}
