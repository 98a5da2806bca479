//! Restartable writer.
//!
//! `write_command`/`write_response` regenerate the full wire form of a
//! message on every call, suppress the first `skip` bytes, and fill the
//! caller's buffer.  The caller loops, passing back the returned `skip`,
//! until `want` reaches zero; a single large message can stream across
//! many small network writes without ever being serialized whole.
//!
//! Commands always use LITERAL+ (`{N+}`) because commands are produced
//! by us and the round trip for a synchronizing literal is pure waste;
//! responses use bare `{N}` literals.

use crate::error::ImapError;
use crate::extensions::Extensions;
use crate::types::command::{Command, CommandBody, QresyncParam, StatusAttr};
use crate::types::core::{is_atom_char, is_text_char, IString};
use crate::types::datetime::ImapTime;
use crate::types::fetch::{FetchAttr, FetchSpec, Partial, Section, SectionText, StoreSign};
use crate::types::flag::{FetchFlags, Flags, MailboxFlags, PermFlags};
use crate::types::mailbox::Mailbox;
use crate::types::response::{
    BodyStructure, Capa, Code, MsgAttr, Response, ResponseData, ResponseStatus, StatusAttrValue,
    XkeySyncResp,
};
use crate::types::search::{ModseqEntryKind, SearchKey};
use crate::types::sequence::SeqSet;

/// Progress of one restartable write call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteStatus {
    /// Bytes placed in the caller's buffer by this call.
    pub written: usize,
    /// Total bytes emitted so far; pass back in as `skip` next call.
    pub skip: usize,
    /// Bytes that remain after this call; zero means the message is out.
    pub want: usize,
}

/// Serialize a command into `buf`, resuming after `skip` bytes.
pub fn write_command(
    cmd: &Command,
    exts: &Extensions,
    buf: &mut [u8],
    skip: usize,
) -> Result<WriteStatus, ImapError> {
    for ext in cmd.required_exts() {
        exts.assert_available(ext)?;
    }
    cmd.validate()?;
    let mut sink = Sink::new(buf, skip);
    emit_command(&mut sink, cmd)?;
    Ok(sink.status(skip))
}

/// Serialize a response into `buf`, resuming after `skip` bytes.
pub fn write_response(
    resp: &Response,
    exts: &Extensions,
    buf: &mut [u8],
    skip: usize,
) -> Result<WriteStatus, ImapError> {
    for ext in resp.required_exts() {
        exts.assert_available(ext)?;
    }
    let mut sink = Sink::new(buf, skip);
    emit_response(&mut sink, resp)?;
    Ok(sink.status(skip))
}

/// Convenience: the whole wire form at once.
pub fn command_to_vec(cmd: &Command, exts: &Extensions) -> Result<Vec<u8>, ImapError> {
    to_vec(|buf, skip| write_command(cmd, exts, buf, skip))
}

/// Convenience: the whole wire form at once.
pub fn response_to_vec(resp: &Response, exts: &Extensions) -> Result<Vec<u8>, ImapError> {
    to_vec(|buf, skip| write_response(resp, exts, buf, skip))
}

fn to_vec(
    mut write: impl FnMut(&mut [u8], usize) -> Result<WriteStatus, ImapError>,
) -> Result<Vec<u8>, ImapError> {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    let mut skip = 0;
    loop {
        let st = write(&mut buf, skip)?;
        out.extend_from_slice(&buf[..st.written]);
        skip = st.skip;
        if st.want == 0 {
            return Ok(out);
        }
    }
}

// ---- the sink ----

struct Sink<'a> {
    out: &'a mut [u8],
    skip: usize,
    written: usize,
    want: usize,
}

impl<'a> Sink<'a> {
    fn new(out: &'a mut [u8], skip: usize) -> Sink<'a> {
        Sink { out, skip, written: 0, want: 0 }
    }

    fn put(&mut self, bytes: &[u8]) {
        let mut b = bytes;
        if self.skip > 0 {
            let n = self.skip.min(b.len());
            self.skip -= n;
            b = &b[n..];
        }
        if b.is_empty() {
            return;
        }
        let cap = self.out.len() - self.written;
        let n = cap.min(b.len());
        self.out[self.written..self.written + n].copy_from_slice(&b[..n]);
        self.written += n;
        self.want += b.len() - n;
    }

    fn put_str(&mut self, s: &str) {
        self.put(s.as_bytes());
    }

    fn put_u32(&mut self, n: u32) {
        self.put_str(&n.to_string());
    }

    fn put_u64(&mut self, n: u64) {
        self.put_str(&n.to_string());
    }

    fn status(&self, skip_in: usize) -> WriteStatus {
        WriteStatus {
            written: self.written,
            skip: skip_in + self.written,
            want: self.want,
        }
    }
}

// ---- shared emitters ----

fn emit_istring(s: &mut Sink<'_>, is: &IString, cmd_mode: bool) {
    let bytes = is.as_bytes();
    match IString::classify(bytes) {
        IString::Atom(a) => s.put_str(&a),
        IString::Quoted(q) => {
            s.put(b"\"");
            for &b in q.as_bytes() {
                if b == b'"' || b == b'\\' {
                    s.put(b"\\");
                }
                s.put(&[b]);
            }
            s.put(b"\"");
        }
        IString::Literal(v) => {
            emit_literal(s, &v, cmd_mode);
        }
    }
}

fn emit_literal(s: &mut Sink<'_>, bytes: &[u8], cmd_mode: bool) {
    s.put(b"{");
    s.put_str(&bytes.len().to_string());
    if cmd_mode {
        s.put(b"+");
    }
    s.put(b"}\r\n");
    s.put(bytes);
}

fn emit_mailbox(s: &mut Sink<'_>, mbx: &Mailbox, cmd_mode: bool) {
    match mbx {
        Mailbox::Inbox => s.put(b"INBOX"),
        Mailbox::Other(name) => emit_istring(s, name, cmd_mode),
    }
}

fn validate_atom(name: &str, what: &'static str) -> Result<(), ImapError> {
    if name.is_empty() || !name.bytes().all(is_atom_char) {
        return Err(ImapError::Param(format!("invalid {what}: {name:?}")));
    }
    Ok(())
}

/// A `uid-set` slot (UID EXPUNGE, COPYUID, QRESYNC known-uids,
/// VANISHED) must not contain `*`; plain sequence-set arguments of UID
/// FETCH/STORE/COPY may.
fn validate_uid_set(set: &SeqSet) -> Result<(), ImapError> {
    if set.contains_star() {
        return Err(ImapError::Value("'*' in a UID sequence set".into()));
    }
    Ok(())
}

fn emit_seq_set(s: &mut Sink<'_>, set: &SeqSet) {
    s.put_str(&set.to_string());
}

fn emit_time(s: &mut Sink<'_>, t: &ImapTime) -> Result<(), ImapError> {
    t.validate()?;
    let sign = if t.z_hour < 0 { '-' } else { '+' };
    s.put_str(&format!(
        "\"{:2}-{}-{:04} {:02}:{:02}:{:02} {}{:02}{:02}\"",
        t.day,
        t.month_name(),
        t.year,
        t.hour,
        t.min,
        t.sec,
        sign,
        t.z_hour.abs(),
        t.z_min,
    ));
    Ok(())
}

fn emit_flag_names(
    s: &mut Sink<'_>,
    system: &[(&str, bool)],
    keywords: &[String],
    extensions: &[String],
) -> Result<(), ImapError> {
    let mut first = true;
    let mut space = |s: &mut Sink<'_>| {
        if first {
            first = false;
        } else {
            s.put(b" ");
        }
    };
    for (name, on) in system {
        if *on {
            space(s);
            s.put(b"\\");
            s.put_str(name);
        }
    }
    for kw in keywords {
        validate_atom(kw, "keyword flag")?;
        space(s);
        s.put_str(kw);
    }
    for ext in extensions {
        validate_atom(ext, "extension flag")?;
        space(s);
        s.put(b"\\");
        s.put_str(ext);
    }
    Ok(())
}

fn emit_flags(s: &mut Sink<'_>, f: &Flags) -> Result<(), ImapError> {
    s.put(b"(");
    emit_flag_names(
        s,
        &[
            ("Answered", f.answered),
            ("Flagged", f.flagged),
            ("Deleted", f.deleted),
            ("Seen", f.seen),
            ("Draft", f.draft),
        ],
        &f.keywords,
        &f.extensions,
    )?;
    s.put(b")");
    Ok(())
}

fn emit_fetch_flags(s: &mut Sink<'_>, f: &FetchFlags) -> Result<(), ImapError> {
    s.put(b"(");
    emit_flag_names(
        s,
        &[
            ("Answered", f.answered),
            ("Flagged", f.flagged),
            ("Deleted", f.deleted),
            ("Seen", f.seen),
            ("Draft", f.draft),
            ("Recent", f.recent),
        ],
        &f.keywords,
        &f.extensions,
    )?;
    s.put(b")");
    Ok(())
}

fn emit_perm_flags(s: &mut Sink<'_>, f: &PermFlags) -> Result<(), ImapError> {
    s.put(b"(");
    emit_flag_names(
        s,
        &[
            ("Answered", f.answered),
            ("Flagged", f.flagged),
            ("Deleted", f.deleted),
            ("Seen", f.seen),
            ("Draft", f.draft),
            ("*", f.asterisk),
        ],
        &f.keywords,
        &f.extensions,
    )?;
    s.put(b")");
    Ok(())
}

fn emit_mailbox_flags(s: &mut Sink<'_>, f: &MailboxFlags) -> Result<(), ImapError> {
    s.put(b"(");
    let system: Vec<(&str, bool)> = vec![
        ("Noinferiors", f.noinferiors),
        ("Noselect", f.noselect),
        ("Marked", f.marked),
        ("Unmarked", f.unmarked),
    ];
    emit_flag_names(s, &system, &[], &f.extensions)?;
    s.put(b")");
    Ok(())
}

// ---- command emission ----

fn emit_command(s: &mut Sink<'_>, cmd: &Command) -> Result<(), ImapError> {
    // DONE terminates IDLE/XKEYSYNC and is never tagged
    if matches!(cmd.body, CommandBody::IdleDone | CommandBody::XkeySyncDone) {
        s.put(b"DONE\r\n");
        return Ok(());
    }
    s.put_str(cmd.tag.as_str());
    s.put(b" ");
    emit_command_body(s, &cmd.body)?;
    s.put(b"\r\n");
    Ok(())
}

fn emit_command_body(s: &mut Sink<'_>, body: &CommandBody) -> Result<(), ImapError> {
    match body {
        CommandBody::Capability => s.put(b"CAPABILITY"),
        CommandBody::Noop => s.put(b"NOOP"),
        CommandBody::Logout => s.put(b"LOGOUT"),
        CommandBody::StartTls => s.put(b"STARTTLS"),
        CommandBody::Check => s.put(b"CHECK"),
        CommandBody::Close => s.put(b"CLOSE"),
        CommandBody::Expunge => s.put(b"EXPUNGE"),
        CommandBody::Unselect => s.put(b"UNSELECT"),
        CommandBody::Idle => s.put(b"IDLE"),
        CommandBody::IdleDone | CommandBody::XkeySyncDone => unreachable!("handled by caller"),
        CommandBody::Login { user, pass } => {
            s.put(b"LOGIN ");
            emit_istring(s, user, true);
            s.put(b" ");
            emit_istring(s, pass, true);
        }
        CommandBody::Select { mailbox, qresync } => {
            s.put(b"SELECT ");
            emit_mailbox(s, mailbox, true);
            if let Some(q) = qresync {
                emit_qresync(s, q)?;
            }
        }
        CommandBody::Examine { mailbox, qresync } => {
            s.put(b"EXAMINE ");
            emit_mailbox(s, mailbox, true);
            if let Some(q) = qresync {
                emit_qresync(s, q)?;
            }
        }
        CommandBody::Create(m) => {
            s.put(b"CREATE ");
            emit_mailbox(s, m, true);
        }
        CommandBody::Delete(m) => {
            s.put(b"DELETE ");
            emit_mailbox(s, m, true);
        }
        CommandBody::Rename { from, to } => {
            s.put(b"RENAME ");
            emit_mailbox(s, from, true);
            s.put(b" ");
            emit_mailbox(s, to, true);
        }
        CommandBody::Subscribe(m) => {
            s.put(b"SUBSCRIBE ");
            emit_mailbox(s, m, true);
        }
        CommandBody::Unsubscribe(m) => {
            s.put(b"UNSUBSCRIBE ");
            emit_mailbox(s, m, true);
        }
        CommandBody::List { reference, pattern } => {
            s.put(b"LIST ");
            emit_mailbox(s, reference, true);
            s.put(b" ");
            emit_istring(s, pattern, true);
        }
        CommandBody::Lsub { reference, pattern } => {
            s.put(b"LSUB ");
            emit_mailbox(s, reference, true);
            s.put(b" ");
            emit_istring(s, pattern, true);
        }
        CommandBody::Status { mailbox, attrs } => {
            s.put(b"STATUS ");
            emit_mailbox(s, mailbox, true);
            s.put(b" (");
            for (i, a) in attrs.iter().enumerate() {
                if i > 0 {
                    s.put(b" ");
                }
                s.put_str(status_attr_token(*a));
            }
            s.put(b")");
        }
        CommandBody::Append { mailbox, flags, time, message } => {
            s.put(b"APPEND ");
            emit_mailbox(s, mailbox, true);
            if !flags.is_empty() {
                s.put(b" ");
                emit_flags(s, flags)?;
            }
            if let Some(t) = time {
                s.put(b" ");
                emit_time(s, t)?;
            }
            s.put(b" ");
            emit_literal(s, message, true);
        }
        CommandBody::UidExpunge(set) => {
            validate_uid_set(set)?;
            s.put(b"UID EXPUNGE ");
            emit_seq_set(s, set);
        }
        CommandBody::Search { uid, charset, keys } => {
            if *uid {
                s.put(b"UID ");
            }
            s.put(b"SEARCH ");
            if let Some(cs) = charset {
                s.put(b"CHARSET ");
                emit_istring(s, cs, true);
                s.put(b" ");
            }
            // a top-level group is the bare key list
            match keys {
                SearchKey::Group(list) => {
                    for (i, k) in list.iter().enumerate() {
                        if i > 0 {
                            s.put(b" ");
                        }
                        emit_search_key(s, k)?;
                    }
                }
                k => emit_search_key(s, k)?,
            }
        }
        CommandBody::Fetch { uid, set, spec, mods } => {
            if *uid {
                s.put(b"UID ");
            }
            s.put(b"FETCH ");
            emit_seq_set(s, set);
            s.put(b" ");
            match spec {
                FetchSpec::All => s.put(b"ALL"),
                FetchSpec::Full => s.put(b"FULL"),
                FetchSpec::Fast => s.put(b"FAST"),
                FetchSpec::Attrs(attrs) => {
                    s.put(b"(");
                    for (i, a) in attrs.iter().enumerate() {
                        if i > 0 {
                            s.put(b" ");
                        }
                        emit_fetch_attr(s, a)?;
                    }
                    s.put(b")");
                }
            }
            if mods.changedsince.is_some() || mods.vanished {
                s.put(b" (");
                if let Some(n) = mods.changedsince {
                    s.put(b"CHANGEDSINCE ");
                    s.put_u64(n);
                    if mods.vanished {
                        s.put(b" ");
                    }
                }
                if mods.vanished {
                    s.put(b"VANISHED");
                }
                s.put(b")");
            }
        }
        CommandBody::Store { uid, set, unchangedsince, sign, silent, flags } => {
            if *uid {
                s.put(b"UID ");
            }
            s.put(b"STORE ");
            emit_seq_set(s, set);
            if let Some(n) = unchangedsince {
                s.put(b" (UNCHANGEDSINCE ");
                s.put_u64(*n);
                s.put(b")");
            }
            s.put(b" ");
            match sign {
                StoreSign::Add => s.put(b"+"),
                StoreSign::Remove => s.put(b"-"),
                StoreSign::Replace => {}
            }
            s.put(b"FLAGS");
            if *silent {
                s.put(b".SILENT");
            }
            s.put(b" ");
            emit_flags(s, flags)?;
        }
        CommandBody::Copy { uid, set, mailbox } => {
            if *uid {
                s.put(b"UID ");
            }
            s.put(b"COPY ");
            emit_seq_set(s, set);
            s.put(b" ");
            emit_mailbox(s, mailbox, true);
        }
        CommandBody::Enable(caps) => {
            s.put(b"ENABLE");
            for c in caps {
                validate_atom(c, "capability")?;
                s.put(b" ");
                s.put_str(c);
            }
        }
        CommandBody::XkeySync(fprs) => {
            s.put(b"XKEYSYNC");
            for fpr in fprs {
                s.put(b" ");
                emit_istring(s, fpr, true);
            }
        }
        CommandBody::XkeyAdd(pem) => {
            s.put(b"XKEYADD ");
            emit_istring(s, pem, true);
        }
    }
    Ok(())
}

fn status_attr_token(a: StatusAttr) -> &'static str {
    match a {
        StatusAttr::Messages => "MESSAGES",
        StatusAttr::Recent => "RECENT",
        StatusAttr::UidNext => "UIDNEXT",
        StatusAttr::UidValidity => "UIDVALIDITY",
        StatusAttr::Unseen => "UNSEEN",
        StatusAttr::HighestModSeq => "HIGHESTMODSEQ",
    }
}

fn emit_qresync(s: &mut Sink<'_>, q: &QresyncParam) -> Result<(), ImapError> {
    s.put(b" (QRESYNC (");
    s.put_u32(q.uidvalidity);
    s.put(b" ");
    s.put_u64(q.modseq);
    if let Some(known) = &q.known_uids {
        validate_uid_set(known)?;
        s.put(b" ");
        emit_seq_set(s, known);
    }
    if let Some((seqs, uids)) = &q.seq_match {
        validate_uid_set(uids)?;
        s.put(b" (");
        emit_seq_set(s, seqs);
        s.put(b" ");
        emit_seq_set(s, uids);
        s.put(b")");
    }
    s.put(b"))");
    Ok(())
}

fn emit_search_key(s: &mut Sink<'_>, key: &SearchKey) -> Result<(), ImapError> {
    use SearchKey::*;
    match key {
        All => s.put(b"ALL"),
        Answered => s.put(b"ANSWERED"),
        Deleted => s.put(b"DELETED"),
        Flagged => s.put(b"FLAGGED"),
        New => s.put(b"NEW"),
        Old => s.put(b"OLD"),
        Recent => s.put(b"RECENT"),
        Seen => s.put(b"SEEN"),
        Unanswered => s.put(b"UNANSWERED"),
        Undeleted => s.put(b"UNDELETED"),
        Unflagged => s.put(b"UNFLAGGED"),
        Unseen => s.put(b"UNSEEN"),
        Draft => s.put(b"DRAFT"),
        Undraft => s.put(b"UNDRAFT"),
        Bcc(v) => emit_key_str(s, "BCC", v),
        Body(v) => emit_key_str(s, "BODY", v),
        Cc(v) => emit_key_str(s, "CC", v),
        From(v) => emit_key_str(s, "FROM", v),
        Subject(v) => emit_key_str(s, "SUBJECT", v),
        Text(v) => emit_key_str(s, "TEXT", v),
        To(v) => emit_key_str(s, "TO", v),
        Header(field, value) => {
            s.put(b"HEADER ");
            emit_istring(s, field, true);
            s.put(b" ");
            emit_istring(s, value, true);
        }
        Keyword(k) => {
            validate_atom(k, "keyword")?;
            s.put(b"KEYWORD ");
            s.put_str(k);
        }
        Unkeyword(k) => {
            validate_atom(k, "keyword")?;
            s.put(b"UNKEYWORD ");
            s.put_str(k);
        }
        Before(d) => emit_key_date(s, "BEFORE", d)?,
        On(d) => emit_key_date(s, "ON", d)?,
        Since(d) => emit_key_date(s, "SINCE", d)?,
        SentBefore(d) => emit_key_date(s, "SENTBEFORE", d)?,
        SentOn(d) => emit_key_date(s, "SENTON", d)?,
        SentSince(d) => emit_key_date(s, "SENTSINCE", d)?,
        Larger(n) => {
            s.put(b"LARGER ");
            s.put_u32(*n);
        }
        Smaller(n) => {
            s.put(b"SMALLER ");
            s.put_u32(*n);
        }
        Uid(set) => {
            validate_uid_set(set)?;
            s.put(b"UID ");
            emit_seq_set(s, set);
        }
        SeqSet(set) => emit_seq_set(s, set),
        Not(k) => {
            s.put(b"NOT ");
            emit_search_key(s, k)?;
        }
        Or(a, b) => {
            s.put(b"OR ");
            emit_search_key(s, a)?;
            s.put(b" ");
            emit_search_key(s, b)?;
        }
        Group(keys) => {
            s.put(b"(");
            for (i, k) in keys.iter().enumerate() {
                if i > 0 {
                    s.put(b" ");
                }
                emit_search_key(s, k)?;
            }
            s.put(b")");
        }
        Modseq(entry, n) => {
            s.put(b"MODSEQ ");
            if let Some(e) = entry {
                emit_istring(s, &e.name, true);
                s.put(b" ");
                s.put_str(match e.kind {
                    ModseqEntryKind::Priv => "priv",
                    ModseqEntryKind::Shared => "shared",
                    ModseqEntryKind::All => "all",
                });
                s.put(b" ");
            }
            s.put_u64(*n);
        }
    }
    Ok(())
}

fn emit_key_str(s: &mut Sink<'_>, name: &str, v: &IString) {
    s.put_str(name);
    s.put(b" ");
    emit_istring(s, v, true);
}

fn emit_key_date(
    s: &mut Sink<'_>,
    name: &str,
    d: &crate::types::search::SearchDate,
) -> Result<(), ImapError> {
    if !(1..=12).contains(&d.month) || !(1..=31).contains(&d.day) {
        return Err(ImapError::Value(format!("invalid date: {d:?}")));
    }
    s.put_str(name);
    s.put_str(&format!(
        " {}-{}-{:04}",
        d.day,
        crate::types::datetime::MONTHS[d.month as usize - 1],
        d.year
    ));
    Ok(())
}

fn emit_section(s: &mut Sink<'_>, section: &Section) {
    s.put(b"[");
    for (i, p) in section.part.iter().enumerate() {
        if i > 0 {
            s.put(b".");
        }
        s.put_u32(*p);
    }
    if let Some(text) = &section.text {
        if !section.part.is_empty() {
            s.put(b".");
        }
        match text {
            SectionText::Header => s.put(b"HEADER"),
            SectionText::Text => s.put(b"TEXT"),
            SectionText::Mime => s.put(b"MIME"),
            SectionText::HeaderFields(fields) => {
                s.put(b"HEADER.FIELDS (");
                for (i, f) in fields.iter().enumerate() {
                    if i > 0 {
                        s.put(b" ");
                    }
                    emit_istring(s, f, true);
                }
                s.put(b")");
            }
            SectionText::HeaderFieldsNot(fields) => {
                s.put(b"HEADER.FIELDS.NOT (");
                for (i, f) in fields.iter().enumerate() {
                    if i > 0 {
                        s.put(b" ");
                    }
                    emit_istring(s, f, true);
                }
                s.put(b")");
            }
        }
    }
    s.put(b"]");
}

fn emit_fetch_attr(s: &mut Sink<'_>, attr: &FetchAttr) -> Result<(), ImapError> {
    match attr {
        FetchAttr::Envelope => s.put(b"ENVELOPE"),
        FetchAttr::Flags => s.put(b"FLAGS"),
        FetchAttr::InternalDate => s.put(b"INTERNALDATE"),
        FetchAttr::Rfc822 => s.put(b"RFC822"),
        FetchAttr::Rfc822Header => s.put(b"RFC822.HEADER"),
        FetchAttr::Rfc822Size => s.put(b"RFC822.SIZE"),
        FetchAttr::Rfc822Text => s.put(b"RFC822.TEXT"),
        FetchAttr::Body => s.put(b"BODY"),
        FetchAttr::BodyStructure => s.put(b"BODYSTRUCTURE"),
        FetchAttr::Uid => s.put(b"UID"),
        FetchAttr::ModSeq => s.put(b"MODSEQ"),
        FetchAttr::BodySection { peek, section, partial } => {
            if *peek {
                s.put(b"BODY.PEEK");
            } else {
                s.put(b"BODY");
            }
            emit_section(s, section);
            if let Some(Partial { offset, count }) = partial {
                s.put(b"<");
                s.put_u32(*offset);
                s.put(b".");
                s.put_u32(*count);
                s.put(b">");
            }
        }
    }
    Ok(())
}

// ---- response emission ----

fn emit_response(s: &mut Sink<'_>, resp: &Response) -> Result<(), ImapError> {
    match resp {
        Response::Status(st) => emit_status(s, st)?,
        Response::Plus { code, text } => {
            s.put(b"+ ");
            if let Some(c) = code {
                s.put(b"[");
                emit_code(s, c)?;
                s.put(b"] ");
            }
            s.put_str(text);
            s.put(b"\r\n");
        }
        Response::Data(data) => emit_data(s, data)?,
    }
    Ok(())
}

fn emit_status(s: &mut Sink<'_>, st: &ResponseStatus) -> Result<(), ImapError> {
    match &st.tag {
        Some(tag) => s.put_str(tag.as_str()),
        None => s.put(b"*"),
    }
    s.put(b" ");
    s.put_str(st.kind.token());
    s.put(b" ");
    if let Some(code) = &st.code {
        s.put(b"[");
        emit_code(s, code)?;
        s.put(b"]");
        if !st.text.is_empty() {
            s.put(b" ");
        }
    }
    validate_text(&st.text)?;
    s.put_str(&st.text);
    s.put(b"\r\n");
    Ok(())
}

fn validate_text(text: &str) -> Result<(), ImapError> {
    if !text.bytes().all(is_text_char) {
        return Err(ImapError::Param("CR/LF/NUL in response text".into()));
    }
    Ok(())
}

fn emit_code(s: &mut Sink<'_>, code: &Code) -> Result<(), ImapError> {
    match code {
        Code::Alert => s.put(b"ALERT"),
        Code::Parse => s.put(b"PARSE"),
        Code::ReadOnly => s.put(b"READ-ONLY"),
        Code::ReadWrite => s.put(b"READ-WRITE"),
        Code::TryCreate => s.put(b"TRYCREATE"),
        Code::NoModSeq => s.put(b"NOMODSEQ"),
        Code::Closed => s.put(b"CLOSED"),
        Code::Capability(caps) => {
            s.put(b"CAPABILITY");
            for c in caps {
                s.put(b" ");
                s.put_str(c.token());
            }
        }
        Code::PermanentFlags(f) => {
            s.put(b"PERMANENTFLAGS ");
            emit_perm_flags(s, f)?;
        }
        Code::UidNext(n) => {
            s.put(b"UIDNEXT ");
            s.put_u32(*n);
        }
        Code::UidValidity(n) => {
            s.put(b"UIDVALIDITY ");
            s.put_u32(*n);
        }
        Code::Unseen(n) => {
            s.put(b"UNSEEN ");
            s.put_u32(*n);
        }
        Code::AppendUid { uidvalidity, uid } => {
            s.put(b"APPENDUID ");
            s.put_u32(*uidvalidity);
            s.put(b" ");
            s.put_u32(*uid);
        }
        Code::CopyUid { uidvalidity, src, dst } => {
            validate_uid_set(src)?;
            validate_uid_set(dst)?;
            s.put(b"COPYUID ");
            s.put_u32(*uidvalidity);
            s.put(b" ");
            emit_seq_set(s, src);
            s.put(b" ");
            emit_seq_set(s, dst);
        }
        Code::HighestModSeq(n) => {
            s.put(b"HIGHESTMODSEQ ");
            s.put_u64(*n);
        }
        Code::Modified(set) => {
            s.put(b"MODIFIED ");
            emit_seq_set(s, set);
        }
        Code::Atom { name, text } => {
            validate_atom(name, "response code")?;
            s.put_str(name);
            if let Some(t) = text {
                s.put(b" ");
                s.put_str(t);
            }
        }
    }
    Ok(())
}

fn emit_data(s: &mut Sink<'_>, data: &ResponseData) -> Result<(), ImapError> {
    s.put(b"* ");
    match data {
        ResponseData::Capability(caps) => {
            s.put(b"CAPABILITY");
            for c in caps {
                s.put(b" ");
                s.put_str(c.token());
            }
        }
        ResponseData::List { flags, sep, mailbox } => {
            s.put(b"LIST ");
            emit_list_line(s, flags, sep, mailbox)?;
        }
        ResponseData::Lsub { flags, sep, mailbox } => {
            s.put(b"LSUB ");
            emit_list_line(s, flags, sep, mailbox)?;
        }
        ResponseData::Status { mailbox, attrs } => {
            s.put(b"STATUS ");
            emit_mailbox(s, mailbox, false);
            s.put(b" (");
            for (i, a) in attrs.iter().enumerate() {
                if i > 0 {
                    s.put(b" ");
                }
                match a {
                    StatusAttrValue::Messages(n) => {
                        s.put(b"MESSAGES ");
                        s.put_u32(*n);
                    }
                    StatusAttrValue::Recent(n) => {
                        s.put(b"RECENT ");
                        s.put_u32(*n);
                    }
                    StatusAttrValue::UidNext(n) => {
                        s.put(b"UIDNEXT ");
                        s.put_u32(*n);
                    }
                    StatusAttrValue::UidValidity(n) => {
                        s.put(b"UIDVALIDITY ");
                        s.put_u32(*n);
                    }
                    StatusAttrValue::Unseen(n) => {
                        s.put(b"UNSEEN ");
                        s.put_u32(*n);
                    }
                    StatusAttrValue::HighestModSeq(n) => {
                        s.put(b"HIGHESTMODSEQ ");
                        s.put_u64(*n);
                    }
                }
            }
            s.put(b")");
        }
        ResponseData::Flags(f) => {
            s.put(b"FLAGS ");
            emit_flags(s, f)?;
        }
        ResponseData::Exists(n) => {
            s.put_u32(*n);
            s.put(b" EXISTS");
        }
        ResponseData::Recent(n) => {
            s.put_u32(*n);
            s.put(b" RECENT");
        }
        ResponseData::Expunge(n) => {
            s.put_u32(*n);
            s.put(b" EXPUNGE");
        }
        ResponseData::Fetch { num, attrs } => {
            s.put_u32(*num);
            s.put(b" FETCH (");
            for (i, a) in attrs.iter().enumerate() {
                if i > 0 {
                    s.put(b" ");
                }
                emit_msg_attr(s, a)?;
            }
            s.put(b")");
        }
        ResponseData::Search { nums, modseq } => {
            s.put(b"SEARCH");
            for n in nums {
                s.put(b" ");
                s.put_u32(*n);
            }
            if let Some(m) = modseq {
                s.put(b" (MODSEQ ");
                s.put_u64(*m);
                s.put(b")");
            }
        }
        ResponseData::Enabled(caps) => {
            s.put(b"ENABLED");
            for c in caps {
                s.put(b" ");
                s.put_str(c.token());
            }
        }
        ResponseData::Vanished { earlier, uids } => {
            validate_uid_set(uids)?;
            s.put(b"VANISHED ");
            if *earlier {
                s.put(b"(EARLIER) ");
            }
            emit_seq_set(s, uids);
        }
        ResponseData::Xkeysync(x) => {
            s.put(b"XKEYSYNC ");
            match x {
                XkeySyncResp::Created(pem) => {
                    s.put(b"CREATED ");
                    emit_literal(s, pem.as_bytes(), false);
                }
                XkeySyncResp::Deleted(fpr) => {
                    s.put(b"DELETED ");
                    emit_istring(s, fpr, false);
                }
                XkeySyncResp::Ok => s.put(b"OK"),
            }
        }
    }
    s.put(b"\r\n");
    Ok(())
}

fn emit_list_line(
    s: &mut Sink<'_>,
    flags: &MailboxFlags,
    sep: &Option<char>,
    mailbox: &Mailbox,
) -> Result<(), ImapError> {
    emit_mailbox_flags(s, flags)?;
    s.put(b" ");
    match sep {
        None => s.put(b"NIL"),
        Some(c) => {
            s.put(b"\"");
            if *c == '"' || *c == '\\' {
                s.put(b"\\");
            }
            let mut tmp = [0u8; 4];
            s.put_str(c.encode_utf8(&mut tmp));
            s.put(b"\"");
        }
    }
    s.put(b" ");
    // mailbox names in LIST responses conventionally come out quoted
    match mailbox {
        Mailbox::Inbox => s.put(b"\"INBOX\""),
        Mailbox::Other(name) => emit_istring(s, name, false),
    }
    Ok(())
}

fn emit_msg_attr(s: &mut Sink<'_>, attr: &MsgAttr) -> Result<(), ImapError> {
    match attr {
        MsgAttr::Flags(f) => {
            s.put(b"FLAGS ");
            emit_fetch_flags(s, f)?;
        }
        MsgAttr::Uid(n) => {
            s.put(b"UID ");
            s.put_u32(*n);
        }
        MsgAttr::InternalDate(t) => {
            s.put(b"INTERNALDATE ");
            emit_time(s, t)?;
        }
        MsgAttr::Rfc822Size(n) => {
            s.put(b"RFC822.SIZE ");
            s.put_u32(*n);
        }
        MsgAttr::ModSeq(n) => {
            s.put(b"MODSEQ (");
            s.put_u64(*n);
            s.put(b")");
        }
        MsgAttr::Rfc822(body) => {
            s.put(b"RFC822 ");
            emit_literal(s, body, false);
        }
        MsgAttr::BodySection { section, origin, data } => {
            s.put(b"BODY");
            emit_section(s, section);
            if let Some(o) = origin {
                s.put(b"<");
                s.put_u32(*o);
                s.put(b">");
            }
            s.put(b" ");
            match data {
                None => s.put(b"NIL"),
                Some(bytes) => emit_literal(s, bytes, false),
            }
        }
        MsgAttr::BodyStructure(bs) => {
            s.put(b"BODYSTRUCTURE ");
            emit_body_structure(s, bs);
        }
    }
    Ok(())
}

fn emit_body_structure(s: &mut Sink<'_>, bs: &BodyStructure) {
    let quoted = |s: &mut Sink<'_>, is: &IString| {
        // bodystructure fields are conventionally quoted strings
        s.put(b"\"");
        for &b in is.as_bytes() {
            if b == b'"' || b == b'\\' {
                s.put(b"\\");
            }
            s.put(&[b]);
        }
        s.put(b"\"");
    };
    let nstring = |s: &mut Sink<'_>, v: &Option<IString>| match v {
        None => s.put(b"NIL"),
        Some(is) => quoted(s, is),
    };
    s.put(b"(");
    quoted(s, &bs.content_type);
    s.put(b" ");
    quoted(s, &bs.subtype);
    s.put(b" ");
    if bs.params.is_empty() {
        s.put(b"NIL");
    } else {
        s.put(b"(");
        for (i, (k, v)) in bs.params.iter().enumerate() {
            if i > 0 {
                s.put(b" ");
            }
            quoted(s, k);
            s.put(b" ");
            quoted(s, v);
        }
        s.put(b")");
    }
    s.put(b" ");
    nstring(s, &bs.id);
    s.put(b" ");
    nstring(s, &bs.description);
    s.put(b" ");
    quoted(s, &bs.encoding);
    s.put(b" ");
    s.put_u32(bs.size);
    if let Some(lines) = bs.lines {
        s.put(b" ");
        s.put_u32(lines);
    }
    s.put(b")");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extensions::{Ext, ExtState};
    use crate::parse::{command::command, response::response};
    use crate::types::core::Tag;

    fn exts() -> Extensions {
        Extensions::all_available()
    }

    fn cmd(tag: &str, body: CommandBody) -> Command {
        Command::new(Tag::new(tag).unwrap(), body)
    }

    #[test]
    fn simple_command_bytes() {
        let c = cmd("a1", CommandBody::Noop);
        assert_eq!(command_to_vec(&c, &exts()).unwrap(), b"a1 NOOP\r\n");
    }

    #[test]
    fn login_uses_literal_plus_for_awkward_strings() {
        let c = cmd(
            "a1",
            CommandBody::Login {
                user: IString::from("alice"),
                pass: IString::Literal(b"p\r\nw".to_vec()),
            },
        );
        assert_eq!(
            command_to_vec(&c, &exts()).unwrap(),
            b"a1 LOGIN alice {4+}\r\np\r\nw\r\n"
        );
    }

    #[test]
    fn inbox_is_uppercased() {
        let c = cmd(
            "a1",
            CommandBody::Select { mailbox: Mailbox::from("inBox"), qresync: None },
        );
        assert_eq!(command_to_vec(&c, &exts()).unwrap(), b"a1 SELECT INBOX\r\n");
    }

    #[test]
    fn response_literals_are_synchronizing() {
        let r = Response::Data(ResponseData::Fetch {
            num: 1,
            attrs: vec![MsgAttr::Rfc822(b"hello".to_vec())],
        });
        assert_eq!(
            response_to_vec(&r, &exts()).unwrap(),
            b"* 1 FETCH (RFC822 {5}\r\nhello)\r\n"
        );
    }

    #[test]
    fn restartable_writes_agree_with_one_shot() {
        // property: for every budget N >= 2, iterating produces the
        // same bytes as a single large write
        let c = cmd(
            "a1",
            CommandBody::Append {
                mailbox: Mailbox::from("saved stuff"),
                flags: Flags { seen: true, ..Flags::default() },
                time: None,
                message: b"a somewhat longer message body\r\nwith two lines".to_vec(),
            },
        );
        let whole = command_to_vec(&c, &exts()).unwrap();
        for budget in 2..16 {
            let mut out = Vec::new();
            let mut buf = vec![0u8; budget];
            let mut skip = 0;
            loop {
                let st = write_command(&c, &exts(), &mut buf, skip).unwrap();
                out.extend_from_slice(&buf[..st.written]);
                skip = st.skip;
                if st.want == 0 {
                    break;
                }
            }
            assert_eq!(out, whole, "budget={budget}");
        }
    }

    #[test]
    fn gating_rejects_disabled_extension() {
        let mut e = exts();
        e.set(Ext::Uidplus, ExtState::Disabled);
        let c = cmd("a1", CommandBody::UidExpunge(SeqSet::single(4)));
        assert!(matches!(
            command_to_vec(&c, &e),
            Err(ImapError::ExtensionDisabled(Ext::Uidplus))
        ));
        // Off is not an error
        let mut e = exts();
        e.set(Ext::Uidplus, ExtState::Off);
        assert!(command_to_vec(&c, &e).is_ok());
    }

    #[test]
    fn uid_sets_reject_star() {
        // a uid-set slot refuses '*'; a UID FETCH sequence-set allows it
        let c = cmd("a1", CommandBody::UidExpunge(SeqSet::range(4, 0)));
        assert!(command_to_vec(&c, &exts()).is_err());
        let c = cmd(
            "a2",
            CommandBody::Fetch {
                uid: true,
                set: SeqSet::range(1, 0),
                spec: FetchSpec::Fast,
                mods: Default::default(),
            },
        );
        assert!(command_to_vec(&c, &exts()).is_ok());
    }

    #[test]
    fn vanished_requires_changedsince() {
        let c = cmd(
            "a1",
            CommandBody::Fetch {
                uid: true,
                set: SeqSet::single(1),
                spec: FetchSpec::Fast,
                mods: crate::types::fetch::FetchMods { changedsince: None, vanished: true },
            },
        );
        assert!(command_to_vec(&c, &exts()).is_err());
    }

    #[test]
    fn bad_time_fails_on_emit() {
        let mut t = ImapTime::from_epoch(0);
        t.month = 13;
        let c = cmd(
            "a1",
            CommandBody::Append {
                mailbox: Mailbox::Inbox,
                flags: Flags::default(),
                time: Some(t),
                message: b"x".to_vec(),
            },
        );
        assert!(command_to_vec(&c, &exts()).is_err());
    }

    #[test]
    fn command_roundtrip() {
        let cases = vec![
            cmd("a1", CommandBody::Capability),
            cmd(
                "a2",
                CommandBody::Login {
                    user: IString::from("alice"),
                    pass: IString::from("pass word"),
                },
            ),
            cmd(
                "a3",
                CommandBody::Select {
                    mailbox: Mailbox::from("Archive/2024"),
                    qresync: Some(QresyncParam {
                        uidvalidity: 123,
                        modseq: 7,
                        known_uids: Some(SeqSet::range(1, 10)),
                        seq_match: None,
                    }),
                },
            ),
            cmd(
                "a4",
                CommandBody::Fetch {
                    uid: true,
                    set: SeqSet::range(1, 0),
                    spec: FetchSpec::Attrs(vec![FetchAttr::Flags, FetchAttr::Uid]),
                    mods: crate::types::fetch::FetchMods {
                        changedsince: Some(7),
                        vanished: true,
                    },
                },
            ),
            cmd(
                "a5",
                CommandBody::Store {
                    uid: false,
                    set: SeqSet::range(1, 3),
                    unchangedsince: Some(12),
                    sign: StoreSign::Add,
                    silent: true,
                    flags: Flags { deleted: true, ..Flags::default() },
                },
            ),
            cmd("a6", CommandBody::XkeySync(vec![IString::from("aabb"), IString::from("ccdd")])),
            cmd("a7", CommandBody::Enable(vec!["CONDSTORE".into(), "QRESYNC".into()])),
        ];
        for c in cases {
            let bytes = command_to_vec(&c, &exts()).unwrap();
            let (rest, parsed) = command(&bytes).expect("roundtrip parse");
            assert!(rest.is_empty());
            assert_eq!(parsed, c, "wire: {}", String::from_utf8_lossy(&bytes));
        }
    }

    #[test]
    fn response_roundtrip() {
        let cases = vec![
            Response::Status(ResponseStatus::ok(
                Some(Tag::new("a1").unwrap()),
                Some(Code::AppendUid { uidvalidity: 123, uid: 42 }),
                "APPEND completed",
            )),
            Response::Status(ResponseStatus::ok(
                None,
                Some(Code::HighestModSeq(7)),
                "Highest",
            )),
            Response::Data(ResponseData::Exists(3)),
            Response::Data(ResponseData::Vanished {
                earlier: true,
                uids: SeqSet::from_uids(&[3, 5]).unwrap(),
            }),
            Response::Data(ResponseData::Search { nums: vec![2, 5], modseq: Some(9) }),
            Response::Data(ResponseData::Xkeysync(XkeySyncResp::Deleted(IString::from(
                "aabbccdd",
            )))),
            Response::Plus { code: None, text: "Idling".into() },
        ];
        for r in cases {
            let bytes = response_to_vec(&r, &exts()).unwrap();
            let (rest, parsed) = response(&bytes).expect("roundtrip parse");
            assert!(rest.is_empty(), "wire: {}", String::from_utf8_lossy(&bytes));
            assert_eq!(parsed, r, "wire: {}", String::from_utf8_lossy(&bytes));
        }
    }
}
