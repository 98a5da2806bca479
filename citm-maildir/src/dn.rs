//! The downstream server: one per downstream session viewing a folder.
//!
//! Serves the SELECTED-state commands from the local store and keeps a
//! `known` snapshot of what its client has been told; unilateral
//! responses are produced by diffing `known` against the live store,
//! the same way a courteous server narrates changes around a NOOP.
//! Mutating commands (STORE/EXPUNGE/COPY) are not applied locally: they
//! are translated to UID commands and relayed upstream, and the change
//! flows back through the downloader.

use std::sync::Arc;

use citm_imap::types::command::QresyncParam;
use citm_imap::types::core::IString;
use citm_imap::types::datetime::ImapTime;
use citm_imap::types::fetch::{FetchAttr, FetchMods, FetchSpec, Section, SectionText, StoreSign};
use citm_imap::types::flag::{Flags, PermFlags};
use citm_imap::types::mailbox::Mailbox;
use citm_imap::types::response::{
    BodyStructure, Code, MsgAttr, Response, ResponseData, ResponseStatus,
};
use citm_imap::types::search::{SearchDate, SearchKey};
use citm_imap::types::sequence::SeqSet;
use citm_imap::CommandBody;

use crate::error::MaildirError;
use crate::imaildir::{Imaildir, Snapshot};
use crate::msg::{Msg, MsgState};

/// The local outcome of one downstream command.
#[derive(Debug, Default)]
pub struct DnReply {
    /// Untagged responses to send first.
    pub data: Vec<Response>,
    /// Code for the tagged OK the owner composes.
    pub code: Option<Code>,
    /// Command the owner must satisfy upstream before completing.
    pub relay: Option<CommandBody>,
}

pub struct DnView {
    dir: Arc<Imaildir>,
    known: Snapshot,
    /// UIDs that appeared after SELECT; these count as \Recent here.
    recent: Vec<u32>,
    readonly: bool,
    condstore: bool,
}

impl DnView {
    pub fn new(dir: Arc<Imaildir>, readonly: bool, condstore: bool) -> DnView {
        let known = dir.snapshot();
        DnView { dir, known, recent: Vec::new(), readonly, condstore }
    }

    pub fn dir(&self) -> &Arc<Imaildir> {
        &self.dir
    }

    /// The responses a SELECT/EXAMINE emits.
    pub fn select(&mut self, qresync: Option<&QresyncParam>) -> DnReply {
        self.known = self.dir.snapshot();
        let mut data = Vec::new();
        data.push(Response::Data(ResponseData::Flags(default_flags())));
        data.push(Response::Data(ResponseData::Exists(self.known.exists())));
        data.push(Response::Data(ResponseData::Recent(0)));
        if let Some(unseen) = self.first_unseen() {
            data.push(untagged_ok(Code::Unseen(unseen), "first unseen"));
        }
        data.push(untagged_ok(
            Code::PermanentFlags(default_perm_flags()),
            "flags permitted",
        ));
        data.push(untagged_ok(
            Code::UidNext(self.uidnext()),
            "next uid",
        ));
        data.push(untagged_ok(
            Code::UidValidity(self.known.uidvalidity),
            "UIDs valid",
        ));
        if self.condstore {
            data.push(untagged_ok(
                Code::HighestModSeq(self.known.himodseq.max(1)),
                "modseq tracked",
            ));
        }
        if let Some(q) = qresync {
            self.qresync_replay(q, &mut data);
        }
        DnReply {
            data,
            code: Some(if self.readonly { Code::ReadOnly } else { Code::ReadWrite }),
            relay: None,
        }
    }

    /// QRESYNC parameter on SELECT: replay what the client missed.
    fn qresync_replay(&self, q: &QresyncParam, data: &mut Vec<Response>) {
        if q.uidvalidity != self.known.uidvalidity {
            // their cache is from another life; they will resync fully
            return;
        }
        let hint = self.star_hint();
        let vanished: Vec<u32> = self
            .known
            .expunged
            .values()
            .filter(|e| e.modseq > q.modseq)
            .map(|e| e.uid)
            .filter(|uid| match &q.known_uids {
                Some(set) => set.contains(*uid, hint),
                None => true,
            })
            .collect();
        if let Some(uids) = SeqSet::from_uids(&vanished) {
            data.push(Response::Data(ResponseData::Vanished { earlier: true, uids }));
        }
        for (seq, msg) in self.known.msgs.values().enumerate() {
            if msg.modseq > q.modseq {
                data.push(self.fetch_response(seq as u32 + 1, msg, true, &[]));
            }
        }
    }

    fn uidnext(&self) -> u32 {
        self.known.max_uid().saturating_add(1).max(1)
    }

    /// `*` resolution for sets that may address expunged UIDs: the
    /// highest UID this folder has ever spoken of.
    fn star_hint(&self) -> u32 {
        self.known
            .max_uid()
            .max(self.known.expunged.keys().next_back().copied().unwrap_or(0))
    }

    fn first_unseen(&self) -> Option<u32> {
        self.known
            .msgs
            .values()
            .position(|m| !m.flags.seen)
            .map(|i| i as u32 + 1)
    }

    // ---- unilateral updates ----

    /// Diff what the client knows against the live store.  Safe to call
    /// at any response point and during IDLE.
    pub fn update(&mut self) -> Vec<Response> {
        let fresh = self.dir.snapshot();
        let mut data = Vec::new();

        if fresh.uidvalidity != self.known.uidvalidity {
            // the world changed underneath us; resynchronize hard
            data.push(untagged_ok(Code::UidValidity(fresh.uidvalidity), "UIDs changed"));
            self.known = fresh;
            self.recent.clear();
            data.push(Response::Data(ResponseData::Exists(self.known.exists())));
            return data;
        }

        // expunges first, highest sequence number first so earlier
        // numbers stay valid as the client applies them
        let mut expunged_seqs: Vec<u32> = Vec::new();
        for (i, uid) in self.known.msgs.keys().enumerate() {
            if !fresh.msgs.contains_key(uid) {
                expunged_seqs.push(i as u32 + 1);
            }
        }
        let n_expunged = expunged_seqs.len();
        for (removed_before, seq) in expunged_seqs.into_iter().enumerate() {
            data.push(Response::Data(ResponseData::Expunge(
                seq - removed_before as u32,
            )));
        }

        // new arrivals
        let old_max = self.known.max_uid();
        let new_uids: Vec<u32> = fresh
            .msgs
            .keys()
            .filter(|&&u| u > old_max)
            .copied()
            .collect();
        if !new_uids.is_empty() || n_expunged > 0 {
            if !new_uids.is_empty() {
                self.recent.extend(&new_uids);
                data.push(Response::Data(ResponseData::Exists(fresh.exists())));
                data.push(Response::Data(ResponseData::Recent(self.recent.len() as u32)));
            }
        }

        // flag changes on surviving messages
        for (i, (uid, msg)) in fresh.msgs.iter().enumerate() {
            if let Some(old) = self.known.msgs.get(uid) {
                if old.flags != msg.flags || old.modseq != msg.modseq {
                    data.push(self.fetch_response(i as u32 + 1, msg, false, &[]));
                }
            }
        }

        self.known = fresh;
        data
    }

    // ---- FETCH ----

    pub fn fetch(
        &mut self,
        set: &SeqSet,
        spec: &FetchSpec,
        mods: &FetchMods,
        uid_mode: bool,
    ) -> Result<DnReply, MaildirError> {
        let mut data = Vec::new();

        if mods.vanished {
            let changedsince = mods.changedsince.unwrap_or(0);
            let hint = self.star_hint();
            let vanished: Vec<u32> = self
                .known
                .expunged
                .values()
                .filter(|e| e.modseq > changedsince)
                .map(|e| e.uid)
                .filter(|&u| set.contains(u, hint))
                .collect();
            if let Some(uids) = SeqSet::from_uids(&vanished) {
                data.push(Response::Data(ResponseData::Vanished { earlier: true, uids }));
            }
        }

        let attrs = spec.expand();
        let targets = self.resolve_set(set, uid_mode);
        for (seq, msg) in targets {
            if let Some(changedsince) = mods.changedsince {
                if msg.modseq <= changedsince {
                    continue;
                }
            }
            data.push(self.fetch_msg(seq, &msg, uid_mode, &attrs)?);
            // an un-peeked body fetch implies \Seen on a writable view
            if !self.readonly && wants_body(&attrs) && !msg.flags.seen {
                let mut flags = msg.flags;
                flags.seen = true;
                self.dir.update_meta(msg.uid, flags, None, None, 0)?;
            }
        }
        Ok(DnReply { data, code: None, relay: None })
    }

    /// (sequence-number, message) pairs addressed by the set.
    fn resolve_set(&self, set: &SeqSet, uid_mode: bool) -> Vec<(u32, Msg)> {
        let mut out = Vec::new();
        if uid_mode {
            for uid in set.iter(1, self.known.max_uid()) {
                if let (Some(msg), Some(seq)) =
                    (self.known.msgs.get(&uid), self.known.seq_of_uid(uid))
                {
                    out.push((seq, msg.clone()));
                }
            }
        } else {
            for seq in set.iter(1, self.known.exists()) {
                if let Some(uid) = self.known.uid_of_seq(seq) {
                    if let Some(msg) = self.known.msgs.get(&uid) {
                        out.push((seq, msg.clone()));
                    }
                }
            }
        }
        out
    }

    fn fetch_response(&self, seq: u32, msg: &Msg, uid_mode: bool, extra: &[MsgAttr]) -> Response {
        let mut attrs = vec![MsgAttr::Flags(
            msg.flags.to_fetch(self.recent.contains(&msg.uid)),
        )];
        if uid_mode {
            attrs.push(MsgAttr::Uid(msg.uid));
        }
        if self.condstore {
            attrs.push(MsgAttr::ModSeq(msg.modseq.max(1)));
        }
        attrs.extend_from_slice(extra);
        Response::Data(ResponseData::Fetch { num: seq, attrs })
    }

    fn fetch_msg(
        &self,
        seq: u32,
        msg: &Msg,
        uid_mode: bool,
        wanted: &[FetchAttr],
    ) -> Result<Response, MaildirError> {
        let mut attrs: Vec<MsgAttr> = Vec::new();
        let mut uid_included = false;
        for attr in wanted {
            match attr {
                FetchAttr::Flags => attrs.push(MsgAttr::Flags(
                    msg.flags.to_fetch(self.recent.contains(&msg.uid)),
                )),
                FetchAttr::Uid => {
                    uid_included = true;
                    attrs.push(MsgAttr::Uid(msg.uid));
                }
                FetchAttr::InternalDate => attrs.push(MsgAttr::InternalDate(
                    ImapTime::from_epoch(msg.internaldate),
                )),
                FetchAttr::Rfc822Size => attrs.push(MsgAttr::Rfc822Size(msg.rfc822_size)),
                FetchAttr::ModSeq => attrs.push(MsgAttr::ModSeq(msg.modseq.max(1))),
                FetchAttr::Rfc822 => {
                    attrs.push(MsgAttr::Rfc822(self.content_of(msg)?));
                }
                FetchAttr::Rfc822Header => {
                    let content = self.content_of(msg)?;
                    attrs.push(MsgAttr::BodySection {
                        section: Section { part: vec![], text: Some(SectionText::Header) },
                        origin: None,
                        data: Some(header_block(&content)),
                    });
                }
                FetchAttr::Rfc822Text => {
                    let content = self.content_of(msg)?;
                    attrs.push(MsgAttr::BodySection {
                        section: Section { part: vec![], text: Some(SectionText::Text) },
                        origin: None,
                        data: Some(body_block(&content)),
                    });
                }
                FetchAttr::Body | FetchAttr::BodyStructure => {
                    let content = self.content_of(msg)?;
                    attrs.push(MsgAttr::BodyStructure(body_structure(&content)));
                }
                FetchAttr::BodySection { section, partial, .. } => {
                    let content = self.content_of(msg)?;
                    let mut bytes = section_bytes(&content, section);
                    let origin = partial.map(|p| {
                        let start = (p.offset as usize).min(bytes.len());
                        let end = (start + p.count as usize).min(bytes.len());
                        bytes = bytes[start..end].to_vec();
                        p.offset
                    });
                    attrs.push(MsgAttr::BodySection {
                        section: section.clone(),
                        origin,
                        data: Some(bytes),
                    });
                }
                // header parsing beyond this is out of scope
                FetchAttr::Envelope => {}
            }
        }
        if uid_mode && !uid_included {
            attrs.push(MsgAttr::Uid(msg.uid));
        }
        Ok(Response::Data(ResponseData::Fetch { num: seq, attrs }))
    }

    fn content_of(&self, msg: &Msg) -> Result<Vec<u8>, MaildirError> {
        if msg.state == MsgState::Unfilled {
            // not downloaded yet: serve empty rather than lie
            return Ok(Vec::new());
        }
        self.dir.read_content(msg.uid)
    }

    // ---- SEARCH ----

    pub fn search(&self, keys: &SearchKey, uid_mode: bool) -> Result<DnReply, MaildirError> {
        let mut nums = Vec::new();
        for (i, (uid, msg)) in self.known.msgs.iter().enumerate() {
            let seq = i as u32 + 1;
            if self.matches(msg, seq, keys)? {
                nums.push(if uid_mode { *uid } else { seq });
            }
        }
        let modseq = if self.condstore && search_uses_modseq(keys) {
            Some(self.known.himodseq.max(1))
        } else {
            None
        };
        Ok(DnReply {
            data: vec![Response::Data(ResponseData::Search { nums, modseq })],
            code: None,
            relay: None,
        })
    }

    fn matches(&self, msg: &Msg, seq: u32, key: &SearchKey) -> Result<bool, MaildirError> {
        use SearchKey::*;
        Ok(match key {
            All => true,
            Answered => msg.flags.answered,
            Unanswered => !msg.flags.answered,
            Deleted => msg.flags.deleted,
            Undeleted => !msg.flags.deleted,
            Flagged => msg.flags.flagged,
            Unflagged => !msg.flags.flagged,
            Seen => msg.flags.seen,
            Unseen => !msg.flags.seen,
            Draft => msg.flags.draft,
            Undraft => !msg.flags.draft,
            New | Recent => self.recent.contains(&msg.uid),
            Old => !self.recent.contains(&msg.uid),
            Keyword(_) => false,
            Unkeyword(_) => true,
            Larger(n) => msg.rfc822_size > *n,
            Smaller(n) => msg.rfc822_size < *n,
            Uid(set) => set.contains(msg.uid, self.known.max_uid()),
            SeqSet(set) => set.contains(seq, self.known.exists()),
            Before(d) => msg.internaldate < date_epoch(d),
            On(d) => {
                let start = date_epoch(d);
                msg.internaldate >= start && msg.internaldate < start + 86400
            }
            Since(d) => msg.internaldate >= date_epoch(d),
            // sent-dates approximate to internal dates here
            SentBefore(d) => msg.internaldate < date_epoch(d),
            SentOn(d) => {
                let start = date_epoch(d);
                msg.internaldate >= start && msg.internaldate < start + 86400
            }
            SentSince(d) => msg.internaldate >= date_epoch(d),
            Not(k) => !self.matches(msg, seq, k)?,
            Or(a, b) => self.matches(msg, seq, a)? || self.matches(msg, seq, b)?,
            Group(ks) => {
                for k in ks {
                    if !self.matches(msg, seq, k)? {
                        return Ok(false);
                    }
                }
                true
            }
            Modseq(_, n) => msg.modseq >= *n,
            Bcc(t) => self.header_contains(msg, b"bcc", t)?,
            Cc(t) => self.header_contains(msg, b"cc", t)?,
            From(t) => self.header_contains(msg, b"from", t)?,
            To(t) => self.header_contains(msg, b"to", t)?,
            Subject(t) => self.header_contains(msg, b"subject", t)?,
            Header(field, t) => {
                self.header_contains(msg, field.as_bytes().to_ascii_lowercase().as_slice(), t)?
            }
            Body(t) => {
                let content = self.content_of(msg)?;
                contains_ci(&body_block(&content), t.as_bytes())
            }
            Text(t) => {
                let content = self.content_of(msg)?;
                contains_ci(&content, t.as_bytes())
            }
        })
    }

    fn header_contains(
        &self,
        msg: &Msg,
        field: &[u8],
        needle: &IString,
    ) -> Result<bool, MaildirError> {
        let content = self.content_of(msg)?;
        match citm_imap::imf::find_header(&content, field) {
            Some(value) => Ok(contains_ci(&value, needle.as_bytes())),
            None => Ok(false),
        }
    }

    // ---- relayed commands ----

    /// STORE: translate to a UID STORE for upstream.
    pub fn store(
        &self,
        set: &SeqSet,
        unchangedsince: Option<u64>,
        sign: StoreSign,
        silent: bool,
        flags: &Flags,
        uid_mode: bool,
    ) -> Result<DnReply, MaildirError> {
        if self.readonly {
            return Err(MaildirError::Value("mailbox is read-only".into()));
        }
        let uids = self.set_to_uids(set, uid_mode)?;
        Ok(DnReply {
            data: Vec::new(),
            code: None,
            relay: Some(CommandBody::Store {
                uid: true,
                set: uids,
                unchangedsince,
                sign,
                silent,
                flags: flags.clone(),
            }),
        })
    }

    /// COPY: translate to a UID COPY for upstream.
    pub fn copy(
        &self,
        set: &SeqSet,
        mailbox: &Mailbox,
        uid_mode: bool,
    ) -> Result<DnReply, MaildirError> {
        let uids = self.set_to_uids(set, uid_mode)?;
        Ok(DnReply {
            data: Vec::new(),
            code: None,
            relay: Some(CommandBody::Copy { uid: true, set: uids, mailbox: mailbox.clone() }),
        })
    }

    /// EXPUNGE (or UID EXPUNGE): relay upstream; the expunges flow back
    /// through the downloader and out as unilateral responses.
    pub fn expunge(&self, uid_set: Option<&SeqSet>) -> Result<DnReply, MaildirError> {
        if self.readonly {
            return Err(MaildirError::Value("mailbox is read-only".into()));
        }
        let relay = match uid_set {
            Some(set) => {
                // restrict to messages that are both \Deleted and in the set
                let doomed: Vec<u32> = self
                    .known
                    .msgs
                    .values()
                    .filter(|m| m.flags.deleted)
                    .map(|m| m.uid)
                    .filter(|&u| set.contains(u, self.known.max_uid()))
                    .collect();
                match SeqSet::from_uids(&doomed) {
                    Some(uids) => Some(CommandBody::UidExpunge(uids)),
                    None => None,
                }
            }
            None => Some(CommandBody::Expunge),
        };
        Ok(DnReply { data: Vec::new(), code: None, relay })
    }

    fn set_to_uids(&self, set: &SeqSet, uid_mode: bool) -> Result<SeqSet, MaildirError> {
        let uids: Vec<u32> = self
            .resolve_set(set, uid_mode)
            .into_iter()
            .map(|(_seq, m)| m.uid)
            .collect();
        SeqSet::from_uids(&uids)
            .ok_or_else(|| MaildirError::Value("no matching messages".into()))
    }
}

fn untagged_ok(code: Code, text: &str) -> Response {
    Response::Status(ResponseStatus::ok(None, Some(code), text))
}

fn default_flags() -> Flags {
    Flags {
        answered: true,
        flagged: true,
        deleted: true,
        seen: true,
        draft: true,
        ..Flags::default()
    }
}

fn default_perm_flags() -> PermFlags {
    PermFlags {
        answered: true,
        flagged: true,
        deleted: true,
        seen: true,
        draft: true,
        asterisk: false,
        ..PermFlags::default()
    }
}

fn wants_body(attrs: &[FetchAttr]) -> bool {
    attrs.iter().any(|a| {
        matches!(
            a,
            FetchAttr::Rfc822
                | FetchAttr::Rfc822Text
                | FetchAttr::BodySection { peek: false, .. }
        )
    })
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

fn date_epoch(d: &SearchDate) -> i64 {
    ImapTime {
        year: d.year,
        month: d.month,
        day: d.day,
        ..ImapTime::default()
    }
    .to_epoch()
}

fn contains_ci(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    haystack
        .windows(needle.len())
        .any(|w| w.eq_ignore_ascii_case(needle))
}

/// Everything through the blank line, CRLF included.
fn header_block(content: &[u8]) -> Vec<u8> {
    match find_body_start(content) {
        Some(start) => content[..start].to_vec(),
        None => content.to_vec(),
    }
}

fn body_block(content: &[u8]) -> Vec<u8> {
    match find_body_start(content) {
        Some(start) => content[start..].to_vec(),
        None => Vec::new(),
    }
}

fn find_body_start(content: &[u8]) -> Option<usize> {
    if let Some(pos) = content.windows(4).position(|w| w == b"\r\n\r\n") {
        return Some(pos + 4);
    }
    content.windows(2).position(|w| w == b"\n\n").map(|p| p + 2)
}

/// A single-part text/plain structure: enough for clients that ask for
/// BODYSTRUCTURE before fetching sections.  Full MIME dissection is a
/// non-goal; the content-type header decides text vs opaque bytes.
fn body_structure(content: &[u8]) -> BodyStructure {
    let body = body_block(content);
    let lines = body.iter().filter(|&&b| b == b'\n').count() as u32;
    let (ctype, subtype) = match citm_imap::imf::find_header(content, b"content-type") {
        Some(value) => {
            let value = String::from_utf8_lossy(&value);
            let mime = value.split(';').next().unwrap_or("").trim();
            match mime.split_once('/') {
                Some((t, s)) => (t.trim().to_string(), s.trim().to_string()),
                None => ("text".into(), "plain".into()),
            }
        }
        None => ("text".into(), "plain".into()),
    };
    let is_text = ctype.eq_ignore_ascii_case("text");
    BodyStructure {
        content_type: IString::from(ctype),
        subtype: IString::from(subtype),
        params: vec![(IString::from("charset"), IString::from("us-ascii"))],
        id: None,
        description: None,
        encoding: IString::from("7bit"),
        size: body.len() as u32,
        lines: is_text.then_some(lines),
    }
}

/// The bytes a BODY[...] section addresses.  Part paths beyond the
/// whole-message part 1 degrade to the whole body.
fn section_bytes(content: &[u8], section: &Section) -> Vec<u8> {
    match &section.text {
        None => content.to_vec(),
        Some(SectionText::Header) => header_block(content),
        Some(SectionText::Text) => body_block(content),
        Some(SectionText::Mime) => header_block(content),
        Some(SectionText::HeaderFields(fields)) => pick_header_fields(content, fields, false),
        Some(SectionText::HeaderFieldsNot(fields)) => pick_header_fields(content, fields, true),
    }
}

/// Rebuild a header block containing only (or everything but) the named
/// fields, preserving folded lines, ending with the blank line.
fn pick_header_fields(content: &[u8], fields: &[IString], invert: bool) -> Vec<u8> {
    let header = header_block(content);
    let mut out = Vec::new();
    let mut keep = false;
    for line in split_keepends(&header) {
        let is_continuation = line.first().is_some_and(|&b| b == b' ' || b == b'\t');
        if !is_continuation {
            let name_end = line.iter().position(|&b| b == b':');
            keep = match name_end {
                Some(end) => {
                    let name = &line[..end];
                    let hit = fields
                        .iter()
                        .any(|f| f.as_bytes().eq_ignore_ascii_case(name));
                    hit != invert
                }
                None => false,
            };
        }
        if keep {
            out.extend_from_slice(line);
        }
    }
    out.extend_from_slice(b"\r\n");
    out
}

fn split_keepends(block: &[u8]) -> Vec<&[u8]> {
    let mut out = Vec::new();
    let mut start = 0;
    for (i, &b) in block.iter().enumerate() {
        if b == b'\n' {
            out.push(&block[start..=i]);
            start = i + 1;
        }
    }
    if start < block.len() {
        out.push(&block[start..]);
    }
    out
}
