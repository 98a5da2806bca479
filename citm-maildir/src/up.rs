//! The upstream downloader.
//!
//! One of these runs per selected folder, driving the single active
//! upstream connection:
//!
//! ```text
//! Unselected --select--> Selecting --> MetaSync --> FetchingBodies --+
//!                            ^  (skipped with QRESYNC)               |
//!                            |                                       v
//!                            +---- reconcile <-- interrupt <-- Idling (synced)
//! ```
//!
//! Entering Idling broadcasts "synced" to the owner; any unilateral
//! response while idling interrupts the IDLE and reconciles.  A close
//! request at any point drains to CLOSE and reports unselected.

use std::collections::HashMap;
use std::sync::Arc;

use citm_imap::extensions::{Ext, Extensions};
use citm_imap::types::command::{Command, CommandBody, QresyncParam};
use citm_imap::types::core::{Tag, TagGen};
use citm_imap::types::fetch::{FetchAttr, FetchMods, FetchSpec};
use citm_imap::types::mailbox::Mailbox;
use citm_imap::types::response::{Code, MsgAttr, Response, ResponseData, ResponseStatus, StatusKind};
use citm_imap::types::sequence::SeqSet;
use citm_crypto::{CryptoError, Decrypter, Keypair};

use crate::error::MaildirError;
use crate::imaildir::{Imaildir, LOCAL_UID_BASE};
use crate::msg::{MsgFlags, MsgState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpState {
    Unselected,
    Selecting,
    /// Waiting on the UID FETCH FLAGS round.
    MetaSync,
    FetchingBodies,
    Idling,
    /// DONE sent, waiting for the IDLE's tagged OK.
    IdleInterrupted,
    Closing,
    Closed,
}

/// What one stimulus produced.
#[derive(Debug, Default)]
pub struct UpOutput {
    pub cmds: Vec<Command>,
    /// The folder just became synchronized with upstream.
    pub synced: bool,
    /// The CLOSE completed; the connection is free again.
    pub unselected: bool,
    /// Messages stored as ciphertext because our key was absent.
    pub not_for_me: Vec<u32>,
}

impl UpOutput {
    fn send(cmd: Command) -> UpOutput {
        UpOutput { cmds: vec![cmd], ..UpOutput::default() }
    }
}

pub struct UpSession {
    dir: Arc<Imaildir>,
    keypair: Arc<Keypair>,
    exts: Extensions,
    state: UpState,
    select_tag: Option<Tag>,
    meta_tag: Option<Tag>,
    idle_tag: Option<Tag>,
    close_tag: Option<Tag>,
    /// outstanding body downloads, tag -> uid
    body_tags: HashMap<Tag, u32>,
    /// uids seen during a full meta sync, for expunge reconciliation
    seen_uids: Option<Vec<u32>>,
    /// remote HIGHESTMODSEQ from the last SELECT
    remote_himodseq: Option<u64>,
    /// whether this reconcile can trust VANISHED instead of a full scan
    quick_reconcile: bool,
    close_requested: bool,
}

impl UpSession {
    pub fn new(dir: Arc<Imaildir>, keypair: Arc<Keypair>, exts: Extensions) -> UpSession {
        UpSession {
            dir,
            keypair,
            exts,
            state: UpState::Unselected,
            select_tag: None,
            meta_tag: None,
            idle_tag: None,
            close_tag: None,
            body_tags: HashMap::new(),
            seen_uids: None,
            remote_himodseq: None,
            quick_reconcile: false,
            close_requested: false,
        }
    }

    pub fn synced(&self) -> bool {
        matches!(self.state, UpState::Idling | UpState::IdleInterrupted)
    }

    pub fn is_idling(&self) -> bool {
        self.state == UpState::Idling && self.idle_tag.is_some()
    }

    /// Terminate the running IDLE so the shared connection can carry
    /// another command.  Returns the DONE to send, once.
    pub fn interrupt_idle(&mut self) -> Option<Command> {
        if !self.is_idling() {
            return None;
        }
        self.state = UpState::IdleInterrupted;
        Some(Command::new(Tag::new("done").unwrap(), CommandBody::IdleDone))
    }

    /// Kick off the SELECT.
    pub fn start(&mut self, tags: &mut TagGen) -> Result<UpOutput, MaildirError> {
        let qresync = self.exts.is_on(Ext::Qresync);
        let uidvld = self.dir.uidvalidity();
        let qresync_param = match (qresync, uidvld) {
            (true, Some(uidvalidity)) => Some(QresyncParam {
                uidvalidity,
                modseq: self.dir.persisted_himodseq()?,
                known_uids: None,
                seq_match: None,
            }),
            _ => None,
        };
        self.quick_reconcile = qresync_param.is_some();
        let tag = tags.next();
        self.select_tag = Some(tag.clone());
        self.state = UpState::Selecting;
        Ok(UpOutput::send(Command::new(
            tag,
            CommandBody::Select {
                mailbox: Mailbox::new(self.dir.name().into()),
                qresync: qresync_param,
            },
        )))
    }

    /// The owner wants the folder closed.
    pub fn request_close(&mut self, tags: &mut TagGen) -> Result<UpOutput, MaildirError> {
        self.close_requested = true;
        match self.state {
            UpState::Idling => {
                match self.interrupt_idle() {
                    Some(done) => Ok(UpOutput::send(done)),
                    // no IDLE actually in flight (server without IDLE):
                    // go straight to the CLOSE
                    None => self.begin_close(tags),
                }
            }
            UpState::Unselected | UpState::Closed => {
                self.state = UpState::Closed;
                Ok(UpOutput { unselected: true, ..UpOutput::default() })
            }
            // mid-sync: drain at the next tagged response
            _ => Ok(UpOutput::default()),
        }
    }

    /// Feed one upstream response.
    pub fn on_response(
        &mut self,
        resp: &Response,
        tags: &mut TagGen,
    ) -> Result<UpOutput, MaildirError> {
        match resp {
            Response::Status(st) => self.on_status(st, tags),
            Response::Data(data) => self.on_data(data, tags),
            Response::Plus { .. } => Ok(UpOutput::default()),
        }
    }

    fn on_status(
        &mut self,
        st: &ResponseStatus,
        tags: &mut TagGen,
    ) -> Result<UpOutput, MaildirError> {
        // untagged OK carry state in their codes
        if st.tag.is_none() {
            if let Some(code) = &st.code {
                self.on_code(code)?;
            }
            return Ok(UpOutput::default());
        }
        let tag = st.tag.clone().unwrap();
        if st.kind != StatusKind::Ok {
            return Err(MaildirError::Value(format!(
                "upstream refused {}: {} {}",
                tag,
                st.kind.token(),
                st.text
            )));
        }
        if let Some(code) = &st.code {
            self.on_code(code)?;
        }

        if self.select_tag.as_ref() == Some(&tag) {
            self.select_tag = None;
            return self.after_select(tags);
        }
        if self.meta_tag.as_ref() == Some(&tag) {
            self.meta_tag = None;
            return self.after_meta_sync(tags);
        }
        if let Some(uid) = self.body_tags.remove(&tag) {
            let _ = uid;
            if self.body_tags.is_empty() {
                return self.after_bodies(tags);
            }
            return Ok(UpOutput::default());
        }
        if self.idle_tag.as_ref() == Some(&tag) {
            self.idle_tag = None;
            return self.after_idle_done(tags);
        }
        if self.close_tag.as_ref() == Some(&tag) {
            self.close_tag = None;
            self.state = UpState::Closed;
            return Ok(UpOutput { unselected: true, ..UpOutput::default() });
        }
        Ok(UpOutput::default())
    }

    fn on_code(&mut self, code: &Code) -> Result<(), MaildirError> {
        match code {
            Code::UidValidity(v) => {
                if self.dir.observe_uidvalidity(*v)? {
                    // local state was dropped; a quick reconcile would lie
                    self.quick_reconcile = false;
                }
            }
            Code::HighestModSeq(n) => self.remote_himodseq = Some(*n),
            Code::NoModSeq => self.remote_himodseq = None,
            // CLOSED marks the boundary between old- and new-mailbox
            // responses during a QRESYNC SELECT; nothing to do, state
            // mutations are UID-addressed
            Code::Closed => {}
            _ => {}
        }
        Ok(())
    }

    fn on_data(
        &mut self,
        data: &ResponseData,
        tags: &mut TagGen,
    ) -> Result<UpOutput, MaildirError> {
        match data {
            ResponseData::Fetch { num, attrs } => self.on_fetch(*num, attrs),
            ResponseData::Vanished { uids, .. } => {
                // a vanished uid-set is explicit: '*' is not valid in
                // it, and an absurd span is a server protocol error
                for r in uids.ranges() {
                    if r.a == 0 || r.b == 0 {
                        return Err(MaildirError::Value("'*' in a VANISHED set".into()));
                    }
                    let (a, b) = (r.a.min(r.b), r.a.max(r.b));
                    if b - a > 100_000 {
                        return Err(MaildirError::Value(
                            "unreasonably wide VANISHED range".into(),
                        ));
                    }
                    for uid in a..=b {
                        self.dir.expunge(uid, 0)?;
                    }
                }
                self.maybe_interrupt_idle(tags)
            }
            ResponseData::Expunge(seq) => {
                // sequence-numbered expunge from a non-QRESYNC server:
                // map through the snapshot
                let snap = self.dir.snapshot();
                if let Some(uid) = snap.uid_of_seq(*seq) {
                    if uid < LOCAL_UID_BASE {
                        self.dir.expunge(uid, 0)?;
                    }
                }
                self.maybe_interrupt_idle(tags)
            }
            ResponseData::Exists(_) | ResponseData::Recent(_) => self.maybe_interrupt_idle(tags),
            _ => Ok(UpOutput::default()),
        }
    }

    /// New activity while idling means DONE + reconcile.
    fn maybe_interrupt_idle(&mut self, _tags: &mut TagGen) -> Result<UpOutput, MaildirError> {
        match self.interrupt_idle() {
            Some(done) => Ok(UpOutput::send(done)),
            None => Ok(UpOutput::default()),
        }
    }

    fn on_fetch(&mut self, num: u32, attrs: &[MsgAttr]) -> Result<UpOutput, MaildirError> {
        let mut uid = None;
        let mut flags = None;
        let mut modseq = 0u64;
        let mut internaldate = None;
        let mut size = None;
        let mut body: Option<&Vec<u8>> = None;
        for attr in attrs {
            match attr {
                MsgAttr::Uid(u) => uid = Some(*u),
                MsgAttr::Flags(f) => flags = Some(MsgFlags::from_fetch(f)),
                MsgAttr::ModSeq(m) => modseq = *m,
                MsgAttr::InternalDate(t) => internaldate = Some(t.to_epoch()),
                MsgAttr::Rfc822Size(n) => size = Some(*n),
                MsgAttr::Rfc822(b) => body = Some(b),
                MsgAttr::BodySection { data: Some(b), .. } => body = Some(b),
                _ => {}
            }
        }
        let Some(uid) = uid else {
            // sequence-only FETCH: resolve through the snapshot
            let snap = self.dir.snapshot();
            let Some(u) = snap.uid_of_seq(num) else {
                return Ok(UpOutput::default());
            };
            if let Some(f) = flags {
                self.dir.update_meta(u, f, internaldate, size, modseq)?;
            }
            return Ok(UpOutput::default());
        };

        if let Some(seen) = &mut self.seen_uids {
            seen.push(uid);
        }
        if let Some(f) = flags {
            self.dir.update_meta(uid, f, internaldate, size, modseq)?;
        } else if internaldate.is_some() || size.is_some() {
            let snap = self.dir.snapshot();
            let f = snap.msgs.get(&uid).map(|m| m.flags).unwrap_or_default();
            self.dir.update_meta(uid, f, internaldate, size, modseq)?;
        }

        let mut out = UpOutput::default();
        if let Some(cipher) = body {
            match self.decrypt(cipher) {
                Ok(plain) => self.dir.store_content(uid, &plain, MsgState::Filled)?,
                Err(e) if e.is_not_for_me() => {
                    tracing::info!(uid, mailbox = %self.dir.name(), "message not for us, keeping ciphertext");
                    self.dir.store_content(uid, cipher, MsgState::NotForMe)?;
                    out.not_for_me.push(uid);
                }
                Err(e) => return Err(e.into()),
            }
        }
        // a FETCH outside MetaSync while idling is an interrupt signal
        if self.state == UpState::Idling {
            let mut int = self.maybe_interrupt_idle(&mut TagGen::new("x"))?;
            out.cmds.append(&mut int.cmds);
        }
        Ok(out)
    }

    fn decrypt(&self, cipher: &[u8]) -> Result<Vec<u8>, CryptoError> {
        // not an envelope at all: store as-is (plaintext mail that
        // predates encryption, or foreign mail)
        if !citm_crypto::envelope::is_envelope(cipher) {
            return Ok(cipher.to_vec());
        }
        let mut dec = Decrypter::new(&self.keypair);
        dec.update(cipher)?;
        dec.finish()
    }

    fn after_select(&mut self, tags: &mut TagGen) -> Result<UpOutput, MaildirError> {
        if self.close_requested {
            return self.begin_close(tags);
        }
        if self.quick_reconcile {
            // QRESYNC replayed expunges and changes during SELECT
            self.begin_bodies(tags)
        } else {
            self.begin_meta_sync(tags, true)
        }
    }

    fn begin_meta_sync(
        &mut self,
        tags: &mut TagGen,
        full: bool,
    ) -> Result<UpOutput, MaildirError> {
        self.state = UpState::MetaSync;
        self.seen_uids = if full { Some(Vec::new()) } else { None };
        let mut attrs = vec![FetchAttr::Flags];
        if self.remote_himodseq.is_some() {
            attrs.push(FetchAttr::ModSeq);
        }
        let mods = if !full && self.exts.is_on(Ext::Qresync) {
            FetchMods {
                changedsince: Some(self.dir.persisted_himodseq()?),
                vanished: true,
            }
        } else {
            FetchMods::default()
        };
        let tag = tags.next();
        self.meta_tag = Some(tag.clone());
        Ok(UpOutput::send(Command::new(
            tag,
            CommandBody::Fetch {
                uid: true,
                set: SeqSet::range(1, 0),
                spec: FetchSpec::Attrs(attrs),
                mods,
            },
        )))
    }

    fn after_meta_sync(&mut self, tags: &mut TagGen) -> Result<UpOutput, MaildirError> {
        if let Some(seen) = self.seen_uids.take() {
            // anything we know that upstream did not mention is gone
            let seen: std::collections::HashSet<u32> = seen.into_iter().collect();
            let snap = self.dir.snapshot();
            for &uid in snap.msgs.keys() {
                if uid < LOCAL_UID_BASE && !seen.contains(&uid) {
                    self.dir.expunge(uid, 0)?;
                }
            }
        }
        if self.close_requested {
            return self.begin_close(tags);
        }
        self.begin_bodies(tags)
    }

    fn begin_bodies(&mut self, tags: &mut TagGen) -> Result<UpOutput, MaildirError> {
        let unfilled = self.dir.unfilled_uids();
        if unfilled.is_empty() {
            return self.go_idle(tags);
        }
        self.state = UpState::FetchingBodies;
        let mut out = UpOutput::default();
        for uid in unfilled {
            let tag = tags.next();
            self.body_tags.insert(tag.clone(), uid);
            out.cmds.push(Command::new(
                tag,
                CommandBody::Fetch {
                    uid: true,
                    set: SeqSet::single(uid),
                    spec: FetchSpec::Attrs(vec![
                        FetchAttr::InternalDate,
                        FetchAttr::Rfc822,
                    ]),
                    mods: FetchMods::default(),
                },
            ));
        }
        Ok(out)
    }

    fn after_bodies(&mut self, tags: &mut TagGen) -> Result<UpOutput, MaildirError> {
        if self.close_requested {
            return self.begin_close(tags);
        }
        self.go_idle(tags)
    }

    /// Caught up: persist the high-water mark, broadcast synced, idle.
    fn go_idle(&mut self, tags: &mut TagGen) -> Result<UpOutput, MaildirError> {
        if let Some(hi) = self.remote_himodseq {
            self.dir.store_himodseq(hi)?;
        }
        let mut out;
        if self.exts.is_available(Ext::Idle) {
            let tag = tags.next();
            self.idle_tag = Some(tag.clone());
            self.state = UpState::Idling;
            out = UpOutput::send(Command::new(tag, CommandBody::Idle));
        } else {
            // no IDLE upstream: the owner polls via keepalive()
            self.state = UpState::Idling;
            out = UpOutput::default();
        }
        out.synced = true;
        Ok(out)
    }

    fn after_idle_done(&mut self, tags: &mut TagGen) -> Result<UpOutput, MaildirError> {
        if self.close_requested {
            return self.begin_close(tags);
        }
        // reconcile; quick if QRESYNC lets the server replay expunges
        self.quick_reconcile = false;
        if self.exts.is_on(Ext::Qresync) {
            self.begin_meta_sync(tags, false)
        } else {
            self.begin_meta_sync(tags, true)
        }
    }

    fn begin_close(&mut self, tags: &mut TagGen) -> Result<UpOutput, MaildirError> {
        let tag = tags.next();
        self.close_tag = Some(tag.clone());
        self.state = UpState::Closing;
        Ok(UpOutput::send(Command::new(tag, CommandBody::Close)))
    }

    /// Periodic poke for servers without IDLE: cheap NOOP to pick up
    /// unilateral responses.
    pub fn keepalive(&mut self, tags: &mut TagGen) -> Option<Command> {
        if self.state == UpState::Idling && self.idle_tag.is_none() {
            return Some(Command::new(tags.next(), CommandBody::Noop));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use citm_imap::types::flag::FetchFlags;

    fn fixture(exts: Extensions) -> (tempfile::TempDir, UpSession, TagGen) {
        let t = tempfile::tempdir().unwrap();
        let dir = Arc::new(Imaildir::open(t.path().join("box"), "box".into()).unwrap());
        let kp = Arc::new(Keypair::generate(1024).unwrap());
        let up = UpSession::new(dir, kp, exts);
        (t, up, TagGen::new("u"))
    }

    fn ok(tag: &Tag) -> Response {
        Response::Status(ResponseStatus::ok(Some(tag.clone()), None, "done"))
    }

    fn fetch_flags(uid: u32, modseq: u64) -> Response {
        Response::Data(ResponseData::Fetch {
            num: 1,
            attrs: vec![
                MsgAttr::Uid(uid),
                MsgAttr::Flags(FetchFlags::default()),
                MsgAttr::ModSeq(modseq),
            ],
        })
    }

    #[test]
    fn initial_sync_without_qresync() {
        let mut exts = Extensions::all_available();
        exts.trigger(Ext::Idle);
        let (_t, mut up, mut tags) = fixture(exts);

        let out = up.start(&mut tags).unwrap();
        assert_eq!(out.cmds.len(), 1);
        let select_tag = out.cmds[0].tag.clone();
        assert!(matches!(out.cmds[0].body, CommandBody::Select { .. }));

        // untagged select responses
        up.on_response(
            &Response::Status(ResponseStatus::ok(None, Some(Code::UidValidity(123)), "")),
            &mut tags,
        )
        .unwrap();
        up.on_response(
            &Response::Status(ResponseStatus::ok(None, Some(Code::HighestModSeq(7)), "")),
            &mut tags,
        )
        .unwrap();
        up.on_response(&Response::Data(ResponseData::Exists(2)), &mut tags).unwrap();

        // tagged OK triggers the meta sync
        let out = up.on_response(&ok(&select_tag), &mut tags).unwrap();
        assert_eq!(out.cmds.len(), 1);
        let meta_tag = out.cmds[0].tag.clone();
        assert!(matches!(
            out.cmds[0].body,
            CommandBody::Fetch { uid: true, .. }
        ));

        up.on_response(&fetch_flags(4, 5), &mut tags).unwrap();
        up.on_response(&fetch_flags(9, 6), &mut tags).unwrap();
        let out = up.on_response(&ok(&meta_tag), &mut tags).unwrap();

        // two unfilled messages -> two body fetches
        assert_eq!(out.cmds.len(), 2);
        let body_tags: Vec<Tag> = out.cmds.iter().map(|c| c.tag.clone()).collect();

        // bodies arrive (not envelopes, stored verbatim)
        up.on_response(
            &Response::Data(ResponseData::Fetch {
                num: 1,
                attrs: vec![MsgAttr::Uid(4), MsgAttr::Rfc822(b"plain one".to_vec())],
            }),
            &mut tags,
        )
        .unwrap();
        up.on_response(&ok(&body_tags[0]), &mut tags).unwrap();
        up.on_response(
            &Response::Data(ResponseData::Fetch {
                num: 2,
                attrs: vec![MsgAttr::Uid(9), MsgAttr::Rfc822(b"plain two".to_vec())],
            }),
            &mut tags,
        )
        .unwrap();
        let out = up.on_response(&ok(&body_tags[1]), &mut tags).unwrap();

        // synced + IDLE issued
        assert!(out.synced);
        assert!(up.synced());
        assert_eq!(out.cmds.len(), 1);
        assert!(matches!(out.cmds[0].body, CommandBody::Idle));
    }

    #[test]
    fn idle_interrupt_reconciles() {
        let mut exts = Extensions::all_available();
        exts.trigger(Ext::Idle);
        let (_t, mut up, mut tags) = fixture(exts);

        let out = up.start(&mut tags).unwrap();
        let select_tag = out.cmds[0].tag.clone();
        up.on_response(
            &Response::Status(ResponseStatus::ok(None, Some(Code::UidValidity(1)), "")),
            &mut tags,
        )
        .unwrap();
        let out = up.on_response(&ok(&select_tag), &mut tags).unwrap();
        let meta_tag = out.cmds[0].tag.clone();
        let out = up.on_response(&ok(&meta_tag), &mut tags).unwrap();
        let idle_tag = out.cmds[0].tag.clone();
        assert!(out.synced);

        // unilateral EXISTS while idling -> DONE
        let out = up
            .on_response(&Response::Data(ResponseData::Exists(3)), &mut tags)
            .unwrap();
        assert!(matches!(out.cmds[0].body, CommandBody::IdleDone));

        // tagged OK for the IDLE -> new meta sync
        let out = up.on_response(&ok(&idle_tag), &mut tags).unwrap();
        assert!(matches!(out.cmds[0].body, CommandBody::Fetch { .. }));
    }

    #[test]
    fn meta_sync_reconciles_expunges() {
        let exts = Extensions::all_available();
        let (_t, mut up, mut tags) = fixture(exts);
        up.dir.observe_uidvalidity(1).unwrap();
        up.dir
            .update_meta(5, MsgFlags::default(), Some(0), Some(1), 2)
            .unwrap();
        up.dir.store_content(5, b"x", MsgState::Filled).unwrap();

        let out = up.start(&mut tags).unwrap();
        let select_tag = out.cmds[0].tag.clone();
        let out = up.on_response(&ok(&select_tag), &mut tags).unwrap();
        let meta_tag = out.cmds[0].tag.clone();
        // upstream only mentions uid 8
        up.on_response(&fetch_flags(8, 3), &mut tags).unwrap();
        up.on_response(&ok(&meta_tag), &mut tags).unwrap();

        let snap = up.dir.snapshot();
        assert!(!snap.msgs.contains_key(&5));
        assert!(snap.expunged.contains_key(&5));
        assert!(snap.msgs.contains_key(&8));
    }

    #[test]
    fn close_request_drains() {
        let mut exts = Extensions::all_available();
        exts.trigger(Ext::Idle);
        let (_t, mut up, mut tags) = fixture(exts);
        let out = up.start(&mut tags).unwrap();
        let select_tag = out.cmds[0].tag.clone();
        let out = up.on_response(&ok(&select_tag), &mut tags).unwrap();
        let meta_tag = out.cmds[0].tag.clone();
        let out = up.on_response(&ok(&meta_tag), &mut tags).unwrap();
        let idle_tag = out.cmds[0].tag.clone();

        let out = up.request_close(&mut tags).unwrap();
        assert!(matches!(out.cmds[0].body, CommandBody::IdleDone));
        let out = up.on_response(&ok(&idle_tag), &mut tags).unwrap();
        let close_tag = out.cmds[0].tag.clone();
        assert!(matches!(out.cmds[0].body, CommandBody::Close));
        let out = up.on_response(&ok(&close_tag), &mut tags).unwrap();
        assert!(out.unselected);
    }
}
