//! The server-client bridge: one downstream session, one upstream
//! session, one keydir, and whichever folder is currently selected.
//!
//! The bridge serves SELECTED-state reads from the local store (via
//! [`DnView`]), relays mutations upstream, encrypts every APPEND to the
//! full recipient set, and arbitrates the destructive commands with
//! dirmgr freezes and holds.  A broken upstream connection cancels the
//! bridge; a downstream hang-up shuts it down gracefully.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use citm_imap::extensions::Ext;
use citm_imap::parse::CmdEvent;
use citm_imap::types::command::{Command, CommandBody, QresyncParam};
use citm_imap::types::core::Tag;
use citm_imap::types::datetime::ImapTime;
use citm_imap::types::mailbox::Mailbox;
use citm_imap::types::response::{
    Capa, Code, Response, ResponseData, ResponseStatus, StatusKind,
};
use citm_maildir::dirmgr::{Dirmgr, Freeze, Hold};
use citm_maildir::dn::DnView;
use citm_maildir::msg::MsgFlags;
use citm_maildir::up::UpSession;
use tokio::sync::broadcast;

use crate::anon::dn_capabilities;
use crate::conn::{ImapClientConn, ImapServerConn};
use crate::error::ProtoError;
use crate::keydir::Keydir;

pub struct ScContext {
    pub keydir: Arc<dyn Keydir>,
    pub dirmgr: Arc<Dirmgr>,
}

/// What we are waiting on from upstream for a downstream command.
enum Pending {
    /// LIST/LSUB/STATUS/CREATE/SUBSCRIBE/UNSUBSCRIBE: forward matching
    /// untagged data, then the tagged result.
    Passthru,
    /// STORE/COPY/EXPUNGE relays: reflect local changes before the
    /// tagged result.
    Relay,
    Append {
        hold: Hold,
        mailbox: Mailbox,
        tmp_id: u64,
        flags: MsgFlags,
        internaldate: i64,
    },
    Delete {
        freeze: Freeze,
    },
    Rename {
        src: Freeze,
        dst: Freeze,
    },
}

struct Selected {
    view: DnView,
    up: UpSession,
    updates: broadcast::Receiver<()>,
    mailbox: Mailbox,
    /// SELECT answered once the downloader reports synced.
    pending_select: Option<(Tag, Option<QresyncParam>)>,
    closing_for: Option<CloseReason>,
}

enum CloseReason {
    /// UNSELECT (no expunge semantics here; CLOSE relays its expunge
    /// separately first).
    Unselect(Tag),
    Close(Tag),
    /// Tear down the old folder, then select a new one.
    Switch(Box<SelectArgs>),
    Logout,
}

struct SelectArgs {
    tag: Tag,
    mailbox: Mailbox,
    qresync: Option<QresyncParam>,
    examine: bool,
}

struct Sc {
    ctx: ScContext,
    pending: HashMap<Tag, (Tag, Pending)>,
    selected: Option<Selected>,
    /// a SELECT waiting for the previous folder's teardown
    deferred_select: Option<SelectArgs>,
    /// downstream IDLE in progress (tag to answer at DONE)
    dn_idle: Option<Tag>,
    logout: bool,
}

/// Run one bridge to completion.
pub async fn run(
    mut dn: ImapServerConn,
    mut up: ImapClientConn,
    ctx: ScContext,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<(), ProtoError> {
    let mut sc = Sc {
        ctx,
        pending: HashMap::new(),
        selected: None,
        deferred_select: None,
        dn_idle: None,
        logout: false,
    };

    enable_upstream(&mut up).await?;

    loop {
        while let Some(ev) = dn.next_event() {
            sc.on_dn_event(&mut dn, &mut up, ev).await?;
            if sc.logout && sc.selected.is_none() && sc.pending.is_empty() {
                return Ok(());
            }
        }
        if dn.pending_sync_literal().is_some() {
            dn.write(&Response::Plus { code: None, text: "OK".into() }).await?;
        }
        while let Some(resp) = up.next_response()? {
            sc.on_up_response(&mut dn, &mut up, resp).await?;
            if sc.logout && sc.selected.is_none() && sc.pending.is_empty() {
                return Ok(());
            }
        }
        sc.flush_updates(&mut dn).await?;

        let dn_open = !dn.eof();
        let has_selected = sc.selected.is_some();
        tokio::select! {
            res = dn.read_more(), if dn_open => {
                if !res? {
                    // client hung up: log out gracefully
                    sc.begin_logout(&mut up).await?;
                    if sc.selected.is_none() {
                        return Ok(());
                    }
                }
            }
            res = up.read_more() => {
                if !res? {
                    return Err(ProtoError::ConnClosed);
                }
            }
            _ = sc.update_tick(), if has_selected => {}
            _ = shutdown.changed() => {
                let _ = dn
                    .write(&Response::Status(ResponseStatus::bye("server shutting down")))
                    .await;
                return Ok(());
            }
        }
    }
}

/// Negotiate CONDSTORE/QRESYNC upstream before any SELECT.
async fn enable_upstream(up: &mut ImapClientConn) -> Result<(), ProtoError> {
    let mut wanted = Vec::new();
    for ext in [Ext::Condstore, Ext::Qresync] {
        if up.exts.is_available(ext) && up.exts.is_available(Ext::Enable) {
            wanted.push(ext.token().to_string());
        }
    }
    if wanted.is_empty() {
        return Ok(());
    }
    let tag = up.tags.next();
    up.write(&Command::new(tag.clone(), CommandBody::Enable(wanted))).await?;
    loop {
        match up.read_response().await? {
            Response::Data(ResponseData::Enabled(capas)) => {
                for capa in capas {
                    if let Some(ext) = capa.to_ext() {
                        up.exts.trigger(ext);
                    }
                }
            }
            Response::Status(ResponseStatus { tag: Some(t), kind, text, .. }) if t == tag => {
                if kind != StatusKind::Ok {
                    return Err(ProtoError::Response(format!("upstream ENABLE failed: {text}")));
                }
                return Ok(());
            }
            _ => {}
        }
    }
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl Sc {
    async fn update_tick(&mut self) {
        match &mut self.selected {
            Some(sel) => {
                // lagged just means "something changed"; both wake us
                let _ = sel.updates.recv().await;
            }
            None => std::future::pending().await,
        }
    }

    /// Reflect store changes to the client when nothing forbids it.
    async fn flush_updates(&mut self, dn: &mut ImapServerConn) -> Result<(), ProtoError> {
        let Some(sel) = &mut self.selected else {
            return Ok(());
        };
        if sel.pending_select.is_some() || sel.closing_for.is_some() {
            return Ok(());
        }
        let data = sel.view.update();
        if !data.is_empty() {
            dn.write_all(&data).await?;
        }
        Ok(())
    }

    // ---- downstream ----

    async fn on_dn_event(
        &mut self,
        dn: &mut ImapServerConn,
        up: &mut ImapClientConn,
        ev: CmdEvent,
    ) -> Result<(), ProtoError> {
        let cmd = match ev {
            CmdEvent::Cmd(cmd) => cmd,
            CmdEvent::Bad { text } => {
                return dn.write_parse_bad(&text).await;
            }
            CmdEvent::Done => {
                // end of downstream IDLE
                dn.set_awaiting_done(false);
                if let Some(tag) = self.dn_idle.take() {
                    self.ok(dn, tag, "IDLE terminated").await?;
                }
                return Ok(());
            }
        };
        let tag = cmd.tag.clone();
        match cmd.body {
            CommandBody::Capability => {
                dn.write(&Response::Data(ResponseData::Capability(dn_capabilities())))
                    .await?;
                self.ok(dn, tag, "CAPABILITY completed").await
            }
            CommandBody::Noop => {
                self.flush_updates(dn).await?;
                self.ok(dn, tag, "NOOP completed").await
            }
            CommandBody::Check => {
                self.flush_updates(dn).await?;
                self.ok(dn, tag, "CHECK completed").await
            }
            CommandBody::Enable(caps) => {
                let mut enabled = Vec::new();
                for cap in caps {
                    let capa = Capa::from_token(&cap);
                    if let Some(ext) = capa.to_ext() {
                        if matches!(ext, Ext::Condstore | Ext::Qresync)
                            && dn.exts.trigger(ext)
                        {
                            enabled.push(capa);
                        }
                    }
                }
                dn.write(&Response::Data(ResponseData::Enabled(enabled))).await?;
                self.ok(dn, tag, "ENABLE completed").await
            }
            CommandBody::Login { .. } => {
                self.bad(dn, tag, "already logged in").await
            }
            CommandBody::StartTls => self.bad(dn, tag, "TLS already negotiated").await,
            CommandBody::Logout => {
                dn.write(&Response::Status(ResponseStatus::bye("logging out"))).await?;
                self.ok(dn, tag, "LOGOUT completed").await?;
                self.logout = true;
                self.begin_logout(up).await
            }
            CommandBody::Select { mailbox, qresync } => {
                self.begin_select(
                    dn,
                    up,
                    SelectArgs { tag, mailbox, qresync, examine: false },
                )
                .await
            }
            CommandBody::Examine { mailbox, qresync } => {
                self.begin_select(
                    dn,
                    up,
                    SelectArgs { tag, mailbox, qresync, examine: true },
                )
                .await
            }
            CommandBody::List { reference, pattern } => {
                self.passthru(up, tag, CommandBody::List { reference, pattern }).await
            }
            CommandBody::Lsub { reference, pattern } => {
                self.passthru(up, tag, CommandBody::Lsub { reference, pattern }).await
            }
            CommandBody::Status { mailbox, attrs } => {
                self.passthru(up, tag, CommandBody::Status { mailbox, attrs }).await
            }
            CommandBody::Create(m) => self.passthru(up, tag, CommandBody::Create(m)).await,
            CommandBody::Subscribe(m) => {
                self.passthru(up, tag, CommandBody::Subscribe(m)).await
            }
            CommandBody::Unsubscribe(m) => {
                self.passthru(up, tag, CommandBody::Unsubscribe(m)).await
            }
            CommandBody::Delete(mailbox) => self.begin_delete(dn, up, tag, mailbox).await,
            CommandBody::Rename { from, to } => {
                self.begin_rename(dn, up, tag, from, to).await
            }
            CommandBody::Append { mailbox, flags, time, message } => {
                self.begin_append(dn, up, tag, mailbox, flags, time, message).await
            }
            CommandBody::Idle => {
                if self.selected.is_none() {
                    return self.bad(dn, tag, "IDLE requires a selected mailbox").await;
                }
                dn.write(&Response::Plus { code: None, text: "idling".into() }).await?;
                dn.set_awaiting_done(true);
                self.dn_idle = Some(tag);
                Ok(())
            }
            CommandBody::IdleDone | CommandBody::XkeySyncDone => Ok(()),
            CommandBody::Unselect => match &mut self.selected {
                Some(sel) => {
                    sel.closing_for = Some(CloseReason::Unselect(tag));
                    let out = sel.up.request_close(&mut up.tags)?;
                    let unselected = out.unselected;
                    up.write_all_cmds(&out.cmds).await?;
                    if unselected {
                        self.finish_unselect(dn).await?;
                    }
                    Ok(())
                }
                None => self.bad(dn, tag, "nothing selected").await,
            },
            CommandBody::Close => {
                if self.selected.is_none() {
                    return self.bad(dn, tag, "nothing selected").await;
                }
                // CLOSE implies a silent expunge of \Deleted
                let reply = self.selected.as_mut().unwrap().view.expunge(None)?;
                if let Some(body) = reply.relay {
                    let up_tag = up.tags.next();
                    self.pending.insert(up_tag.clone(), (tag.clone(), Pending::Relay));
                    self.send_up(up, Command::new(up_tag, body)).await?;
                }
                let sel = self.selected.as_mut().unwrap();
                sel.closing_for = Some(CloseReason::Close(tag));
                let out = sel.up.request_close(&mut up.tags)?;
                let unselected = out.unselected;
                up.write_all_cmds(&out.cmds).await?;
                if unselected {
                    self.finish_unselect(dn).await?;
                }
                Ok(())
            }
            CommandBody::Expunge => self.relay_expunge(dn, up, tag, None).await,
            CommandBody::UidExpunge(set) => {
                self.relay_expunge(dn, up, tag, Some(set)).await
            }
            CommandBody::Fetch { uid, set, spec, mods } => {
                let Some(sel) = &mut self.selected else {
                    return self.bad(dn, tag, "no mailbox selected").await;
                };
                let reply = sel.view.fetch(&set, &spec, &mods, uid)?;
                dn.write_all(&reply.data).await?;
                self.ok(dn, tag, "FETCH completed").await
            }
            CommandBody::Search { keys, uid, .. } => {
                let Some(sel) = &mut self.selected else {
                    return self.bad(dn, tag, "no mailbox selected").await;
                };
                let reply = sel.view.search(&keys, uid)?;
                dn.write_all(&reply.data).await?;
                self.ok(dn, tag, "SEARCH completed").await
            }
            CommandBody::Store { uid, set, unchangedsince, sign, silent, flags } => {
                let Some(sel) = &mut self.selected else {
                    return self.bad(dn, tag, "no mailbox selected").await;
                };
                match sel.view.store(&set, unchangedsince, sign, silent, &flags, uid) {
                    Ok(reply) => match reply.relay {
                        Some(body) => {
                            let up_tag = up.tags.next();
                            self.pending.insert(up_tag.clone(), (tag, Pending::Relay));
                            self.send_up(up, Command::new(up_tag, body)).await
                        }
                        None => self.ok(dn, tag, "STORE completed").await,
                    },
                    Err(e) => self.no(dn, tag, &e.to_string()).await,
                }
            }
            CommandBody::Copy { uid, set, mailbox } => {
                let Some(sel) = &mut self.selected else {
                    return self.bad(dn, tag, "no mailbox selected").await;
                };
                match sel.view.copy(&set, &mailbox, uid) {
                    Ok(reply) => match reply.relay {
                        Some(body) => {
                            let up_tag = up.tags.next();
                            self.pending.insert(up_tag.clone(), (tag, Pending::Relay));
                            self.send_up(up, Command::new(up_tag, body)).await
                        }
                        None => self.no(dn, tag, "no messages to copy").await,
                    },
                    Err(e) => self.no(dn, tag, &e.to_string()).await,
                }
            }
            CommandBody::XkeySync(_) | CommandBody::XkeyAdd(_) => {
                self.bad(dn, tag, "XKEY is not offered here").await
            }
        }
    }

    async fn relay_expunge(
        &mut self,
        dn: &mut ImapServerConn,
        up: &mut ImapClientConn,
        tag: Tag,
        uid_set: Option<citm_imap::types::sequence::SeqSet>,
    ) -> Result<(), ProtoError> {
        let Some(sel) = &mut self.selected else {
            return self.bad(dn, tag, "no mailbox selected").await;
        };
        match sel.view.expunge(uid_set.as_ref()) {
            Ok(reply) => match reply.relay {
                Some(body) => {
                    let up_tag = up.tags.next();
                    self.pending.insert(up_tag.clone(), (tag, Pending::Relay));
                    self.send_up(up, Command::new(up_tag, body)).await
                }
                None => self.ok(dn, tag, "EXPUNGE completed").await,
            },
            Err(e) => self.no(dn, tag, &e.to_string()).await,
        }
    }

    async fn begin_select(
        &mut self,
        dn: &mut ImapServerConn,
        up: &mut ImapClientConn,
        args: SelectArgs,
    ) -> Result<(), ProtoError> {
        if args.qresync.is_some() && !dn.exts.is_on(Ext::Qresync) {
            return self.bad(dn, args.tag, "QRESYNC not enabled").await;
        }
        if let Some(sel) = &mut self.selected {
            // finish with the old folder first
            sel.closing_for = Some(CloseReason::Switch(Box::new(args)));
            let out = sel.up.request_close(&mut up.tags)?;
            let unselected = out.unselected;
            up.write_all_cmds(&out.cmds).await?;
            if unselected {
                self.finish_unselect(dn).await?;
                if let Some(args) = self.deferred_select.take() {
                    return Box::pin(self.start_select(dn, up, args)).await;
                }
            }
            return Ok(());
        }
        self.start_select(dn, up, args).await
    }

    async fn start_select(
        &mut self,
        dn: &mut ImapServerConn,
        up: &mut ImapClientConn,
        args: SelectArgs,
    ) -> Result<(), ProtoError> {
        let name = args.mailbox.to_string_lossy();
        let dir = match self.ctx.dirmgr.open(&name) {
            Ok(dir) => dir,
            Err(e) => return self.no(dn, args.tag, &e.to_string()).await,
        };
        dir.register_up()?;
        dir.register_dn()?;
        let mut upsess = UpSession::new(dir.clone(), self.ctx.keydir.mykey(), up.exts);
        let out = upsess.start(&mut up.tags)?;
        up.write_all_cmds(&out.cmds).await?;

        let condstore = dn.exts.is_on(Ext::Condstore)
            || args.qresync.is_some()
            || dn.exts.is_on(Ext::Qresync);
        let view = DnView::new(dir.clone(), args.examine, condstore);
        self.selected = Some(Selected {
            view,
            up: upsess,
            updates: dir.subscribe(),
            mailbox: args.mailbox.clone(),
            pending_select: Some((args.tag, args.qresync)),
            closing_for: None,
        });
        Ok(())
    }

    /// Unregister both accessors and release the folder if we were the
    /// last ones out.  Returns the close reason for the caller to act
    /// on.
    fn teardown_selected(&mut self) -> Option<CloseReason> {
        let mut sel = self.selected.take()?;
        let reason = sel.closing_for.take();
        let name = sel.mailbox.to_string_lossy();
        let dir = sel.view.dir().clone();
        drop(sel);
        let dn_last = dir.unregister_dn();
        let up_last = dir.unregister_up();
        if dn_last || up_last {
            self.ctx.dirmgr.close_if_unused(&name);
        }
        reason
    }

    /// The old folder is fully closed; run the deferred action.
    async fn finish_unselect(&mut self, dn: &mut ImapServerConn) -> Result<(), ProtoError> {
        let reason = self.teardown_selected();

        match reason {
            Some(CloseReason::Unselect(tag)) => self.ok(dn, tag, "UNSELECT completed").await,
            Some(CloseReason::Close(tag)) => self.ok(dn, tag, "CLOSE completed").await,
            Some(CloseReason::Logout) | None => Ok(()),
            Some(CloseReason::Switch(args)) => {
                if dn.exts.is_on(Ext::Qresync) {
                    dn.write(&Response::Status(ResponseStatus::ok(
                        None,
                        Some(Code::Closed),
                        "previous mailbox closed",
                    )))
                    .await?;
                }
                // every caller follows up by draining deferred_select
                self.deferred_select = Some(*args);
                Ok(())
            }
        }
    }

    async fn begin_delete(
        &mut self,
        dn: &mut ImapServerConn,
        up: &mut ImapClientConn,
        tag: Tag,
        mailbox: Mailbox,
    ) -> Result<(), ProtoError> {
        if self.is_selected_mailbox(&mailbox) {
            return self.no(dn, tag, "cannot DELETE the selected mailbox").await;
        }
        let freeze = match self.ctx.dirmgr.freeze(&mailbox.to_string_lossy()) {
            Ok(freeze) => freeze,
            Err(e) => return self.no(dn, tag, &e.to_string()).await,
        };
        let up_tag = up.tags.next();
        self.pending
            .insert(up_tag.clone(), (tag, Pending::Delete { freeze }));
        self.send_up(up, Command::new(up_tag, CommandBody::Delete(mailbox))).await
    }

    async fn begin_rename(
        &mut self,
        dn: &mut ImapServerConn,
        up: &mut ImapClientConn,
        tag: Tag,
        from: Mailbox,
        to: Mailbox,
    ) -> Result<(), ProtoError> {
        if self.is_selected_mailbox(&from) || self.is_selected_mailbox(&to) {
            return self.no(dn, tag, "cannot RENAME the selected mailbox").await;
        }
        let src = match self.ctx.dirmgr.freeze(&from.to_string_lossy()) {
            Ok(freeze) => freeze,
            Err(e) => return self.no(dn, tag, &e.to_string()).await,
        };
        let dst = match self.ctx.dirmgr.freeze(&to.to_string_lossy()) {
            Ok(freeze) => freeze,
            Err(e) => return self.no(dn, tag, &e.to_string()).await,
        };
        let up_tag = up.tags.next();
        self.pending
            .insert(up_tag.clone(), (tag, Pending::Rename { src, dst }));
        self.send_up(up, Command::new(up_tag, CommandBody::Rename { from, to })).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn begin_append(
        &mut self,
        dn: &mut ImapServerConn,
        up: &mut ImapClientConn,
        tag: Tag,
        mailbox: Mailbox,
        flags: citm_imap::types::flag::Flags,
        time: Option<ImapTime>,
        message: Vec<u8>,
    ) -> Result<(), ProtoError> {
        let name = mailbox.to_string_lossy();
        let hold = match self.ctx.dirmgr.hold(&name) {
            Ok(hold) => hold,
            Err(e) => return self.no(dn, tag, &e.to_string()).await,
        };
        // stage the plaintext locally under a temp id
        let dir = self.ctx.dirmgr.open(&name)?;
        let tmp_id = dir.stage_tmp(&message)?;

        // encrypt to every key on the account
        let recipients = self.ctx.keydir.all_keys();
        let ciphertext = citm_crypto::envelope::encrypt(&recipients, &message)?;

        let internaldate = time.map(|t| t.to_epoch()).unwrap_or_else(now_epoch);
        let up_tag = up.tags.next();
        self.pending.insert(
            up_tag.clone(),
            (
                tag,
                Pending::Append {
                    hold,
                    mailbox,
                    tmp_id,
                    flags: MsgFlags::from_flags(&flags),
                    internaldate,
                },
            ),
        );
        self.send_up(
            up,
            Command::new(
                up_tag,
                CommandBody::Append {
                    mailbox: Mailbox::new(name.as_str().into()),
                    flags,
                    time,
                    message: ciphertext,
                },
            ),
        )
        .await
    }

    fn is_selected_mailbox(&self, mailbox: &Mailbox) -> bool {
        self.selected
            .as_ref()
            .map(|sel| &sel.mailbox == mailbox)
            .unwrap_or(false)
    }

    async fn begin_logout(&mut self, up: &mut ImapClientConn) -> Result<(), ProtoError> {
        self.logout = true;
        if let Some(sel) = &mut self.selected {
            sel.closing_for = Some(CloseReason::Logout);
            let out = sel.up.request_close(&mut up.tags)?;
            let unselected = out.unselected;
            up.write_all_cmds(&out.cmds).await?;
            if unselected {
                self.teardown_selected();
            }
        }
        Ok(())
    }

    async fn passthru(
        &mut self,
        up: &mut ImapClientConn,
        dn_tag: Tag,
        body: CommandBody,
    ) -> Result<(), ProtoError> {
        let up_tag = up.tags.next();
        self.pending.insert(up_tag.clone(), (dn_tag, Pending::Passthru));
        self.send_up(up, Command::new(up_tag, body)).await
    }

    /// Write a command upstream, first terminating any IDLE the
    /// downloader has running on the shared connection.
    async fn send_up(
        &mut self,
        up: &mut ImapClientConn,
        cmd: Command,
    ) -> Result<(), ProtoError> {
        if let Some(sel) = &mut self.selected {
            if let Some(done) = sel.up.interrupt_idle() {
                up.write(&done).await?;
            }
        }
        up.write(&cmd).await
    }

    // ---- upstream ----

    async fn on_up_response(
        &mut self,
        dn: &mut ImapServerConn,
        up: &mut ImapClientConn,
        resp: Response,
    ) -> Result<(), ProtoError> {
        // tagged responses may close out a pending downstream command
        if let Response::Status(st) = &resp {
            if let Some(tag) = &st.tag {
                if let Some((dn_tag, pending)) = self.pending.remove(tag) {
                    return self.finish_pending(dn, dn_tag, pending, st.clone()).await;
                }
            }
        }

        // passthrough data flows straight down while a passthrough is
        // pending
        if self.has_passthru() {
            if let Response::Data(
                ResponseData::List { .. }
                | ResponseData::Lsub { .. }
                | ResponseData::Status { .. },
            ) = &resp
            {
                return dn.write(&resp).await;
            }
        }

        // everything else drives the downloader
        let Some(sel) = &mut self.selected else {
            return Ok(());
        };
        let out = sel
            .up
            .on_response(&resp, &mut up.tags)
            .map_err(ProtoError::from)?;
        up.write_all_cmds(&out.cmds).await?;

        for uid in &out.not_for_me {
            self.inject_not_for_me_notice(*uid)?;
        }

        if out.synced {
            let sel = self.selected.as_mut().expect("selected while synced");
            if let Some((tag, qresync)) = sel.pending_select.take() {
                let reply = sel.view.select(qresync.as_ref());
                dn.write_all(&reply.data).await?;
                dn.write(&Response::Status(ResponseStatus::ok(
                    Some(tag),
                    reply.code,
                    "SELECT completed",
                )))
                .await?;
                let mailbox = sel.mailbox.to_string_lossy();
                self.ctx.keydir.mailbox_synced(&mailbox);
            }
        }

        if out.unselected {
            self.finish_unselect(dn).await?;
            if let Some(args) = self.deferred_select.take() {
                self.start_select(dn, up, args).await?;
            }
        }
        Ok(())
    }

    fn has_passthru(&self) -> bool {
        self.pending.values().any(|(_, p)| matches!(p, Pending::Passthru))
    }

    /// A pending downstream command got its upstream tagged response.
    async fn finish_pending(
        &mut self,
        dn: &mut ImapServerConn,
        dn_tag: Tag,
        pending: Pending,
        st: ResponseStatus,
    ) -> Result<(), ProtoError> {
        let ok = st.kind == StatusKind::Ok;
        match pending {
            Pending::Passthru => {
                dn.write(&Response::Status(ResponseStatus {
                    tag: Some(dn_tag),
                    kind: st.kind,
                    code: st.code,
                    text: st.text,
                }))
                .await
            }
            Pending::Relay => {
                // reflect whatever the relay changed before answering
                self.flush_updates(dn).await?;
                dn.write(&Response::Status(ResponseStatus {
                    tag: Some(dn_tag),
                    kind: st.kind,
                    code: st.code,
                    text: st.text,
                }))
                .await
            }
            Pending::Append { hold, mailbox, tmp_id, flags, internaldate } => {
                let name = mailbox.to_string_lossy();
                let dir = self.ctx.dirmgr.open(&name)?;
                if !ok {
                    dir.discard_tmp(tmp_id);
                    drop(hold);
                    return dn
                        .write(&Response::Status(ResponseStatus {
                            tag: Some(dn_tag),
                            kind: st.kind,
                            code: st.code,
                            text: st.text,
                        }))
                        .await;
                }
                match st.code {
                    Some(Code::AppendUid { uidvalidity, uid }) => {
                        if dir.uidvalidity() == Some(uidvalidity) {
                            dir.commit_tmp(tmp_id, uid, flags, internaldate)?;
                        } else {
                            // stale folder state: the next sync will
                            // download it
                            dir.discard_tmp(tmp_id);
                        }
                        drop(hold);
                        dn.write(&Response::Status(ResponseStatus::ok(
                            Some(dn_tag),
                            Some(Code::AppendUid { uidvalidity, uid }),
                            "APPEND completed",
                        )))
                        .await
                    }
                    code => {
                        // no APPENDUID: keep nothing local
                        dir.discard_tmp(tmp_id);
                        drop(hold);
                        dn.write(&Response::Status(ResponseStatus {
                            tag: Some(dn_tag),
                            kind: StatusKind::Ok,
                            code,
                            text: st.text,
                        }))
                        .await
                    }
                }
            }
            Pending::Delete { freeze } => {
                if ok {
                    self.ctx.dirmgr.delete_frozen(&freeze)?;
                }
                drop(freeze);
                dn.write(&Response::Status(ResponseStatus {
                    tag: Some(dn_tag),
                    kind: st.kind,
                    code: st.code,
                    text: st.text,
                }))
                .await
            }
            Pending::Rename { src, dst } => {
                if ok {
                    self.ctx.dirmgr.rename_frozen(&src, &dst)?;
                }
                drop((src, dst));
                dn.write(&Response::Status(ResponseStatus {
                    tag: Some(dn_tag),
                    kind: st.kind,
                    code: st.code,
                    text: st.text,
                }))
                .await
            }
        }
    }

    /// Scenario: a stored message was not encrypted to us.  Leave the
    /// ciphertext in place and tell the user what happened, once.
    fn inject_not_for_me_notice(&self, uid: u32) -> Result<(), ProtoError> {
        let Some(sel) = &self.selected else {
            return Ok(());
        };
        let mailbox = sel.mailbox.to_string_lossy();
        let body = format!(
            "From: CITM <citm@localhost>\r\n\
             Subject: a message could not be decrypted\r\n\
             \r\n\
             The message with UID {uid} in {mailbox} was encrypted, but not\r\n\
             to any key this device holds. The encrypted original has been\r\n\
             kept in place.\r\n"
        );
        let inbox = self.ctx.dirmgr.open("INBOX")?;
        inbox.inject_local(body.as_bytes())?;
        Ok(())
    }

    // ---- small response helpers ----

    async fn ok(&self, dn: &mut ImapServerConn, tag: Tag, text: &str) -> Result<(), ProtoError> {
        dn.write(&Response::Status(ResponseStatus::ok(Some(tag), None, text))).await
    }

    async fn no(&self, dn: &mut ImapServerConn, tag: Tag, text: &str) -> Result<(), ProtoError> {
        dn.write(&Response::Status(ResponseStatus::no(Some(tag), None, text))).await
    }

    async fn bad(&self, dn: &mut ImapServerConn, tag: Tag, text: &str) -> Result<(), ProtoError> {
        dn.write(&Response::Status(ResponseStatus::bad(Some(tag), None, text))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anon::exts_from_capas;
    use crate::keydir::MemKeydir;
    use citm_crypto::Keypair;
    use citm_imap::types::response::Capa;
    use citm_imap::Extensions;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    struct Client {
        rd: tokio::io::ReadHalf<DuplexStream>,
        wr: tokio::io::WriteHalf<DuplexStream>,
        got: Vec<u8>,
    }

    impl Client {
        fn new(stream: DuplexStream) -> Client {
            let (rd, wr) = tokio::io::split(stream);
            Client { rd, wr, got: Vec::new() }
        }

        async fn send(&mut self, line: &str) {
            self.wr.write_all(line.as_bytes()).await.unwrap();
        }

        async fn read_until(&mut self, marker: &str) -> String {
            let mut buf = [0u8; 4096];
            loop {
                let s = String::from_utf8_lossy(&self.got).into_owned();
                if s.contains(marker) {
                    return s;
                }
                let n = tokio::time::timeout(
                    std::time::Duration::from_secs(5),
                    self.rd.read(&mut buf),
                )
                .await
                .expect("timeout waiting for marker")
                .unwrap();
                assert!(n > 0, "eof before {marker:?}: {:?}", String::from_utf8_lossy(&self.got));
                self.got.extend_from_slice(&buf[..n]);
            }
        }

        /// Like read_until, but drops everything through the marker so
        /// a repeated marker matches fresh bytes next time.
        async fn read_until_consume(&mut self, marker: &str) -> String {
            let text = self.read_until(marker).await;
            let end = text.find(marker).unwrap() + marker.len();
            self.got.drain(..end);
            text[..end].to_string()
        }
    }

    /// The fake upstream: wait for each expected substring, then send
    /// the canned response.
    async fn fake_upstream(stream: DuplexStream, script: Vec<(&str, &str)>) {
        let mut peer = Client::new(stream);
        for (expect, respond) in script {
            peer.read_until_consume(expect).await;
            peer.send(respond).await;
        }
        // hold the connection open until the test ends
        let mut buf = [0u8; 4096];
        loop {
            match peer.rd.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    }

    fn upstream_exts() -> Extensions {
        exts_from_capas(&[
            Capa::Imap4rev1,
            Capa::Uidplus,
            Capa::Enable,
            Capa::Condstore,
            Capa::Qresync,
            Capa::Unselect,
            Capa::Idle,
            Capa::LiteralPlus,
            Capa::Xkey,
        ])
    }

    #[tokio::test]
    async fn select_fetch_append_logout() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = ScContext {
            keydir: Arc::new(MemKeydir::new(Keypair::generate(1024).unwrap())),
            dirmgr: Arc::new(Dirmgr::new(tmp.path().join("mail"))),
        };

        let (dn_ours, dn_theirs) = duplex(1 << 20);
        let (up_ours, up_theirs) = duplex(1 << 20);
        let dn = ImapServerConn::new(Box::new(dn_ours), Extensions::all_available());
        let up = ImapClientConn::new(Box::new(up_ours), upstream_exts());

        let script = vec![
            (
                "ENABLE CONDSTORE QRESYNC\r\n",
                "* ENABLED CONDSTORE QRESYNC\r\ncitm1 OK enabled\r\n",
            ),
            (
                "citm2 SELECT INBOX\r\n",
                "* 2 EXISTS\r\n* OK [UIDVALIDITY 123] ok\r\n* OK [HIGHESTMODSEQ 7] ok\r\ncitm2 OK [READ-WRITE] selected\r\n",
            ),
            (
                "citm3 UID FETCH 1:* (FLAGS MODSEQ)\r\n",
                "* 1 FETCH (UID 4 FLAGS (\\Seen) MODSEQ (5))\r\n* 2 FETCH (UID 9 FLAGS () MODSEQ (6))\r\ncitm3 OK fetched\r\n",
            ),
            (
                "citm4 UID FETCH 4 (INTERNALDATE RFC822)\r\n",
                "* 1 FETCH (UID 4 INTERNALDATE \"17-Jul-1996 02:44:25 -0700\" RFC822 {5}\r\nhello)\r\ncitm4 OK one\r\n",
            ),
            (
                "citm5 UID FETCH 9 (INTERNALDATE RFC822)\r\n",
                "* 2 FETCH (UID 9 RFC822 {5}\r\nworld)\r\ncitm5 OK two\r\n",
            ),
            ("citm6 IDLE\r\n", "+ idling\r\n"),
            // the APPEND interrupts the IDLE first
            ("DONE\r\n", "citm6 OK idle terminated\r\n"),
            (
                "END SPLINTERMAIL MESSAGE",
                "citm7 OK [APPENDUID 123 42] append done\r\n",
            ),
            // reconcile after the interrupt, then idle again
            (
                "citm8 UID FETCH 1:* (FLAGS MODSEQ) (CHANGEDSINCE 7 VANISHED)\r\n",
                "citm8 OK nothing new\r\n",
            ),
            ("citm9 IDLE\r\n", "+ idling\r\n"),
            // logout tears the idle down and closes
            ("DONE\r\n", "citm9 OK idle terminated\r\n"),
            ("citm10 CLOSE\r\n", "citm10 OK closed\r\n"),
        ];
        let upstream = tokio::spawn(fake_upstream(up_theirs, script));

        let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let bridge = tokio::spawn(run(dn, up, ctx, shutdown_rx));

        let mut client = Client::new(dn_theirs);

        client.send("a1 SELECT INBOX\r\n").await;
        let text = client.read_until("a1 OK").await;
        assert!(text.contains("* 2 EXISTS"), "{text}");
        assert!(text.contains("* 0 RECENT"), "{text}");
        assert!(text.contains("[UIDVALIDITY 123]"), "{text}");
        assert!(text.contains("a1 OK [READ-WRITE] SELECT completed"), "{text}");

        client.send("a2 UID FETCH 1:* (FLAGS)\r\n").await;
        let text = client.read_until("a2 OK").await;
        assert!(text.contains("UID 4"), "{text}");
        assert!(text.contains("UID 9"), "{text}");
        assert!(text.contains("\\Seen"), "{text}");

        // fetch a body served from the local store
        client.send("a3 UID FETCH 4 (RFC822)\r\n").await;
        let text = client.read_until("a3 OK").await;
        assert!(text.contains("{5}\r\nhello"), "{text}");

        client.send("a4 APPEND INBOX (\\Seen) {11+}\r\nhello world\r\n").await;
        let text = client.read_until("a4 OK").await;
        assert!(text.contains("[APPENDUID 123 42]"), "{text}");

        // the local store now serves the appended plaintext
        client.send("a5 UID FETCH 42 (RFC822)\r\n").await;
        let text = client.read_until("a5 OK").await;
        assert!(text.contains("{11}\r\nhello world"), "{text}");

        client.send("a6 LOGOUT\r\n").await;
        let text = client.read_until("a6 OK").await;
        assert!(text.contains("* BYE"), "{text}");

        bridge.await.unwrap().unwrap();
        upstream.abort();
    }

    #[tokio::test]
    async fn delete_of_selected_mailbox_is_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = ScContext {
            keydir: Arc::new(MemKeydir::new(Keypair::generate(1024).unwrap())),
            dirmgr: Arc::new(Dirmgr::new(tmp.path().join("mail"))),
        };
        let (dn_ours, dn_theirs) = duplex(1 << 20);
        let (up_ours, up_theirs) = duplex(1 << 20);
        let dn = ImapServerConn::new(Box::new(dn_ours), Extensions::all_available());
        let up = ImapClientConn::new(Box::new(up_ours), upstream_exts());

        let script = vec![
            (
                "ENABLE CONDSTORE QRESYNC\r\n",
                "* ENABLED CONDSTORE QRESYNC\r\ncitm1 OK enabled\r\n",
            ),
            (
                "citm2 SELECT box\r\n",
                "* 0 EXISTS\r\n* OK [UIDVALIDITY 5] ok\r\ncitm2 OK [READ-WRITE] selected\r\n",
            ),
            ("citm3 UID FETCH 1:* (FLAGS)\r\n", "citm3 OK nothing\r\n"),
            ("citm4 IDLE\r\n", "+ idling\r\n"),
        ];
        let upstream = tokio::spawn(fake_upstream(up_theirs, script));
        let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let bridge = tokio::spawn(run(dn, up, ctx, shutdown_rx));

        let mut client = Client::new(dn_theirs);
        client.send("a1 SELECT box\r\n").await;
        client.read_until("a1 OK").await;

        client.send("a2 DELETE box\r\n").await;
        let text = client.read_until("a2 NO").await;
        assert!(text.contains("cannot DELETE the selected mailbox"), "{text}");

        client.send("a3 RENAME box elsewhere\r\n").await;
        client.read_until("a3 NO").await;

        bridge.abort();
        upstream.abort();
    }
}
