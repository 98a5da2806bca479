//! The folder store itself.
//!
//! Lock discipline: `content` is a readers-writer lock (many dn views
//! read, the up session writes); the accessor registry is a plain mutex
//! with the shortest possible critical sections.  Lock order is always
//! content first, access last.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use im::OrdMap;
use tokio::sync::broadcast;

use crate::error::MaildirError;
use crate::log::MaildirLog;
use crate::msg::{Expunge, Msg, MsgFlags, MsgState};

/// UIDs at or above this are locally-injected messages (decryption
/// notices, new-key notices) that upstream has never heard of.
pub const LOCAL_UID_BASE: u32 = 0x8000_0000;

/// A cheap-to-clone read view of the folder.
#[derive(Clone)]
pub struct Snapshot {
    pub msgs: OrdMap<u32, Msg>,
    pub expunged: OrdMap<u32, Expunge>,
    pub uidvalidity: u32,
    pub himodseq: u64,
}

impl Snapshot {
    /// Sequence numbers are 1-based positions in UID order.
    pub fn seq_of_uid(&self, uid: u32) -> Option<u32> {
        self.msgs
            .keys()
            .position(|&u| u == uid)
            .map(|i| (i + 1) as u32)
    }

    pub fn uid_of_seq(&self, seq: u32) -> Option<u32> {
        if seq == 0 {
            return None;
        }
        self.msgs.keys().nth(seq as usize - 1).copied()
    }

    pub fn max_uid(&self) -> u32 {
        self.msgs.keys().next_back().copied().unwrap_or(0)
    }

    pub fn exists(&self) -> u32 {
        self.msgs.len() as u32
    }
}

struct Content {
    msgs: OrdMap<u32, Msg>,
    expunged: OrdMap<u32, Expunge>,
    uidvalidity: Option<u32>,
    /// Highest modseq observed (persisted separately at quiet points).
    himodseq: u64,
    log: MaildirLog,
    tmp_count: u64,
    local_uid_count: u32,
}

#[derive(Default)]
struct Access {
    ups: usize,
    dns: usize,
    failed: Option<String>,
}

pub struct Imaildir {
    path: PathBuf,
    name: String,
    content: RwLock<Content>,
    access: Mutex<Access>,
    notify: broadcast::Sender<()>,
}

impl Imaildir {
    /// Open (or create) the folder at `path`.
    pub fn open(path: PathBuf, name: String) -> Result<Imaildir, MaildirError> {
        std::fs::create_dir_all(path.join("cur"))?;
        std::fs::create_dir_all(path.join("tmp"))?;
        let log = MaildirLog::open(&path.join("log.sqlite"))?;

        let mut msgs = OrdMap::new();
        let mut himodseq = log.get_himodseq_up()?;
        for msg in log.load_msgs()? {
            himodseq = himodseq.max(msg.modseq);
            msgs.insert(msg.uid, msg);
        }
        let mut expunged = OrdMap::new();
        for e in log.load_expunged()? {
            himodseq = himodseq.max(e.modseq);
            expunged.insert(e.uid, e);
        }
        let uidvalidity = log.get_uidvld()?;
        let local_uid_count = msgs
            .keys()
            .rev()
            .find(|&&u| u >= LOCAL_UID_BASE)
            .map(|&u| u - LOCAL_UID_BASE + 1)
            .unwrap_or(0);

        let (notify, _) = broadcast::channel(64);
        Ok(Imaildir {
            path,
            name,
            content: RwLock::new(Content {
                msgs,
                expunged,
                uidvalidity,
                himodseq,
                log,
                tmp_count: 0,
                local_uid_count,
            }),
            access: Mutex::new(Access::default()),
            notify,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wake-ups for views: fired after every content mutation.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.notify.subscribe()
    }

    fn ping(&self) {
        let _ = self.notify.send(());
    }

    // ---- accessor registry ----

    pub fn register_up(&self) -> Result<(), MaildirError> {
        let mut access = self.access.lock().unwrap();
        if let Some(reason) = &access.failed {
            return Err(MaildirError::NotAccessible(reason.clone()));
        }
        access.ups += 1;
        Ok(())
    }

    pub fn register_dn(&self) -> Result<(), MaildirError> {
        let mut access = self.access.lock().unwrap();
        if let Some(reason) = &access.failed {
            return Err(MaildirError::NotAccessible(reason.clone()));
        }
        access.dns += 1;
        Ok(())
    }

    /// Returns true when the last accessor of any kind left.
    pub fn unregister_up(&self) -> bool {
        let mut access = self.access.lock().unwrap();
        access.ups = access.ups.saturating_sub(1);
        access.ups + access.dns == 0
    }

    pub fn unregister_dn(&self) -> bool {
        let mut access = self.access.lock().unwrap();
        access.dns = access.dns.saturating_sub(1);
        access.ups + access.dns == 0
    }

    pub fn naccessors(&self) -> usize {
        let access = self.access.lock().unwrap();
        access.ups + access.dns
    }

    /// Mark the whole folder failed; accessors learn via the broadcast
    /// and their next registration attempt is refused.
    pub fn fail(&self, reason: &str) {
        {
            let mut access = self.access.lock().unwrap();
            if access.failed.is_none() {
                access.failed = Some(reason.to_string());
            }
        }
        self.ping();
    }

    pub fn failed(&self) -> Option<String> {
        self.access.lock().unwrap().failed.clone()
    }

    // ---- reads ----

    pub fn snapshot(&self) -> Snapshot {
        let content = self.content.read().unwrap();
        Snapshot {
            msgs: content.msgs.clone(),
            expunged: content.expunged.clone(),
            uidvalidity: content.uidvalidity.unwrap_or(0),
            himodseq: content.himodseq,
        }
    }

    pub fn uidvalidity(&self) -> Option<u32> {
        self.content.read().unwrap().uidvalidity
    }

    /// The himodseq to hand upstream in QRESYNC parameters: the
    /// persisted high-water mark, not the live maximum.
    pub fn persisted_himodseq(&self) -> Result<u64, MaildirError> {
        let content = self.content.read().unwrap();
        content.log.get_himodseq_up()
    }

    /// UIDs whose content still needs downloading.
    pub fn unfilled_uids(&self) -> Vec<u32> {
        let content = self.content.read().unwrap();
        content
            .msgs
            .values()
            .filter(|m| m.state == MsgState::Unfilled && m.uid < LOCAL_UID_BASE)
            .map(|m| m.uid)
            .collect()
    }

    fn content_file(&self, uid: u32) -> PathBuf {
        self.path.join("cur").join(format!("{uid}.eml"))
    }

    pub fn read_content(&self, uid: u32) -> Result<Vec<u8>, MaildirError> {
        // downloaded-state check under the lock, file read outside it
        {
            let content = self.content.read().unwrap();
            let msg = content
                .msgs
                .get(&uid)
                .ok_or_else(|| MaildirError::Value(format!("no such uid {uid}")))?;
            if !msg.state.downloaded() {
                return Err(MaildirError::Value(format!("uid {uid} not downloaded")));
            }
        }
        Ok(std::fs::read(self.content_file(uid))?)
    }

    // ---- upstream-driven writes ----

    /// Observe a UIDVALIDITY from upstream.  A mismatch wipes local
    /// state: the persistent wipe lands before the in-memory drop so a
    /// crash mid-way resumes consistently.
    pub fn observe_uidvalidity(&self, uidvld: u32) -> Result<bool, MaildirError> {
        let mut content = self.content.write().unwrap();
        match content.uidvalidity {
            Some(current) if current == uidvld => return Ok(false),
            None => {
                content.log.set_uidvld(uidvld)?;
                content.uidvalidity = Some(uidvld);
                return Ok(false);
            }
            Some(current) => {
                tracing::warn!(
                    mailbox = %self.name,
                    old = current,
                    new = uidvld,
                    "UIDVALIDITY changed, dropping local state"
                );
            }
        }
        content.log.drop_all()?;
        content.log.set_uidvld(uidvld)?;
        content.msgs = OrdMap::new();
        content.expunged = OrdMap::new();
        content.uidvalidity = Some(uidvld);
        content.himodseq = 1;
        let _ = std::fs::remove_dir_all(self.path.join("cur"));
        std::fs::create_dir_all(self.path.join("cur"))?;
        drop(content);
        self.ping();
        Ok(true)
    }

    /// Metadata upsert from an upstream FETCH response.
    pub fn update_meta(
        &self,
        uid: u32,
        flags: MsgFlags,
        internaldate: Option<i64>,
        rfc822_size: Option<u32>,
        modseq: u64,
    ) -> Result<(), MaildirError> {
        let mut content = self.content.write().unwrap();
        if content.expunged.contains_key(&uid) {
            // a late FETCH for a message we already saw vanish
            return Ok(());
        }
        let msg = match content.msgs.get(&uid) {
            Some(old) => Msg {
                uid,
                modseq: if modseq > 0 { modseq } else { old.modseq },
                flags,
                internaldate: internaldate.unwrap_or(old.internaldate),
                rfc822_size: rfc822_size.unwrap_or(old.rfc822_size),
                state: old.state,
            },
            None => Msg {
                uid,
                modseq: modseq.max(1),
                flags,
                internaldate: internaldate.unwrap_or(0),
                rfc822_size: rfc822_size.unwrap_or(0),
                state: MsgState::Unfilled,
            },
        };
        content.himodseq = content.himodseq.max(msg.modseq);
        content.log.update_msg(&msg)?;
        content.msgs.insert(uid, msg);
        drop(content);
        self.ping();
        Ok(())
    }

    /// Store downloaded (already decrypted, or verbatim not-for-me)
    /// content for a UID.
    pub fn store_content(
        &self,
        uid: u32,
        body: &[u8],
        state: MsgState,
    ) -> Result<(), MaildirError> {
        if state == MsgState::Unfilled {
            return Err(MaildirError::Param("content stores must be downloaded states".into()));
        }
        // write through tmp then rename, so cur/ only ever holds
        // complete files
        let tmp = self.stage_tmp(body)?;
        let mut content = self.content.write().unwrap();
        let Some(old) = content.msgs.get(&uid).cloned() else {
            drop(content);
            self.discard_tmp(tmp);
            return Err(MaildirError::Value(format!("no such uid {uid}")));
        };
        std::fs::rename(self.tmp_file(tmp), self.content_file(uid))?;
        let msg = Msg { rfc822_size: body.len() as u32, state, ..old };
        content.log.update_msg(&msg)?;
        content.msgs.insert(uid, msg);
        drop(content);
        self.ping();
        Ok(())
    }

    /// Record an upstream expunge.
    pub fn expunge(&self, uid: u32, modseq: u64) -> Result<(), MaildirError> {
        let mut content = self.content.write().unwrap();
        let modseq = if modseq > 0 { modseq } else { content.himodseq + 1 };
        content.himodseq = content.himodseq.max(modseq);
        let expunge = Expunge { uid, modseq };
        content.log.expunge_msg(&expunge)?;
        content.msgs.remove(&uid);
        content.expunged.insert(uid, expunge);
        drop(content);
        let _ = std::fs::remove_file(self.content_file(uid));
        self.ping();
        Ok(())
    }

    /// Persist the high-water modseq once a sync round is caught up.
    pub fn store_himodseq(&self, himodseq: u64) -> Result<(), MaildirError> {
        let mut content = self.content.write().unwrap();
        content.himodseq = content.himodseq.max(himodseq);
        content.log.set_himodseq_up(himodseq)?;
        Ok(())
    }

    // ---- APPEND staging ----

    fn tmp_file(&self, id: u64) -> PathBuf {
        self.path.join("tmp").join(format!("{id}.tmp"))
    }

    /// Stage bytes under a local-only temp id.
    pub fn stage_tmp(&self, body: &[u8]) -> Result<u64, MaildirError> {
        let id = {
            let mut content = self.content.write().unwrap();
            content.tmp_count += 1;
            content.tmp_count
        };
        std::fs::write(self.tmp_file(id), body)?;
        Ok(id)
    }

    /// Commit a staged append under the UID upstream assigned to it.
    pub fn commit_tmp(
        &self,
        tmp_id: u64,
        uid: u32,
        flags: MsgFlags,
        internaldate: i64,
    ) -> Result<(), MaildirError> {
        let size = std::fs::metadata(self.tmp_file(tmp_id))?.len() as u32;
        let mut content = self.content.write().unwrap();
        let modseq = content.himodseq;
        std::fs::rename(self.tmp_file(tmp_id), self.content_file(uid))?;
        let msg = Msg {
            uid,
            modseq,
            flags,
            internaldate,
            rfc822_size: size,
            state: MsgState::Filled,
        };
        content.log.update_msg(&msg)?;
        content.msgs.insert(uid, msg);
        drop(content);
        self.ping();
        Ok(())
    }

    pub fn discard_tmp(&self, tmp_id: u64) {
        let _ = std::fs::remove_file(self.tmp_file(tmp_id));
    }

    // ---- local injection ----

    /// Add a message upstream has never seen (decryption notices and
    /// the like).  Lives in a reserved high UID band so reconciliation
    /// never mistakes it for an upstream message.
    pub fn inject_local(&self, body: &[u8]) -> Result<u32, MaildirError> {
        let tmp = self.stage_tmp(body)?;
        let mut content = self.content.write().unwrap();
        let uid = LOCAL_UID_BASE + content.local_uid_count;
        content.local_uid_count += 1;
        std::fs::rename(self.tmp_file(tmp), self.content_file(uid))?;
        let msg = Msg {
            uid,
            modseq: content.himodseq,
            flags: MsgFlags::default(),
            internaldate: 0,
            rfc822_size: body.len() as u32,
            state: MsgState::Filled,
        };
        content.log.update_msg(&msg)?;
        content.msgs.insert(uid, msg);
        drop(content);
        self.ping();
        Ok(uid)
    }
}
