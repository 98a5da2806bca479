//! The durable per-folder log, backed by an embedded sqlite database.
//!
//! Everything the folder cannot rebuild from upstream for free lives
//! here: message metadata by UID, expunged UIDs with their modseqs, the
//! UIDVALIDITY we last saw, and the high-water modseq mark.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::MaildirError;
use crate::msg::{Expunge, Msg, MsgFlags, MsgState};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS kv (
    k TEXT PRIMARY KEY,
    v TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS msgs (
    uid INTEGER PRIMARY KEY,
    modseq INTEGER NOT NULL,
    flags TEXT NOT NULL,
    internaldate INTEGER NOT NULL,
    rfc822_size INTEGER NOT NULL,
    state INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS expunged (
    uid INTEGER PRIMARY KEY,
    modseq INTEGER NOT NULL
);
";

pub struct MaildirLog {
    conn: Connection,
}

impl MaildirLog {
    pub fn open(path: &Path) -> Result<MaildirLog, MaildirError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(MaildirLog { conn })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<MaildirLog, MaildirError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(MaildirLog { conn })
    }

    pub fn get_uidvld(&self) -> Result<Option<u32>, MaildirError> {
        self.get_kv("uidvld")
    }

    pub fn set_uidvld(&self, uidvld: u32) -> Result<(), MaildirError> {
        self.set_kv("uidvld", u64::from(uidvld))
    }

    /// The highest modseq synced from upstream; 1 if nothing yet.
    pub fn get_himodseq_up(&self) -> Result<u64, MaildirError> {
        Ok(self.get_kv("himodseq_up")?.unwrap_or(1))
    }

    pub fn set_himodseq_up(&self, himodseq: u64) -> Result<(), MaildirError> {
        self.set_kv("himodseq_up", himodseq)
    }

    fn get_kv<T: TryFrom<u64>>(&self, key: &str) -> Result<Option<T>, MaildirError> {
        let v: Option<String> = self
            .conn
            .query_row("SELECT v FROM kv WHERE k = ?1", params![key], |row| row.get(0))
            .optional()?;
        match v {
            None => Ok(None),
            Some(s) => {
                let n: u64 = s
                    .parse()
                    .map_err(|_| MaildirError::Internal(format!("bad kv value for {key}: {s}")))?;
                T::try_from(n)
                    .map(Some)
                    .map_err(|_| MaildirError::Internal(format!("kv value out of range: {s}")))
            }
        }
    }

    fn set_kv(&self, key: &str, value: u64) -> Result<(), MaildirError> {
        self.conn.execute(
            "INSERT INTO kv (k, v) VALUES (?1, ?2)
             ON CONFLICT(k) DO UPDATE SET v = excluded.v",
            params![key, value.to_string()],
        )?;
        Ok(())
    }

    /// Idempotent upsert by UID.
    pub fn update_msg(&self, msg: &Msg) -> Result<(), MaildirError> {
        self.conn.execute(
            "INSERT INTO msgs (uid, modseq, flags, internaldate, rfc822_size, state)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(uid) DO UPDATE SET
                modseq = excluded.modseq,
                flags = excluded.flags,
                internaldate = excluded.internaldate,
                rfc822_size = excluded.rfc822_size,
                state = excluded.state",
            params![
                msg.uid,
                msg.modseq as i64,
                msg.flags.encode(),
                msg.internaldate,
                msg.rfc822_size,
                msg.state.encode(),
            ],
        )?;
        Ok(())
    }

    /// Record an expunge and retire the message row.
    pub fn expunge_msg(&self, expunge: &Expunge) -> Result<(), MaildirError> {
        self.conn.execute(
            "INSERT INTO expunged (uid, modseq) VALUES (?1, ?2)
             ON CONFLICT(uid) DO UPDATE SET modseq = excluded.modseq",
            params![expunge.uid, expunge.modseq as i64],
        )?;
        self.conn
            .execute("DELETE FROM msgs WHERE uid = ?1", params![expunge.uid])?;
        Ok(())
    }

    /// Wipe everything (UIDVALIDITY change).
    pub fn drop_all(&self) -> Result<(), MaildirError> {
        self.conn.execute_batch(
            "DELETE FROM msgs; DELETE FROM expunged; DELETE FROM kv;",
        )?;
        Ok(())
    }

    pub fn load_msgs(&self) -> Result<Vec<Msg>, MaildirError> {
        let mut stmt = self.conn.prepare(
            "SELECT uid, modseq, flags, internaldate, rfc822_size, state FROM msgs ORDER BY uid",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Msg {
                uid: row.get(0)?,
                modseq: row.get::<_, i64>(1)? as u64,
                flags: MsgFlags::decode(&row.get::<_, String>(2)?),
                internaldate: row.get(3)?,
                rfc822_size: row.get(4)?,
                state: MsgState::decode(row.get(5)?),
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn load_expunged(&self) -> Result<Vec<Expunge>, MaildirError> {
        let mut stmt =
            self.conn.prepare("SELECT uid, modseq FROM expunged ORDER BY uid")?;
        let rows = stmt.query_map([], |row| {
            Ok(Expunge { uid: row.get(0)?, modseq: row.get::<_, i64>(1)? as u64 })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(uid: u32, modseq: u64) -> Msg {
        Msg {
            uid,
            modseq,
            flags: MsgFlags { seen: true, ..MsgFlags::default() },
            internaldate: 1_700_000_000,
            rfc822_size: 42,
            state: MsgState::Unfilled,
        }
    }

    #[test]
    fn kv_roundtrip() {
        let log = MaildirLog::open_in_memory().unwrap();
        assert_eq!(log.get_uidvld().unwrap(), None);
        assert_eq!(log.get_himodseq_up().unwrap(), 1);
        log.set_uidvld(123).unwrap();
        log.set_himodseq_up(7).unwrap();
        assert_eq!(log.get_uidvld().unwrap(), Some(123));
        assert_eq!(log.get_himodseq_up().unwrap(), 7);
    }

    #[test]
    fn update_is_idempotent() {
        let log = MaildirLog::open_in_memory().unwrap();
        log.update_msg(&msg(1, 2)).unwrap();
        log.update_msg(&msg(1, 3)).unwrap();
        let msgs = log.load_msgs().unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].modseq, 3);
    }

    #[test]
    fn expunge_retires_the_message() {
        let log = MaildirLog::open_in_memory().unwrap();
        log.update_msg(&msg(5, 2)).unwrap();
        log.expunge_msg(&Expunge { uid: 5, modseq: 9 }).unwrap();
        assert!(log.load_msgs().unwrap().is_empty());
        let exp = log.load_expunged().unwrap();
        assert_eq!(exp, vec![Expunge { uid: 5, modseq: 9 }]);
    }

    #[test]
    fn survives_close_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.sqlite");
        {
            let log = MaildirLog::open(&path).unwrap();
            log.set_uidvld(9).unwrap();
            log.update_msg(&msg(3, 4)).unwrap();
        }
        let log = MaildirLog::open(&path).unwrap();
        assert_eq!(log.get_uidvld().unwrap(), Some(9));
        assert_eq!(log.load_msgs().unwrap().len(), 1);
    }

    #[test]
    fn drop_all_wipes() {
        let log = MaildirLog::open_in_memory().unwrap();
        log.set_uidvld(9).unwrap();
        log.update_msg(&msg(3, 4)).unwrap();
        log.drop_all().unwrap();
        assert_eq!(log.get_uidvld().unwrap(), None);
        assert!(log.load_msgs().unwrap().is_empty());
    }
}
