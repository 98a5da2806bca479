//! One logged-in account: its keydir, its mail root, its permanently
//! open keysync session, and the shutdown fan-out to every bridge the
//! account has running.

use std::sync::Arc;

use citm_maildir::dirmgr::Dirmgr;
use tokio::sync::watch;

use crate::conn::ImapClientConn;
use crate::error::ProtoError;
use crate::keydir::Keydir;
use crate::keysync::KeysyncClient;

/// Shared per-account state handed to each new bridge.
#[derive(Clone)]
pub struct UserHandle {
    pub name: String,
    pub keydir: Arc<dyn Keydir>,
    pub dirmgr: Arc<Dirmgr>,
    /// Trips when the account must log out (STONITH, daemon shutdown).
    pub shutdown: watch::Receiver<bool>,
}

pub struct User {
    pub handle: UserHandle,
    shutdown_tx: watch::Sender<bool>,
}

impl User {
    pub fn new(name: String, keydir: Arc<dyn Keydir>, dirmgr: Arc<Dirmgr>) -> User {
        let (shutdown_tx, shutdown) = watch::channel(false);
        User {
            handle: UserHandle { name, keydir, dirmgr, shutdown },
            shutdown_tx,
        }
    }

    pub fn shut_down(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Drive the long-lived keysync session.  Returns when the account
    /// shuts down; an Err is a lost or misbehaving connection (the
    /// discovered keys are dropped so a reconnect starts clean).
    pub async fn run_keysync(&self, mut conn: ImapClientConn) -> Result<(), ProtoError> {
        let mut client = KeysyncClient::new(self.handle.keydir.clone());
        let mut shutdown = self.handle.shutdown.clone();

        let cmd = client.subscribe(&mut conn.tags);
        conn.write(&cmd).await?;

        let result = loop {
            tokio::select! {
                more = conn.read_more() => {
                    match more {
                        Ok(true) => {}
                        Ok(false) => break Err(ProtoError::ConnClosed),
                        Err(e) => break Err(e),
                    }
                    loop {
                        let resp = match conn.next_response() {
                            Ok(Some(resp)) => resp,
                            Ok(None) => break,
                            Err(e) => return self.keysync_failed(&mut client, e),
                        };
                        let out = match client.on_response(&resp, &mut conn.tags) {
                            Ok(out) => out,
                            Err(e) => return self.keysync_failed(&mut client, e),
                        };
                        conn.write_all_cmds(&out.cmds).await?;
                        for fpr in &out.created {
                            if self.handle.keydir.first_sighting(fpr) {
                                self.announce_new_key(fpr);
                            }
                        }
                        if out.stonith {
                            self.shut_down();
                            return Ok(());
                        }
                    }
                }
                _ = shutdown.changed() => {
                    break Ok(());
                }
            }
        };
        if let Err(e) = &result {
            tracing::warn!(user = %self.handle.name, err = %e, "keysync connection lost");
            client.connection_lost();
        }
        result
    }

    fn keysync_failed(
        &self,
        client: &mut KeysyncClient,
        e: ProtoError,
    ) -> Result<(), ProtoError> {
        tracing::warn!(user = %self.handle.name, err = %e, "keysync failed");
        client.connection_lost();
        Err(e)
    }

    /// Drop a note in the INBOX about a key that appeared on the
    /// account, once per fingerprint ever.
    fn announce_new_key(&self, fpr: &citm_crypto::Fingerprint) {
        let body = format!(
            "From: CITM <citm@localhost>\r\n\
             Subject: a new device was added to your account\r\n\
             \r\n\
             A new encryption key was published for this account.\r\n\
             Its fingerprint is:\r\n\
             \r\n\
                 {fpr}\r\n\
             \r\n\
             If you did not add a device, change your password.\r\n"
        );
        match self.handle.dirmgr.open("INBOX") {
            Ok(inbox) => {
                if let Err(e) = inbox.inject_local(body.as_bytes()) {
                    tracing::warn!(err = %e, "could not inject new-key notice");
                }
            }
            Err(e) => tracing::warn!(err = %e, "could not open INBOX for notice"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keydir::MemKeydir;
    use citm_crypto::Keypair;
    use citm_imap::Extensions;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn stonith_trips_the_account_shutdown() {
        let tmp = tempfile::tempdir().unwrap();
        let keydir: Arc<dyn Keydir> =
            Arc::new(MemKeydir::new(Keypair::generate(1024).unwrap()));
        let my_fpr = keydir.mykey().fingerprint().hex();
        let user = Arc::new(User::new(
            "alice".into(),
            keydir,
            Arc::new(Dirmgr::new(tmp.path().join("mail"))),
        ));

        let (ours, theirs) = duplex(64 * 1024);
        let conn = ImapClientConn::new(Box::new(ours), Extensions::all_available());

        let mut watch = user.handle.shutdown.clone();
        let runner = {
            let user = user.clone();
            tokio::spawn(async move { user.run_keysync(conn).await })
        };

        let (mut rd, mut wr) = tokio::io::split(theirs);
        let mut buf = [0u8; 1024];
        let n = rd.read(&mut buf).await.unwrap();
        let text = String::from_utf8_lossy(&buf[..n]);
        assert!(text.contains("XKEYSYNC"), "{text}");
        assert!(text.contains(&my_fpr), "{text}");

        wr.write_all(format!("* XKEYSYNC DELETED {my_fpr}\r\n").as_bytes())
            .await
            .unwrap();

        runner.await.unwrap().unwrap();
        assert!(*watch.borrow_and_update());
    }

    #[tokio::test]
    async fn new_key_injects_inbox_notice_once() {
        let tmp = tempfile::tempdir().unwrap();
        let keydir: Arc<dyn Keydir> =
            Arc::new(MemKeydir::new(Keypair::generate(1024).unwrap()));
        let dirmgr = Arc::new(Dirmgr::new(tmp.path().join("mail")));
        let user = Arc::new(User::new("alice".into(), keydir, dirmgr.clone()));

        let (ours, theirs) = duplex(256 * 1024);
        let conn = ImapClientConn::new(Box::new(ours), Extensions::all_available());
        let runner = {
            let user = user.clone();
            tokio::spawn(async move { user.run_keysync(conn).await })
        };

        let peer = Keypair::generate(1024).unwrap();
        let pem = peer.public().pem().to_string();
        let (mut rd, mut wr) = tokio::io::split(theirs);
        let mut buf = [0u8; 1024];
        let _ = rd.read(&mut buf).await.unwrap();
        let created = format!("* XKEYSYNC CREATED {{{}}}\r\n{}\r\n", pem.len(), pem);
        wr.write_all(created.as_bytes()).await.unwrap();
        // the same key a second time must not repeat the notice
        wr.write_all(created.as_bytes()).await.unwrap();

        // give the runner a moment to process, then stop it
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        user.shut_down();
        runner.await.unwrap().unwrap();

        let inbox = dirmgr.open("INBOX").unwrap();
        let snap = inbox.snapshot();
        assert_eq!(snap.exists(), 1);
        let uid = *snap.msgs.keys().next().unwrap();
        let body = inbox.read_content(uid).unwrap();
        assert!(String::from_utf8_lossy(&body).contains("new device"));
    }
}
