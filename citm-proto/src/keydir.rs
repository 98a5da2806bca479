//! The per-account keyring.
//!
//! Holds the account's own keypair and every peer public key the
//! keysync session has discovered, persisting them as PEM files:
//!
//! ```text
//! keys/mykey.pem           the owner keypair
//! keys/<fingerprint>.pem   one file per peer public key
//! keys/seen_fprs           fingerprints already announced to the user
//! ```
//!
//! The fingerprint watcher is what keeps "new device added" notices
//! from repeating: a fingerprint is announced at most once per account,
//! and announcements wait until the INBOX has completed a sync.

use std::collections::HashSet;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use citm_crypto::{Fingerprint, Keypair, Keyshare, PublicKey};

use crate::error::ProtoError;

pub trait Keydir: Send + Sync {
    fn mykey(&self) -> Arc<Keypair>;

    fn peers(&self) -> Vec<Arc<PublicKey>>;

    /// mykey plus every peer: the recipient set for outgoing mail.
    fn all_keys(&self) -> Vec<Arc<PublicKey>> {
        let mut keys = vec![self.mykey().public().clone()];
        keys.extend(self.peers());
        keys
    }

    fn add_key(&self, pem: &str) -> Result<Arc<PublicKey>, ProtoError>;

    fn delete_key(&self, fingerprint: &Fingerprint);

    /// The subscribe/notify bus for sessions that track the key set.
    fn keyshare(&self) -> &Keyshare;

    /// True exactly once per fingerprint per account; used to gate
    /// new-key notices.
    fn first_sighting(&self, fingerprint: &Fingerprint) -> bool;

    /// A folder finished its initial sync (keysync notices may now be
    /// injected there).
    fn mailbox_synced(&self, mailbox: &str);
}

// ---- filesystem implementation ----

pub struct FsKeydir {
    root: PathBuf,
    mykey: Arc<Keypair>,
    share: Keyshare,
    seen: Mutex<HashSet<Fingerprint>>,
}

impl FsKeydir {
    /// Load (or initialize) the key directory for one account.
    /// Key generation blocks; call from `spawn_blocking` on hot paths.
    pub fn load(root: PathBuf) -> Result<FsKeydir, ProtoError> {
        std::fs::create_dir_all(&root)?;
        let mykey_path = root.join("mykey.pem");
        let mykey = if mykey_path.exists() {
            Keypair::load(&mykey_path)?
        } else {
            tracing::info!(path = %mykey_path.display(), "generating account key");
            let kp = Keypair::generate(citm_crypto::keypair::KEY_BITS)?;
            kp.save(&mykey_path)?;
            kp
        };

        let share = Keyshare::new();
        for entry in std::fs::read_dir(&root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == "mykey.pem" || !name.ends_with(".pem") {
                continue;
            }
            let pem = std::fs::read_to_string(entry.path())?;
            match PublicKey::from_pem(&pem) {
                Ok(key) => share.add_key(Arc::new(key)),
                Err(e) => {
                    tracing::warn!(file = %name, err = %e, "skipping unreadable peer key");
                }
            }
        }

        let mut seen = HashSet::new();
        seen.insert(mykey.fingerprint().clone());
        if let Ok(text) = std::fs::read_to_string(root.join("seen_fprs")) {
            for line in text.lines() {
                if let Ok(fpr) = Fingerprint::from_hex(line) {
                    seen.insert(fpr);
                }
            }
        }

        Ok(FsKeydir {
            root,
            mykey: Arc::new(mykey),
            share,
            seen: Mutex::new(seen),
        })
    }

    fn peer_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.root.join(format!("{}.pem", fingerprint.hex()))
    }
}

impl Keydir for FsKeydir {
    fn mykey(&self) -> Arc<Keypair> {
        self.mykey.clone()
    }

    fn peers(&self) -> Vec<Arc<PublicKey>> {
        self.share.keys()
    }

    fn add_key(&self, pem: &str) -> Result<Arc<PublicKey>, ProtoError> {
        let key = Arc::new(PublicKey::from_pem(pem)?);
        if key.fingerprint() == self.mykey.fingerprint() {
            // our own key is not a peer
            return Ok(key);
        }
        std::fs::write(self.peer_path(key.fingerprint()), pem)?;
        self.share.add_key(key.clone());
        Ok(key)
    }

    fn delete_key(&self, fingerprint: &Fingerprint) {
        let _ = std::fs::remove_file(self.peer_path(fingerprint));
        self.share.del_key(fingerprint);
    }

    fn keyshare(&self) -> &Keyshare {
        &self.share
    }

    fn first_sighting(&self, fingerprint: &Fingerprint) -> bool {
        let mut seen = self.seen.lock().unwrap();
        if !seen.insert(fingerprint.clone()) {
            return false;
        }
        // persist so restarts do not repeat the announcement
        let mut lines = String::new();
        for fpr in seen.iter() {
            lines.push_str(&fpr.hex());
            lines.push('\n');
        }
        if let Ok(mut f) = std::fs::File::create(self.root.join("seen_fprs")) {
            let _ = f.write_all(lines.as_bytes());
        }
        true
    }

    fn mailbox_synced(&self, mailbox: &str) {
        tracing::debug!(mailbox, "mailbox synced");
    }
}

// ---- in-memory implementation for tests ----

pub struct MemKeydir {
    mykey: Arc<Keypair>,
    share: Keyshare,
    seen: Mutex<HashSet<Fingerprint>>,
}

impl MemKeydir {
    pub fn new(mykey: Keypair) -> MemKeydir {
        MemKeydir {
            mykey: Arc::new(mykey),
            share: Keyshare::new(),
            seen: Mutex::new(HashSet::new()),
        }
    }
}

impl Keydir for MemKeydir {
    fn mykey(&self) -> Arc<Keypair> {
        self.mykey.clone()
    }

    fn peers(&self) -> Vec<Arc<PublicKey>> {
        self.share.keys()
    }

    fn add_key(&self, pem: &str) -> Result<Arc<PublicKey>, ProtoError> {
        let key = Arc::new(PublicKey::from_pem(pem)?);
        if key.fingerprint() != self.mykey.fingerprint() {
            self.share.add_key(key.clone());
        }
        Ok(key)
    }

    fn delete_key(&self, fingerprint: &Fingerprint) {
        self.share.del_key(fingerprint);
    }

    fn keyshare(&self) -> &Keyshare {
        &self.share
    }

    fn first_sighting(&self, fingerprint: &Fingerprint) -> bool {
        self.seen.lock().unwrap().insert(fingerprint.clone())
    }

    fn mailbox_synced(&self, _mailbox: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fs_keydir_persists_keys_and_sightings() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("keys");

        let peer = Keypair::generate(1024).unwrap();
        let peer_pem = peer.public().pem().to_string();
        let peer_fpr = peer.fingerprint().clone();
        let my_fpr;
        {
            let kd = FsKeydir::load(root.clone()).unwrap();
            my_fpr = kd.mykey().fingerprint().clone();
            kd.add_key(&peer_pem).unwrap();
            assert_eq!(kd.peers().len(), 1);
            assert!(kd.first_sighting(&peer_fpr));
            assert!(!kd.first_sighting(&peer_fpr));
            // our own key never counts as new
            assert!(!kd.first_sighting(&my_fpr));
        }

        // reload: same key, peer still there, sighting remembered
        let kd = FsKeydir::load(root).unwrap();
        assert_eq!(kd.mykey().fingerprint(), &my_fpr);
        assert_eq!(kd.peers().len(), 1);
        assert!(!kd.first_sighting(&peer_fpr));

        kd.delete_key(&peer_fpr);
        assert!(kd.peers().is_empty());
    }

    #[test]
    fn own_key_is_not_a_peer() {
        let tmp = tempfile::tempdir().unwrap();
        let kd = FsKeydir::load(tmp.path().join("keys")).unwrap();
        let my_pem = kd.mykey().public().pem().to_string();
        kd.add_key(&my_pem).unwrap();
        assert!(kd.peers().is_empty());
        assert_eq!(kd.all_keys().len(), 1);
    }
}
