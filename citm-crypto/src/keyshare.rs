//! The key-share bus: one account's peer keys, fanned out to every
//! session that cares.
//!
//! Listeners see exactly one `add` per key and one `del` per removal.
//! Registration returns the keys that already exist so a late
//! subscriber starts complete.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::keypair::{Fingerprint, PublicKey};

/// Callback interface for key events.
pub trait KeyListener: Send + Sync {
    fn key_added(&self, key: &Arc<PublicKey>);
    fn key_deleted(&self, fingerprint: &Fingerprint);
}

struct Inner {
    /// fingerprint -> (key, refcount); re-adding a key bumps the count
    keys: HashMap<Fingerprint, (Arc<PublicKey>, usize)>,
    listeners: Vec<(u64, Arc<dyn KeyListener>)>,
    next_id: u64,
}

/// Shared, thread-safe key set with subscribe/notify.
#[derive(Clone)]
pub struct Keyshare {
    inner: Arc<Mutex<Inner>>,
}

/// Registration handle; unregister with [`Keyshare::unregister`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

impl Default for Keyshare {
    fn default() -> Self {
        Keyshare::new()
    }
}

impl Keyshare {
    pub fn new() -> Keyshare {
        Keyshare {
            inner: Arc::new(Mutex::new(Inner {
                keys: HashMap::new(),
                listeners: Vec::new(),
                next_id: 0,
            })),
        }
    }

    /// Add a key (or bump its refcount).  Listeners hear about the
    /// first add only.
    pub fn add_key(&self, key: Arc<PublicKey>) {
        let listeners;
        {
            let mut inner = self.inner.lock().unwrap();
            let entry = inner
                .keys
                .entry(key.fingerprint().clone())
                .or_insert_with(|| (key.clone(), 0));
            entry.1 += 1;
            if entry.1 > 1 {
                return;
            }
            listeners = inner.listeners.clone();
        }
        for (_, l) in listeners {
            l.key_added(&key);
        }
    }

    /// Drop one reference; listeners hear about the last drop only.
    pub fn del_key(&self, fingerprint: &Fingerprint) {
        let listeners;
        {
            let mut inner = self.inner.lock().unwrap();
            let Some(entry) = inner.keys.get_mut(fingerprint) else {
                return;
            };
            entry.1 -= 1;
            if entry.1 > 0 {
                return;
            }
            inner.keys.remove(fingerprint);
            listeners = inner.listeners.clone();
        }
        for (_, l) in listeners {
            l.key_deleted(fingerprint);
        }
    }

    /// Subscribe; returns the handle and the current key set.
    pub fn register(&self, listener: Arc<dyn KeyListener>) -> (ListenerId, Vec<Arc<PublicKey>>) {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.listeners.push((id, listener));
        let keys = inner.keys.values().map(|(k, _)| k.clone()).collect();
        (ListenerId(id), keys)
    }

    pub fn unregister(&self, id: ListenerId) {
        let mut inner = self.inner.lock().unwrap();
        inner.listeners.retain(|(lid, _)| *lid != id.0);
    }

    pub fn keys(&self) -> Vec<Arc<PublicKey>> {
        let inner = self.inner.lock().unwrap();
        inner.keys.values().map(|(k, _)| k.clone()).collect()
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.inner.lock().unwrap().keys.contains_key(fingerprint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keypair::Keypair;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        adds: AtomicUsize,
        dels: AtomicUsize,
    }

    impl KeyListener for Counter {
        fn key_added(&self, _key: &Arc<PublicKey>) {
            self.adds.fetch_add(1, Ordering::SeqCst);
        }
        fn key_deleted(&self, _fingerprint: &Fingerprint) {
            self.dels.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn refcounted_add_del_notifies_once() {
        let share = Keyshare::new();
        let counter = Arc::new(Counter { adds: AtomicUsize::new(0), dels: AtomicUsize::new(0) });
        let (_id, initial) = share.register(counter.clone());
        assert!(initial.is_empty());

        let kp = Keypair::generate(1024).unwrap();
        let key = kp.public().clone();
        let fpr = key.fingerprint().clone();

        share.add_key(key.clone());
        share.add_key(key.clone());
        assert_eq!(counter.adds.load(Ordering::SeqCst), 1);

        share.del_key(&fpr);
        assert_eq!(counter.dels.load(Ordering::SeqCst), 0);
        share.del_key(&fpr);
        assert_eq!(counter.dels.load(Ordering::SeqCst), 1);
        assert!(!share.contains(&fpr));
    }

    #[test]
    fn late_registration_sees_existing_keys() {
        let share = Keyshare::new();
        let kp = Keypair::generate(1024).unwrap();
        share.add_key(kp.public().clone());

        let counter = Arc::new(Counter { adds: AtomicUsize::new(0), dels: AtomicUsize::new(0) });
        let (id, initial) = share.register(counter.clone());
        assert_eq!(initial.len(), 1);
        assert_eq!(counter.adds.load(Ordering::SeqCst), 0);

        share.unregister(id);
        share.del_key(kp.public().fingerprint());
        assert_eq!(counter.dels.load(Ordering::SeqCst), 0);
    }
}
