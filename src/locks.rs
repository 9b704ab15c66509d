//! Process-wide named locks serialising outbound mailbox traffic per peer.
//!
//! Keys are 32-bit hashes of the remote endpoint string; colliding strings
//! share a mutex, which is acceptable because the lock only serialises
//! outbound control requests to a peer. Records live until the controller
//! tears down.
//!
//! Lock order is controller lock first, then a mailbox lock. A mailbox lock
//! must never be held across a dispatch tick taken from another thread.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::utils::hash32;

struct MailboxLock {
    hash: u32,
    mutex: Arc<Mutex<()>>,
}

/// Registry of per-peer mailbox mutexes, created on first use.
pub struct MailboxLockRegistry {
    locks: Vec<MailboxLock>,
}

impl MailboxLockRegistry {
    pub fn new() -> Self {
        Self { locks: Vec::new() }
    }

    /// The mutex guarding outbound requests to `endpoint`. The same handle
    /// is returned for every string hashing to the same key.
    pub fn lock_for(&mut self, endpoint: &str) -> Arc<Mutex<()>> {
        let hash = hash32(endpoint);
        if let Some(rec) = self.locks.iter().find(|l| l.hash == hash) {
            return rec.mutex.clone();
        }
        debug!(endpoint, hash, "creating mailbox lock");
        let mutex = Arc::new(Mutex::new(()));
        self.locks.push(MailboxLock {
            hash,
            mutex: mutex.clone(),
        });
        mutex
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl Default for MailboxLockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_endpoint_yields_same_mutex() {
        let mut reg = MailboxLockRegistry::new();
        let a = reg.lock_for("smb:peer;4096.1.16");
        let b = reg.lock_for("smb:peer;4096.1.16");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn different_endpoints_get_distinct_records() {
        let mut reg = MailboxLockRegistry::new();
        let a = reg.lock_for("smb:peer-a;4096.1.16");
        let b = reg.lock_for("smb:peer-b;4096.2.16");
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn handle_outlives_registry_lookup() {
        let mut reg = MailboxLockRegistry::new();
        let m = reg.lock_for("smb:peer;4096.1.16");
        let guard = m.lock();
        // A second lookup still refers to the held mutex.
        assert!(reg.lock_for("smb:peer;4096.1.16").try_lock().is_none());
        drop(guard);
        assert!(reg.lock_for("smb:peer;4096.1.16").try_lock().is_some());
    }
}
