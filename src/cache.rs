//! Storage for pre-built mailbox acknowledgement transfers and for in-flight
//! one-shot transfers.
//!
//! Clearing a peer's copy of a slot is a fixed two-copy program, so the
//! first clear to a given (peer, slot offset) pair is cached and every later
//! acknowledgement re-posts the same request object. One-shot transfers
//! (offset broadcasts, request posts) have no key; they are swept lazily and
//! dropped once their poll reports completion.

use std::hint;

use tracing::trace;

use crate::provider::TransferRequest;

/// A cached slot-clear transfer, keyed by destination endpoint and slot
/// offset.
pub struct CachedClear {
    endpoint: String,
    offset: u64,
    request: Box<dyn TransferRequest>,
}

impl CachedClear {
    /// Spin until the previous post of this clear has retired, then post it
    /// again. The program never changes, so reuse is a single posted
    /// transfer.
    pub fn repost(&mut self) -> anyhow::Result<()> {
        while !self.request.is_complete() {
            hint::spin_loop();
        }
        self.request.post()
    }
}

/// Cached clears plus the in-flight one-shot transfer set.
pub struct TransferCache {
    cached: Vec<CachedClear>,
    active: Vec<Box<dyn TransferRequest>>,
}

impl TransferCache {
    pub fn new() -> Self {
        Self {
            cached: Vec::new(),
            active: Vec::new(),
        }
    }

    /// Look up the cached clear for `(endpoint, offset)`.
    pub fn find_clear(&mut self, endpoint: &str, offset: u64) -> Option<&mut CachedClear> {
        self.cached
            .iter_mut()
            .find(|c| c.offset == offset && c.endpoint == endpoint)
    }

    /// Record a freshly built and posted clear for later reuse.
    pub fn insert_clear(&mut self, endpoint: &str, offset: u64, request: Box<dyn TransferRequest>) {
        trace!(endpoint, offset, "caching mailbox clear transfer");
        self.cached.push(CachedClear {
            endpoint: endpoint.to_string(),
            offset,
            request,
        });
    }

    /// Drop every cached clear. Invoked when the circuit registry empties;
    /// in-flight one-shots are kept until they retire.
    pub fn purge_clears(&mut self) {
        self.cached.clear();
    }

    /// Retire completed one-shot transfers.
    pub fn sweep_active(&mut self) {
        self.active.retain(|t| !t.is_complete());
    }

    /// Track a posted one-shot transfer until a later sweep retires it.
    pub fn push_active(&mut self, request: Box<dyn TransferRequest>) {
        self.active.push(request);
    }

    pub fn cached_len(&self) -> usize {
        self.cached.len()
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }
}

impl Default for TransferCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{CopyHint, TransferFactory};
    use crate::test_support::MemFactory;

    fn build_request(factory: &MemFactory) -> Box<dyn TransferRequest> {
        let from = factory.endpoint_for_test(0);
        let to = factory.endpoint_for_test(1);
        let service = factory.service(&from, &to).unwrap();
        let mut req = service.create_request();
        req.add_copy(64, 64, 16, CopyHint::First);
        req.post().unwrap();
        req
    }

    #[test]
    fn find_matches_on_endpoint_and_offset() {
        let factory = MemFactory::new("smb", 8192, 4);
        let mut cache = TransferCache::new();
        cache.insert_clear("smb:a;8192.1.4", 64, build_request(&factory));

        assert!(cache.find_clear("smb:a;8192.1.4", 64).is_some());
        assert!(cache.find_clear("smb:a;8192.1.4", 128).is_none());
        assert!(cache.find_clear("smb:b;8192.2.4", 64).is_none());
    }

    #[test]
    fn sweep_retires_only_completed_transfers() {
        let factory = MemFactory::new("smb", 8192, 4);
        factory.set_manual_completion(true);
        let from = factory.endpoint_for_test(0);
        let to = factory.endpoint_for_test(1);
        let service = factory.service(&from, &to).unwrap();

        let mut cache = TransferCache::new();
        let mut pending = service.create_request();
        pending.add_copy(0, 0, 4, CopyHint::None);
        pending.post().unwrap();
        cache.push_active(pending);
        assert_eq!(cache.active_len(), 1);

        // Still in flight under manual completion.
        cache.sweep_active();
        assert_eq!(cache.active_len(), 1);

        factory.complete_all();
        cache.sweep_active();
        assert_eq!(cache.active_len(), 0);
    }

    #[test]
    fn purge_drops_cached_clears_only() {
        let factory = MemFactory::new("smb", 8192, 4);
        let mut cache = TransferCache::new();
        cache.insert_clear("smb:a;8192.1.4", 64, build_request(&factory));
        cache.push_active(build_request(&factory));

        cache.purge_clears();
        assert_eq!(cache.cached_len(), 0);
        assert_eq!(cache.active_len(), 1);
    }
}
