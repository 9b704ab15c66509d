//! Transfer provider abstraction consumed by the control core.
//!
//! This module defines the unified interface every pluggable transport must
//! provide, and the registry through which the core reaches them. The core
//! never moves bulk data itself; it describes descriptor-driven copies
//! through these traits and lets the provider execute them.
//!
//! ## Provider architecture
//!
//! ```text
//! ┌──────────────────┐    ┌───────────────────┐    ┌──────────────────┐
//! │    Transport     │───▶│ ProviderRegistry  │───▶│ TransferFactory  │
//! │   Controller     │    │  (protocol find)  │    │ (per transport)  │
//! └──────────────────┘    └───────────────────┘    └──────────────────┘
//!                                                     │           │
//!                                              SmemServices  TransferService
//!                                              (regions)     (copy programs)
//! ```
//!
//! ## Copy ordering contract
//!
//! A posted transfer executes its copies in submission order, except that
//! every `First` copy completes before any other copy starts and every
//! `Last` copy starts only after all other copies complete. The mailbox
//! engine leans on this to guarantee that a peer never observes a slot whose
//! request tag is valid while the rest of the slot is stale.
//!
//! Provider methods report failures as `anyhow::Error`; the core converts
//! them into `TransportError::Provider` at its boundary.

use std::sync::Arc;

use anyhow::Result;
use parking_lot::RwLock;
use tracing::debug;

use crate::endpoint::Endpoint;
use crate::error::TransportError;

/// Ordering hint attached to one copy within a transfer request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyHint {
    /// No constraint beyond program order.
    None,
    /// Must complete before any non-`First` copy starts.
    First,
    /// Explicitly unconstrained middle copy.
    Middle,
    /// Must start only after every other copy has completed.
    Last,
}

/// A descriptor-driven copy program between two memory regions.
///
/// Requests are built up with [`TransferRequest::add_copy`], posted, and
/// polled for completion. A request may be re-posted once complete; the
/// transfer cache relies on that to acknowledge mailbox requests without
/// rebuilding the program.
pub trait TransferRequest: Send {
    /// Append a copy of `len` bytes from `from_offset` in the source region
    /// to `to_offset` in the destination region.
    fn add_copy(&mut self, from_offset: u64, to_offset: u64, len: usize, hint: CopyHint);

    /// Start the transfer. Completion is observed through
    /// [`TransferRequest::is_complete`].
    fn post(&mut self) -> Result<()>;

    /// True once the most recent post has fully retired.
    fn is_complete(&self) -> bool;
}

/// Factory for transfer requests between one (source, destination) endpoint
/// pair.
pub trait TransferService: Send + Sync {
    fn create_request(&self) -> Box<dyn TransferRequest>;
}

/// Memory region services for one endpoint: map a window, and allocate or
/// release offsets inside the region.
///
/// Local endpoints use the full interface. Remote endpoints are mapped for
/// addressing only and never see `alloc`.
pub trait SmemServices: Send + Sync {
    /// Total region size in bytes.
    fn size(&self) -> u64;

    /// Map `len` bytes at `offset` and return the window's base pointer.
    /// The pointer stays valid for the lifetime of the service object.
    fn map(&self, offset: u64, len: usize) -> Result<*mut u8>;

    /// Release the most recent mapping. Providers backed by a persistent
    /// mapping may treat this as a no-op.
    fn unmap(&self) -> Result<()>;

    /// Allocate `len` bytes inside the region and return its offset.
    fn alloc(&self, len: usize) -> Result<u64>;

    /// Return an allocation made by [`SmemServices::alloc`].
    fn free(&self, offset: u64, len: usize) -> Result<()>;
}

/// One pluggable transport: endpoint finalisation, region access and
/// transfer creation for a single protocol.
pub trait TransferFactory: Send + Sync {
    /// Protocol name this factory serves, e.g. `ocpi-smb-pio`.
    fn protocol(&self) -> &str;

    /// Endpoint templates this factory can finalise, as full endpoint
    /// strings. The mailbox number in a template is advisory until the
    /// template is finalised.
    fn supported_endpoints(&self) -> Vec<String>;

    /// Resolve an endpoint string to an identity. With `allocate` set the
    /// factory finalises the endpoint as local, claiming its mailbox number;
    /// otherwise the result describes a remote peer.
    fn endpoint(&self, spec: &str, allocate: bool) -> Result<Endpoint>;

    /// Mint a fresh local endpoint able to talk to `remote`: same protocol
    /// and mailbox count, a mailbox number of the factory's choosing that
    /// differs from the remote's.
    fn compatible_endpoint(&self, remote: &Endpoint) -> Result<Endpoint>;

    /// Open region services for an endpoint. For a local endpoint this
    /// creates the backing region; for a remote endpoint it attaches to the
    /// existing one without allocating.
    fn smem_services(&self, endpoint: &Endpoint) -> Result<Arc<dyn SmemServices>>;

    /// Build a transfer service moving bytes from `from`'s region into
    /// `to`'s region.
    fn service(&self, from: &Endpoint, to: &Endpoint) -> Result<Arc<dyn TransferService>>;
}

/// Registry of transfer factories, indexed by protocol.
///
/// Population is small and lookups are linear; handles returned are opaque
/// `Arc`s so the storage strategy can change without touching callers.
pub struct ProviderRegistry {
    factories: RwLock<Vec<Arc<dyn TransferFactory>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(Vec::new()),
        }
    }

    /// Register a factory. Later registrations of the same protocol shadow
    /// earlier ones for template enumeration order only; `find` returns the
    /// first match.
    pub fn register(&self, factory: Arc<dyn TransferFactory>) {
        debug!(protocol = factory.protocol(), "registering transfer factory");
        self.factories.write().push(factory);
    }

    /// Every endpoint template across all registered factories, in
    /// registration order.
    pub fn list_supported_endpoints(&self) -> Vec<String> {
        self.factories
            .read()
            .iter()
            .flat_map(|f| f.supported_endpoints())
            .collect()
    }

    /// Find the factory serving `spec`, which may be a full endpoint string
    /// or a bare protocol name.
    pub fn find(&self, spec: &str) -> Option<Arc<dyn TransferFactory>> {
        let protocol = Endpoint::protocol_of(spec);
        self.factories
            .read()
            .iter()
            .find(|f| f.protocol() == protocol)
            .cloned()
    }

    /// Build a transfer service for the (source, destination) pair, resolved
    /// through the source endpoint's factory.
    pub fn service(
        &self,
        from: &Endpoint,
        to: &Endpoint,
    ) -> crate::error::Result<Arc<dyn TransferService>> {
        let factory = self
            .find(from.protocol())
            .ok_or_else(|| TransportError::UnsupportedEndpoint(from.to_string()))?;
        Ok(factory.service(from, to)?)
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}
