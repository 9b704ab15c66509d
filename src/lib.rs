//! # Shared-Memory Circuit Transport Core
//!
//! Control core of a shared-memory data-transport layer: it negotiates and
//! manages *circuits*, pairwise unidirectional data flows between processing
//! components that exchange bulk data through named *endpoints*. Control
//! signalling runs over small fixed-format mailbox slots at the head of
//! each endpoint's memory region; bulk data bypasses the mailbox path
//! entirely and is set up through descriptor-driven memory-to-memory
//! transfers.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌────────────────┐   foreground    ┌─────────────────┐
//! │  Port/Circuit  │───────────────▶ │    Transport    │
//! │  creation APIs │                 │   (controller)  │
//! └────────────────┘                 └───────┬─────────┘
//!        dispatcher thread ──────────────────┤ dispatch()
//!                                            ▼
//!   Endpoint Table ── Mailbox Engine ── Transfer Cache ── Circuits
//!                                            │
//!                                     ProviderRegistry
//!                                 (pluggable transports)
//! ```
//!
//! The controller owns two endpoint sets (local finalised, remote known),
//! the circuit registry, the transfer cache and the per-peer mailbox locks,
//! all behind a single controller mutex. Providers are pluggable through
//! [`provider::TransferFactory`]; a programmed-I/O provider over OS shared
//! memory ships in [`pio`].

pub mod cache;
pub mod circuit;
pub mod controller;
pub mod endpoint;
pub mod error;
pub mod locks;
pub mod logging;
pub mod mailbox;
pub mod pio;
mod protocol;
pub mod provider;
pub mod table;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_support;

pub use circuit::{
    Circuit, CircuitId, ConnectionMetaData, OffsetPair, Port, PortDescriptor, PortLocation,
    PortOrdinal, ProtocolInfo,
};
pub use controller::{
    CircuitFlags, NewCircuitListener, PortParams, Transport, DEFAULT_PROTOCOL_ENV,
};
pub use endpoint::{Endpoint, MailboxId, DEFAULT_PROTOCOL};
pub use error::{Result, TransportError};
pub use pio::PioFactory;
pub use provider::{
    CopyHint, ProviderRegistry, SmemServices, TransferFactory, TransferRequest, TransferService,
};
pub use table::SmbResources;
pub use utils::Timer;

/// The current version of the transport core.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    /// Default memory region size for the built-in PIO provider
    pub const REGION_SIZE: u64 = 1 << 20;

    /// Default mailbox count per protocol domain
    pub const MAX_MAILBOXES: u32 = 16;

    /// Default data buffer size for new port descriptors
    pub const DATA_BUFFER_SIZE: u32 = 4096;
}
