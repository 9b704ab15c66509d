//! Error taxonomy for the transport control core.
//!
//! Every fallible public operation returns [`TransportError`]. Provider
//! implementations (transfer factories, memory regions) report failures as
//! `anyhow::Error`; those are folded into the [`TransportError::Provider`]
//! variant at the core boundary so callers see a single error type.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Failures surfaced by the transport control core.
#[derive(Debug, Error)]
pub enum TransportError {
    /// An endpoint string did not match the
    /// `protocol:address;size.mailbox.maxMailboxes` grammar.
    #[error("malformed endpoint string `{0}`")]
    BadEndpointSyntax(String),

    /// No registered transfer provider matches the endpoint's protocol.
    #[error("endpoint not supported: `{0}`")]
    UnsupportedEndpoint(String),

    /// A local endpoint declared more mailboxes than the core can track.
    #[error("endpoint `{endpoint}` declares {max_mailboxes} mailboxes, ceiling is {ceiling}")]
    EndpointCapacityExceeded {
        endpoint: String,
        max_mailboxes: u32,
        ceiling: u32,
    },

    /// The local memory region refused an allocation.
    #[error("no buffer available {0}")]
    NoBufferAvailable(&'static str),

    /// A mailbox slot did not drain within the caller's timer.
    #[error("server not responding")]
    ServerNotResponding,

    /// The server answered a connection request with a non-zero error code.
    #[error("failed to create client connection: server error code {0}")]
    ConnectRejected(i32),

    /// Internal consistency failure. These are not recoverable; they mean a
    /// peer referenced a circuit or endpoint this controller never knew about,
    /// or controller state was corrupted.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// A transfer provider or memory region service failed.
    #[error(transparent)]
    Provider(#[from] anyhow::Error),
}
