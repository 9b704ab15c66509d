//! Endpoint identity: parsing, formatting and compatibility of endpoint
//! strings.
//!
//! An endpoint string has the form
//!
//! ```text
//! protocol ':' address-specific-part ';' size '.' mailbox '.' maxMailboxes
//! ```
//!
//! for example `ocpi-smb-pio:shm-4711-0;1048576.0.16`. The address part is
//! opaque to the core; only the providing transfer factory interprets it. A
//! bare protocol name (no colon) is accepted by the higher layers as a
//! wildcard request for any compatible endpoint of that protocol, but is not
//! a parseable endpoint by itself.

use std::fmt;

use crate::error::{Result, TransportError};

/// Mailbox index within a protocol domain.
pub type MailboxId = u32;

/// Protocol tried first when the caller asks for a default endpoint.
pub const DEFAULT_PROTOCOL: &str = "ocpi-smb-pio";

/// A parsed, comparable endpoint identity.
///
/// Local endpoints own a memory region and a mailbox area; remote endpoints
/// are identities plus a handle for addressing outbound transfers. The
/// `local` flag records which side of that split this value describes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    protocol: String,
    address: String,
    size: u64,
    mailbox: MailboxId,
    max_mailboxes: u32,
    local: bool,
}

impl Endpoint {
    /// Assemble an endpoint from its parts. Used by transfer factories when
    /// they finalise a template or mint a compatible peer endpoint.
    pub fn new(
        protocol: impl Into<String>,
        address: impl Into<String>,
        size: u64,
        mailbox: MailboxId,
        max_mailboxes: u32,
        local: bool,
    ) -> Self {
        Self {
            protocol: protocol.into(),
            address: address.into(),
            size,
            mailbox,
            max_mailboxes,
            local,
        }
    }

    /// Parse a full endpoint string. The result is marked not-local; callers
    /// that finalise a local endpoint flip the flag via [`Endpoint::set_local`].
    pub fn parse(s: &str) -> Result<Self> {
        let bad = || TransportError::BadEndpointSyntax(s.to_string());

        let (protocol, rest) = s.split_once(':').ok_or_else(bad)?;
        let (address, tail) = rest.rsplit_once(';').ok_or_else(bad)?;
        if protocol.is_empty() || address.is_empty() {
            return Err(bad());
        }

        let mut fields = tail.split('.');
        let size: u64 = fields
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or_else(bad)?;
        let mailbox: MailboxId = fields
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or_else(bad)?;
        let max_mailboxes: u32 = fields
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or_else(bad)?;
        if fields.next().is_some() {
            return Err(bad());
        }
        if max_mailboxes == 0 || mailbox >= max_mailboxes {
            return Err(bad());
        }

        Ok(Self {
            protocol: protocol.to_string(),
            address: address.to_string(),
            size,
            mailbox,
            max_mailboxes,
            local: false,
        })
    }

    /// The protocol prefix of an endpoint string or bare protocol name.
    pub fn protocol_of(spec: &str) -> &str {
        match spec.split_once(':') {
            Some((p, _)) => p,
            None => spec,
        }
    }

    /// True when an outbound control path can be set up between this local
    /// endpoint and the peer described by `remote`: same protocol, same
    /// mailbox count, and a mailbox number that does not clash with ours.
    pub fn can_support(&self, remote: &str) -> bool {
        match Endpoint::parse(remote) {
            Ok(r) => {
                self.protocol == r.protocol
                    && self.max_mailboxes == r.max_mailboxes
                    && self.mailbox != r.mailbox
            }
            Err(_) => false,
        }
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn mailbox(&self) -> MailboxId {
        self.mailbox
    }

    pub fn max_mailboxes(&self) -> u32 {
        self.max_mailboxes
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn set_local(&mut self, local: bool) {
        self.local = local;
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{};{}.{}.{}",
            self.protocol, self.address, self.size, self.mailbox, self.max_mailboxes
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trips() {
        for s in [
            "ocpi-smb-pio:shm-4711-0;1048576.0.16",
            "smb:addr;4096.0.16",
            "net-rdma:10.0.0.7:9999;65536.3.8",
            "x:a;0.1.2",
        ] {
            let ep = Endpoint::parse(s).unwrap();
            assert_eq!(ep.to_string(), s);
        }
    }

    #[test]
    fn parse_extracts_fields() {
        let ep = Endpoint::parse("smb:peer;4096.3.16").unwrap();
        assert_eq!(ep.protocol(), "smb");
        assert_eq!(ep.address(), "peer");
        assert_eq!(ep.size(), 4096);
        assert_eq!(ep.mailbox(), 3);
        assert_eq!(ep.max_mailboxes(), 16);
        assert!(!ep.is_local());
    }

    #[test]
    fn rejects_malformed_strings() {
        for s in [
            "",
            "smb",
            "smb:",
            "smb:addr",
            "smb:addr;4096",
            "smb:addr;4096.0",
            "smb:addr;4096.0.16.9",
            "smb:addr;size.0.16",
            ":addr;4096.0.16",
            "smb:addr;4096.16.16",
            "smb:addr;4096.0.0",
        ] {
            assert!(
                matches!(Endpoint::parse(s), Err(TransportError::BadEndpointSyntax(_))),
                "accepted `{s}`"
            );
        }
    }

    #[test]
    fn address_may_contain_separators() {
        // Only the last ';' splits the resource tail off the address.
        let ep = Endpoint::parse("tcp:host;port=80;4096.1.4").unwrap();
        assert_eq!(ep.address(), "host;port=80");
        assert_eq!(ep.to_string(), "tcp:host;port=80;4096.1.4");
    }

    #[test]
    fn compatibility_requires_protocol_count_and_distinct_mailbox() {
        let local = Endpoint::parse("smb:addr;4096.0.16").unwrap();
        assert!(local.can_support("smb:peer;4096.3.16"));
        // Same mailbox number.
        assert!(!local.can_support("smb:peer;4096.0.16"));
        // Different mailbox count.
        assert!(!local.can_support("smb:peer;4096.3.8"));
        // Different protocol.
        assert!(!local.can_support("pio:peer;4096.3.16"));
        // Unparseable remote.
        assert!(!local.can_support("smb"));
    }

    #[test]
    fn protocol_of_handles_bare_names() {
        assert_eq!(Endpoint::protocol_of("smb:addr;4096.0.16"), "smb");
        assert_eq!(Endpoint::protocol_of("smb"), "smb");
    }
}
