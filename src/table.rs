//! Endpoint table: the controller's two endpoint sets.
//!
//! Local endpoints are finalised identities owning a memory region with a
//! mailbox area; remote endpoints are known peers attached for outbound
//! addressing only. Both sets are insertion-ordered with linear lookup; the
//! expected population is tens, and every lookup hands back an opaque `Arc`
//! so the storage can later move to a map without touching callers.

use std::sync::Arc;

use tracing::debug;

use crate::endpoint::{Endpoint, MailboxId, DEFAULT_PROTOCOL};
use crate::error::{Result, TransportError};
use crate::mailbox::{self, MAX_SYSTEM_MAILBOXES};
use crate::provider::{ProviderRegistry, SmemServices};

/// A registered endpoint with its region services. For local endpoints the
/// region was created here and starts with the mailbox area; for remote
/// endpoints the region is attached without allocating.
pub struct SmbResources {
    endpoint: Endpoint,
    endpoint_str: String,
    smem: Arc<dyn SmemServices>,
}

impl std::fmt::Debug for SmbResources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmbResources")
            .field("endpoint", &self.endpoint)
            .field("endpoint_str", &self.endpoint_str)
            .finish()
    }
}

impl SmbResources {
    pub(crate) fn new(endpoint: Endpoint, smem: Arc<dyn SmemServices>) -> Self {
        let endpoint_str = endpoint.to_string();
        Self {
            endpoint,
            endpoint_str,
            smem,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn endpoint_string(&self) -> &str {
        &self.endpoint_str
    }

    pub fn smem(&self) -> &Arc<dyn SmemServices> {
        &self.smem
    }
}

/// The local-finalised and remote-known endpoint sets.
pub struct EndpointTable {
    registry: Arc<ProviderRegistry>,
    /// Supported endpoint templates enumerated at startup; entries are
    /// replaced by their finalised strings as they are claimed.
    supported: Vec<String>,
    local: Vec<Arc<SmbResources>>,
    remote: Vec<Arc<SmbResources>>,
    default_local: Option<Arc<SmbResources>>,
}

impl EndpointTable {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        let supported = registry.list_supported_endpoints();
        for ep in &supported {
            debug!("initial supported ep = {ep}");
        }
        Self {
            registry,
            supported,
            local: Vec::new(),
            remote: Vec::new(),
            default_local: None,
        }
    }

    pub fn supported(&self) -> &[String] {
        &self.supported
    }

    /// Register a local endpoint. With `spec` absent the cached default is
    /// returned, created lazily from the default protocol with a fallback to
    /// the first supported template. With `compatible_with` set, `spec`
    /// names a remote endpoint and the factory mints a fresh local endpoint
    /// able to talk to it.
    pub fn add_local(
        &mut self,
        spec: Option<&str>,
        compatible_with: bool,
    ) -> Result<Arc<SmbResources>> {
        let Some(spec) = spec else {
            return self.default_local();
        };

        let factory = self
            .registry
            .find(spec)
            .ok_or_else(|| TransportError::UnsupportedEndpoint(spec.to_string()))?;
        let ep = if compatible_with {
            let remote = Endpoint::parse(spec)?;
            factory.compatible_endpoint(&remote)?
        } else {
            factory.endpoint(spec, true)?
        };
        if !ep.is_local() {
            return Err(TransportError::InvariantViolation(format!(
                "factory for `{}` finalised `{ep}` without marking it local",
                factory.protocol()
            )));
        }
        if ep.max_mailboxes() >= MAX_SYSTEM_MAILBOXES {
            return Err(TransportError::EndpointCapacityExceeded {
                endpoint: ep.to_string(),
                max_mailboxes: ep.max_mailboxes(),
                ceiling: MAX_SYSTEM_MAILBOXES,
            });
        }

        let ep_str = ep.to_string();
        if let Some(existing) = self.resources(&ep_str) {
            return Ok(existing);
        }

        debug!("adding local endpoint {ep_str}");
        let smem = factory.smem_services(&ep)?;
        let res = Arc::new(SmbResources::new(ep, smem));
        mailbox::initialize_comms(&res)?;
        self.local.push(res.clone());
        Ok(res)
    }

    /// Finalise and register a local endpoint for a protocol by walking the
    /// supported templates.
    pub fn add_local_from_protocol(&mut self, protocol: &str) -> Result<Arc<SmbResources>> {
        debug!("finding compatible endpoint for {protocol}");
        let wanted = Endpoint::protocol_of(protocol);
        for i in 0..self.supported.len() {
            let template = self.supported[i].clone();
            if Endpoint::protocol_of(&template) == wanted {
                let res = self.add_local(Some(&template), false)?;
                debug!("found {} for {protocol}", res.endpoint_string());
                self.supported[i] = res.endpoint_string().to_string();
                return Ok(res);
            }
        }
        Err(TransportError::UnsupportedEndpoint(protocol.to_string()))
    }

    /// Find or create a local endpoint able to talk to `spec`, which may be
    /// a full remote endpoint string or a bare protocol name.
    ///
    /// An existing local endpoint that can already support the peer is
    /// reused. Otherwise a supported template with matching protocol and
    /// mailbox count and a distinct mailbox number is finalised, and as a
    /// last resort the provider mints a compatible endpoint.
    pub fn local_compatible(&mut self, spec: &str) -> Result<Arc<SmbResources>> {
        let spec = if spec.is_empty() { DEFAULT_PROTOCOL } else { spec };
        if !spec.contains(':') {
            return self.add_local_from_protocol(spec);
        }

        if let Some(res) = self.local.iter().find(|l| l.endpoint().can_support(spec)) {
            return Ok(res.clone());
        }

        let remote = Endpoint::parse(spec)?;
        for i in 0..self.supported.len() {
            let template = self.supported[i].clone();
            let Ok(te) = Endpoint::parse(&template) else {
                continue;
            };
            if te.protocol() == remote.protocol()
                && te.max_mailboxes() == remote.max_mailboxes()
                && te.mailbox() != remote.mailbox()
            {
                let res = self.add_local(Some(&template), false)?;
                self.supported[i] = res.endpoint_string().to_string();
                return Ok(res);
            }
        }

        self.add_local(Some(spec), true)
    }

    /// Register a remote endpoint, attaching to its region without
    /// allocating. Idempotent: a known endpoint is returned as-is.
    pub fn add_remote(&mut self, spec: &str) -> Result<Arc<SmbResources>> {
        if let Some(res) = self.resources(spec) {
            return Ok(res);
        }
        debug!("adding remote endpoint {spec}");
        let factory = self
            .registry
            .find(spec)
            .ok_or_else(|| TransportError::UnsupportedEndpoint(spec.to_string()))?;
        let ep = factory.endpoint(spec, false)?;
        let smem = factory.smem_services(&ep)?;
        let res = Arc::new(SmbResources::new(ep, smem));
        self.remote.push(res.clone());
        Ok(res)
    }

    /// Resources of a known endpoint, remote set searched first.
    pub fn resources(&self, endpoint: &str) -> Option<Arc<SmbResources>> {
        self.remote
            .iter()
            .chain(self.local.iter())
            .find(|r| r.endpoint_string() == endpoint)
            .cloned()
    }

    /// Resources of whichever known endpoint answers to mailbox `mb`.
    pub fn resources_for_mailbox(&self, mb: MailboxId) -> Option<Arc<SmbResources>> {
        self.remote
            .iter()
            .chain(self.local.iter())
            .find(|r| r.endpoint().mailbox() == mb)
            .cloned()
    }

    pub fn is_local(&self, endpoint: &str) -> bool {
        self.local.iter().any(|l| l.endpoint_string() == endpoint)
    }

    /// Drop a local endpoint; its region is released when the last handle
    /// goes away.
    pub fn remove_local(&mut self, endpoint: &str) {
        if let Some(d) = &self.default_local {
            if d.endpoint_string() == endpoint {
                self.default_local = None;
            }
        }
        self.local.retain(|l| l.endpoint_string() != endpoint);
    }

    pub fn local_count(&self) -> usize {
        self.local.len()
    }

    pub fn remote_count(&self) -> usize {
        self.remote.len()
    }

    fn default_local(&mut self) -> Result<Arc<SmbResources>> {
        if let Some(d) = &self.default_local {
            return Ok(d.clone());
        }
        let res = match self.add_local_from_protocol(DEFAULT_PROTOCOL) {
            Ok(res) => res,
            Err(e) => {
                if self.supported.is_empty() {
                    return Err(e);
                }
                let first = self.supported[0].clone();
                self.add_local(Some(&first), false)?
            }
        };
        self.default_local = Some(res.clone());
        Ok(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MemFactory;

    fn table_with(factories: Vec<MemFactory>) -> EndpointTable {
        let registry = Arc::new(ProviderRegistry::new());
        for f in factories {
            registry.register(Arc::new(f));
        }
        EndpointTable::new(registry)
    }

    #[test]
    fn unknown_protocol_is_rejected_without_side_effects() {
        let mut table = table_with(vec![MemFactory::new("smb", 65536, 16)]);
        let err = table.add_local_from_protocol("no-such").unwrap_err();
        assert!(matches!(err, TransportError::UnsupportedEndpoint(_)));
        assert_eq!(table.local_count(), 0);
    }

    #[test]
    fn default_endpoint_prefers_the_builtin_protocol() {
        let mut table = table_with(vec![
            MemFactory::new("smb", 65536, 16),
            MemFactory::new(DEFAULT_PROTOCOL, 65536, 16),
        ]);
        let res = table.add_local(None, false).unwrap();
        assert_eq!(res.endpoint().protocol(), DEFAULT_PROTOCOL);

        // Cached: the same record comes back.
        let again = table.add_local(None, false).unwrap();
        assert!(Arc::ptr_eq(&res, &again));
        assert_eq!(table.local_count(), 1);
    }

    #[test]
    fn default_endpoint_falls_back_to_first_supported() {
        let mut table = table_with(vec![MemFactory::new("smb", 65536, 16)]);
        let res = table.add_local(None, false).unwrap();
        assert_eq!(res.endpoint().protocol(), "smb");
    }

    #[test]
    fn compatible_peer_reuses_existing_local_endpoint() {
        let mut table = table_with(vec![MemFactory::new("smb", 65536, 16)]);
        let existing = table.add_local(Some("smb:addr;65536.0.16"), false).unwrap();

        let found = table.local_compatible("smb:peer;65536.3.16").unwrap();
        assert!(Arc::ptr_eq(&existing, &found));
        assert_eq!(table.local_count(), 1);
    }

    #[test]
    fn clashing_mailbox_forces_a_new_local_endpoint() {
        let mut table = table_with(vec![MemFactory::new("smb", 65536, 16)]);
        let existing = table.add_local(Some("smb:addr;65536.0.16"), false).unwrap();

        let created = table.local_compatible("smb:peer;65536.0.16").unwrap();
        assert!(!Arc::ptr_eq(&existing, &created));
        assert_ne!(created.endpoint().mailbox(), 0);
        assert_eq!(created.endpoint().max_mailboxes(), 16);
        assert_eq!(table.local_count(), 2);
    }

    #[test]
    fn bare_protocol_walks_supported_templates() {
        let mut table = table_with(vec![MemFactory::new("smb", 65536, 16)]);
        let res = table.local_compatible("smb").unwrap();
        assert_eq!(res.endpoint().protocol(), "smb");
        assert!(res.endpoint().is_local());
        // The template entry was replaced by the finalised string.
        assert_eq!(table.supported()[0], res.endpoint_string());
    }

    #[test]
    fn remote_registration_is_idempotent() {
        let mut table = table_with(vec![MemFactory::new("smb", 65536, 16)]);
        let a = table.add_remote("smb:peer;65536.2.16").unwrap();
        let b = table.add_remote("smb:peer;65536.2.16").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(table.remote_count(), 1);
        assert!(!a.endpoint().is_local());
        assert!(!table.is_local("smb:peer;65536.2.16"));
    }

    #[test]
    fn mailbox_ceiling_is_enforced() {
        let mut table = table_with(vec![MemFactory::new("smb", 65536, 64)]);
        let err = table.add_local(Some("smb:addr;65536.0.64"), false).unwrap_err();
        assert!(matches!(
            err,
            TransportError::EndpointCapacityExceeded {
                max_mailboxes: 64,
                ..
            }
        ));
        assert_eq!(table.local_count(), 0);
    }

    #[test]
    fn remove_local_forgets_the_endpoint() {
        let mut table = table_with(vec![MemFactory::new("smb", 65536, 16)]);
        let res = table.add_local(Some("smb:addr;65536.0.16"), false).unwrap();
        let ep = res.endpoint_string().to_string();
        assert!(table.is_local(&ep));

        table.remove_local(&ep);
        assert!(!table.is_local(&ep));
        assert_eq!(table.local_count(), 0);
    }

    #[test]
    fn resources_by_mailbox_searches_both_sets() {
        let mut table = table_with(vec![MemFactory::new("smb", 65536, 16)]);
        table.add_local(Some("smb:addr;65536.0.16"), false).unwrap();
        table.add_remote("smb:peer;65536.5.16").unwrap();

        assert_eq!(
            table.resources_for_mailbox(5).unwrap().endpoint().mailbox(),
            5
        );
        assert_eq!(
            table.resources_for_mailbox(0).unwrap().endpoint().mailbox(),
            0
        );
        assert!(table.resources_for_mailbox(9).is_none());
    }
}
