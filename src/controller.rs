//! Transport controller: the public facade over endpoint, circuit and
//! transfer-cache state.
//!
//! ## Concurrency model
//!
//! A foreground thread creates ports and circuits while a dispatcher thread
//! calls [`Transport::dispatch`] periodically. One controller mutex guards
//! the endpoint table, circuit registry, transfer cache and mailbox lock
//! registry; every public operation takes it on entry. Internal code works
//! on `&mut ControllerState` and never re-locks, so the cooperative waits
//! inside outbound negotiation run the dispatch tick directly instead of
//! re-entering the facade. Per-peer mailbox locks nest strictly inside the
//! controller lock; the inbound dispatcher takes none of them.
//!
//! New-circuit announcements are collected while the lock is held and the
//! listener is invoked after it is released, so a listener may call straight
//! back into the controller.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::debug;

use crate::cache::TransferCache;
use crate::circuit::{
    Circuit, CircuitId, ConnectionMetaData, Port, PortDescriptor, PortLocation,
};
use crate::endpoint::Endpoint;
use crate::error::{Result, TransportError};
use crate::locks::MailboxLockRegistry;
use crate::provider::{ProviderRegistry, SmemServices};
use crate::table::{EndpointTable, SmbResources};
use crate::utils::Timer;

/// Environment variable forcing the protocol of new input ports when the
/// caller supplies none.
pub const DEFAULT_PROTOCOL_ENV: &str = "OCPI_DEFAULT_PROTOCOL";

/// Behaviour flags for [`Transport::create_circuit`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CircuitFlags {
    /// Negotiate the circuit with the peer before returning.
    pub new_connection: bool,
    /// This side sends data on the circuit; the peer is the server of the
    /// negotiation.
    pub send: bool,
}

/// Callback invoked when an inbound negotiation produced a circuit.
///
/// Announcements are delivered outside the controller lock, after the
/// dispatch pass that produced them.
pub trait NewCircuitListener: Send + Sync {
    fn new_circuit_available(&self, circuit: &Arc<Circuit>);
}

/// Endpoint selection parameters for new input ports. `protocol` and
/// `transport` are synonyms, checked in that order; `endpoint` is an
/// explicit endpoint-string override.
#[derive(Debug, Clone, Default)]
pub struct PortParams {
    pub protocol: Option<String>,
    pub transport: Option<String>,
    pub endpoint: Option<String>,
}

impl PortParams {
    fn requested_protocol(&self) -> Option<&str> {
        self.protocol.as_deref().or(self.transport.as_deref())
    }
}

/// Process-wide circuit-id counter, seeded once from the process id and a
/// random value so ids rarely collide across processes. Every circuit id in
/// the process comes from this counter, which keeps ids monotonic across
/// controllers.
static CIRCUIT_ID_COUNTER: OnceLock<AtomicU32> = OnceLock::new();

fn next_circuit_id() -> CircuitId {
    let counter = CIRCUIT_ID_COUNTER.get_or_init(|| {
        AtomicU32::new((std::process::id() as u32).wrapping_add(rand::random::<u32>()))
    });
    counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
}

/// Everything behind the controller mutex. Field order matters at teardown:
/// circuits are destroyed before the transfer cache and the endpoint sets.
pub(crate) struct ControllerState {
    pub(crate) circuits: Vec<Arc<Circuit>>,
    pub(crate) cache: TransferCache,
    pub(crate) endpoints: EndpointTable,
    pub(crate) mailbox_locks: MailboxLockRegistry,
    pub(crate) registry: Arc<ProviderRegistry>,
    pub(crate) listener: Option<Arc<dyn NewCircuitListener>>,
    /// The control-surface endpoint: the first local endpoint finalised by
    /// this controller. Its mailbox area is the one the dispatch tick scans.
    pub(crate) control: Option<Arc<SmbResources>>,
    /// Circuits accepted by inbound negotiation, announced to the listener
    /// once the controller lock drops.
    pub(crate) announcements: Vec<Arc<Circuit>>,
}

impl ControllerState {
    pub(crate) fn find_circuit(&self, id: CircuitId) -> Option<Arc<Circuit>> {
        self.circuits.iter().find(|c| c.id() == id).cloned()
    }

    /// Adopt the first finalised local endpoint as the control surface.
    pub(crate) fn note_local(&mut self, res: &Arc<SmbResources>) {
        if self.control.is_none() {
            debug!(
                endpoint = res.endpoint_string(),
                "control endpoint established"
            );
            self.control = Some(res.clone());
        }
    }

    /// Region services of `endpoint` when it is one of ours.
    pub(crate) fn smem_if_local(&self, endpoint: &str) -> Option<Arc<dyn SmemServices>> {
        self.endpoints
            .resources(endpoint)
            .filter(|r| r.endpoint().is_local())
            .map(|r| r.smem().clone())
    }
}

/// The transport controller.
pub struct Transport {
    pub(crate) state: Mutex<ControllerState>,
    uses_mailboxes: bool,
    /// Nesting depth of the mailbox engine; nested dispatches are legal but
    /// worth seeing in a trace.
    pub(crate) dispatch_nesting: AtomicU32,
}

impl Transport {
    /// Create a controller over the given provider registry. Controllers
    /// that never negotiate (pure data movers) may disable mailbox scanning.
    pub fn new(registry: Arc<ProviderRegistry>, uses_mailboxes: bool) -> Self {
        let state = ControllerState {
            circuits: Vec::new(),
            cache: TransferCache::new(),
            endpoints: EndpointTable::new(registry.clone()),
            mailbox_locks: MailboxLockRegistry::new(),
            registry,
            listener: None,
            control: None,
            announcements: Vec::new(),
        };
        Self {
            state: Mutex::new(state),
            uses_mailboxes,
            dispatch_nesting: AtomicU32::new(0),
        }
    }

    pub fn uses_mailboxes(&self) -> bool {
        self.uses_mailboxes
    }

    /// Install or clear the inbound-negotiation callback. While no listener
    /// is installed, inbound connection requests stay pending in their slot
    /// and the peer keeps retrying.
    pub fn set_new_circuit_listener(&self, listener: Option<Arc<dyn NewCircuitListener>>) {
        self.state.lock().listener = listener;
    }

    /// One housekeeping pass: pump every ready circuit's queued transfers,
    /// then run the mailbox engine. Fatal protocol errors escape here.
    pub fn dispatch(&self) -> Result<()> {
        let result = {
            let mut st = self.state.lock();
            self.tick(&mut st)
        };
        self.drain_announcements();
        result
    }

    pub(crate) fn tick(&self, st: &mut ControllerState) -> Result<()> {
        let circuits = st.circuits.clone();
        for circuit in &circuits {
            if circuit.ready() {
                circuit.check_queued_transfers();
            }
        }
        if self.uses_mailboxes {
            self.check_mailboxes(st)?;
        }
        Ok(())
    }

    fn drain_announcements(&self) {
        loop {
            let (listener, pending) = {
                let mut st = self.state.lock();
                if st.announcements.is_empty() {
                    return;
                }
                (st.listener.clone(), std::mem::take(&mut st.announcements))
            };
            if let Some(listener) = listener {
                for circuit in &pending {
                    listener.new_circuit_available(circuit);
                }
            }
        }
    }

    pub fn circuit(&self, id: CircuitId) -> Option<Arc<Circuit>> {
        self.state.lock().find_circuit(id)
    }

    pub fn circuit_count(&self) -> usize {
        self.state.lock().circuits.len()
    }

    /// Remove and destroy a circuit. Unknown ids are ignored. When the last
    /// circuit goes away the cached acknowledgement transfers go with it.
    pub fn delete_circuit(&self, id: CircuitId) {
        let mut st = self.state.lock();
        Self::delete_circuit_inner(&mut st, id);
    }

    pub(crate) fn delete_circuit_inner(st: &mut ControllerState, id: CircuitId) {
        let Some(pos) = st.circuits.iter().position(|c| c.id() == id) else {
            return;
        };
        debug!(circuit = format_args!("{id:#x}"), "deleting circuit");
        st.circuits.remove(pos);
        if st.circuits.is_empty() {
            st.cache.purge_clears();
        }
    }

    /// Create a circuit from connection metadata. Without an explicit `id`
    /// one is drawn from the process-wide counter; with one, any existing
    /// circuit under that id is deleted first. With `flags.new_connection`
    /// the circuit is negotiated with the peer before this returns, and a
    /// failed negotiation tears the new circuit down again.
    pub fn create_circuit(
        &self,
        id: Option<CircuitId>,
        meta: ConnectionMetaData,
        flags: CircuitFlags,
        protocol_info: Option<&[u8]>,
        timer: Option<&Timer>,
    ) -> Result<Arc<Circuit>> {
        let result = {
            let mut st = self.state.lock();
            self.create_circuit_inner(&mut st, id, meta, flags, protocol_info, timer)
        };
        self.drain_announcements();
        result
    }

    pub(crate) fn create_circuit_inner(
        &self,
        st: &mut ControllerState,
        id: Option<CircuitId>,
        meta: ConnectionMetaData,
        flags: CircuitFlags,
        protocol_info: Option<&[u8]>,
        timer: Option<&Timer>,
    ) -> Result<Arc<Circuit>> {
        let cid = id.unwrap_or_else(next_circuit_id);
        if st.find_circuit(cid).is_some() {
            Self::delete_circuit_inner(st, cid);
        }

        let output_smem = meta
            .output_endpoint
            .as_deref()
            .and_then(|e| st.smem_if_local(e));
        let input_smem = meta
            .input_endpoint
            .as_deref()
            .and_then(|e| st.smem_if_local(e));
        let circuit = Arc::new(Circuit::new(cid, meta, output_smem, input_smem)?);
        st.circuits.push(circuit.clone());
        debug!(
            circuit = format_args!("{cid:#x}"),
            "new circuit created and registered"
        );

        if flags.new_connection {
            if let Err(e) = self.request_new_connection_inner(st, &circuit, flags.send, protocol_info, timer)
            {
                Self::delete_circuit_inner(st, cid);
                return Err(e);
            }
        }
        Ok(circuit)
    }

    /// Create an input port, on `circuit` when given, otherwise on a fresh
    /// circuit. The local endpoint is chosen from `params`, the
    /// `OCPI_DEFAULT_PROTOCOL` environment variable, or the ambient default,
    /// and its string is stamped into the descriptor's out-of-band field.
    pub fn create_input_port(
        &self,
        circuit: Option<&Arc<Circuit>>,
        desc: &mut PortDescriptor,
        params: &PortParams,
    ) -> Result<Port> {
        let mut st = self.state.lock();

        let res = if let Some(protocol) = params.requested_protocol() {
            st.endpoints.add_local_from_protocol(protocol)?
        } else if let Ok(protocol) = std::env::var(DEFAULT_PROTOCOL_ENV) {
            debug!("forcing protocol = {protocol} because {DEFAULT_PROTOCOL_ENV} set in environment");
            st.endpoints.add_local_from_protocol(&protocol)?
        } else {
            st.endpoints.add_local(params.endpoint.as_deref(), false)?
        };
        st.note_local(&res);
        desc.oob_endpoint = res.endpoint_string().to_string();

        match circuit {
            Some(circuit) => {
                let ordinal = circuit.add_port(desc, res.smem().clone())?;
                circuit.update_port(ordinal);
                Ok(Port::new(circuit.clone(), PortLocation::Input(0), ordinal))
            }
            None => {
                let meta = ConnectionMetaData::from_input_descriptor(desc);
                let circuit =
                    self.create_circuit_inner(&mut st, None, meta, CircuitFlags::default(), None, None)?;
                Ok(Port::new(circuit, PortLocation::Input(0), 1))
            }
        }
    }

    /// Create an output port against a remote input descriptor: choose or
    /// create a compatible local endpoint, register the input endpoint as
    /// remote, narrow the buffer size to what the input accepts, and build a
    /// circuit carrying both sides.
    pub fn create_output_port(
        &self,
        output_desc: &mut PortDescriptor,
        input_desc: &PortDescriptor,
    ) -> Result<Port> {
        let mut st = self.state.lock();

        let res = st.endpoints.local_compatible(&input_desc.oob_endpoint)?;
        st.note_local(&res);
        output_desc.oob_endpoint = res.endpoint_string().to_string();
        st.endpoints.add_remote(&input_desc.oob_endpoint)?;

        if output_desc.data_buffer_size > input_desc.data_buffer_size {
            output_desc.data_buffer_size = input_desc.data_buffer_size;
        }

        let meta = ConnectionMetaData::from_output_descriptor(output_desc);
        let circuit =
            self.create_circuit_inner(&mut st, None, meta, CircuitFlags::default(), None, None)?;
        circuit.add_input_port(input_desc);
        Ok(Port::new(circuit, PortLocation::Output, 0))
    }

    /// Create an output port against an input port of this same controller.
    /// The connection stays inside one region, so the circuit is finalised
    /// directly instead of negotiated.
    pub fn create_output_port_for(
        &self,
        output_desc: &mut PortDescriptor,
        input_port: &Port,
    ) -> Result<Port> {
        let st = self.state.lock();

        let input_desc = input_port.descriptor().ok_or_else(|| {
            TransportError::InvariantViolation("input port has no descriptor".into())
        })?;
        output_desc.oob_endpoint = input_desc.oob_endpoint.clone();
        if output_desc.data_buffer_size > input_desc.data_buffer_size {
            debug!(
                "forcing output buffer size to {} from input size on local connection",
                input_desc.data_buffer_size
            );
            output_desc.data_buffer_size = input_desc.data_buffer_size;
        }

        let smem = st.smem_if_local(&input_desc.oob_endpoint).ok_or_else(|| {
            TransportError::InvariantViolation(format!(
                "input endpoint `{}` is not local to this controller",
                input_desc.oob_endpoint
            ))
        })?;
        input_port.circuit().finalize(&input_desc.oob_endpoint, smem)?;
        Ok(Port::new(
            input_port.circuit().clone(),
            PortLocation::Output,
            0,
        ))
    }

    /// Negotiate an existing circuit with its peer. `send` marks this side
    /// as the data sender; `protocol_info` is an opaque blob delivered to
    /// the server before the circuit becomes usable.
    pub fn request_new_connection(
        &self,
        circuit: &Arc<Circuit>,
        send: bool,
        protocol_info: Option<&[u8]>,
        timer: Option<&Timer>,
    ) -> Result<()> {
        let result = {
            let mut st = self.state.lock();
            self.request_new_connection_inner(&mut st, circuit, send, protocol_info, timer)
        };
        self.drain_announcements();
        result
    }

    /// Reference to a finalised local endpoint able to talk to `spec`
    /// (a remote endpoint string or bare protocol name).
    pub fn local_compatible_endpoint(&self, spec: &str) -> Result<Endpoint> {
        let mut st = self.state.lock();
        let res = st.endpoints.local_compatible(spec)?;
        st.note_local(&res);
        Ok(res.endpoint().clone())
    }

    /// Resources of a known endpoint, by exact endpoint string.
    pub fn endpoint_resources(&self, endpoint: &str) -> Option<Arc<SmbResources>> {
        self.state.lock().endpoints.resources(endpoint)
    }

    /// Register a remote endpoint ahead of negotiation.
    pub fn add_remote_endpoint(&self, endpoint: &str) -> Result<Arc<SmbResources>> {
        self.state.lock().endpoints.add_remote(endpoint)
    }

    pub fn is_local_endpoint(&self, endpoint: &str) -> bool {
        self.state.lock().endpoints.is_local(endpoint)
    }

    /// Drop a local endpoint and, if it was the control surface, forget
    /// that too.
    pub fn remove_local_endpoint(&self, endpoint: &str) {
        let mut st = self.state.lock();
        if let Some(c) = &st.control {
            if c.endpoint_string() == endpoint {
                st.control = None;
            }
        }
        st.endpoints.remove_local(endpoint);
    }

    pub fn local_endpoint_count(&self) -> usize {
        self.state.lock().endpoints.local_count()
    }

    pub fn remote_endpoint_count(&self) -> usize {
        self.state.lock().endpoints.remote_count()
    }
}
