//! Circuits: negotiated unidirectional flows between an output port set and
//! one or more input port sets.
//!
//! The control core owns circuit lifecycle and negotiation; the per-buffer
//! dataflow machinery underneath a circuit stays outside it. A circuit here
//! carries the connection metadata, the port records with their control
//! blocks, the protocol info staging area, and a queue of posted transfers
//! the dispatch tick pumps on its behalf.
//!
//! Each non-shadow port owns a small control block allocated from its
//! endpoint's memory region: the words peers poll for flow control. The
//! first half of the block holds the shadow remote-state words, the second
//! half the input-specific words; an output port reports the whole block.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::Result;
use crate::mailbox::{read_endpoint_chars, ReqUpdateCircuit};
use crate::provider::{SmemServices, TransferRequest};

/// Circuit identifier, unique among live circuits of one controller.
pub type CircuitId = u32;

/// Port ordinal within a circuit. The output port is ordinal zero; input
/// ports count from one.
pub type PortOrdinal = u32;

/// Control words allocated per non-shadow port.
pub const PORT_CONTROL_WORDS: usize = 4;

const WORD: usize = 4;

/// Caller-facing description of one port: buffering plus the out-of-band
/// endpoint string that tells the peer where the port lives.
#[derive(Debug, Clone)]
pub struct PortDescriptor {
    pub n_buffers: u32,
    pub data_buffer_size: u32,
    /// Endpoint string of the region backing this port. Stamped by the
    /// controller when the port is created.
    pub oob_endpoint: String,
}

impl Default for PortDescriptor {
    fn default() -> Self {
        Self {
            n_buffers: 1,
            data_buffer_size: crate::defaults::DATA_BUFFER_SIZE,
            oob_endpoint: String::new(),
        }
    }
}

/// Connection metadata a circuit is built from: the endpoints of both sides
/// (either may be unresolved while the circuit is still open) and the
/// buffering agreed for the flow.
#[derive(Debug, Clone, Default)]
pub struct ConnectionMetaData {
    pub output_endpoint: Option<String>,
    pub input_endpoint: Option<String>,
    pub buffer_count: u32,
    pub buffer_size: u32,
}

impl ConnectionMetaData {
    pub fn new(
        output_endpoint: Option<String>,
        input_endpoint: Option<String>,
        buffer_count: u32,
        buffer_size: u32,
    ) -> Self {
        Self {
            output_endpoint,
            input_endpoint,
            buffer_count,
            buffer_size,
        }
    }

    /// Metadata for a circuit described from its output side only.
    pub fn from_output_descriptor(desc: &PortDescriptor) -> Self {
        Self::new(
            Some(desc.oob_endpoint.clone()),
            None,
            desc.n_buffers,
            desc.data_buffer_size,
        )
    }

    /// Metadata for a circuit described from its input side only.
    pub fn from_input_descriptor(desc: &PortDescriptor) -> Self {
        Self::new(
            None,
            Some(desc.oob_endpoint.clone()),
            desc.n_buffers,
            desc.data_buffer_size,
        )
    }
}

/// One 32-bit copy in an offset broadcast: a local control word and the
/// peer-designated destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetPair {
    pub from: u64,
    pub to: u64,
}

/// Protocol info blob bookkeeping: byte size and offset of the staging
/// allocation in the owner's local region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolInfo {
    pub size: u32,
    pub offset: u64,
}

struct PortRecord {
    ordinal: PortOrdinal,
    descriptor: PortDescriptor,
    /// Shadow ports live on a remote endpoint; they carry no control block.
    shadow: bool,
    control_offsets: Vec<u64>,
    smem: Option<Arc<dyn SmemServices>>,
}

impl PortRecord {
    fn new_shadow(ordinal: PortOrdinal, descriptor: PortDescriptor) -> Self {
        Self {
            ordinal,
            descriptor,
            shadow: true,
            control_offsets: Vec::new(),
            smem: None,
        }
    }

    fn new_local(
        ordinal: PortOrdinal,
        descriptor: PortDescriptor,
        smem: Arc<dyn SmemServices>,
    ) -> Result<Self> {
        let base = smem.alloc(PORT_CONTROL_WORDS * WORD)?;
        let control_offsets = (0..PORT_CONTROL_WORDS)
            .map(|i| base + (i * WORD) as u64)
            .collect();
        Ok(Self {
            ordinal,
            descriptor,
            shadow: false,
            control_offsets,
            smem: Some(smem),
        })
    }

    /// Pair a range of this port's control words against a return base the
    /// peer designated. Pairs are emitted in word order, destinations packed
    /// from the base.
    fn offset_pairs(&self, words: std::ops::Range<usize>, return_base: u64) -> Vec<OffsetPair> {
        self.control_offsets[words]
            .iter()
            .enumerate()
            .map(|(j, from)| OffsetPair {
                from: *from,
                to: return_base + (j * WORD) as u64,
            })
            .collect()
    }
}

impl Drop for PortRecord {
    fn drop(&mut self) {
        if let (Some(smem), Some(base)) = (&self.smem, self.control_offsets.first()) {
            let _ = smem.free(*base, PORT_CONTROL_WORDS * WORD);
        }
    }
}

struct PortSetState {
    buffer_count: u32,
    buffer_size: u32,
    ports: Vec<PortRecord>,
}

impl PortSetState {
    fn port(&self, ordinal: PortOrdinal) -> Option<&PortRecord> {
        self.ports.iter().find(|p| p.ordinal == ordinal)
    }
}

struct CircuitState {
    meta: ConnectionMetaData,
    output: PortSetState,
    inputs: Vec<PortSetState>,
    /// An open circuit is still negotiating; the dispatch tick does not pump
    /// it.
    open: bool,
    protocol_info: Option<ProtocolInfo>,
    queued: Vec<Box<dyn TransferRequest>>,
    remote_circuit_id: Option<CircuitId>,
}

/// A live circuit. Owned by the transport controller, with its own leaf
/// lock so dataplane threads can touch it without the controller lock.
pub struct Circuit {
    id: CircuitId,
    state: Mutex<CircuitState>,
}

impl std::fmt::Debug for Circuit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Circuit").field("id", &self.id).finish()
    }
}

impl Circuit {
    /// Build a circuit from connection metadata. `output_smem` and
    /// `input_smem` carry the region services of whichever side is local;
    /// the corresponding port gets a control block, the other side becomes a
    /// shadow port.
    pub(crate) fn new(
        id: CircuitId,
        meta: ConnectionMetaData,
        output_smem: Option<Arc<dyn SmemServices>>,
        input_smem: Option<Arc<dyn SmemServices>>,
    ) -> Result<Self> {
        let mut output = PortSetState {
            buffer_count: meta.buffer_count,
            buffer_size: meta.buffer_size,
            ports: Vec::new(),
        };
        if let Some(ep) = &meta.output_endpoint {
            let desc = PortDescriptor {
                n_buffers: meta.buffer_count,
                data_buffer_size: meta.buffer_size,
                oob_endpoint: ep.clone(),
            };
            output.ports.push(match &output_smem {
                Some(smem) => PortRecord::new_local(0, desc, smem.clone())?,
                None => PortRecord::new_shadow(0, desc),
            });
        }

        let mut inputs = Vec::new();
        if let Some(ep) = &meta.input_endpoint {
            let desc = PortDescriptor {
                n_buffers: meta.buffer_count,
                data_buffer_size: meta.buffer_size,
                oob_endpoint: ep.clone(),
            };
            let port = match &input_smem {
                Some(smem) => PortRecord::new_local(1, desc, smem.clone())?,
                None => PortRecord::new_shadow(1, desc),
            };
            inputs.push(PortSetState {
                buffer_count: meta.buffer_count,
                buffer_size: meta.buffer_size,
                ports: vec![port],
            });
        }

        let open = meta.output_endpoint.is_none() || meta.input_endpoint.is_none();
        Ok(Self {
            id,
            state: Mutex::new(CircuitState {
                meta,
                output,
                inputs,
                open,
                protocol_info: None,
                queued: Vec::new(),
                remote_circuit_id: None,
            }),
        })
    }

    pub fn id(&self) -> CircuitId {
        self.id
    }

    /// True when negotiation finished and the dispatch tick may pump this
    /// circuit's queued transfers.
    pub fn ready(&self) -> bool {
        !self.state.lock().open
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    pub fn set_open(&self, open: bool) {
        self.state.lock().open = open;
    }

    /// Retire queued transfers whose poll reports completion.
    pub fn check_queued_transfers(&self) {
        self.state.lock().queued.retain(|t| !t.is_complete());
    }

    /// Hand a posted transfer to the circuit; the dispatch tick retires it
    /// once complete. This is the dataplane's entry point for descriptor
    /// updates that must outlive the caller.
    pub fn queue_transfer(&self, request: Box<dyn TransferRequest>) {
        self.state.lock().queued.push(request);
    }

    pub fn queued_len(&self) -> usize {
        self.state.lock().queued.len()
    }

    /// Apply an inbound circuit update: the sender announces its output
    /// endpoint and its own circuit id.
    pub fn update_inputs(&self, req: &ReqUpdateCircuit) {
        let mut st = self.state.lock();
        let output = read_endpoint_chars(&req.output_end_point);
        debug!(
            circuit = format_args!("{:#x}", self.id),
            sender = format_args!("{:#x}", req.sender_circuit_id),
            %output,
            "updating circuit inputs"
        );
        st.meta.output_endpoint = Some(output);
        st.remote_circuit_id = Some(req.sender_circuit_id);
    }

    pub fn remote_circuit_id(&self) -> Option<CircuitId> {
        self.state.lock().remote_circuit_id
    }

    pub fn input_port_set_count(&self) -> usize {
        self.state.lock().inputs.len()
    }

    /// Attach a shadow input port described by a remote descriptor. Returns
    /// the assigned ordinal.
    pub fn add_input_port(&self, desc: &PortDescriptor) -> PortOrdinal {
        let mut st = self.state.lock();
        let ordinal = next_input_ordinal(&st);
        if st.meta.input_endpoint.is_none() {
            st.meta.input_endpoint = Some(desc.oob_endpoint.clone());
        }
        let record = PortRecord::new_shadow(ordinal, desc.clone());
        push_input_port(&mut st, desc, record);
        refresh_open(&mut st);
        ordinal
    }

    /// Attach a local input port with its own control block. Returns the
    /// assigned ordinal.
    pub fn add_port(
        &self,
        desc: &PortDescriptor,
        smem: Arc<dyn SmemServices>,
    ) -> Result<PortOrdinal> {
        let mut st = self.state.lock();
        let ordinal = next_input_ordinal(&st);
        if st.meta.input_endpoint.is_none() {
            st.meta.input_endpoint = Some(desc.oob_endpoint.clone());
        }
        let record = PortRecord::new_local(ordinal, desc.clone(), smem)?;
        push_input_port(&mut st, desc, record);
        refresh_open(&mut st);
        Ok(ordinal)
    }

    /// Re-derive derived state after a port's descriptor changed.
    pub fn update_port(&self, ordinal: PortOrdinal) {
        let mut st = self.state.lock();
        debug!(circuit = format_args!("{:#x}", self.id), ordinal, "port updated");
        refresh_open(&mut st);
    }

    /// Resolve the output side of a locally connected circuit: stamp the
    /// output endpoint and give the output port a control block in that
    /// endpoint's region.
    pub fn finalize(&self, output_endpoint: &str, smem: Arc<dyn SmemServices>) -> Result<()> {
        let mut st = self.state.lock();
        st.meta.output_endpoint = Some(output_endpoint.to_string());
        if st.output.ports.is_empty() {
            let desc = PortDescriptor {
                n_buffers: st.output.buffer_count,
                data_buffer_size: st.output.buffer_size,
                oob_endpoint: output_endpoint.to_string(),
            };
            let record = PortRecord::new_local(0, desc, smem)?;
            st.output.ports.push(record);
        }
        refresh_open(&mut st);
        Ok(())
    }

    pub fn set_protocol_info(&self, size: u32, offset: u64) {
        self.state.lock().protocol_info = Some(ProtocolInfo { size, offset });
    }

    pub fn protocol_info(&self) -> Option<ProtocolInfo> {
        self.state.lock().protocol_info
    }

    pub fn clear_protocol_info(&self) {
        self.state.lock().protocol_info = None;
    }

    /// Snapshot of the connection metadata.
    pub fn metadata(&self) -> ConnectionMetaData {
        self.state.lock().meta.clone()
    }

    pub fn buffer_size(&self) -> u32 {
        self.state.lock().meta.buffer_size
    }

    /// Full control-block offsets of an output port, paired against a
    /// peer-designated return base.
    pub fn output_offsets(
        &self,
        ordinal: PortOrdinal,
        return_base: u64,
    ) -> Option<Vec<OffsetPair>> {
        let st = self.state.lock();
        let port = st.output.port(ordinal)?;
        if port.shadow {
            return None;
        }
        Some(port.offset_pairs(0..PORT_CONTROL_WORDS, return_base))
    }

    /// Shadow remote-state offsets of an input port: the first half of its
    /// control block. Searches every input set, first match wins.
    pub fn shadow_rstate_offsets(
        &self,
        ordinal: PortOrdinal,
        return_base: u64,
    ) -> Option<Vec<OffsetPair>> {
        self.input_port_pairs(ordinal, 0..PORT_CONTROL_WORDS / 2, return_base)
    }

    /// Input-specific offsets of an input port: the second half of its
    /// control block.
    pub fn input_offsets(&self, ordinal: PortOrdinal, return_base: u64) -> Option<Vec<OffsetPair>> {
        self.input_port_pairs(ordinal, PORT_CONTROL_WORDS / 2..PORT_CONTROL_WORDS, return_base)
    }

    fn input_port_pairs(
        &self,
        ordinal: PortOrdinal,
        words: std::ops::Range<usize>,
        return_base: u64,
    ) -> Option<Vec<OffsetPair>> {
        let st = self.state.lock();
        for set in &st.inputs {
            if let Some(port) = set.port(ordinal) {
                if port.shadow {
                    return None;
                }
                return Some(port.offset_pairs(words, return_base));
            }
        }
        None
    }

    /// Descriptor of the port at `location` / `ordinal`, if present.
    pub fn port_descriptor(
        &self,
        location: PortLocation,
        ordinal: PortOrdinal,
    ) -> Option<PortDescriptor> {
        let st = self.state.lock();
        let record = match location {
            PortLocation::Output => st.output.port(ordinal),
            PortLocation::Input(set) => st.inputs.get(set)?.port(ordinal),
        }?;
        Some(record.descriptor.clone())
    }
}

fn next_input_ordinal(st: &CircuitState) -> PortOrdinal {
    match st.inputs.first() {
        Some(set) => 1 + set.ports.len() as PortOrdinal,
        None => 1,
    }
}

fn push_input_port(st: &mut CircuitState, desc: &PortDescriptor, record: PortRecord) {
    if st.inputs.is_empty() {
        st.inputs.push(PortSetState {
            buffer_count: desc.n_buffers,
            buffer_size: desc.data_buffer_size,
            ports: Vec::new(),
        });
    }
    st.inputs[0].ports.push(record);
}

fn refresh_open(st: &mut CircuitState) {
    st.open = st.meta.output_endpoint.is_none() || st.meta.input_endpoint.is_none();
}

/// Which port set a port handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortLocation {
    Output,
    Input(usize),
}

/// Caller handle for one port of a circuit.
#[derive(Clone)]
pub struct Port {
    circuit: Arc<Circuit>,
    location: PortLocation,
    ordinal: PortOrdinal,
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port")
            .field("circuit_id", &self.circuit.id())
            .field("location", &self.location)
            .field("ordinal", &self.ordinal)
            .finish()
    }
}

impl Port {
    pub(crate) fn new(circuit: Arc<Circuit>, location: PortLocation, ordinal: PortOrdinal) -> Self {
        Self {
            circuit,
            location,
            ordinal,
        }
    }

    pub fn circuit(&self) -> &Arc<Circuit> {
        &self.circuit
    }

    pub fn ordinal(&self) -> PortOrdinal {
        self.ordinal
    }

    pub fn location(&self) -> PortLocation {
        self.location
    }

    /// Endpoint string of the region this port lives in.
    pub fn endpoint(&self) -> Option<String> {
        self.descriptor().map(|d| d.oob_endpoint)
    }

    pub fn descriptor(&self) -> Option<PortDescriptor> {
        self.circuit.port_descriptor(self.location, self.ordinal)
    }
}
