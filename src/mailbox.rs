//! Bit-exact mailbox slot layout and slot access helpers.
//!
//! Every local memory region begins with a short [`UpAndRunningMarker`]
//! followed by an array of `maxMailboxes` slots, one per potential peer. A
//! peer with mailbox number `n` writes its requests into slot `n` of our
//! region; we acknowledge by writing the cleared slot back into slot `n` of
//! the peer's region. A slot is idle while its request tag reads
//! `NoRequest` and pending otherwise.
//!
//! The layout is `repr(C)` and shared across processes, so every field is
//! fixed-width and the request tag sits at offset zero of the slot: each
//! payload variant embeds the common [`BasicReq`] header first, which lets
//! acknowledgements clear the slot tail before the tag so a peer can never
//! observe a valid tag over stale payload bytes.

use std::mem::size_of;
use std::ptr;

use crate::endpoint::MailboxId;
use crate::error::{Result, TransportError};
use crate::table::SmbResources;

/// Most mailboxes a single protocol domain may declare. Endpoint
/// registration rejects anything at or above this.
pub const MAX_SYSTEM_MAILBOXES: u32 = 32;

/// Characters reserved for an endpoint string inside a slot payload,
/// including the terminating NUL.
pub const ENDPOINT_CHARS: usize = 128;

/// Request tags carried in [`BasicReq::kind`]. `NoRequest` doubles as the
/// idle marker, so it must stay zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RequestKind {
    NoRequest = 0,
    NewConnection = 1,
    UpdateCircuit = 2,
    OutputControlOffset = 3,
    ShadowRstateOffset = 4,
    InputOffsets = 5,
}

impl RequestKind {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::NoRequest),
            1 => Some(Self::NewConnection),
            2 => Some(Self::UpdateCircuit),
            3 => Some(Self::OutputControlOffset),
            4 => Some(Self::ShadowRstateOffset),
            5 => Some(Self::InputOffsets),
            _ => None,
        }
    }
}

/// Common header of every request payload. Cleared last so the tag flip is
/// the final thing a peer observes.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct BasicReq {
    pub kind: u32,
}

/// Ask the receiver to create the server half of a circuit.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct ReqNewConnection {
    pub basic: BasicReq,
    pub circuit_id: u32,
    pub buffer_size: u32,
    /// Non-zero when the requester intends to send data to the receiver.
    pub send: u32,
    /// Bytes of protocol info the requester holds for the receiver, zero
    /// when there is none.
    pub protocol_size: u32,
    pub output_end_point: [u8; ENDPOINT_CHARS],
}

/// Forward new input-side state into an existing circuit.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct ReqUpdateCircuit {
    pub basic: BasicReq,
    pub receiver_circuit_id: u32,
    pub sender_circuit_id: u32,
    pub output_end_point: [u8; ENDPOINT_CHARS],
}

/// Ask the output side for its flow-control offsets, optionally telling it
/// where to place the protocol info blob announced at connection time.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct ReqOutputControlOffset {
    pub basic: BasicReq,
    pub circuit_id: u32,
    /// Destination offset for the protocol info blob in the requester's
    /// region, zero when no blob was announced.
    pub protocol_offset: u64,
    pub port_id: u32,
    pub shadow_end_point: [u8; ENDPOINT_CHARS],
}

/// Ask an input port for its shadow remote-state offsets.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct ReqShadowRstateOffset {
    pub basic: BasicReq,
    pub circuit_id: u32,
    pub port_id: u32,
    pub url: [u8; ENDPOINT_CHARS],
}

/// Ask an input port for its input-specific offsets.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct ReqInputOffsets {
    pub basic: BasicReq,
    pub circuit_id: u32,
    pub port_id: u32,
    pub url: [u8; ENDPOINT_CHARS],
}

/// Request payload union, discriminated by the leading tag.
#[derive(Clone, Copy)]
#[repr(C)]
pub union RequestPayload {
    pub basic: BasicReq,
    pub new_connection: ReqNewConnection,
    pub update_circuit: ReqUpdateCircuit,
    pub output_control: ReqOutputControlOffset,
    pub shadow_rstate: ReqShadowRstateOffset,
    pub input_offsets: ReqInputOffsets,
}

/// One control-message slot.
#[repr(C)]
pub struct MailboxSlot {
    pub request: RequestPayload,
    /// Base offset in the requester's region where the answer lands; `-1`
    /// when no reply is expected.
    pub return_offset: i64,
    pub return_size: u32,
    pub return_mailbox_id: u32,
    pub error_code: i32,
}

/// Region header announcing that the owner finished initialising its
/// mailbox area.
#[repr(C)]
pub struct UpAndRunningMarker {
    pub flag: u32,
    pub pad: u32,
}

/// Value stored in [`UpAndRunningMarker::flag`] once the slots are usable.
pub const UP_AND_RUNNING: u32 = 0x5550_5231; // "UPR1"

/// Size of the common header cleared last during an acknowledgement.
pub const TAG_SIZE: usize = size_of::<BasicReq>();

/// Byte size of one slot.
pub const fn slot_size() -> usize {
    size_of::<MailboxSlot>()
}

/// Offset of slot `mailbox` from the start of the region.
pub fn slot_offset(mailbox: MailboxId) -> u64 {
    (size_of::<UpAndRunningMarker>() + mailbox as usize * slot_size()) as u64
}

/// Total bytes of the mailbox area: marker plus the full slot array.
pub fn comms_size(max_mailboxes: u32) -> usize {
    size_of::<UpAndRunningMarker>() + max_mailboxes as usize * slot_size()
}

/// Copy an endpoint string into a fixed payload field, NUL terminated.
pub fn write_endpoint_chars(field: &mut [u8; ENDPOINT_CHARS], s: &str) -> Result<()> {
    let bytes = s.as_bytes();
    if bytes.len() >= ENDPOINT_CHARS {
        return Err(TransportError::InvariantViolation(format!(
            "endpoint string `{s}` exceeds the {ENDPOINT_CHARS} byte slot field"
        )));
    }
    field[..bytes.len()].copy_from_slice(bytes);
    field[bytes.len()..].fill(0);
    Ok(())
}

/// Read a NUL-terminated endpoint string out of a payload field.
pub fn read_endpoint_chars(field: &[u8; ENDPOINT_CHARS]) -> String {
    let len = field.iter().position(|b| *b == 0).unwrap_or(ENDPOINT_CHARS);
    String::from_utf8_lossy(&field[..len]).into_owned()
}

/// Write the up-and-running marker and zero the slot array of a freshly
/// created local region.
pub fn initialize_comms(res: &SmbResources) -> Result<()> {
    let total = comms_size(res.endpoint().max_mailboxes());
    let base = res.smem().map(0, total)?;
    unsafe {
        ptr::write_bytes(base, 0, total);
        let marker = base as *mut UpAndRunningMarker;
        ptr::write_volatile(ptr::addr_of_mut!((*marker).flag), UP_AND_RUNNING);
    }
    Ok(())
}

/// Addressing helper for one mailbox's slot, in whichever region it is
/// viewed.
#[derive(Debug, Clone, Copy)]
pub struct MailboxView {
    mailbox: MailboxId,
}

impl MailboxView {
    pub fn new(mailbox: MailboxId) -> Self {
        Self { mailbox }
    }

    pub fn mailbox(&self) -> MailboxId {
        self.mailbox
    }

    /// Offset of this mailbox's slot within a region.
    pub fn offset(&self) -> u64 {
        slot_offset(self.mailbox)
    }

    /// Raw pointer to this mailbox's slot inside `res`'s region. The slot is
    /// shared memory written by peers, so all field access must go through
    /// volatile reads and writes.
    pub fn slot_ptr(&self, res: &SmbResources) -> Result<*mut MailboxSlot> {
        let base = res.smem().map(self.offset(), slot_size())?;
        Ok(base as *mut MailboxSlot)
    }

    /// True while this slot reads idle in `res`'s region.
    pub fn available(&self, res: &SmbResources) -> Result<bool> {
        let slot = self.slot_ptr(res)?;
        let kind = unsafe { ptr::read_volatile(ptr::addr_of!((*slot).request.basic.kind)) };
        Ok(kind == RequestKind::NoRequest as u32)
    }
}

/// Reset a local slot to idle: error code first, tag last.
pub fn clear_local_slot(slot: *mut MailboxSlot) {
    unsafe {
        ptr::write_volatile(ptr::addr_of_mut!((*slot).error_code), 0);
        ptr::write_volatile(
            ptr::addr_of_mut!((*slot).request.basic.kind),
            RequestKind::NoRequest as u32,
        );
    }
}

/// Mark a local slot rejected before it is cleared back to the peer.
pub fn reject_local_slot(slot: *mut MailboxSlot) {
    unsafe {
        ptr::write_volatile(ptr::addr_of_mut!((*slot).error_code), -1);
        ptr::write_volatile(
            ptr::addr_of_mut!((*slot).request.basic.kind),
            RequestKind::NoRequest as u32,
        );
    }
}
