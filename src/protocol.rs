//! Mailbox protocol engine: outbound circuit negotiation and the inbound
//! request dispatcher.
//!
//! Outbound requests are staged in our own region's slot for our mailbox
//! number and copied into the same slot of the server's region; the server
//! answers by clearing our copy remotely, carrying its error code along.
//! Inbound dispatch walks every slot other than our own, branches on the
//! request tag, and acknowledges by clearing the requester's copy of the
//! slot through the transfer cache.
//!
//! Slot transfers move the payload before the tag word in completion order,
//! so a peer can never observe a pending tag over a half-written request,
//! nor a cleared tail under a still-valid tag.
//!
//! Handler failures follow three outcomes: success, recoverable rejection
//! (only inbound `NewConnection`, answered with `error_code = -1`), and
//! fatal invariant violations that escape from `dispatch`.

use std::ptr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::circuit::{Circuit, CircuitId, ConnectionMetaData, OffsetPair, PortOrdinal};
use crate::controller::{CircuitFlags, ControllerState, Transport};
use crate::endpoint::Endpoint;
use crate::error::{Result, TransportError};
use crate::mailbox::{
    self, clear_local_slot, read_endpoint_chars, reject_local_slot, write_endpoint_chars,
    BasicReq, MailboxSlot, MailboxView, ReqNewConnection, RequestKind, ENDPOINT_CHARS, TAG_SIZE,
};
use crate::provider::CopyHint;
use crate::table::SmbResources;
use crate::utils::Timer;

fn invariant(msg: impl Into<String>) -> TransportError {
    TransportError::InvariantViolation(msg.into())
}

fn remote_identity(st: &ControllerState, spec: &str) -> Result<Endpoint> {
    let factory = st
        .registry
        .find(spec)
        .ok_or_else(|| TransportError::UnsupportedEndpoint(spec.to_string()))?;
    Ok(factory.endpoint(spec, false)?)
}

impl Transport {
    /// Outbound negotiation. Runs with the controller lock held; the waits
    /// below tick the dispatcher directly and never release the lock.
    pub(crate) fn request_new_connection_inner(
        &self,
        st: &mut ControllerState,
        circuit: &Arc<Circuit>,
        send: bool,
        protocol_info: Option<&[u8]>,
        timer: Option<&Timer>,
    ) -> Result<()> {
        let meta = circuit.metadata();
        let output_loc = meta
            .output_endpoint
            .ok_or_else(|| invariant("circuit has no output endpoint"))?;
        let input_loc = meta
            .input_endpoint
            .ok_or_else(|| invariant("circuit has no input endpoint"))?;
        let (client_loc, server_loc) = if send {
            (output_loc, input_loc)
        } else {
            (input_loc, output_loc)
        };

        if !st.endpoints.is_local(&server_loc) {
            st.endpoints.add_remote(&server_loc)?;
        }
        debug!("requestNewConnection: c: {client_loc} s: {server_loc}");

        let factory = st
            .registry
            .find(&client_loc)
            .ok_or_else(|| TransportError::UnsupportedEndpoint(client_loc.clone()))?;
        let client_location = factory.endpoint(&client_loc, false)?;

        let lock = st.mailbox_locks.lock_for(&server_loc);
        let _guard = lock.lock();

        let s_res = st
            .endpoints
            .resources(&client_loc)
            .ok_or_else(|| invariant(format!("no resources for client endpoint {client_loc}")))?;
        let t_res = st
            .endpoints
            .resources(&server_loc)
            .ok_or_else(|| invariant(format!("no resources for server endpoint {server_loc}")))?;

        let view = MailboxView::new(client_location.mailbox());

        // Keep the circuit out of the dispatch pump while its slot churns.
        let was_open = circuit.is_open();
        circuit.set_open(true);
        while !view.available(&s_res)? {
            if timer.map_or(false, Timer::expired) {
                circuit.set_open(was_open);
                return Err(TransportError::ServerNotResponding);
            }
            self.tick(st)?;
            thread::yield_now();
        }
        circuit.set_open(was_open);

        debug!("client is making a request to server to establish new connection");

        let control = st
            .control
            .clone()
            .ok_or_else(|| invariant("controller has no control endpoint"))?;
        let mut request = ReqNewConnection {
            basic: BasicReq {
                kind: RequestKind::NewConnection as u32,
            },
            circuit_id: circuit.id(),
            buffer_size: circuit.buffer_size(),
            send: u32::from(send),
            protocol_size: 0,
            output_end_point: [0; ENDPOINT_CHARS],
        };
        write_endpoint_chars(&mut request.output_end_point, control.endpoint_string())?;

        if let Some(info) = protocol_info {
            // Stage the blob in our region now; it moves to the server when
            // the server asks for our output control offsets and tells us
            // where to put it.
            let size = info.len() + 1;
            let offset = s_res
                .smem()
                .alloc(size)
                .map_err(|_| TransportError::NoBufferAvailable("for protocol info exchange"))?;
            let dst = s_res.smem().map(offset, size)?;
            unsafe {
                ptr::copy_nonoverlapping(info.as_ptr(), dst, info.len());
                *dst.add(info.len()) = 0;
            }
            circuit.set_protocol_info(size as u32, offset);
            request.protocol_size = size as u32;
        }

        let slot = view.slot_ptr(&s_res)?;
        unsafe {
            // This request carries no return window.
            ptr::write_volatile(ptr::addr_of_mut!((*slot).return_offset), -1);
            ptr::write_volatile(ptr::addr_of_mut!((*slot).return_size), 0);
            ptr::write_volatile(
                ptr::addr_of_mut!((*slot).return_mailbox_id),
                client_location.mailbox(),
            );
            ptr::write_volatile(ptr::addr_of_mut!((*slot).error_code), 0);
            ptr::write_volatile(ptr::addr_of_mut!((*slot).request.new_connection), request);
        }

        debug!(
            circuit = format_args!("{:#x}", circuit.id()),
            "posting connection request"
        );
        self.post_slot(st, &view, s_res.endpoint(), t_res.endpoint())?;

        // Wait for the server to drain the request and clear our copy.
        while !view.available(&s_res)? {
            if timer.map_or(false, Timer::expired) {
                return Err(TransportError::ServerNotResponding);
            }
            self.tick(st)?;
            thread::sleep(Duration::from_millis(1));
        }

        let error_code = unsafe { ptr::read_volatile(ptr::addr_of!((*slot).error_code)) };
        if error_code != 0 {
            return Err(TransportError::ConnectRejected(error_code));
        }
        Ok(())
    }

    /// Copy our staged slot into the peer's region, payload before tag.
    fn post_slot(
        &self,
        st: &mut ControllerState,
        view: &MailboxView,
        from: &Endpoint,
        to: &Endpoint,
    ) -> Result<()> {
        st.cache.sweep_active();
        let service = st.registry.service(from, to)?;
        let mut request = service.create_request();
        let offset = view.offset();
        let size = mailbox::slot_size();
        request.add_copy(
            offset + TAG_SIZE as u64,
            offset + TAG_SIZE as u64,
            size - TAG_SIZE,
            CopyHint::First,
        );
        request.add_copy(offset, offset, TAG_SIZE, CopyHint::Last);
        request.post()?;
        st.cache.push_active(request);
        Ok(())
    }

    /// Write a cleared copy of slot `offset` back into the peer's region.
    /// The first clear to a (peer, offset) pair builds the two-copy program
    /// and caches it; reuse re-posts the cached request once its previous
    /// post has retired.
    pub(crate) fn clear_remote_mailbox(
        &self,
        st: &mut ControllerState,
        offset: u64,
        remote: &Endpoint,
    ) -> Result<()> {
        let remote_str = remote.to_string();
        debug!("clearing remote mailbox {remote_str} offset {offset:#x}");

        if let Some(cached) = st.cache.find_clear(&remote_str, offset) {
            cached.repost()?;
            return Ok(());
        }

        let control = st
            .control
            .clone()
            .ok_or_else(|| invariant("controller has no control endpoint"))?;
        let service = st.registry.service(control.endpoint(), remote)?;
        let mut request = service.create_request();
        let size = mailbox::slot_size();
        // Tail first, tag last: the peer never sees a valid tag over a
        // half-cleared slot.
        request.add_copy(
            offset + TAG_SIZE as u64,
            offset + TAG_SIZE as u64,
            size - TAG_SIZE,
            CopyHint::First,
        );
        request.add_copy(offset, offset, TAG_SIZE, CopyHint::Last);
        request.post()?;
        st.cache.insert_clear(&remote_str, offset, request);
        Ok(())
    }

    /// Broadcast control-word offsets to a peer, optionally preceded by the
    /// protocol info blob. The blob rides in front in program order: the
    /// offset words are what the peer polls, so their arrival implies the
    /// blob is complete.
    pub(crate) fn send_offsets(
        &self,
        st: &mut ControllerState,
        offsets: &[OffsetPair],
        remote: &Endpoint,
        extra_size: u32,
        extra_from: u64,
        extra_to: u64,
    ) -> Result<()> {
        st.cache.sweep_active();

        let control = st
            .control
            .clone()
            .ok_or_else(|| invariant("controller has no control endpoint"))?;
        let service = st.registry.service(control.endpoint(), remote)?;
        let mut request = service.create_request();
        if extra_size > 0 {
            request.add_copy(extra_from, extra_to, extra_size as usize, CopyHint::None);
        }
        for pair in offsets {
            request.add_copy(pair.from, pair.to, 4, CopyHint::None);
        }
        request.post()?;
        st.cache.push_active(request);
        Ok(())
    }

    /// Inbound dispatch entry. Keeps the nesting depth honest; nested
    /// dispatches are legal but traced.
    pub(crate) fn check_mailboxes(&self, st: &mut ControllerState) -> Result<()> {
        let nesting = self.dispatch_nesting.fetch_add(1, Ordering::SeqCst);
        if nesting > 0 {
            debug!(depth = nesting + 1, "nested mailbox dispatch");
        }
        let result = self.scan_mailboxes(st);
        self.dispatch_nesting.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn scan_mailboxes(&self, st: &mut ControllerState) -> Result<()> {
        let Some(control) = st.control.clone() else {
            return Ok(());
        };
        let our_mailbox = control.endpoint().mailbox();
        let n_mailboxes = control.endpoint().max_mailboxes();

        for n in 0..n_mailboxes {
            if n == our_mailbox {
                continue;
            }
            let view = MailboxView::new(n);
            let slot = view.slot_ptr(&control)?;
            let raw = unsafe { ptr::read_volatile(ptr::addr_of!((*slot).request.basic.kind)) };
            if raw == RequestKind::NoRequest as u32 {
                continue;
            }
            debug!("got a mailbox request from {n}, req = {raw}");

            match RequestKind::from_raw(raw) {
                Some(RequestKind::UpdateCircuit) => {
                    self.handle_update_circuit(st, &view, slot)?;
                }
                Some(RequestKind::NewConnection) => {
                    // Without a listener nobody can own the new circuit.
                    // Leave the slot pending; the peer keeps retrying until
                    // a listener is installed.
                    if st.listener.is_none() {
                        return Ok(());
                    }
                    self.handle_new_connection(st, &control, &view, slot)?;
                }
                Some(RequestKind::OutputControlOffset) => {
                    self.handle_output_control(st, &control, &view, slot)?;
                }
                Some(RequestKind::ShadowRstateOffset) => {
                    self.handle_port_offsets(st, &view, slot, Circuit::shadow_rstate_offsets)?;
                }
                Some(RequestKind::InputOffsets) => {
                    self.handle_port_offsets(st, &view, slot, Circuit::input_offsets)?;
                }
                Some(RequestKind::NoRequest) | None => {
                    debug!("ignoring mailbox request tag {raw} from {n}");
                }
            }
        }
        Ok(())
    }

    fn handle_update_circuit(
        &self,
        st: &mut ControllerState,
        view: &MailboxView,
        slot: *mut MailboxSlot,
    ) -> Result<()> {
        let req = unsafe { ptr::read_volatile(ptr::addr_of!((*slot).request.update_circuit)) };
        let cid = req.receiver_circuit_id;
        debug!(
            circuit = format_args!("{cid:#x}"),
            "handling circuit update request"
        );
        let circuit = st
            .find_circuit(cid)
            .ok_or_else(|| invariant(format!("update request for unknown circuit {cid:#x}")))?;
        circuit.update_inputs(&req);

        clear_local_slot(slot);
        let remote = remote_identity(st, &read_endpoint_chars(&req.output_end_point))?;
        self.clear_remote_mailbox(st, view.offset(), &remote)
    }

    fn handle_new_connection(
        &self,
        st: &mut ControllerState,
        control: &Arc<SmbResources>,
        view: &MailboxView,
        slot: *mut MailboxSlot,
    ) -> Result<()> {
        let req = unsafe { ptr::read_volatile(ptr::addr_of!((*slot).request.new_connection)) };
        let requester = read_endpoint_chars(&req.output_end_point);
        debug!(
            circuit = format_args!("{:#x}", req.circuit_id),
            %requester,
            "handling new connection request"
        );

        match self.accept_new_connection(st, control, &req) {
            Ok(circuit) => {
                clear_local_slot(slot);
                let remote = remote_identity(st, &requester)?;
                self.clear_remote_mailbox(st, view.offset(), &remote)?;
                // Announced once the controller lock drops.
                st.announcements.push(circuit);
                Ok(())
            }
            Err(e) => {
                // Recoverable: tell the peer, keep dispatching.
                warn!("rejecting inbound connection request: {e}");
                reject_local_slot(slot);
                let remote = remote_identity(st, &requester)?;
                self.clear_remote_mailbox(st, view.offset(), &remote)?;
                Ok(())
            }
        }
    }

    fn accept_new_connection(
        &self,
        st: &mut ControllerState,
        control: &Arc<SmbResources>,
        req: &ReqNewConnection,
    ) -> Result<Arc<Circuit>> {
        let output_ep = read_endpoint_chars(&req.output_end_point);
        st.endpoints.add_remote(&output_ep)?;

        // The send flag tells us which way data flows: set means the
        // requester pushes into us.
        let meta = if req.send != 0 {
            ConnectionMetaData::new(
                Some(output_ep),
                Some(control.endpoint_string().to_string()),
                1,
                req.buffer_size,
            )
        } else {
            ConnectionMetaData::new(
                Some(control.endpoint_string().to_string()),
                Some(output_ep),
                1,
                req.buffer_size,
            )
        };

        // Reserve room for the requester's protocol info; it tells us the
        // size now and transfers the bytes when we ask for its offsets.
        let protocol = if req.protocol_size > 0 {
            let offset = control
                .smem()
                .alloc(req.protocol_size as usize)
                .map_err(|_| TransportError::NoBufferAvailable("for protocol info exchange"))?;
            Some((req.protocol_size, offset))
        } else {
            None
        };

        let circuit = match self.create_circuit_inner(
            st,
            Some(req.circuit_id),
            meta,
            CircuitFlags::default(),
            None,
            None,
        ) {
            Ok(c) => c,
            Err(e) => {
                if let Some((size, offset)) = protocol {
                    let _ = control.smem().free(offset, size as usize);
                }
                return Err(e);
            }
        };
        if let Some((size, offset)) = protocol {
            circuit.set_protocol_info(size, offset);
        }
        Ok(circuit)
    }

    fn handle_output_control(
        &self,
        st: &mut ControllerState,
        control: &Arc<SmbResources>,
        view: &MailboxView,
        slot: *mut MailboxSlot,
    ) -> Result<()> {
        let req = unsafe { ptr::read_volatile(ptr::addr_of!((*slot).request.output_control)) };
        let cid = req.circuit_id;
        debug!(
            circuit = format_args!("{cid:#x}"),
            "handling output control offset request"
        );

        let shadow_ep = read_endpoint_chars(&req.shadow_end_point);
        st.endpoints.add_remote(&shadow_ep)?;

        let circuit = st.find_circuit(cid).ok_or_else(|| {
            invariant(format!("output-control request for unknown circuit {cid:#x}"))
        })?;
        let res = st
            .endpoints
            .resources(&shadow_ep)
            .ok_or_else(|| invariant(format!("no resources for shadow endpoint {shadow_ep}")))?;

        let (protocol_size, protocol_offset) = if req.protocol_offset != 0 {
            // The server designated a landing offset for the blob we
            // announced at connection time.
            let info = circuit
                .protocol_info()
                .ok_or_else(|| invariant("peer asked for protocol info this circuit never staged"))?;
            (info.size, info.offset)
        } else {
            (0, 0)
        };

        let return_base = unsafe { ptr::read_volatile(ptr::addr_of!((*slot).return_offset)) };
        let offsets = circuit
            .output_offsets(req.port_id, return_base.max(0) as u64)
            .ok_or_else(|| {
                invariant(format!(
                    "unknown output port {} on circuit {cid:#x}",
                    req.port_id
                ))
            })?;

        let remote_ep = res.endpoint().clone();
        self.send_offsets(
            st,
            &offsets,
            &remote_ep,
            protocol_size,
            protocol_offset,
            req.protocol_offset,
        )?;
        if protocol_size > 0 {
            control
                .smem()
                .free(protocol_offset, protocol_size as usize)?;
            circuit.clear_protocol_info();
        }

        clear_local_slot(slot);
        self.clear_remote_mailbox(st, view.offset(), &remote_ep)
    }

    /// Shared tail of the two input-side offset requests; `select` picks
    /// which view of the port's control block is reported.
    fn handle_port_offsets(
        &self,
        st: &mut ControllerState,
        view: &MailboxView,
        slot: *mut MailboxSlot,
        select: fn(&Circuit, PortOrdinal, u64) -> Option<Vec<OffsetPair>>,
    ) -> Result<()> {
        let req = unsafe { ptr::read_volatile(ptr::addr_of!((*slot).request.shadow_rstate)) };
        let cid: CircuitId = req.circuit_id;
        let url = read_endpoint_chars(&req.url);
        debug!(
            circuit = format_args!("{cid:#x}"),
            %url,
            "handling port offset request"
        );

        let res = st
            .endpoints
            .resources(&url)
            .ok_or_else(|| invariant(format!("no resources for return endpoint {url}")))?;
        let circuit = st
            .find_circuit(cid)
            .ok_or_else(|| invariant(format!("offset request for unknown circuit {cid:#x}")))?;

        let return_base = unsafe { ptr::read_volatile(ptr::addr_of!((*slot).return_offset)) };
        let Some(offsets) = select(&circuit, req.port_id, return_base.max(0) as u64) else {
            // The port is not attached yet; leave the slot pending so the
            // peer retries on a later tick.
            warn!(
                circuit = format_args!("{cid:#x}"),
                port = req.port_id,
                "offset request for a port not yet attached"
            );
            return Ok(());
        };

        let remote_ep = res.endpoint().clone();
        self.send_offsets(st, &offsets, &remote_ep, 0, 0, 0)?;
        clear_local_slot(slot);
        self.clear_remote_mailbox(st, view.offset(), &remote_ep)
    }
}
