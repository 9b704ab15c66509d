//! Built-in `ocpi-smb-pio` transfer provider: programmed I/O over OS shared
//! memory.
//!
//! Each endpoint owns one named shared memory segment. Local endpoints
//! create their segment; remote endpoints attach to the existing one by the
//! OS id carried in the endpoint's address field. Transfers are executed
//! synchronously at post time, honouring the copy ordering contract, so a
//! posted request completes immediately.

use std::collections::HashMap;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use parking_lot::Mutex;
use shared_memory::{Shmem, ShmemConf};
use tracing::debug;

use crate::defaults;
use crate::endpoint::{Endpoint, DEFAULT_PROTOCOL};
use crate::mailbox;
use crate::provider::{CopyHint, SmemServices, TransferFactory, TransferRequest, TransferService};

static FACTORY_SEQ: AtomicU32 = AtomicU32::new(0);

struct Bump {
    next: u64,
    limit: u64,
    free: Vec<(u64, usize)>,
}

/// One mapped shared memory segment with a bump allocator over the space
/// behind the mailbox area. Only the owning endpoint allocates; peers map
/// for addressing.
pub struct PioSmem {
    shmem: Shmem,
    size: u64,
    alloc: Mutex<Bump>,
}

// The raw segment pointer is only dereferenced through map(), whose offsets
// are bounds-checked against the segment.
unsafe impl Send for PioSmem {}
unsafe impl Sync for PioSmem {}

impl SmemServices for PioSmem {
    fn size(&self) -> u64 {
        self.size
    }

    fn map(&self, offset: u64, len: usize) -> Result<*mut u8> {
        if offset + len as u64 > self.size {
            bail!(
                "map of {len} bytes at {offset} exceeds segment of {} bytes",
                self.size
            );
        }
        Ok(unsafe { self.shmem.as_ptr().add(offset as usize) })
    }

    fn unmap(&self) -> Result<()> {
        Ok(())
    }

    fn alloc(&self, len: usize) -> Result<u64> {
        let mut a = self.alloc.lock();
        if let Some(i) = a.free.iter().position(|(_, l)| *l == len) {
            return Ok(a.free.remove(i).0);
        }
        let rounded = (len + 7) & !7;
        if a.next + rounded as u64 > a.limit {
            bail!("segment exhausted: {len} bytes requested");
        }
        let offset = a.next;
        a.next += rounded as u64;
        Ok(offset)
    }

    fn free(&self, offset: u64, len: usize) -> Result<()> {
        self.alloc.lock().free.push((offset, len));
        Ok(())
    }
}

struct PioCopy {
    from: u64,
    to: u64,
    len: usize,
    hint: CopyHint,
}

struct PioTransferRequest {
    src: Arc<PioSmem>,
    dst: Arc<PioSmem>,
    copies: Vec<PioCopy>,
    posted: bool,
}

impl TransferRequest for PioTransferRequest {
    fn add_copy(&mut self, from_offset: u64, to_offset: u64, len: usize, hint: CopyHint) {
        self.copies.push(PioCopy {
            from: from_offset,
            to: to_offset,
            len,
            hint,
        });
    }

    fn post(&mut self) -> Result<()> {
        // First copies run before everything, Last copies after everything;
        // the rest keep program order. The sort is stable.
        let phase = |h: CopyHint| match h {
            CopyHint::First => 0,
            CopyHint::None | CopyHint::Middle => 1,
            CopyHint::Last => 2,
        };
        let mut order: Vec<usize> = (0..self.copies.len()).collect();
        order.sort_by_key(|i| phase(self.copies[*i].hint));
        for i in order {
            let c = &self.copies[i];
            let s = self.src.map(c.from, c.len)?;
            let d = self.dst.map(c.to, c.len)?;
            unsafe { ptr::copy(s, d, c.len) };
        }
        self.posted = true;
        Ok(())
    }

    fn is_complete(&self) -> bool {
        // Copies retire synchronously inside post().
        self.posted
    }
}

struct PioTransferService {
    src: Arc<PioSmem>,
    dst: Arc<PioSmem>,
}

impl TransferService for PioTransferService {
    fn create_request(&self) -> Box<dyn TransferRequest> {
        Box::new(PioTransferRequest {
            src: self.src.clone(),
            dst: self.dst.clone(),
            copies: Vec::new(),
            posted: false,
        })
    }
}

/// Transfer factory for the `ocpi-smb-pio` protocol.
pub struct PioFactory {
    region_size: u64,
    max_mailboxes: u32,
    /// Uniquifies segment names across factories of one process.
    instance: String,
    next_mailbox: AtomicU32,
    segments: Mutex<HashMap<String, Arc<PioSmem>>>,
}

impl PioFactory {
    pub fn new() -> Self {
        Self::with_config(defaults::REGION_SIZE, defaults::MAX_MAILBOXES)
    }

    pub fn with_config(region_size: u64, max_mailboxes: u32) -> Self {
        Self {
            region_size,
            max_mailboxes,
            instance: format!(
                "{}-{}",
                std::process::id(),
                FACTORY_SEQ.fetch_add(1, Ordering::SeqCst)
            ),
            next_mailbox: AtomicU32::new(0),
            segments: Mutex::new(HashMap::new()),
        }
    }

    fn address_for(&self, tag: &str, mailbox: u32) -> String {
        format!("pio-{}-{tag}{mailbox}", self.instance)
    }

    fn segment(&self, ep: &Endpoint) -> Result<Arc<PioSmem>> {
        let mut segments = self.segments.lock();
        if let Some(s) = segments.get(ep.address()) {
            return Ok(s.clone());
        }
        let total = ep
            .size()
            .max(mailbox::comms_size(ep.max_mailboxes()) as u64);
        let shmem = if ep.is_local() {
            debug!(segment = ep.address(), size = total, "creating pio segment");
            ShmemConf::new()
                .size(total as usize)
                .os_id(ep.address())
                .create()?
        } else {
            debug!(segment = ep.address(), "attaching to pio segment");
            ShmemConf::new().os_id(ep.address()).open()?
        };
        let size = (shmem.len() as u64).max(total);
        let smem = Arc::new(PioSmem {
            shmem,
            size,
            alloc: Mutex::new(Bump {
                next: mailbox::comms_size(ep.max_mailboxes()) as u64,
                limit: size,
                free: Vec::new(),
            }),
        });
        segments.insert(ep.address().to_string(), smem.clone());
        Ok(smem)
    }
}

impl Default for PioFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferFactory for PioFactory {
    fn protocol(&self) -> &str {
        DEFAULT_PROTOCOL
    }

    fn supported_endpoints(&self) -> Vec<String> {
        let mailbox = self.next_mailbox.load(Ordering::SeqCst);
        vec![format!(
            "{}:{};{}.{}.{}",
            DEFAULT_PROTOCOL,
            self.address_for("t", mailbox),
            self.region_size,
            mailbox,
            self.max_mailboxes
        )]
    }

    fn endpoint(&self, spec: &str, allocate: bool) -> Result<Endpoint> {
        let mut ep = Endpoint::parse(spec)?;
        if ep.protocol() != DEFAULT_PROTOCOL {
            bail!("protocol mismatch for `{spec}`");
        }
        ep.set_local(allocate);
        if allocate {
            // Claim the mailbox so compatible endpoints avoid it.
            self.next_mailbox
                .fetch_max(ep.mailbox() + 1, Ordering::SeqCst);
        }
        Ok(ep)
    }

    fn compatible_endpoint(&self, remote: &Endpoint) -> Result<Endpoint> {
        let mut mailbox = self.next_mailbox.fetch_add(1, Ordering::SeqCst);
        if mailbox == remote.mailbox() {
            mailbox = self.next_mailbox.fetch_add(1, Ordering::SeqCst);
        }
        if mailbox >= remote.max_mailboxes() {
            bail!("mailbox numbers exhausted for `{remote}`");
        }
        Ok(Endpoint::new(
            DEFAULT_PROTOCOL,
            self.address_for("c", mailbox),
            self.region_size,
            mailbox,
            remote.max_mailboxes(),
            true,
        ))
    }

    fn smem_services(&self, endpoint: &Endpoint) -> Result<Arc<dyn SmemServices>> {
        Ok(self.segment(endpoint)?)
    }

    fn service(&self, from: &Endpoint, to: &Endpoint) -> Result<Arc<dyn TransferService>> {
        Ok(Arc::new(PioTransferService {
            src: self.segment(from)?,
            dst: self.segment(to)?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_round_trips_through_create_and_attach() {
        let factory = PioFactory::with_config(8192, 8);
        let template = factory.supported_endpoints().remove(0);
        let local = factory.endpoint(&template, true).unwrap();
        let created = factory.smem_services(&local).unwrap();

        let marker = 0xabad_cafeu32.to_le_bytes();
        unsafe {
            ptr::copy_nonoverlapping(marker.as_ptr(), created.map(4096, 4).unwrap(), 4);
        }

        // A second factory attaching by the same string observes the same
        // bytes through the OS segment.
        let other = PioFactory::with_config(8192, 8);
        let remote = other.endpoint(&template, false).unwrap();
        let attached = other.smem_services(&remote).unwrap();
        let mut read = [0u8; 4];
        unsafe {
            ptr::copy_nonoverlapping(attached.map(4096, 4).unwrap(), read.as_mut_ptr(), 4);
        }
        assert_eq!(read, marker);
    }

    #[test]
    fn allocator_reuses_exact_size_frees() {
        let factory = PioFactory::with_config(16384, 8);
        let template = factory.supported_endpoints().remove(0);
        let local = factory.endpoint(&template, true).unwrap();
        let smem = factory.smem_services(&local).unwrap();

        let a = smem.alloc(48).unwrap();
        let b = smem.alloc(48).unwrap();
        assert_ne!(a, b);
        smem.free(a, 48).unwrap();
        assert_eq!(smem.alloc(48).unwrap(), a);
    }

    #[test]
    fn last_hinted_copy_wins_regardless_of_submission_order() {
        let factory = PioFactory::with_config(8192, 8);
        let template = factory.supported_endpoints().remove(0);
        let local = factory.endpoint(&template, true).unwrap();
        let smem = factory.smem_services(&local).unwrap();

        // Source bytes: X at 0x1000, Y at 0x1008.
        unsafe {
            ptr::copy_nonoverlapping(b"XXXXXXXX".as_ptr(), smem.map(0x1000, 8).unwrap(), 8);
            ptr::copy_nonoverlapping(b"YYYYYYYY".as_ptr(), smem.map(0x1008, 8).unwrap(), 8);
        }

        let service = factory.service(&local, &local).unwrap();
        let mut req = service.create_request();
        // Submitted Last first; it must still execute last.
        req.add_copy(0x1008, 0x1100, 8, CopyHint::Last);
        req.add_copy(0x1000, 0x1100, 8, CopyHint::First);
        assert!(!req.is_complete());
        req.post().unwrap();
        assert!(req.is_complete());

        let mut out = [0u8; 8];
        unsafe {
            ptr::copy_nonoverlapping(smem.map(0x1100, 8).unwrap(), out.as_mut_ptr(), 8);
        }
        assert_eq!(&out, b"YYYYYYYY");
    }

    #[test]
    fn mailbox_numbers_avoid_the_remote_peer() {
        let factory = PioFactory::with_config(8192, 4);
        let remote = Endpoint::parse("ocpi-smb-pio:elsewhere;8192.0.4").unwrap();
        let ours = factory.compatible_endpoint(&remote).unwrap();
        assert_ne!(ours.mailbox(), remote.mailbox());
        assert_eq!(ours.max_mailboxes(), 4);
        assert!(ours.is_local());
    }
}
