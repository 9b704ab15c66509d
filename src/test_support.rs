//! In-process transfer provider for unit tests.
//!
//! Regions are plain heap buffers keyed by endpoint address, shared across
//! every controller built over the same factory instance, so two
//! controllers in one test can genuinely write into each other's mailbox
//! areas. The factory records every executed copy in execution order and
//! can defer transfer completion so tests can observe in-flight state.

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use parking_lot::Mutex;

use crate::endpoint::Endpoint;
use crate::mailbox;
use crate::provider::{CopyHint, SmemServices, TransferFactory, TransferRequest, TransferService};

static INSTANCE_SEQ: AtomicU32 = AtomicU32::new(0);

/// One executed copy, as recorded in the factory log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyRecord {
    pub from: u64,
    pub to: u64,
    pub len: usize,
    pub hint: CopyHint,
}

/// Execution-order log of every copy the factory performed.
pub type TransferLog = Arc<Mutex<Vec<CopyRecord>>>;

struct Bump {
    next: u64,
    limit: u64,
    free: Vec<(u64, usize)>,
}

/// Heap-backed region with a bump allocator and an exact-fit free list.
pub struct MemSmem {
    buf: UnsafeCell<Box<[u8]>>,
    size: u64,
    alloc: Mutex<Bump>,
}

unsafe impl Send for MemSmem {}
unsafe impl Sync for MemSmem {}

impl MemSmem {
    fn new(size: u64, alloc_base: u64) -> Self {
        Self {
            buf: UnsafeCell::new(vec![0u8; size as usize].into_boxed_slice()),
            size,
            alloc: Mutex::new(Bump {
                next: alloc_base,
                limit: size,
                free: Vec::new(),
            }),
        }
    }

    fn base(&self) -> *mut u8 {
        unsafe { (*self.buf.get()).as_mut_ptr() }
    }
}

impl SmemServices for MemSmem {
    fn size(&self) -> u64 {
        self.size
    }

    fn map(&self, offset: u64, len: usize) -> Result<*mut u8> {
        if offset + len as u64 > self.size {
            bail!("map of {len} bytes at {offset} exceeds region of {} bytes", self.size);
        }
        Ok(unsafe { self.base().add(offset as usize) })
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
            bail!("region exhausted: {len} bytes requested");
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

struct MemTransferRequest {
    src: Arc<MemSmem>,
    dst: Arc<MemSmem>,
    copies: Vec<CopyRecord>,
    done: Arc<AtomicBool>,
    manual: bool,
    pending: Arc<Mutex<Vec<Arc<AtomicBool>>>>,
    log: TransferLog,
}

impl TransferRequest for MemTransferRequest {
    fn add_copy(&mut self, from_offset: u64, to_offset: u64, len: usize, hint: CopyHint) {
        self.copies.push(CopyRecord {
            from: from_offset,
            to: to_offset,
            len,
            hint,
        });
    }

    fn post(&mut self) -> Result<()> {
        let order = |h: CopyHint| match h {
            CopyHint::First => 0,
            CopyHint::None | CopyHint::Middle => 1,
            CopyHint::Last => 2,
        };
        let mut indices: Vec<usize> = (0..self.copies.len()).collect();
        indices.sort_by_key(|i| order(self.copies[*i].hint));
        for i in indices {
            let c = self.copies[i];
            let s = self.src.map(c.from, c.len)?;
            let d = self.dst.map(c.to, c.len)?;
            unsafe { ptr::copy(s, d, c.len) };
            self.log.lock().push(c);
        }
        if self.manual {
            self.done.store(false, Ordering::SeqCst);
            self.pending.lock().push(self.done.clone());
        } else {
            self.done.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }
}

struct MemTransferService {
    src: Arc<MemSmem>,
    dst: Arc<MemSmem>,
    manual: Arc<AtomicBool>,
    pending: Arc<Mutex<Vec<Arc<AtomicBool>>>>,
    log: TransferLog,
    created: Arc<AtomicUsize>,
}

impl TransferService for MemTransferService {
    fn create_request(&self) -> Box<dyn TransferRequest> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Box::new(MemTransferRequest {
            src: self.src.clone(),
            dst: self.dst.clone(),
            copies: Vec::new(),
            done: Arc::new(AtomicBool::new(true)),
            manual: self.manual.load(Ordering::SeqCst),
            pending: self.pending.clone(),
            log: self.log.clone(),
        })
    }
}

/// Test transfer factory over in-process regions.
pub struct MemFactory {
    protocol: String,
    size: u64,
    max_mailboxes: u32,
    instance: u32,
    next_mailbox: AtomicU32,
    segments: Mutex<HashMap<String, Arc<MemSmem>>>,
    manual: Arc<AtomicBool>,
    pending: Arc<Mutex<Vec<Arc<AtomicBool>>>>,
    log: TransferLog,
    created: Arc<AtomicUsize>,
}

impl MemFactory {
    pub fn new(protocol: &str, size: u64, max_mailboxes: u32) -> Self {
        Self {
            protocol: protocol.to_string(),
            size,
            max_mailboxes,
            instance: INSTANCE_SEQ.fetch_add(1, Ordering::SeqCst),
            next_mailbox: AtomicU32::new(0),
            segments: Mutex::new(HashMap::new()),
            manual: Arc::new(AtomicBool::new(false)),
            pending: Arc::new(Mutex::new(Vec::new())),
            log: Arc::new(Mutex::new(Vec::new())),
            created: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn log(&self) -> TransferLog {
        self.log.clone()
    }

    /// Defer completion: posted transfers stay in flight until
    /// [`MemFactory::complete_all`].
    pub fn set_manual_completion(&self, on: bool) {
        self.manual.store(on, Ordering::SeqCst);
    }

    pub fn complete_all(&self) {
        for done in self.pending.lock().drain(..) {
            done.store(true, Ordering::SeqCst);
        }
    }

    /// Transfer requests constructed so far.
    pub fn created_requests(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// A ready-made local endpoint identity on this factory.
    pub fn endpoint_for_test(&self, mailbox: u32) -> Endpoint {
        Endpoint::new(
            &self.protocol,
            format!("mem{}-{}", self.instance, mailbox),
            self.size,
            mailbox,
            self.max_mailboxes,
            true,
        )
    }

    fn segment(&self, ep: &Endpoint) -> Arc<MemSmem> {
        self.segments
            .lock()
            .entry(ep.address().to_string())
            .or_insert_with(|| {
                Arc::new(MemSmem::new(
                    self.size.max(ep.size()),
                    mailbox::comms_size(ep.max_mailboxes()) as u64,
                ))
            })
            .clone()
    }
}

impl TransferFactory for MemFactory {
    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn supported_endpoints(&self) -> Vec<String> {
        vec![format!(
            "{}:mem{}-t;{}.{}.{}",
            self.protocol,
            self.instance,
            self.size,
            self.next_mailbox.load(Ordering::SeqCst),
            self.max_mailboxes
        )]
    }

    fn endpoint(&self, spec: &str, allocate: bool) -> Result<Endpoint> {
        let mut ep = Endpoint::parse(spec)?;
        if ep.protocol() != self.protocol {
            bail!("protocol mismatch for `{spec}`");
        }
        ep.set_local(allocate);
        if allocate {
            // Claim the mailbox so later compatible endpoints avoid it.
            self.next_mailbox.fetch_max(ep.mailbox() + 1, Ordering::SeqCst);
        }
        Ok(ep)
    }

    fn compatible_endpoint(&self, remote: &Endpoint) -> Result<Endpoint> {
        let mut mailbox = self.next_mailbox.fetch_add(1, Ordering::SeqCst);
        if mailbox == remote.mailbox() {
            mailbox = self.next_mailbox.fetch_add(1, Ordering::SeqCst);
        }
        if mailbox >= remote.max_mailboxes() {
            bail!("mailbox numbers exhausted");
        }
        Ok(Endpoint::new(
            &self.protocol,
            format!("mem{}-c{}", self.instance, mailbox),
            remote.size(),
            mailbox,
            remote.max_mailboxes(),
            true,
        ))
    }

    fn smem_services(&self, endpoint: &Endpoint) -> Result<Arc<dyn SmemServices>> {
        Ok(self.segment(endpoint))
    }

    fn service(&self, from: &Endpoint, to: &Endpoint) -> Result<Arc<dyn TransferService>> {
        Ok(Arc::new(MemTransferService {
            src: self.segment(from),
            dst: self.segment(to),
            manual: self.manual.clone(),
            pending: self.pending.clone(),
            log: self.log.clone(),
            created: self.created.clone(),
        }))
    }
}

/// Raw read from a region, for test assertions.
pub fn read_bytes(smem: &Arc<dyn SmemServices>, offset: u64, len: usize) -> Vec<u8> {
    let p = smem.map(offset, len).unwrap();
    let mut out = vec![0u8; len];
    unsafe { ptr::copy_nonoverlapping(p, out.as_mut_ptr(), len) };
    out
}

pub fn read_u32(smem: &Arc<dyn SmemServices>, offset: u64) -> u32 {
    let p = smem.map(offset, 4).unwrap() as *const u32;
    unsafe { ptr::read_volatile(p) }
}

pub fn write_u32(smem: &Arc<dyn SmemServices>, offset: u64, value: u32) {
    let p = smem.map(offset, 4).unwrap() as *mut u32;
    unsafe { ptr::write_volatile(p, value) }
}
