//! Shared test harness: a std-thread scheduler implementation and an
//! in-process host-side device model that serves the legacy VirtIO PCI
//! transport and the rings behind it.
#![allow(dead_code)]

use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread::{self, Thread, ThreadId};
use std::time::{Duration, Instant};

use kpio_virtio::pci::{BarIo, PciAddress, PciDevice};
use kpio_virtio::sched::{Scheduler, Task, TaskRef};

// ── Scheduler backed by std threads ─────────────────────────

struct StdTask {
    thread: Thread,
    interrupted: AtomicBool,
}

impl Task for StdTask {
    fn wake(&self) {
        self.thread.unpark();
    }

    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.thread.unpark();
    }

    fn interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }
}

thread_local! {
    static CPU_ID: Cell<usize> = const { Cell::new(0) };
}

/// Scheduler implementation over std threads. `park`/`wake` map onto the
/// one-token `std::thread` park/unpark; CPU pinning just records the id
/// for `cpu_id`.
pub struct StdSched {
    cpus: usize,
    registry: Arc<Mutex<HashMap<ThreadId, Arc<StdTask>>>>,
}

impl StdSched {
    pub fn new(cpus: usize) -> Arc<StdSched> {
        Arc::new(StdSched {
            cpus,
            registry: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn task_for_current(&self) -> Arc<StdTask> {
        let mut registry = self.registry.lock().unwrap();
        registry
            .entry(thread::current().id())
            .or_insert_with(|| {
                Arc::new(StdTask {
                    thread: thread::current(),
                    interrupted: AtomicBool::new(false),
                })
            })
            .clone()
    }
}

impl Scheduler for StdSched {
    fn current(&self) -> TaskRef {
        self.task_for_current()
    }

    fn park(&self) {
        thread::park();
    }

    fn spawn(
        &self,
        name: &str,
        cpu: Option<usize>,
        body: Box<dyn FnOnce() + Send>,
    ) -> TaskRef {
        let (tx, rx) = mpsc::channel::<TaskRef>();
        let registry = self.registry.clone();
        let cpus = self.cpus.max(1);
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                if let Some(cpu) = cpu {
                    CPU_ID.with(|id| id.set(cpu % cpus));
                }
                let me = Arc::new(StdTask {
                    thread: thread::current(),
                    interrupted: AtomicBool::new(false),
                });
                registry
                    .lock()
                    .unwrap()
                    .insert(thread::current().id(), me.clone());
                tx.send(me).unwrap();
                body();
            })
            .unwrap();
        rx.recv().unwrap()
    }

    fn cpu_id(&self) -> usize {
        CPU_ID.with(|id| id.get())
    }

    fn cpu_count(&self) -> usize {
        self.cpus
    }
}

/// Pretend the current thread runs on the given CPU.
pub fn set_current_cpu(cpu: usize) {
    CPU_ID.with(|id| id.set(cpu));
}

// ── Host-side register model ────────────────────────────────

// Legacy transport register offsets (the host's side of the contract).
const REG_HOST_FEATURES: u32 = 0x00;
const REG_GUEST_FEATURES: u32 = 0x04;
const REG_QUEUE_PFN: u32 = 0x08;
const REG_QUEUE_NUM: u32 = 0x0C;
const REG_QUEUE_SEL: u32 = 0x0E;
const REG_QUEUE_NOTIFY: u32 = 0x10;
const REG_STATUS: u32 = 0x12;
const REG_ISR: u32 = 0x13;
const REG_MSI_CONFIG_VECTOR: u32 = 0x14;
const REG_MSI_QUEUE_VECTOR: u32 = 0x16;

pub struct HostRegs {
    pub host_features: u32,
    pub guest_features: u32,
    pub status: u8,
    pub isr: u8,
    queue_sel: u16,
    pub queue_sizes: Vec<u16>,
    pub queue_pfns: Vec<u32>,
    pub msi_vectors: Vec<u16>,
    pub config_space: Vec<u8>,
    pub notifications: VecDeque<u16>,
}

/// BAR1 served from a register struct, with notifications queued for the
/// test's host thread.
pub struct HostBar {
    pub regs: Mutex<HostRegs>,
    notify_cv: Condvar,
    msix: bool,
}

impl HostBar {
    fn config_offset(&self) -> u32 {
        if self.msix {
            0x18
        } else {
            0x14
        }
    }
}

impl BarIo for HostBar {
    fn read8(&self, offset: u32) -> u8 {
        let mut regs = self.regs.lock().unwrap();
        match offset {
            REG_STATUS => regs.status,
            REG_ISR => {
                let isr = regs.isr;
                regs.isr = 0;
                isr
            }
            off if off >= self.config_offset() => {
                let idx = (off - self.config_offset()) as usize;
                regs.config_space.get(idx).copied().unwrap_or(0)
            }
            _ => 0,
        }
    }

    fn read16(&self, offset: u32) -> u16 {
        let regs = self.regs.lock().unwrap();
        match offset {
            REG_QUEUE_NUM => regs
                .queue_sizes
                .get(regs.queue_sel as usize)
                .copied()
                .unwrap_or(0),
            REG_QUEUE_SEL => regs.queue_sel,
            REG_MSI_QUEUE_VECTOR => regs
                .msi_vectors
                .get(regs.queue_sel as usize)
                .copied()
                .unwrap_or(0xFFFF),
            _ => 0,
        }
    }

    fn read32(&self, offset: u32) -> u32 {
        let regs = self.regs.lock().unwrap();
        match offset {
            REG_HOST_FEATURES => regs.host_features,
            REG_GUEST_FEATURES => regs.guest_features,
            REG_QUEUE_PFN => regs
                .queue_pfns
                .get(regs.queue_sel as usize)
                .copied()
                .unwrap_or(0),
            _ => 0,
        }
    }

    fn write8(&self, offset: u32, value: u8) {
        let mut regs = self.regs.lock().unwrap();
        if offset == REG_STATUS {
            regs.status = value;
        }
    }

    fn write16(&self, offset: u32, value: u16) {
        let mut regs = self.regs.lock().unwrap();
        match offset {
            REG_QUEUE_SEL => regs.queue_sel = value,
            REG_QUEUE_NOTIFY => {
                regs.notifications.push_back(value);
                self.notify_cv.notify_all();
            }
            REG_MSI_QUEUE_VECTOR => {
                let sel = regs.queue_sel as usize;
                if sel < regs.msi_vectors.len() {
                    regs.msi_vectors[sel] = value;
                }
            }
            _ => {}
        }
    }

    fn write32(&self, offset: u32, value: u32) {
        let mut regs = self.regs.lock().unwrap();
        match offset {
            REG_GUEST_FEATURES => regs.guest_features = value,
            REG_QUEUE_PFN => {
                let sel = regs.queue_sel as usize;
                if sel < regs.queue_pfns.len() {
                    regs.queue_pfns[sel] = value;
                }
            }
            _ => {}
        }
    }
}

// ── Host-side ring model ────────────────────────────────────

const DESC_F_NEXT: u16 = 1;
const DESC_F_WRITE: u16 = 2;
const DESC_F_INDIRECT: u16 = 4;

#[repr(C)]
#[derive(Clone, Copy)]
struct RawDesc {
    addr: u64,
    len: u32,
    flags: u16,
    next: u16,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct RawUsedElem {
    id: u32,
    len: u32,
}

/// One descriptor as resolved by the host.
#[derive(Clone, Copy, Debug)]
pub struct HostDesc {
    pub addr: u64,
    pub len: u32,
    pub write: bool,
}

/// A resolved descriptor chain.
pub struct HostChain {
    pub head: u16,
    pub descs: Vec<HostDesc>,
}

impl HostChain {
    /// Total capacity of the device-writable descriptors.
    pub fn writable_len(&self) -> usize {
        self.descs
            .iter()
            .filter(|d| d.write)
            .map(|d| d.len as usize)
            .sum()
    }

    /// Scatter `data` into the writable descriptors; returns the number
    /// of bytes written.
    pub fn write_bytes(&self, data: &[u8]) -> u32 {
        let mut written = 0usize;
        for desc in self.descs.iter().filter(|d| d.write) {
            if written == data.len() {
                break;
            }
            let take = (data.len() - written).min(desc.len as usize);
            unsafe {
                std::ptr::copy_nonoverlapping(
                    data[written..].as_ptr(),
                    desc.addr as *mut u8,
                    take,
                );
            }
            written += take;
        }
        written as u32
    }

    /// Gather the readable descriptors into one buffer.
    pub fn read_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for desc in self.descs.iter().filter(|d| !d.write) {
            let slice =
                unsafe { std::slice::from_raw_parts(desc.addr as *const u8, desc.len as usize) };
            out.extend_from_slice(slice);
        }
        out
    }
}

/// The host's view of one vring, located from the guest-written PFN.
pub struct HostQueue {
    size: u16,
    desc: *const RawDesc,
    avail_idx: *const u16,
    avail_ring: *const u16,
    used_flags: *mut u16,
    used_idx: *mut u16,
    used_ring: *mut RawUsedElem,
    avail_event: *mut u16,
    last_avail: u16,
}

unsafe impl Send for HostQueue {}

impl HostQueue {
    pub fn from_pfn(pfn: u32, size: u16) -> HostQueue {
        Self::from_base((pfn as u64) << 12, size)
    }

    pub fn from_base(base: u64, size: u16) -> HostQueue {
        let n = size as usize;
        let desc_bytes = 16 * n;
        let avail_bytes = 6 + 2 * n;
        let used_off = (desc_bytes + avail_bytes + 4095) & !4095;
        let base = base as *mut u8;
        unsafe {
            HostQueue {
                size,
                desc: base as *const RawDesc,
                avail_idx: base.add(desc_bytes + 2) as *const u16,
                avail_ring: base.add(desc_bytes + 4) as *const u16,
                used_flags: base.add(used_off) as *mut u16,
                used_idx: base.add(used_off + 2) as *mut u16,
                used_ring: base.add(used_off + 4) as *mut RawUsedElem,
                avail_event: base.add(used_off + 4 + 8 * n) as *mut u16,
                last_avail: 0,
            }
        }
    }

    /// Ask the guest not to kick this queue (NO_NOTIFY flag).
    pub fn suppress_notify(&self, on: bool) {
        unsafe { std::ptr::write_volatile(self.used_flags, if on { 1 } else { 0 }) };
    }

    /// Publish the avail-event index (event-idx mode).
    pub fn set_avail_event(&self, idx: u16) {
        unsafe { std::ptr::write_volatile(self.avail_event, idx) };
    }

    /// Consume the next published chain, resolving indirect tables.
    pub fn pop_avail(&mut self) -> Option<HostChain> {
        let avail = unsafe { std::ptr::read_volatile(self.avail_idx) };
        if avail == self.last_avail {
            return None;
        }
        fence(Ordering::SeqCst);
        let head = unsafe {
            std::ptr::read_volatile(self.avail_ring.add((self.last_avail % self.size) as usize))
        };
        self.last_avail = self.last_avail.wrapping_add(1);

        let mut descs = Vec::new();
        let mut idx = head;
        loop {
            let d = unsafe { std::ptr::read_volatile(self.desc.add(idx as usize)) };
            if d.flags & DESC_F_INDIRECT != 0 {
                let count = (d.len / 16) as usize;
                let table = d.addr as *const RawDesc;
                let mut ti = 0usize;
                loop {
                    let td = unsafe { std::ptr::read_volatile(table.add(ti)) };
                    descs.push(HostDesc {
                        addr: td.addr,
                        len: td.len,
                        write: td.flags & DESC_F_WRITE != 0,
                    });
                    if td.flags & DESC_F_NEXT == 0 || ti + 1 >= count {
                        break;
                    }
                    ti = td.next as usize;
                }
                break;
            }
            descs.push(HostDesc {
                addr: d.addr,
                len: d.len,
                write: d.flags & DESC_F_WRITE != 0,
            });
            if d.flags & DESC_F_NEXT == 0 {
                break;
            }
            idx = d.next;
        }
        Some(HostChain { head, descs })
    }

    /// Retry `pop_avail` until a chain shows up or the timeout expires.
    pub fn pop_avail_wait(&mut self, timeout: Duration) -> Option<HostChain> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(chain) = self.pop_avail() {
                return Some(chain);
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Complete a chain: used-ring element, fence, index bump.
    pub fn push_used(&self, head: u16, len: u32) {
        unsafe {
            let idx = std::ptr::read_volatile(self.used_idx);
            std::ptr::write_volatile(
                self.used_ring.add((idx % self.size) as usize),
                RawUsedElem {
                    id: head as u32,
                    len,
                },
            );
            fence(Ordering::SeqCst);
            std::ptr::write_volatile(self.used_idx, idx.wrapping_add(1));
        }
    }
}

// ── A discovered device, as the PCI service would hand it over ──

pub struct TestDevice {
    pub bar: Arc<HostBar>,
    pub pci: Arc<PciDevice>,
    msix: bool,
}

impl TestDevice {
    pub fn new(
        device_id: u16,
        msix: bool,
        queue_sizes: &[u16],
        host_features: u32,
        config_space: &[u8],
    ) -> TestDevice {
        let bar = Arc::new(HostBar {
            regs: Mutex::new(HostRegs {
                host_features,
                guest_features: 0,
                status: 0,
                isr: 0,
                queue_sel: 0,
                queue_sizes: queue_sizes.to_vec(),
                queue_pfns: vec![0; queue_sizes.len()],
                msi_vectors: vec![0xFFFF; queue_sizes.len()],
                config_space: config_space.to_vec(),
                notifications: VecDeque::new(),
            }),
            notify_cv: Condvar::new(),
            msix,
        });
        let pci = Arc::new(PciDevice::new(
            PciAddress::new(0, 4, 0),
            0x1AF4,
            device_id,
            0,
            11,
            Some(bar.clone() as Arc<dyn BarIo>),
            msix,
        ));
        TestDevice { bar, pci, msix }
    }

    /// Wait for a queue-notify write; returns the queue index.
    pub fn wait_notify(&self, timeout: Duration) -> Option<u16> {
        let deadline = Instant::now() + timeout;
        let mut regs = self.bar.regs.lock().unwrap();
        loop {
            if let Some(queue) = regs.notifications.pop_front() {
                return Some(queue);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .bar
                .notify_cv
                .wait_timeout(regs, deadline - now)
                .unwrap();
            regs = guard;
        }
    }

    /// Host view of queue `idx`, from the PFN the guest programmed.
    pub fn queue(&self, idx: usize) -> HostQueue {
        let regs = self.bar.regs.lock().unwrap();
        HostQueue::from_pfn(regs.queue_pfns[idx], regs.queue_sizes[idx])
    }

    pub fn status(&self) -> u8 {
        self.bar.regs.lock().unwrap().status
    }

    pub fn guest_features(&self) -> u32 {
        self.bar.regs.lock().unwrap().guest_features
    }

    /// Raise the legacy ISR bit and deliver the line interrupt.
    pub fn fire_legacy_isr(&self) {
        self.bar.regs.lock().unwrap().isr = 1;
        self.pci.fire_legacy();
    }
}

/// Spin until `cond` holds or the timeout expires; returns whether it
/// held.
pub fn wait_for<F: FnMut() -> bool>(mut cond: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
}
