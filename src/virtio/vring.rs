//! Vring: the descriptor-ring pair shared with the host.
//!
//! Three structures live in one page-aligned DMA region: the descriptor
//! table, the available ring (guest writes, host reads) and the used ring
//! (host writes, guest reads). The legacy layout contract is:
//!
//! ```text
//!   descriptor table   16 * N bytes
//!   available ring     6 + 2 * N bytes (used_event in the last two)
//!   (pad to page)
//!   used ring          6 + 8 * N bytes (avail_event in the last two)
//! ```
//!
//! The guest-side state tracked here: a LIFO of free descriptors, the
//! staged scatter-gather vector, the cookie owned by each in-flight chain
//! (keyed by chain head), and the shadow of the last used index seen.
//!
//! A chain's cookie is owned by the vring from publish until the caller
//! takes it back with `get_buf_elem`/`get_buf_finalize`.

use alloc::boxed::Box;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::sync::atomic::{fence, Ordering};

use super::DriverError;
use crate::mem::{self, DmaRegion, PAGE_SIZE};

bitflags! {
    /// Descriptor flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DescFlags: u16 {
        /// Buffer continues via the next field.
        const NEXT = 1;
        /// Buffer is write-only for the device.
        const WRITE = 2;
        /// Buffer contains a table of descriptors.
        const INDIRECT = 4;
    }
}

/// Available-ring flag: suppress host-to-guest interrupts.
const VRING_AVAIL_F_NO_INTERRUPT: u16 = 1;
/// Used-ring flag: the host asks not to be notified.
const VRING_USED_F_NO_NOTIFY: u16 = 1;

/// A virtqueue descriptor.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Desc {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

/// A used-ring element.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct UsedElem {
    id: u32,
    len: u32,
}

/// One staged scatter-gather entry (virtual address; translated at
/// publish time).
#[derive(Debug, Clone, Copy)]
struct SgEntry {
    addr: u64,
    len: u32,
    write: bool,
}

/// Guest-side state for one virtqueue.
pub struct Vring<T> {
    mem: DmaRegion,
    size: u16,
    queue_index: u16,

    desc: *mut Desc,
    avail_flags: *mut u16,
    avail_idx: *mut u16,
    avail_ring: *mut u16,
    used_event: *mut u16,
    used_flags: *mut u16,
    used_idx: *mut u16,
    used_ring: *mut UsedElem,
    avail_event: *mut u16,

    /// Free descriptor indices (LIFO).
    free_list: Vec<u16>,
    /// In-flight cookie per chain head.
    cookies: Vec<Option<T>>,
    /// Indirect descriptor tables kept alive per chain head.
    indirect_tables: Vec<Option<Box<[Desc]>>>,
    /// Scatter-gather staging vector.
    sg: Vec<SgEntry>,

    /// Next value to publish as avail.idx.
    avail_shadow: u16,
    /// Shadow of the last used-ring head we consumed.
    last_used_idx: u16,
    /// avail.idx as of the last kick (event-idx suppression).
    kicked_avail_idx: u16,
    /// Peeked-but-not-finalized completion head.
    pending: Option<u16>,

    use_indirect: bool,
    use_event_idx: bool,

    /// Host notification hook (writes the transport's queue-notify
    /// register).
    notify: Box<dyn Fn() + Send + Sync>,
}

// The raw ring pointers live inside the owned DmaRegion; the vring is
// mutated by its single owner task only.
unsafe impl<T: Send> Send for Vring<T> {}

impl<T> Vring<T> {
    /// Allocate the ring memory for a queue of `size` descriptors and
    /// compute the three ring areas.
    pub fn new(
        size: u16,
        queue_index: u16,
        use_indirect: bool,
        use_event_idx: bool,
        notify: Box<dyn Fn() + Send + Sync>,
    ) -> Result<Vring<T>, DriverError> {
        debug_assert!(size.is_power_of_two(), "queue size must be a power of two");

        let n = size as usize;
        // Legacy layout: the trailing event words are part of the 6+2N /
        // 6+8N ring sizes.
        let desc_bytes = 16 * n;
        let avail_bytes = 6 + 2 * n;
        let used_off = mem::align_up(desc_bytes + avail_bytes, PAGE_SIZE);
        let used_bytes = 6 + 8 * n;

        let region =
            DmaRegion::alloc_zeroed(used_off + used_bytes).ok_or(DriverError::RingAlloc)?;
        let base = region.base();

        // SAFETY: all offsets are within the freshly allocated region.
        let (desc, avail_flags, avail_idx, avail_ring, used_event) = unsafe {
            (
                base as *mut Desc,
                base.add(desc_bytes) as *mut u16,
                base.add(desc_bytes + 2) as *mut u16,
                base.add(desc_bytes + 4) as *mut u16,
                base.add(desc_bytes + 4 + 2 * n) as *mut u16,
            )
        };
        let (used_flags, used_idx, used_ring, avail_event) = unsafe {
            (
                base.add(used_off) as *mut u16,
                base.add(used_off + 2) as *mut u16,
                base.add(used_off + 4) as *mut UsedElem,
                base.add(used_off + 4 + 8 * n) as *mut u16,
            )
        };

        let mut cookies = Vec::with_capacity(n);
        let mut indirect_tables = Vec::with_capacity(n);
        for _ in 0..n {
            cookies.push(None);
            indirect_tables.push(None);
        }

        Ok(Vring {
            mem: region,
            size,
            queue_index,
            desc,
            avail_flags,
            avail_idx,
            avail_ring,
            used_event,
            used_flags,
            used_idx,
            used_ring,
            avail_event,
            free_list: (0..size).collect(),
            cookies,
            indirect_tables,
            sg: Vec::new(),
            avail_shadow: 0,
            last_used_idx: 0,
            kicked_avail_idx: 0,
            pending: None,
            use_indirect,
            use_event_idx,
            notify,
        })
    }

    /// Queue size (number of descriptors).
    pub fn size(&self) -> u16 {
        self.size
    }

    /// Queue index within the device.
    pub fn queue_index(&self) -> u16 {
        self.queue_index
    }

    /// Physical base address of the ring memory.
    pub fn paddr(&self) -> u64 {
        self.mem.phys()
    }

    /// Number of free descriptors.
    pub fn free_descs(&self) -> usize {
        self.free_list.len()
    }

    // ── Scatter-gather staging ──────────────────────────────

    /// Reset the staging vector.
    pub fn init_sg(&mut self) {
        self.sg.clear();
    }

    /// Stage a host-readable buffer. All out entries must precede all in
    /// entries.
    pub fn add_out_sg(&mut self, addr: *const u8, len: usize) {
        debug_assert!(
            self.sg.iter().all(|e| !e.write),
            "out entries must precede in entries"
        );
        self.sg.push(SgEntry {
            addr: addr as u64,
            len: len as u32,
            write: false,
        });
    }

    /// Stage a host-writable buffer.
    pub fn add_in_sg(&mut self, addr: *mut u8, len: usize) {
        self.sg.push(SgEntry {
            addr: addr as u64,
            len: len as u32,
            write: true,
        });
    }

    // ── Publish ─────────────────────────────────────────────

    /// True iff at least `count` more scatter-gather entries can be
    /// published as one chain.
    pub fn avail_ring_has_room(&self, count: usize) -> bool {
        if self.use_indirect && count > 1 {
            !self.free_list.is_empty()
        } else {
            self.free_list.len() >= count
        }
    }

    /// True iff there is room to publish at least one more chain.
    pub fn avail_ring_not_empty(&self) -> bool {
        !self.free_list.is_empty()
    }

    /// Half-empty watermark used to pace RX refills.
    pub fn refill_ring_cond(&self) -> bool {
        self.free_list.len() >= (self.size / 2) as usize
    }

    /// Number of entries currently staged.
    pub fn sg_count(&self) -> usize {
        self.sg.len()
    }

    /// Publish the staged scatter-gather list as one chain owning
    /// `cookie`.
    ///
    /// On success the staging vector is reset. On failure (not enough
    /// free descriptors) the cookie is dropped and the staging vector is
    /// kept, so the caller can reclaim completions and retry.
    pub fn add_buf(&mut self, cookie: T) -> bool {
        let sg_len = self.sg.len();
        debug_assert!(sg_len > 0, "add_buf with empty scatter-gather list");

        let head = if self.use_indirect && sg_len > 1 {
            let Some(head) = self.free_list.pop() else {
                return false;
            };
            let mut table = Vec::with_capacity(sg_len);
            for (i, entry) in self.sg.iter().enumerate() {
                let mut flags = DescFlags::empty();
                if entry.write {
                    flags |= DescFlags::WRITE;
                }
                if i + 1 < sg_len {
                    flags |= DescFlags::NEXT;
                }
                table.push(Desc {
                    addr: mem::virt_to_phys(entry.addr),
                    len: entry.len,
                    flags: flags.bits(),
                    next: (i + 1) as u16,
                });
            }
            let table = table.into_boxed_slice();
            self.write_desc(
                head,
                Desc {
                    addr: mem::virt_to_phys(table.as_ptr() as u64),
                    len: (16 * sg_len) as u32,
                    flags: DescFlags::INDIRECT.bits(),
                    next: 0,
                },
            );
            self.indirect_tables[head as usize] = Some(table);
            head
        } else {
            if self.free_list.len() < sg_len {
                return false;
            }
            let first = self.free_list.len() - sg_len;
            let chain: Vec<u16> = self.free_list.drain(first..).collect();
            let desc_table = self.desc;
            for (i, entry) in self.sg.iter().enumerate() {
                let mut flags = DescFlags::empty();
                if entry.write {
                    flags |= DescFlags::WRITE;
                }
                let next = if i + 1 < sg_len {
                    flags |= DescFlags::NEXT;
                    chain[i + 1]
                } else {
                    0
                };
                unsafe {
                    mem::mmio_write(
                        desc_table.add(chain[i] as usize),
                        Desc {
                            addr: mem::virt_to_phys(entry.addr),
                            len: entry.len,
                            flags: flags.bits(),
                            next,
                        },
                    );
                }
            }
            chain[0]
        };

        self.cookies[head as usize] = Some(cookie);

        // Publish: ring slot first, then the index, with a full fence in
        // between so the host never observes the index before the
        // descriptors.
        unsafe {
            let slot = self.avail_ring.add((self.avail_shadow % self.size) as usize);
            mem::mmio_write(slot, head);
            fence(Ordering::SeqCst);
            mem::mmio_write(self.avail_idx, self.avail_shadow.wrapping_add(1));
            fence(Ordering::SeqCst);
        }
        self.avail_shadow = self.avail_shadow.wrapping_add(1);

        self.sg.clear();
        true
    }

    /// Notify the host, unless it asked for suppression.
    ///
    /// Returns whether the notify register was actually written.
    pub fn kick(&mut self) -> bool {
        fence(Ordering::SeqCst);
        let should = if self.use_event_idx {
            let event = unsafe { mem::mmio_read(self.avail_event) };
            let new = self.avail_shadow;
            let old = self.kicked_avail_idx;
            // Notify iff the host's event index lies in (old, new].
            new.wrapping_sub(event).wrapping_sub(1) < new.wrapping_sub(old)
        } else {
            (unsafe { mem::mmio_read(self.used_flags) } & VRING_USED_F_NO_NOTIFY) == 0
        };
        self.kicked_avail_idx = self.avail_shadow;
        if should {
            (self.notify)();
        }
        should
    }

    // ── Completion ──────────────────────────────────────────

    /// True iff the host has published completions we have not consumed.
    pub fn used_ring_not_empty(&self) -> bool {
        let host_idx = unsafe { mem::mmio_read(self.used_idx) };
        host_idx != self.last_used_idx
    }

    /// Synonym used when pacing producers that wait for reclaimable
    /// completions.
    pub fn used_ring_can_gc(&self) -> bool {
        self.used_ring_not_empty()
    }

    /// Peek the next completed chain: takes its cookie and records the
    /// number of bytes the host wrote. Returns `None` when no completion
    /// is pending. Must be followed by [`Vring::get_buf_finalize`].
    pub fn get_buf_elem(&mut self, len: &mut u32) -> Option<T> {
        debug_assert!(self.pending.is_none(), "unfinalized completion peek");
        if !self.used_ring_not_empty() {
            return None;
        }
        // Host wrote the element before bumping used.idx; pair its
        // release with a full fence before reading the entry.
        fence(Ordering::SeqCst);
        let elem = unsafe {
            mem::mmio_read(self.used_ring.add((self.last_used_idx % self.size) as usize))
        };
        *len = elem.len;
        let head = elem.id as u16;
        self.pending = Some(head);
        let cookie = self.cookies[head as usize].take();
        debug_assert!(cookie.is_some(), "completion for a chain we never published");
        cookie
    }

    /// Commit the peek: recover the chain's descriptors to the free list
    /// and advance the used shadow.
    pub fn get_buf_finalize(&mut self) {
        let Some(head) = self.pending.take() else {
            debug_assert!(false, "get_buf_finalize without a pending peek");
            return;
        };
        if self.indirect_tables[head as usize].take().is_some() {
            self.free_list.push(head);
        } else {
            let mut idx = head;
            loop {
                let desc = unsafe { mem::mmio_read(self.desc.add(idx as usize)) };
                self.free_list.push(idx);
                if desc.flags & DescFlags::NEXT.bits() == 0 {
                    break;
                }
                idx = desc.next;
            }
        }
        self.last_used_idx = self.last_used_idx.wrapping_add(1);
    }

    /// Bulk-drain every pending completion, dropping the cookies.
    /// Returns how many chains were reclaimed.
    pub fn get_buf_gc(&mut self) -> usize {
        let mut reclaimed = 0;
        let mut len = 0u32;
        while self.get_buf_elem(&mut len).is_some() {
            self.get_buf_finalize();
            reclaimed += 1;
        }
        reclaimed
    }

    // ── Interrupt suppression ───────────────────────────────

    /// Ask the host to interrupt us for the next completion, then fence
    /// so a predicate recheck cannot pass before the host can see it.
    pub fn enable_interrupts(&mut self) {
        unsafe {
            if self.use_event_idx {
                mem::mmio_write(self.used_event, self.last_used_idx);
            } else {
                let flags = mem::mmio_read(self.avail_flags);
                mem::mmio_write(self.avail_flags, flags & !VRING_AVAIL_F_NO_INTERRUPT);
            }
        }
        fence(Ordering::SeqCst);
    }

    /// Tell the host not to interrupt us. In event-idx mode the event
    /// index published by `enable_interrupts` simply goes stale, so the
    /// guest-visible word is untouched.
    pub fn disable_interrupts(&mut self) {
        if !self.use_event_idx {
            unsafe {
                let flags = mem::mmio_read(self.avail_flags);
                mem::mmio_write(self.avail_flags, flags | VRING_AVAIL_F_NO_INTERRUPT);
            }
        }
    }

    fn write_desc(&mut self, index: u16, desc: Desc) {
        unsafe { mem::mmio_write(self.desc.add(index as usize), desc) };
    }
}
