//! Packet buffers.
//!
//! A BSD-flavored `Mbuf`: a fragment with optional packet header, linkable
//! into chains. The NIC datapath needs exactly this surface: cluster
//! allocation for receive buffers, header adjustment to strip the VirtIO
//! header, pullup to make protocol headers contiguous for offload parsing,
//! and the checksum metadata the host offloads are driven by.
//!
//! Pool management and zero-copy backing stores belong to the packet layer
//! proper; fragments here are plain heap clusters.

use alloc::boxed::Box;
use alloc::vec::Vec;
use bitflags::bitflags;

/// Receive cluster size.
pub const MCLBYTES: usize = 2048;

bitflags! {
    /// Checksum/offload metadata carried in the packet header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CsumFlags: u32 {
        /// Transmit: host should fill in the TCP checksum.
        const TCP = 1 << 0;
        /// Transmit: host should fill in the UDP checksum.
        const UDP = 1 << 1;
        /// Transmit: host should segment this TCP payload.
        const TSO = 1 << 2;
        /// Receive: the L4 checksum has been verified.
        const DATA_VALID = 1 << 4;
        /// Receive: the verified checksum covers the pseudo-header.
        const PSEUDO_HDR = 1 << 5;
    }
}

impl CsumFlags {
    /// Flags that request a transmit checksum offload.
    pub const OFFLOAD: CsumFlags = CsumFlags::TCP.union(CsumFlags::UDP);
}

/// Per-packet header, present on the first fragment of a chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct PktHdr {
    /// Total packet length across the chain.
    pub len: usize,
    /// Receiving interface index, set by the driver on RX.
    pub rcvif: Option<u32>,
    /// Checksum/offload flags.
    pub csum_flags: CsumFlags,
    /// Transmit: checksum field offset from `csum_start`.
    /// Receive: filled with 0xFFFF when DATA_VALID|PSEUDO_HDR is set.
    pub csum_data: u16,
    /// Transmit: TSO segment size (MSS).
    pub tso_segsz: u16,
}

/// A packet fragment, optionally chained.
pub struct Mbuf {
    storage: Vec<u8>,
    off: usize,
    len: usize,
    pkthdr: Option<PktHdr>,
    next: Option<Box<Mbuf>>,
}

impl Mbuf {
    /// Allocate a cluster-sized receive buffer with a packet header.
    ///
    /// Returns `None` if the allocator cannot satisfy the request; the
    /// RX refill loop stops on the first such failure.
    pub fn try_cluster() -> Option<Mbuf> {
        let mut storage = Vec::new();
        storage.try_reserve_exact(MCLBYTES).ok()?;
        storage.resize(MCLBYTES, 0);
        Some(Mbuf {
            storage,
            off: 0,
            len: MCLBYTES,
            pkthdr: Some(PktHdr::default()),
            next: None,
        })
    }

    /// Build a single-fragment packet from a byte slice.
    pub fn from_slice(data: &[u8]) -> Mbuf {
        let storage = data.to_vec();
        let len = storage.len();
        Mbuf {
            storage,
            off: 0,
            len,
            pkthdr: Some(PktHdr {
                len,
                ..PktHdr::default()
            }),
            next: None,
        }
    }

    /// Fragment data length.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total packet length from the header (first fragment only).
    pub fn pkt_len(&self) -> usize {
        self.pkthdr.map(|h| h.len).unwrap_or(self.len)
    }

    /// Fragment payload.
    pub fn data(&self) -> &[u8] {
        &self.storage[self.off..self.off + self.len]
    }

    /// Mutable fragment payload.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.storage[self.off..self.off + self.len]
    }

    /// Address/length pair describing the fragment payload for DMA.
    pub fn dma_addr(&self) -> u64 {
        self.storage[self.off..].as_ptr() as u64
    }

    /// Set the fragment length, clamped to the backing storage.
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.storage.len() - self.off);
    }

    pub fn pkthdr(&self) -> Option<&PktHdr> {
        self.pkthdr.as_ref()
    }

    pub fn pkthdr_mut(&mut self) -> Option<&mut PktHdr> {
        self.pkthdr.as_mut()
    }

    /// Install a fresh packet header.
    pub fn set_pkthdr(&mut self, hdr: PktHdr) {
        self.pkthdr = Some(hdr);
    }

    /// Drop the packet header (fragments past the head carry none).
    pub fn clear_pkthdr(&mut self) {
        self.pkthdr = None;
    }

    /// Trim `count` bytes from the front of the fragment, adjusting the
    /// packet-header total as well.
    pub fn adj(&mut self, count: usize) {
        let count = count.min(self.len);
        self.off += count;
        self.len -= count;
        if let Some(hdr) = self.pkthdr.as_mut() {
            hdr.len = hdr.len.saturating_sub(count);
        }
    }

    /// Make the first `count` bytes of the chain contiguous in this
    /// fragment. Returns false if the chain holds fewer than `count`
    /// bytes (the packet is malformed).
    pub fn pullup(&mut self, count: usize) -> bool {
        if self.len >= count {
            return true;
        }
        if self.storage.len() < self.off + count {
            self.storage.resize(self.off + count, 0);
        }
        while self.len < count {
            let needed = count - self.len;
            let Some(frag) = self.next.as_mut() else {
                return false;
            };
            let take = needed.min(frag.len);
            if take == 0 {
                let rest = frag.next.take();
                self.next = rest;
                continue;
            }
            let dst = self.off + self.len;
            let src = frag.off;
            for i in 0..take {
                self.storage[dst + i] = frag.storage[src + i];
            }
            frag.off += take;
            frag.len -= take;
            self.len += take;
            if frag.len == 0 {
                let rest = frag.next.take();
                self.next = rest;
            }
        }
        true
    }

    /// Link a fragment at the tail of the chain.
    pub fn append(&mut self, frag: Mbuf) {
        match self.next.as_mut() {
            Some(next) => next.append(frag),
            None => self.next = Some(Box::new(frag)),
        }
    }

    /// Iterate over the fragments of the chain.
    pub fn iter(&self) -> MbufIter<'_> {
        MbufIter { cur: Some(self) }
    }

    /// Number of fragments in the chain.
    pub fn frag_count(&self) -> usize {
        self.iter().count()
    }
}

/// Fragment iterator.
pub struct MbufIter<'a> {
    cur: Option<&'a Mbuf>,
}

impl<'a> Iterator for MbufIter<'a> {
    type Item = &'a Mbuf;

    fn next(&mut self) -> Option<&'a Mbuf> {
        let cur = self.cur?;
        self.cur = cur.next.as_deref();
        Some(cur)
    }
}
