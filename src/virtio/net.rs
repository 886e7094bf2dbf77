//! virtio-net: paravirtualized Ethernet NIC.
//!
//! The datapath runs over `num_queues / 2` RX/TX queue pairs. Each RX
//! queue has a poll task pinned to its CPU: it sleeps on the used ring,
//! drains completed buffers into mbuf chains (one frame may span several
//! buffers when mergeable receive buffers are negotiated), validates
//! receive-checksum claims, hands packets to the interface, and refills
//! the ring with fresh clusters. Transmit runs under a single per-device
//! mutex: offload header construction, scatter-gather of the fragment
//! chain behind a 10/12-byte VirtIO header, lazy reclaim of completed
//! transmit requests when the ring runs short.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use spin::Mutex;

use super::vring::Vring;
use super::{device_status, transport_reg, wait_for_queue, DriverError, VirtioDriver};
use crate::iface::{self, IfCaps, IfData, Interface, ETHERMTU, ETHER_HDR_LEN};
use crate::mbuf::{CsumFlags, Mbuf, PktHdr, MCLBYTES};
use crate::pci::PciDevice;
use crate::sched::{SchedRef, TaskRef};

/// virtio-net feature bits.
mod features {
    /// Host handles TX checksums.
    pub const CSUM: u32 = 1 << 0;
    /// Guest handles RX checksums.
    pub const GUEST_CSUM: u32 = 1 << 1;
    /// Device has a MAC address in config space.
    pub const MAC: u32 = 1 << 5;
    /// Guest can receive TSOv4.
    pub const GUEST_TSO4: u32 = 1 << 7;
    /// Guest can receive TSO with ECN.
    pub const GUEST_ECN: u32 = 1 << 9;
    /// Guest can receive UFO.
    pub const GUEST_UFO: u32 = 1 << 10;
    /// Host can receive TSOv4.
    pub const HOST_TSO4: u32 = 1 << 11;
    /// Host can receive TSO with ECN.
    pub const HOST_ECN: u32 = 1 << 13;
    /// One frame may span several receive buffers.
    pub const MRG_RXBUF: u32 = 1 << 15;
    /// Link status field in config space.
    pub const STATUS: u32 = 1 << 16;
    /// Device supports multiqueue.
    pub const MQ: u32 = 1 << 22;
}

// ── Protocol constants for offload parsing ──────────────────

const ETHERTYPE_IP: u16 = 0x0800;
const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHER_VLAN_HDR_LEN: usize = 18;
const IP_HDR_LEN: usize = 20;
const TCP_HDR_LEN: usize = 20;
const UDP_HDR_LEN: usize = 8;
const IPPROTO_TCP: u8 = 6;
/// Offset of the UDP checksum field within its header.
const UDP_CSUM_OFFSET: u16 = 6;
/// Offset of the TCP checksum field within its header.
const TCP_CSUM_OFFSET: u16 = 16;
/// TCP CWR flag.
const TH_CWR: u8 = 0x80;

// ── Wire header ─────────────────────────────────────────────

/// The VirtIO net header prefixed to every frame.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct NetHdr {
    pub flags: u8,
    pub gso_type: u8,
    pub hdr_len: u16,
    pub gso_size: u16,
    pub csum_start: u16,
    pub csum_offset: u16,
}

impl NetHdr {
    /// Checksum must be completed by the receiver.
    pub const F_NEEDS_CSUM: u8 = 1;
    pub const GSO_NONE: u8 = 0;
    pub const GSO_TCPV4: u8 = 1;
    /// ECN-capable segmentation.
    pub const GSO_ECN: u8 = 0x80;
}

/// Net header with the mergeable-buffers buffer count.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct NetHdrMrgRxbuf {
    pub hdr: NetHdr,
    pub num_buffers: u16,
}

/// virtio-net config space.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetConfig {
    pub mac: [u8; 6],
    pub status: u16,
    pub max_virtqueue_pairs: u16,
}

// ── Statistics ──────────────────────────────────────────────

/// Per-RX-queue counters, updated by the owning poll task.
#[derive(Debug, Clone, Copy, Default)]
pub struct RxqStats {
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub rx_drops: u64,
    pub rx_csum_ok: u64,
    pub rx_csum_err: u64,
}

/// Per-TX-queue counters, updated under the transmit mutex.
#[derive(Debug, Clone, Copy, Default)]
pub struct TxqStats {
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub tx_drops: u64,
    pub tx_err: u64,
    pub tx_csum: u64,
    pub tx_tso: u64,
}

/// Transmit errors surfaced to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxError {
    /// The packet's headers could not be pulled up (EINVAL).
    InvalidPacket,
    /// The ring is full with nothing reclaimable (ENOBUFS).
    NoBuffers,
}

impl fmt::Display for TxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPacket => write!(f, "malformed packet"),
            Self::NoBuffers => write!(f, "transmit ring full"),
        }
    }
}

/// An in-flight transmit request: the wire header plus the packet it
/// describes. Owned by the vring until the host completes the chain.
struct NetReq {
    mhdr: NetHdrMrgRxbuf,
    m: Mbuf,
}

/// Cookie carried by this device's vrings.
enum NetCookie {
    Rx(Mbuf),
    Tx(Box<NetReq>),
}

struct Rxq {
    vq: Arc<Mutex<Vring<NetCookie>>>,
    stats: Mutex<RxqStats>,
    poll_task: Mutex<Option<TaskRef>>,
}

struct Txq {
    vq: Arc<Mutex<Vring<NetCookie>>>,
    stats: Mutex<TxqStats>,
}

/// virtio-net device state.
pub struct Net {
    drv: VirtioDriver<NetCookie>,
    sched: SchedRef,
    ifn: Arc<Interface>,
    config: NetConfig,
    mergeable_bufs: bool,
    hdr_size: usize,
    /// GUEST_ECN: the host accepts TSO segments carrying CWR.
    tso_ecn: bool,
    rxq: Vec<Rxq>,
    txq: Vec<Txq>,
    /// Serializes the whole enqueue+publish+kick sequence.
    tx_ring_lock: Mutex<()>,
}

impl Net {
    /// Feature bits this driver knows how to use.
    fn driver_features() -> u32 {
        features::MAC
            | features::MRG_RXBUF
            | features::STATUS
            | features::CSUM
            | features::GUEST_CSUM
            | features::GUEST_TSO4
            | features::HOST_ECN
            | features::HOST_TSO4
            | features::GUEST_ECN
            | features::GUEST_UFO
            | features::MQ
    }

    /// Probe a discovered virtio-net PCI device and bring up the full
    /// datapath: feature negotiation, queue pairs, poll tasks, interrupt
    /// routing, interface attach, RX ring fill, DRIVER_OK.
    pub fn probe(dev: Arc<PciDevice>, sched: SchedRef) -> Result<Arc<Net>, DriverError> {
        if dev.device_id != super::VIRTIO_NET_DEVICE_ID {
            return Err(DriverError::WrongDeviceId(dev.device_id));
        }

        let mut drv = VirtioDriver::new(dev.clone(), sched.clone())?;
        drv.setup_features(Self::driver_features())?;

        let mut raw = [0u8; 10];
        drv.conf_read(drv.device_config_offset(), &mut raw);
        let config = NetConfig {
            mac: [raw[0], raw[1], raw[2], raw[3], raw[4], raw[5]],
            status: u16::from_le_bytes([raw[6], raw[7]]),
            max_virtqueue_pairs: u16::from_le_bytes([raw[8], raw[9]]),
        };
        if drv.has_feature(features::MAC) {
            log::info!(
                "[VirtIO-Net] MAC {:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
                config.mac[0],
                config.mac[1],
                config.mac[2],
                config.mac[3],
                config.mac[4],
                config.mac[5]
            );
        }

        let mergeable_bufs = drv.has_feature(features::MRG_RXBUF);
        let csum = drv.has_feature(features::CSUM);
        let guest_csum = drv.has_feature(features::GUEST_CSUM);
        let host_tso4 = drv.has_feature(features::HOST_TSO4);
        let guest_tso4 = drv.has_feature(features::GUEST_TSO4);
        let tso_ecn = drv.has_feature(features::GUEST_ECN);
        let hdr_size = if mergeable_bufs {
            core::mem::size_of::<NetHdrMrgRxbuf>()
        } else {
            core::mem::size_of::<NetHdr>()
        };

        drv.probe_virt_queues()?;
        let pairs = drv.num_queues() / 2;
        if pairs == 0 {
            drv.mark_failed();
            return Err(DriverError::NoQueues);
        }

        let mut rxq = Vec::with_capacity(pairs);
        let mut txq = Vec::with_capacity(pairs);
        for i in 0..pairs {
            // Queue 2i receives, 2i+1 transmits; probe_virt_queues
            // enumerated both.
            let rvq = drv.queue(2 * i).ok_or(DriverError::NoQueues)?;
            let tvq = drv.queue(2 * i + 1).ok_or(DriverError::NoQueues)?;
            rxq.push(Rxq {
                vq: rvq,
                stats: Mutex::new(RxqStats::default()),
                poll_task: Mutex::new(None),
            });
            txq.push(Txq {
                vq: tvq,
                stats: Mutex::new(TxqStats::default()),
            });
        }

        let mut caps = IfCaps::empty();
        if csum {
            caps |= IfCaps::TXCSUM;
            if host_tso4 {
                caps |= IfCaps::TSO4;
            }
        }
        if guest_csum {
            caps |= IfCaps::RXCSUM;
            if guest_tso4 {
                caps |= IfCaps::LRO;
            }
        }
        let ifn = Interface::alloc("eth", ETHERMTU, caps);

        let net = Arc::new(Net {
            drv,
            sched: sched.clone(),
            ifn,
            config,
            mergeable_bufs,
            hdr_size,
            tso_ecn,
            rxq,
            txq,
            tx_ring_lock: Mutex::new(()),
        });

        for i in 0..pairs {
            let worker = net.clone();
            let task = sched.spawn(
                "virtio-net-rx",
                Some(i),
                Box::new(move || worker.receiver(i)),
            );
            *net.rxq[i].poll_task.lock() = Some(task.clone());

            if dev.is_msix() {
                let rvq = net.rxq[i].vq.clone();
                dev.bind_msix(
                    (2 * i) as u16,
                    Some(Box::new(move || rvq.lock().disable_interrupts())),
                    Some(task),
                );
                let tvq = net.txq[i].vq.clone();
                dev.bind_msix(
                    (2 * i + 1) as u16,
                    Some(Box::new(move || tvq.lock().disable_interrupts())),
                    None,
                );
            }
        }

        if !dev.is_msix() {
            let bar = dev.bar1().ok_or(DriverError::MissingBar)?.clone();
            let rvqs: Vec<_> = net.rxq.iter().map(|q| q.vq.clone()).collect();
            let tasks: Vec<TaskRef> = net
                .rxq
                .iter()
                .filter_map(|q| q.poll_task.lock().clone())
                .collect();
            dev.bind_legacy(
                Box::new(move || {
                    if bar.read8(transport_reg::ISR) != 0 {
                        for vq in &rvqs {
                            vq.lock().disable_interrupts();
                        }
                        true
                    } else {
                        false
                    }
                }),
                Box::new(move || {
                    for task in &tasks {
                        task.wake();
                    }
                }),
            );
        }

        iface::attach(net.ifn.clone());
        for i in 0..pairs {
            net.fill_rx_ring(i);
        }
        net.drv.add_dev_status(device_status::DRIVER_OK);

        log::info!(
            "[VirtIO-Net] {} up: {} queue pair(s), mrg_rxbuf={} csum={} tso4={}",
            net.ifn.name(),
            pairs,
            mergeable_bufs,
            csum,
            host_tso4
        );
        Ok(net)
    }

    /// The interface this NIC is attached as.
    pub fn interface(&self) -> &Arc<Interface> {
        &self.ifn
    }

    /// Device MAC address.
    pub fn mac(&self) -> [u8; 6] {
        self.config.mac
    }

    /// Device config as read at probe time.
    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    /// Number of RX/TX queue pairs.
    pub fn queue_pairs(&self) -> usize {
        self.rxq.len()
    }

    /// Snapshot of one RX queue's counters.
    pub fn rxq_stats(&self, idx: usize) -> RxqStats {
        *self.rxq[idx].stats.lock()
    }

    /// Snapshot of one TX queue's counters.
    pub fn txq_stats(&self, idx: usize) -> TxqStats {
        *self.txq[idx].stats.lock()
    }

    /// Aggregate statistics over all queue pairs.
    pub fn fill_stats(&self) -> IfData {
        let mut data = IfData::default();
        for rxq in &self.rxq {
            let s = rxq.stats.lock();
            data.ipackets += s.rx_packets;
            data.ibytes += s.rx_bytes;
            data.iqdrops += s.rx_drops;
            data.ierrors += s.rx_csum_err;
        }
        for txq in &self.txq {
            let s = txq.stats.lock();
            data.opackets += s.tx_packets;
            data.obytes += s.tx_bytes;
            data.oerrors += s.tx_err + s.tx_drops;
        }
        data
    }

    // ── Receive path ────────────────────────────────────────

    /// Take the next completed RX buffer off the queue, if any.
    fn next_rx(vq: &Mutex<Vring<NetCookie>>, len: &mut u32) -> Option<Mbuf> {
        let mut q = vq.lock();
        let cookie = q.get_buf_elem(len)?;
        q.get_buf_finalize();
        match cookie {
            NetCookie::Rx(m) => Some(m),
            // A transmit cookie can never complete on an RX queue.
            NetCookie::Tx(_) => None,
        }
    }

    /// RX poll task body for queue pair `idx`.
    fn receiver(&self, idx: usize) {
        let rxq = &self.rxq[idx];
        let vq = &rxq.vq;
        log::debug!("[VirtIO-Net] rx poll task {} started", idx);

        loop {
            if !wait_for_queue(&*self.sched, vq, Vring::used_ring_not_empty) {
                log::debug!("[VirtIO-Net] rx poll task {} exiting", idx);
                return;
            }

            let mut rx_packets = 0u64;
            let mut rx_bytes = 0u64;
            let mut rx_drops = 0u64;
            let mut csum_ok = 0u64;
            let mut csum_err = 0u64;

            let mut len = 0u32;
            let mut next = Self::next_rx(vq, &mut len);
            while let Some(mut m) = next.take() {
                // Runt: not even a full header plus an Ethernet header.
                if (len as usize) < self.hdr_size + ETHER_HDR_LEN {
                    rx_drops += 1;
                    drop(m);
                    next = Self::next_rx(vq, &mut len);
                    continue;
                }

                // Copy the header out; it is about to be stripped.
                let mhdr = self.parse_net_hdr(m.data());
                let mut nbufs = if self.mergeable_bufs {
                    mhdr.num_buffers
                } else {
                    1
                };

                m.set_len(len as usize);
                m.set_pkthdr(PktHdr {
                    len: len as usize,
                    rcvif: Some(self.ifn.index()),
                    csum_flags: CsumFlags::empty(),
                    csum_data: 0,
                    tso_segsz: 0,
                });

                // Gather the rest of a frame that spans several buffers.
                while nbufs > 1 {
                    nbufs -= 1;
                    let mut frag_len = 0u32;
                    let Some(mut frag) = Self::next_rx(vq, &mut frag_len) else {
                        rx_drops += 1;
                        break;
                    };
                    frag.set_len(frag_len as usize);
                    frag.clear_pkthdr();
                    if let Some(hdr) = m.pkthdr_mut() {
                        hdr.len += frag.len();
                    }
                    m.append(frag);
                }

                // The upper layers never see the VirtIO header.
                m.adj(self.hdr_size);

                if self.ifn.cap_enabled(IfCaps::RXCSUM)
                    && mhdr.hdr.flags & NetHdr::F_NEEDS_CSUM != 0
                {
                    if Self::bad_rx_csum(&mut m, &mhdr.hdr) {
                        csum_err += 1;
                    } else {
                        csum_ok += 1;
                    }
                }

                rx_packets += 1;
                rx_bytes += m.pkt_len() as u64;

                self.ifn.deliver(m);

                // The interface may have been stopped while the packet
                // was up in the stack.
                if !self.ifn.is_running() {
                    break;
                }

                next = Self::next_rx(vq, &mut len);
            }

            if vq.lock().refill_ring_cond() {
                self.fill_rx_ring(idx);
            }

            let mut stats = rxq.stats.lock();
            stats.rx_packets += rx_packets;
            stats.rx_bytes += rx_bytes;
            stats.rx_drops += rx_drops;
            stats.rx_csum_ok += csum_ok;
            stats.rx_csum_err += csum_err;
        }
    }

    /// Decode the VirtIO header at the front of a receive buffer.
    fn parse_net_hdr(&self, data: &[u8]) -> NetHdrMrgRxbuf {
        let hdr = NetHdr {
            flags: data[0],
            gso_type: data[1],
            hdr_len: u16::from_le_bytes([data[2], data[3]]),
            gso_size: u16::from_le_bytes([data[4], data[5]]),
            csum_start: u16::from_le_bytes([data[6], data[7]]),
            csum_offset: u16::from_le_bytes([data[8], data[9]]),
        };
        let num_buffers = if self.mergeable_bufs {
            u16::from_le_bytes([data[10], data[11]])
        } else {
            1
        };
        NetHdrMrgRxbuf { hdr, num_buffers }
    }

    /// Validate a host checksum claim without parsing past the IP
    /// header: the checksum *offset* identifies the protocol. IPv4 only;
    /// anything else counts as a bad checksum.
    ///
    /// Returns true if the claim is bad, false if the packet may be
    /// marked valid.
    fn bad_rx_csum(m: &mut Mbuf, hdr: &NetHdr) -> bool {
        let csum_start = hdr.csum_start as usize;
        let csum_len = csum_start + hdr.csum_offset as usize;

        if csum_len < ETHER_HDR_LEN + IP_HDR_LEN {
            return true;
        }
        if m.len() < csum_len {
            return true;
        }

        let data = m.data();
        let mut eth_type = u16::from_be_bytes([data[12], data[13]]);
        if eth_type == ETHERTYPE_VLAN {
            eth_type = u16::from_be_bytes([data[16], data[17]]);
        }
        if eth_type != ETHERTYPE_IP {
            return true;
        }

        if hdr.csum_offset == UDP_CSUM_OFFSET {
            if m.len() < csum_start + UDP_HDR_LEN {
                return true;
            }
            let udp_sum = u16::from_be_bytes([data[csum_start + 6], data[csum_start + 7]]);
            if udp_sum == 0 {
                // A zero UDP checksum means "not checksummed": accept
                // without marking anything valid.
                return false;
            }
            // Non-zero UDP checksum: same marking as TCP below.
        } else if hdr.csum_offset != TCP_CSUM_OFFSET {
            return true;
        }

        if let Some(pkthdr) = m.pkthdr_mut() {
            pkthdr.csum_flags |= CsumFlags::DATA_VALID | CsumFlags::PSEUDO_HDR;
            pkthdr.csum_data = 0xFFFF;
        }
        false
    }

    /// Refill the RX ring with cluster buffers, one writable
    /// scatter-gather entry each. Stops on the first allocation failure.
    fn fill_rx_ring(&self, idx: usize) {
        let mut added = 0;
        let mut vq = self.rxq[idx].vq.lock();

        while vq.avail_ring_not_empty() {
            let Some(mut m) = Mbuf::try_cluster() else {
                break;
            };
            vq.init_sg();
            let addr = m.data_mut().as_mut_ptr();
            vq.add_in_sg(addr, MCLBYTES);
            if !vq.add_buf(NetCookie::Rx(m)) {
                break;
            }
            added += 1;
        }

        if added > 0 {
            log::trace!("[VirtIO-Net] rx ring {} refilled with {} buffers", idx, added);
            vq.kick();
        }
    }

    // ── Transmit path ───────────────────────────────────────

    /// Transmit one packet chain. Serialized by the per-device transmit
    /// mutex; the queue is picked by the current CPU.
    pub fn transmit(&self, m: Mbuf) -> Result<(), TxError> {
        let _tx = self.tx_ring_lock.lock();
        let idx = self.pick_txq();
        let result = self.tx_locked(idx, m);
        if result.is_ok() {
            self.txq[idx].vq.lock().kick();
        }
        result
    }

    /// Map the current CPU to a transmit queue. The modulo keeps a CPU
    /// beyond the negotiated pair count on a valid queue.
    fn pick_txq(&self) -> usize {
        self.sched.cpu_id() % self.txq.len()
    }

    fn tx_locked(&self, idx: usize, m: Mbuf) -> Result<(), TxError> {
        let txq = &self.txq[idx];
        let mut mhdr = NetHdrMrgRxbuf::default();
        let mut tx_bytes = 0u64;

        let result = self.tx_publish(txq, m, &mut mhdr, &mut tx_bytes);

        let mut stats = txq.stats.lock();
        match result {
            Ok(()) => {
                stats.tx_packets += 1;
                stats.tx_bytes += tx_bytes;
                if mhdr.hdr.flags & NetHdr::F_NEEDS_CSUM != 0 {
                    stats.tx_csum += 1;
                }
                if mhdr.hdr.gso_type != NetHdr::GSO_NONE {
                    stats.tx_tso += 1;
                }
            }
            Err(TxError::NoBuffers) => stats.tx_drops += 1,
            Err(TxError::InvalidPacket) => stats.tx_err += 1,
        }
        result
    }

    /// Build the offload header and the scatter-gather list, then publish
    /// the request on the TX vring, reclaiming completions when the ring
    /// runs short.
    fn tx_publish(
        &self,
        txq: &Txq,
        mut m: Mbuf,
        mhdr: &mut NetHdrMrgRxbuf,
        tx_bytes: &mut u64,
    ) -> Result<(), TxError> {
        let wants_offload = m
            .pkthdr()
            .map(|h| !h.csum_flags.is_empty())
            .unwrap_or(false);
        if wants_offload {
            self.tx_offload(&mut m, &mut mhdr.hdr)?;
        }

        // The header must keep its address until completion: box the
        // request before staging any pointers.
        let req = Box::new(NetReq { mhdr: *mhdr, m });

        let mut vq = txq.vq.lock();
        vq.init_sg();
        vq.add_out_sg(
            &req.mhdr as *const NetHdrMrgRxbuf as *const u8,
            self.hdr_size,
        );
        for frag in req.m.iter() {
            if frag.len() != 0 {
                vq.add_out_sg(frag.data().as_ptr(), frag.len());
                *tx_bytes += frag.len() as u64;
            }
        }

        if !vq.avail_ring_has_room(vq.sg_count()) {
            if vq.used_ring_not_empty() {
                log::trace!("[VirtIO-Net] tx ring short, reclaiming completions");
                Self::tx_gc_locked(&mut vq);
            } else {
                return Err(TxError::NoBuffers);
            }
        }

        if !vq.add_buf(NetCookie::Tx(req)) {
            return Err(TxError::NoBuffers);
        }
        Ok(())
    }

    /// Construct the offload header for a packet requesting checksum or
    /// segmentation offload. Only TCP-over-IPv4 TSO is supported.
    fn tx_offload(&self, m: &mut Mbuf, hdr: &mut NetHdr) -> Result<(), TxError> {
        let mut ip_offset = ETHER_HDR_LEN;
        if m.len() < ip_offset && !m.pullup(ip_offset) {
            return Err(TxError::InvalidPacket);
        }

        let mut eth_type = u16::from_be_bytes([m.data()[12], m.data()[13]]);
        if eth_type == ETHERTYPE_VLAN {
            ip_offset = ETHER_VLAN_HDR_LEN;
            if m.len() < ip_offset && !m.pullup(ip_offset) {
                return Err(TxError::InvalidPacket);
            }
            eth_type = u16::from_be_bytes([m.data()[16], m.data()[17]]);
        }

        // Offloads are only built for IPv4; anything else goes out with
        // a blank header.
        if eth_type != ETHERTYPE_IP {
            return Ok(());
        }
        if m.len() < ip_offset + IP_HDR_LEN && !m.pullup(ip_offset + IP_HDR_LEN) {
            return Err(TxError::InvalidPacket);
        }

        let ip_hl = ((m.data()[ip_offset] & 0x0F) as usize) << 2;
        let ip_proto = m.data()[ip_offset + 9];
        let csum_start = ip_offset + ip_hl;

        let pkthdr = *m.pkthdr().ok_or(TxError::InvalidPacket)?;

        if pkthdr.csum_flags.intersects(CsumFlags::OFFLOAD) {
            hdr.flags |= NetHdr::F_NEEDS_CSUM;
            hdr.csum_start = csum_start as u16;
            hdr.csum_offset = pkthdr.csum_data;
        }

        if pkthdr.csum_flags.contains(CsumFlags::TSO) {
            if ip_proto != IPPROTO_TCP {
                return Ok(());
            }
            if m.len() < csum_start + TCP_HDR_LEN && !m.pullup(csum_start + TCP_HDR_LEN) {
                return Err(TxError::InvalidPacket);
            }

            let th_off = ((m.data()[csum_start + 12] >> 4) as usize) << 2;
            hdr.gso_type = NetHdr::GSO_TCPV4;
            hdr.hdr_len = (csum_start + th_off) as u16;
            hdr.gso_size = pkthdr.tso_segsz;

            let th_flags = m.data()[csum_start + 13];
            if th_flags & TH_CWR != 0 {
                if !self.tso_ecn {
                    log::warn!("[VirtIO-Net] TSO with ECN not supported by host");
                    return Err(TxError::InvalidPacket);
                }
                hdr.flags |= NetHdr::GSO_ECN;
            }
        }

        Ok(())
    }

    /// Reclaim every completed transmit request, dropping the cookies
    /// (and with them the packets).
    fn tx_gc_locked(vq: &mut Vring<NetCookie>) {
        let mut len = 0u32;
        while let Some(req) = vq.get_buf_elem(&mut len) {
            drop(req);
            vq.get_buf_finalize();
        }
        vq.get_buf_gc();
    }
}

impl Drop for Net {
    fn drop(&mut self) {
        iface::detach(&self.ifn);
        for rxq in &self.rxq {
            if let Some(task) = rxq.poll_task.lock().as_ref() {
                task.interrupt();
                task.wake();
            }
        }
        // VirtioDriver::drop resets the device, discarding in-flight
        // descriptors.
    }
}
