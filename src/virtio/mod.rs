//! VirtIO PCI transport core.
//!
//! Walks a discovered VirtIO PCI device through the legacy (0.9.5)
//! transport handshake: ABI validation, reset, status progression,
//! feature negotiation, virtqueue enumeration and MSI-X binding. Device
//! personalities (`rng`, `net`) build on [`VirtioDriver`] and finish the
//! sequence by raising DRIVER_OK.

pub mod net;
pub mod rng;
pub mod vring;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use spin::Mutex;

use crate::pci::{BarIo, PciDevice};
use crate::sched::{self, SchedRef, Scheduler};
use vring::Vring;

/// VirtIO ABI revision implemented by the legacy transport.
pub const VIRTIO_PCI_ABI_VERSION: u8 = 0;
/// Transitional PCI device ID range for VirtIO devices.
pub const VIRTIO_PCI_ID_MIN: u16 = 0x1000;
pub const VIRTIO_PCI_ID_MAX: u16 = 0x103F;
/// virtio-net PCI device ID.
pub const VIRTIO_NET_DEVICE_ID: u16 = 0x1000;
/// virtio-rng PCI device ID.
pub const VIRTIO_RNG_DEVICE_ID: u16 = 0x1005;

/// QUEUE_PFN holds the ring base shifted right by this.
pub const VIRTIO_PCI_QUEUE_ADDR_SHIFT: u32 = 12;

/// Ring feature bits (transport-level).
pub const VIRTIO_RING_F_INDIRECT_DESC: u32 = 1 << 28;
pub const VIRTIO_RING_F_EVENT_IDX: u32 = 1 << 29;

/// Hard cap on enumerated virtqueues.
const MAX_VIRTQUEUES: usize = 64;

/// Legacy transport register offsets within BAR1.
#[allow(dead_code)]
mod transport_reg {
    /// RO device feature bitmap.
    pub const HOST_FEATURES: u32 = 0x00;
    /// RW negotiated feature bitmap.
    pub const GUEST_FEATURES: u32 = 0x04;
    /// Physical frame number of the selected queue's ring base.
    pub const QUEUE_PFN: u32 = 0x08;
    /// RO size of the selected queue.
    pub const QUEUE_NUM: u32 = 0x0C;
    /// Queue selector.
    pub const QUEUE_SEL: u32 = 0x0E;
    /// Write a queue index here to notify the host.
    pub const QUEUE_NOTIFY: u32 = 0x10;
    /// Device status byte.
    pub const STATUS: u32 = 0x12;
    /// Interrupt status; reading clears.
    pub const ISR: u32 = 0x13;
    /// MSI-X vector for config changes.
    pub const MSI_CONFIG_VECTOR: u32 = 0x14;
    /// MSI-X vector for the selected queue.
    pub const MSI_QUEUE_VECTOR: u32 = 0x16;
}

/// Device status bits.
pub mod device_status {
    /// Driver has acknowledged the device.
    pub const ACKNOWLEDGE: u8 = 1;
    /// Driver knows how to drive the device.
    pub const DRIVER: u8 = 2;
    /// Driver is ready.
    pub const DRIVER_OK: u8 = 4;
    /// Feature negotiation complete.
    pub const FEATURES_OK: u8 = 8;
    /// Device has experienced an error and needs a reset.
    #[allow(dead_code)]
    pub const NEEDS_RESET: u8 = 64;
    /// Something went wrong; the device is unusable.
    pub const FAILED: u8 = 128;
}

/// Probe/initialization failures. Any of these abandons the device with
/// no partial registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverError {
    /// BAR1 (the legacy register window) is absent.
    MissingBar,
    /// The device reports an ABI revision we do not speak.
    WrongRevision(u8),
    /// Device ID outside the VirtIO range (or not the expected
    /// personality).
    WrongDeviceId(u16),
    /// The device rejected our feature subset.
    FeatureNegotiation,
    /// MSI-X vector binding for a queue did not stick.
    QueueVector(u16),
    /// Ring memory allocation failed or the ring base does not fit the
    /// transport's address width.
    RingAlloc,
    /// The device exposes no usable virtqueues.
    NoQueues,
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingBar => write!(f, "BAR1 not present"),
            Self::WrongRevision(rev) => write!(f, "wrong virtio revision {:#x}", rev),
            Self::WrongDeviceId(id) => write!(f, "wrong virtio device id {:#x}", id),
            Self::FeatureNegotiation => write!(f, "feature negotiation failed"),
            Self::QueueVector(q) => write!(f, "MSI-X vector setup failed for queue {}", q),
            Self::RingAlloc => write!(f, "virtqueue ring allocation failed"),
            Self::NoQueues => write!(f, "device exposes no virtqueues"),
        }
    }
}

/// Common state for one VirtIO PCI device, generic over the cookie type
/// the device's vrings carry.
pub struct VirtioDriver<T> {
    dev: Arc<PciDevice>,
    sched: SchedRef,
    bar1: Arc<dyn BarIo>,
    queues: Vec<Arc<Mutex<Vring<T>>>>,
    features: u32,
    cap_indirect: bool,
    cap_event_idx: bool,
}

impl<T> VirtioDriver<T> {
    /// Bind a discovered PCI device and walk it to the DRIVER status:
    /// validate the config, enable bus mastering and MSI-X, reset the
    /// host side, then acknowledge.
    pub fn new(dev: Arc<PciDevice>, sched: SchedRef) -> Result<Self, DriverError> {
        let bar1 = dev.bar1().ok_or(DriverError::MissingBar)?.clone();

        if dev.revision_id != VIRTIO_PCI_ABI_VERSION {
            log::error!("[VirtIO] {}: wrong revision {:#x}", dev.address, dev.revision_id);
            return Err(DriverError::WrongRevision(dev.revision_id));
        }
        if dev.vendor_id != crate::pci::VIRTIO_VENDOR_ID
            || dev.device_id < VIRTIO_PCI_ID_MIN
            || dev.device_id > VIRTIO_PCI_ID_MAX
        {
            log::error!("[VirtIO] {}: wrong device id {:#x}", dev.address, dev.device_id);
            return Err(DriverError::WrongDeviceId(dev.device_id));
        }

        dev.set_bus_master(true);
        dev.msix_enable();

        let drv = VirtioDriver {
            dev,
            sched,
            bar1,
            queues: Vec::new(),
            features: 0,
            cap_indirect: false,
            cap_event_idx: false,
        };

        drv.reset_host_side();
        drv.add_dev_status(device_status::ACKNOWLEDGE);
        drv.add_dev_status(device_status::DRIVER);
        Ok(drv)
    }

    /// Negotiate features: intersect the host bitmap with what the
    /// personality supports (plus the transport's ring features), detect
    /// the ring capabilities, and write the result back.
    pub fn setup_features(&mut self, driver_features: u32) -> Result<u32, DriverError> {
        let dev_features = self.conf_readl(transport_reg::HOST_FEATURES);
        let wanted = driver_features | VIRTIO_RING_F_INDIRECT_DESC | VIRTIO_RING_F_EVENT_IDX;
        let subset = dev_features & wanted;

        self.cap_indirect = subset & VIRTIO_RING_F_INDIRECT_DESC != 0;
        self.cap_event_idx = subset & VIRTIO_RING_F_EVENT_IDX != 0;

        log::debug!(
            "[VirtIO] {}: features host={:#x} negotiated={:#x} indirect={} event_idx={}",
            self.dev.address,
            dev_features,
            subset,
            self.cap_indirect,
            self.cap_event_idx
        );

        self.conf_writel(transport_reg::GUEST_FEATURES, subset);
        self.add_dev_status(device_status::FEATURES_OK);
        if self.get_dev_status() & device_status::FEATURES_OK == 0 {
            self.mark_failed();
            return Err(DriverError::FeatureNegotiation);
        }
        self.features = subset;
        Ok(subset)
    }

    /// Enumerate virtqueues: for each index until the device reports size
    /// zero (or the `2·ncpus` transport cap), allocate a ring of the
    /// host-chosen size, bind MSI-X vector == queue index, and hand the
    /// ring's page frame number to the device.
    pub fn probe_virt_queues(&mut self) -> Result<(), DriverError> {
        let cap = (2 * self.sched.cpu_count()).min(MAX_VIRTQUEUES);

        while self.queues.len() < cap {
            let idx = self.queues.len() as u16;
            self.conf_writew(transport_reg::QUEUE_SEL, idx);
            let size = self.conf_readw(transport_reg::QUEUE_NUM);
            if size == 0 {
                break;
            }

            let bar = self.bar1.clone();
            let vring: Vring<T> = Vring::new(
                size,
                idx,
                self.cap_indirect,
                self.cap_event_idx,
                Box::new(move || bar.write16(transport_reg::QUEUE_NOTIFY, idx)),
            )?;

            if self.dev.is_msix() {
                self.conf_writew(transport_reg::MSI_QUEUE_VECTOR, idx);
                if self.conf_readw(transport_reg::MSI_QUEUE_VECTOR) != idx {
                    log::error!("[VirtIO] MSI-X entry for queue {} did not stick", idx);
                    self.mark_failed();
                    return Err(DriverError::QueueVector(idx));
                }
            }

            let pfn = vring.paddr() >> VIRTIO_PCI_QUEUE_ADDR_SHIFT;
            if pfn > u32::MAX as u64 {
                self.mark_failed();
                return Err(DriverError::RingAlloc);
            }
            self.conf_writel(transport_reg::QUEUE_PFN, pfn as u32);

            log::debug!(
                "[VirtIO] queue[{}] size {} paddr {:#x}",
                idx,
                size,
                vring.paddr()
            );
            self.queues.push(Arc::new(Mutex::new(vring)));
        }

        if self.queues.is_empty() {
            self.mark_failed();
            return Err(DriverError::NoQueues);
        }
        Ok(())
    }

    /// Shared handle to queue `idx`.
    pub fn queue(&self, idx: usize) -> Option<Arc<Mutex<Vring<T>>>> {
        self.queues.get(idx).cloned()
    }

    /// Number of enumerated virtqueues.
    pub fn num_queues(&self) -> usize {
        self.queues.len()
    }

    /// The negotiated feature bitmap.
    pub fn features(&self) -> u32 {
        self.features
    }

    /// Check one negotiated feature mask.
    pub fn has_feature(&self, mask: u32) -> bool {
        self.features & mask != 0
    }

    /// The PCI device this driver is bound to.
    pub fn pci_device(&self) -> &Arc<PciDevice> {
        &self.dev
    }

    /// The scheduler handle device personalities share.
    pub fn scheduler(&self) -> &SchedRef {
        &self.sched
    }

    // ── Status register ─────────────────────────────────────

    /// Reset the host side (`status := 0`).
    pub fn reset_host_side(&self) {
        self.conf_writeb(transport_reg::STATUS, 0);
    }

    pub fn get_dev_status(&self) -> u8 {
        self.conf_readb(transport_reg::STATUS)
    }

    pub fn add_dev_status(&self, status: u8) {
        self.conf_writeb(transport_reg::STATUS, self.get_dev_status() | status);
    }

    /// Mark the device failed; it stays abandoned until reset.
    pub fn mark_failed(&self) {
        self.add_dev_status(device_status::FAILED);
    }

    // ── Config space access ─────────────────────────────────

    pub fn conf_readb(&self, offset: u32) -> u8 {
        self.bar1.read8(offset)
    }

    pub fn conf_readw(&self, offset: u32) -> u16 {
        self.bar1.read16(offset)
    }

    pub fn conf_readl(&self, offset: u32) -> u32 {
        self.bar1.read32(offset)
    }

    pub fn conf_writeb(&self, offset: u32, value: u8) {
        self.bar1.write8(offset, value);
    }

    pub fn conf_writew(&self, offset: u32, value: u16) {
        self.bar1.write16(offset, value);
    }

    pub fn conf_writel(&self, offset: u32, value: u32) {
        self.bar1.write32(offset, value);
    }

    /// Read and clear the interrupt status register.
    pub fn read_isr(&self) -> u8 {
        self.conf_readb(transport_reg::ISR)
    }

    /// Offset of the personality-specific config space. MSI-X inserts
    /// its two vector registers before it.
    pub fn device_config_offset(&self) -> u32 {
        if self.dev.is_msix() {
            0x18
        } else {
            0x14
        }
    }

    /// Byte-wise read of the personality config space.
    pub fn conf_read(&self, offset: u32, buf: &mut [u8]) {
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = self.conf_readb(offset + i as u32);
        }
    }
}

impl<T> Drop for VirtioDriver<T> {
    fn drop(&mut self) {
        // Detach: reset the host so in-flight descriptors are dropped.
        self.reset_host_side();
    }
}

/// A probed device personality.
pub enum Device {
    Net(Arc<net::Net>),
    Rng(Arc<rng::Rng>),
}

/// Probe a discovered PCI function with the personality that claims its
/// device ID.
pub fn probe(dev: Arc<PciDevice>, sched: SchedRef) -> Result<Device, DriverError> {
    match dev.device_id {
        VIRTIO_NET_DEVICE_ID => Ok(Device::Net(net::Net::probe(dev, sched)?)),
        VIRTIO_RNG_DEVICE_ID => Ok(Device::Rng(rng::Rng::probe(dev, sched)?)),
        id => {
            log::debug!("[VirtIO] {}: no driver for device id {:#x}", dev.address, id);
            Err(DriverError::WrongDeviceId(id))
        }
    }
}

/// Block until `pred` holds on the queue.
///
/// The naive "check, then sleep" would lose a completion whose interrupt
/// fires between the check and the sleep. The discipline here: check;
/// enable interrupts; check *again* (the completion may have arrived in
/// between, before its interrupt was enabled); only then park. The
/// interrupt handler disables queue interrupts and wakes the task, which
/// repeats the cycle.
///
/// Returns `false` if the task was interrupted before the predicate held.
pub fn wait_for_queue<T, P>(sched: &dyn Scheduler, queue: &Mutex<Vring<T>>, pred: P) -> bool
where
    P: Fn(&Vring<T>) -> bool,
{
    sched::wait_until(sched, || {
        let mut vq = queue.lock();
        if pred(&vq) {
            return true;
        }
        vq.enable_interrupts();
        if pred(&vq) {
            vq.disable_interrupts();
            return true;
        }
        false
    })
}
