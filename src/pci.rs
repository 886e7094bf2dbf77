//! PCI service surface.
//!
//! Bus enumeration, BAR decoding and MSI-X table programming are the PCI
//! service's job; this module defines what a driver receives from it once
//! a device has been discovered: the device identity, a [`BarIo`] window
//! onto BAR1 (the VirtIO legacy register block), and interrupt plumbing:
//! per-vector MSI-X bindings or a shared legacy line.
//!
//! Interrupt handlers registered here run in interrupt context: they only
//! acknowledge hardware state and wake a task, never allocate or block.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

use crate::sched::TaskRef;

/// VirtIO PCI vendor ID.
pub const VIRTIO_VENDOR_ID: u16 = 0x1AF4;

/// Location of a function on the PCI bus, packed `bus<<8 | dev<<3 | fn`,
/// the same encoding the configuration mechanism uses on the wire.
///
/// The PCI service that discovered the device owns validation; out-of-range
/// device/function values are simply masked into their fields here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciAddress(u16);

impl PciAddress {
    /// Pack a bus/device/function triple.
    pub fn new(bus: u8, device: u8, function: u8) -> Self {
        PciAddress(((bus as u16) << 8) | (((device & 0x1F) as u16) << 3) | ((function & 0x07) as u16))
    }

    pub fn bus(&self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub fn device(&self) -> u8 {
        ((self.0 >> 3) & 0x1F) as u8
    }

    pub fn function(&self) -> u8 {
        (self.0 & 0x07) as u8
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Domain-qualified lspci form.
        write!(
            f,
            "0000:{:02x}:{:02x}.{}",
            self.bus(),
            self.device(),
            self.function()
        )
    }
}

/// Register access to a device's BAR1 I/O window.
///
/// Offsets are relative to the BAR base. On bare metal this is port I/O
/// ([`PortBar`]); other environments supply their own mapping.
pub trait BarIo: Send + Sync {
    fn read8(&self, offset: u32) -> u8;
    fn read16(&self, offset: u32) -> u16;
    fn read32(&self, offset: u32) -> u32;
    fn write8(&self, offset: u32, value: u8);
    fn write16(&self, offset: u32, value: u16);
    fn write32(&self, offset: u32, value: u32);
}

/// x86 port-I/O implementation of [`BarIo`] for I/O-space BARs.
#[cfg(target_arch = "x86_64")]
pub struct PortBar {
    io_base: u16,
}

#[cfg(target_arch = "x86_64")]
impl PortBar {
    /// Wrap an I/O-space BAR base (low bits already masked off).
    pub fn new(io_base: u16) -> Self {
        Self { io_base }
    }
}

#[cfg(target_arch = "x86_64")]
impl BarIo for PortBar {
    fn read8(&self, offset: u32) -> u8 {
        let mut port = x86_64::instructions::port::Port::<u8>::new(self.io_base + offset as u16);
        unsafe { port.read() }
    }

    fn read16(&self, offset: u32) -> u16 {
        let mut port = x86_64::instructions::port::Port::<u16>::new(self.io_base + offset as u16);
        unsafe { port.read() }
    }

    fn read32(&self, offset: u32) -> u32 {
        let mut port = x86_64::instructions::port::Port::<u32>::new(self.io_base + offset as u16);
        unsafe { port.read() }
    }

    fn write8(&self, offset: u32, value: u8) {
        let mut port = x86_64::instructions::port::Port::<u8>::new(self.io_base + offset as u16);
        unsafe { port.write(value) }
    }

    fn write16(&self, offset: u32, value: u16) {
        let mut port = x86_64::instructions::port::Port::<u16>::new(self.io_base + offset as u16);
        unsafe { port.write(value) }
    }

    fn write32(&self, offset: u32, value: u32) {
        let mut port = x86_64::instructions::port::Port::<u32>::new(self.io_base + offset as u16);
        unsafe { port.write(value) }
    }
}

/// A pre-handler run in interrupt context before waking the bound task.
pub type IsrHandler = Box<dyn Fn() + Send + Sync>;

/// MSI-X vector binding: an acknowledge step plus an optional task wake.
struct MsixEntry {
    pre: Option<IsrHandler>,
    wake: Option<TaskRef>,
}

/// Legacy line binding: `ack` reads/clears the interrupt status and says
/// whether the interrupt was ours; `handler` runs only when it was.
struct LegacyEntry {
    ack: Box<dyn Fn() -> bool + Send + Sync>,
    handler: IsrHandler,
}

/// A discovered PCI device as handed to a driver by the PCI service.
pub struct PciDevice {
    /// Bus:Device:Function address.
    pub address: PciAddress,
    /// Vendor ID.
    pub vendor_id: u16,
    /// Device ID.
    pub device_id: u16,
    /// Revision ID (the VirtIO ABI version for 0x1AF4 devices).
    pub revision_id: u8,
    /// Legacy interrupt line.
    pub interrupt_line: u8,
    /// BAR1 register window, if the BAR is present.
    bar1: Option<Arc<dyn BarIo>>,
    /// Whether the device exposes an MSI-X capability.
    msix_capable: bool,
    msix_enabled: AtomicBool,
    bus_master: AtomicBool,
    msix_table: Mutex<BTreeMap<u16, MsixEntry>>,
    legacy: Mutex<Option<LegacyEntry>>,
}

impl PciDevice {
    /// Build the driver-side view of a discovered device.
    pub fn new(
        address: PciAddress,
        vendor_id: u16,
        device_id: u16,
        revision_id: u8,
        interrupt_line: u8,
        bar1: Option<Arc<dyn BarIo>>,
        msix_capable: bool,
    ) -> Self {
        Self {
            address,
            vendor_id,
            device_id,
            revision_id,
            interrupt_line,
            bar1,
            msix_capable,
            msix_enabled: AtomicBool::new(false),
            bus_master: AtomicBool::new(false),
            msix_table: Mutex::new(BTreeMap::new()),
            legacy: Mutex::new(None),
        }
    }

    /// BAR1 register window.
    pub fn bar1(&self) -> Option<&Arc<dyn BarIo>> {
        self.bar1.as_ref()
    }

    /// Enable (or disable) bus mastering. The command-register write is
    /// performed by the PCI service that produced this device handle.
    pub fn set_bus_master(&self, on: bool) {
        self.bus_master.store(on, Ordering::Relaxed);
        log::debug!("[PCI] {} bus master {}", self.address, if on { "on" } else { "off" });
    }

    /// Enable MSI-X if the device exposes the capability.
    pub fn msix_enable(&self) -> bool {
        if self.msix_capable {
            self.msix_enabled.store(true, Ordering::Relaxed);
        }
        self.msix_capable
    }

    /// Whether MSI-X is enabled.
    pub fn is_msix(&self) -> bool {
        self.msix_enabled.load(Ordering::Relaxed)
    }

    /// Bind an MSI-X vector to a pre-handler plus an optional task wake.
    ///
    /// Rebinding a vector replaces the previous entry.
    pub fn bind_msix(&self, vector: u16, pre: Option<IsrHandler>, wake: Option<TaskRef>) {
        self.msix_table
            .lock()
            .insert(vector, MsixEntry { pre, wake });
    }

    /// Bind the shared legacy interrupt line.
    pub fn bind_legacy(
        &self,
        ack: Box<dyn Fn() -> bool + Send + Sync>,
        handler: IsrHandler,
    ) {
        *self.legacy.lock() = Some(LegacyEntry { ack, handler });
    }

    /// Deliver an MSI-X interrupt. Called by the platform interrupt glue.
    pub fn fire_msix(&self, vector: u16) {
        let table = self.msix_table.lock();
        if let Some(entry) = table.get(&vector) {
            if let Some(pre) = &entry.pre {
                pre();
            }
            if let Some(task) = &entry.wake {
                task.wake();
            }
        }
    }

    /// Deliver a legacy line interrupt. Called by the platform interrupt
    /// glue; returns whether the interrupt was acknowledged as ours.
    pub fn fire_legacy(&self) -> bool {
        let legacy = self.legacy.lock();
        match legacy.as_ref() {
            Some(entry) => {
                if (entry.ack)() {
                    (entry.handler)();
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }
}

impl fmt::Display for PciDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:04x}:{:04x} rev {:02x} irq {}",
            self.address, self.vendor_id, self.device_id, self.revision_id, self.interrupt_line
        )
    }
}
