//! Network interface surface.
//!
//! The upper network stack consumes NICs through this module: an
//! [`Interface`] carries the `eth<N>` name, MTU, administrative flags,
//! the capability set derived from what the hardware negotiated, and the
//! two delivery hooks: a classifier fast path that may claim a packet,
//! and the generic input hook packets fall back to.

use alloc::boxed::Box;
use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::{Mutex, RwLock};

use crate::mbuf::Mbuf;

/// Ethernet MTU.
pub const ETHERMTU: u16 = 1500;
/// Ethernet header size.
pub const ETHER_HDR_LEN: usize = 14;

bitflags! {
    /// Interface administrative/driver flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IfFlags: u32 {
        const UP = 1 << 0;
        const BROADCAST = 1 << 1;
        /// The driver datapath is live; cleared on detach/down.
        const RUNNING = 1 << 2;
    }
}

bitflags! {
    /// Hardware capabilities advertised to the stack.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IfCaps: u32 {
        /// Transmit checksum offload.
        const TXCSUM = 1 << 0;
        /// TCP/IPv4 segmentation offload.
        const TSO4 = 1 << 1;
        /// Receive checksum offload.
        const RXCSUM = 1 << 2;
        /// Large receive offload.
        const LRO = 1 << 3;
    }
}

/// Aggregated interface statistics, in the classic if_data shape.
#[derive(Debug, Clone, Copy, Default)]
pub struct IfData {
    pub ipackets: u64,
    pub ibytes: u64,
    pub iqdrops: u64,
    pub ierrors: u64,
    pub opackets: u64,
    pub obytes: u64,
    pub oerrors: u64,
}

/// Fast-path classifier: returns true if it consumed the packet.
pub type Classifier = Box<dyn Fn(&Mbuf) -> bool + Send + Sync>;
/// Generic input hook for packets the classifier declined.
pub type InputHook = Box<dyn Fn(Mbuf) + Send + Sync>;

/// Process-wide interface instance counter (`eth0`, `eth1`, ...).
static IF_INDEX: AtomicU32 = AtomicU32::new(0);

/// Registered interfaces.
static INTERFACES: Mutex<Vec<Arc<Interface>>> = Mutex::new(Vec::new());

/// A network interface as seen by the upper layers.
pub struct Interface {
    name: String,
    index: u32,
    mtu: u16,
    flags: AtomicU32,
    capabilities: IfCaps,
    cap_enabled: AtomicU32,
    classifier: RwLock<Option<Classifier>>,
    input: RwLock<Option<InputHook>>,
}

impl Interface {
    /// Allocate a new interface: `<prefix><N>` with N from the
    /// process-wide counter. Starts UP but not RUNNING.
    pub fn alloc(prefix: &str, mtu: u16, capabilities: IfCaps) -> Arc<Interface> {
        let index = IF_INDEX.fetch_add(1, Ordering::Relaxed);
        Arc::new(Interface {
            name: format!("{}{}", prefix, index),
            index,
            mtu,
            flags: AtomicU32::new((IfFlags::UP | IfFlags::BROADCAST).bits()),
            capabilities,
            cap_enabled: AtomicU32::new(capabilities.bits()),
            classifier: RwLock::new(None),
            input: RwLock::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// Capabilities the hardware supports.
    pub fn capabilities(&self) -> IfCaps {
        self.capabilities
    }

    /// True if the given capability is currently enabled.
    pub fn cap_enabled(&self, cap: IfCaps) -> bool {
        IfCaps::from_bits_truncate(self.cap_enabled.load(Ordering::Relaxed)).contains(cap)
    }

    /// Enable/disable a subset of the supported capabilities.
    pub fn set_cap_enabled(&self, caps: IfCaps) {
        self.cap_enabled
            .store((caps & self.capabilities).bits(), Ordering::Relaxed);
    }

    pub fn flags(&self) -> IfFlags {
        IfFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed))
    }

    /// True while the driver datapath is live.
    pub fn is_running(&self) -> bool {
        self.flags().contains(IfFlags::RUNNING)
    }

    /// Flip the RUNNING flag (driver up/down, detach).
    pub fn set_running(&self, on: bool) {
        if on {
            self.flags.fetch_or(IfFlags::RUNNING.bits(), Ordering::Relaxed);
        } else {
            self.flags.fetch_and(!IfFlags::RUNNING.bits(), Ordering::Relaxed);
        }
    }

    /// Install the classifier fast path.
    pub fn set_classifier(&self, classifier: Classifier) {
        *self.classifier.write() = Some(classifier);
    }

    /// Install the generic input hook.
    pub fn set_input(&self, input: InputHook) {
        *self.input.write() = Some(input);
    }

    /// Deliver a received packet: classifier first, input hook if it
    /// declines. Packets with no consumer are dropped here.
    pub fn deliver(&self, m: Mbuf) {
        {
            let classifier = self.classifier.read();
            if let Some(post) = classifier.as_ref() {
                if post(&m) {
                    return;
                }
            }
        }
        let input = self.input.read();
        if let Some(input) = input.as_ref() {
            input(m);
        }
    }
}

/// Register an interface with the subsystem.
pub fn attach(ifp: Arc<Interface>) {
    log::info!("[Net] attaching {}", ifp.name());
    ifp.set_running(true);
    INTERFACES.lock().push(ifp);
}

/// Unregister an interface; stops its datapath.
pub fn detach(ifp: &Arc<Interface>) {
    ifp.set_running(false);
    INTERFACES.lock().retain(|i| i.index() != ifp.index());
    log::info!("[Net] detached {}", ifp.name());
}

/// Look up an interface by name.
pub fn lookup(name: &str) -> Option<Arc<Interface>> {
    INTERFACES.lock().iter().find(|i| i.name() == name).cloned()
}

/// Number of registered interfaces.
pub fn count() -> usize {
    INTERFACES.lock().len()
}
