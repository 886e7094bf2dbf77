//! KPIO VirtIO Driver Subsystem
//!
//! This crate provides the paravirtualized device drivers for the KPIO
//! operating system: the VirtIO PCI transport (legacy layout), the vring
//! descriptor-ring machinery shared by every VirtIO device, and two device
//! personalities: an entropy source (virtio-rng) and an Ethernet NIC
//! (virtio-net).
//!
//! # Architecture
//!
//! The subsystem is organized into:
//!
//! - `pci`: the surface consumed from the PCI service (device identity,
//!   BAR1 register window, MSI-X vector binding, legacy interrupt line)
//! - `mem`: page-aligned DMA memory and guest-physical translation
//! - `sched`: the surface consumed from the scheduler (tasks, park/wake,
//!   per-CPU identity) plus the wait-until / condition-queue helpers
//! - `mbuf`: BSD-style packet buffers (fragment chains, packet headers,
//!   checksum metadata)
//! - `iface`: the upper-layer interface surface (`eth<N>` naming,
//!   capabilities, classifier/input hooks, aggregated statistics)
//! - `random`: the randomness multiplexer entropy sources register with
//! - `virtio`: the transport core, the vring, and the rng/net devices
//!
//! PCI bus enumeration, the scheduler itself, packet-buffer pools and the
//! TCP/IP stack live outside this crate; the modules above define exactly
//! the interface the drivers need from them.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod iface;
pub mod mbuf;
pub mod mem;
pub mod pci;
pub mod random;
pub mod sched;
pub mod virtio;
