//! virtio-rng: host-fed entropy source.
//!
//! A bounded in-guest pool sits between the host's randomness queue and
//! consumer threads. One producer task keeps the pool topped up: it
//! publishes a single host-writable buffer sized to the pool's free
//! space, waits for the completion, and appends whatever the host
//! actually returned (short completions are normal). Consumers drain
//! from the front and may get partial reads.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use super::{device_status, transport_reg, wait_for_queue, DriverError, VirtioDriver};
use super::vring::Vring;
use crate::pci::PciDevice;
use crate::random::{self, RandomSource};
use crate::sched::{Condvar, SchedRef};

/// Soft capacity of the entropy pool.
pub const ENTROPY_POOL_SIZE: usize = 64;

/// virtio-rng device state.
pub struct Rng {
    drv: VirtioDriver<()>,
    queue: Arc<Mutex<Vring<()>>>,
    sched: SchedRef,
    pool: Mutex<VecDeque<u8>>,
    producer: Condvar,
    consumer: Condvar,
}

impl Rng {
    /// Probe a discovered virtio-rng PCI device: transport handshake,
    /// single queue, interrupt wiring, producer task, registration with
    /// the randomness multiplexer.
    pub fn probe(dev: Arc<PciDevice>, sched: SchedRef) -> Result<Arc<Rng>, DriverError> {
        if dev.device_id != super::VIRTIO_RNG_DEVICE_ID {
            return Err(DriverError::WrongDeviceId(dev.device_id));
        }

        let mut drv = VirtioDriver::new(dev.clone(), sched.clone())?;
        // The rng personality has no feature bits of its own; only the
        // transport's ring features are negotiated.
        drv.setup_features(0)?;
        drv.probe_virt_queues()?;
        let queue = drv.queue(0).ok_or(DriverError::NoQueues)?;

        let rng = Arc::new(Rng {
            drv,
            queue: queue.clone(),
            sched: sched.clone(),
            pool: Mutex::new(VecDeque::new()),
            producer: Condvar::new(),
            consumer: Condvar::new(),
        });

        let worker = rng.clone();
        let task = sched.spawn("virtio-rng", None, Box::new(move || worker.worker()));

        if dev.is_msix() {
            let vq = queue.clone();
            dev.bind_msix(
                0,
                Some(Box::new(move || vq.lock().disable_interrupts())),
                Some(task),
            );
        } else {
            let bar = dev.bar1().ok_or(DriverError::MissingBar)?.clone();
            dev.bind_legacy(
                Box::new(move || bar.read8(transport_reg::ISR) != 0),
                Box::new(move || task.wake()),
            );
        }

        rng.drv.add_dev_status(device_status::DRIVER_OK);
        log::info!("[VirtIO-Rng] device ready, pool size {}", ENTROPY_POOL_SIZE);

        random::register_source(rng.clone());
        Ok(rng)
    }

    /// Drain up to `buf.len()` bytes from the pool, blocking while it is
    /// empty. Returns the number of bytes copied; 0 on interruption.
    pub fn get_random_bytes(&self, buf: &mut [u8]) -> usize {
        let guard = self.pool.lock();
        let Some(mut pool) =
            self.consumer
                .wait_until(&*self.sched, &self.pool, guard, |p| !p.is_empty())
        else {
            return 0;
        };
        let count = pool.len().min(buf.len());
        for (slot, byte) in buf.iter_mut().zip(pool.drain(..count)) {
            *slot = byte;
        }
        self.producer.wake_one();
        count
    }

    /// Producer loop: top up the pool whenever it is below capacity.
    fn worker(&self) {
        log::debug!("[VirtIO-Rng] producer task started");
        loop {
            let guard = self.pool.lock();
            let Some(pool) = self.producer.wait_until(&*self.sched, &self.pool, guard, |p| {
                p.len() < ENTROPY_POOL_SIZE
            }) else {
                log::debug!("[VirtIO-Rng] producer interrupted, exiting");
                return;
            };
            let remaining = ENTROPY_POOL_SIZE - pool.len();
            // The DMA round runs without the pool lock so consumers can
            // keep draining while the host fills our buffer.
            drop(pool);

            let Some(bytes) = self.refill(remaining) else {
                log::debug!("[VirtIO-Rng] producer interrupted, exiting");
                return;
            };

            let mut pool = self.pool.lock();
            pool.extend(bytes);
            self.consumer.wake_all();
        }
    }

    /// One DMA round: publish a host-writable buffer of `remaining`
    /// bytes, kick, wait for the completion, and return what the host
    /// wrote. `None` on interruption.
    fn refill(&self, remaining: usize) -> Option<Vec<u8>> {
        let mut buf = alloc::vec![0u8; remaining];

        loop {
            let added = {
                let mut vq = self.queue.lock();
                vq.init_sg();
                vq.add_in_sg(buf.as_mut_ptr(), remaining);
                vq.add_buf(())
            };
            if added {
                break;
            }
            // No free descriptors: reclaim completed chains first.
            if !wait_for_queue(&*self.sched, &self.queue, Vring::used_ring_can_gc) {
                return None;
            }
            self.queue.lock().get_buf_gc();
        }
        self.queue.lock().kick();

        if !wait_for_queue(&*self.sched, &self.queue, Vring::used_ring_not_empty) {
            return None;
        }

        let mut len = 0u32;
        {
            let mut vq = self.queue.lock();
            if vq.get_buf_elem(&mut len).is_some() {
                vq.get_buf_finalize();
            }
        }
        // The host may return fewer bytes than asked for.
        buf.truncate(len as usize);
        Some(buf)
    }
}

impl RandomSource for Rng {
    fn name(&self) -> &str {
        "virtio-rng"
    }

    fn get_random_bytes(&self, buf: &mut [u8]) -> usize {
        Rng::get_random_bytes(self, buf)
    }
}
