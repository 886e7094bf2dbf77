//! Randomness multiplexer.
//!
//! Hardware entropy sources register here; consumers call
//! [`get_random_bytes`] without caring which device backs it. The first
//! registered source serves requests (a single virtio-rng device is the
//! common case under a hypervisor).

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::RwLock;

/// A registered entropy source.
pub trait RandomSource: Send + Sync {
    /// Source name, for diagnostics.
    fn name(&self) -> &str;
    /// Fill up to `buf.len()` bytes; returns how many were produced.
    /// May block until entropy is available; partial reads are legal.
    fn get_random_bytes(&self, buf: &mut [u8]) -> usize;
}

static SOURCES: RwLock<Vec<Arc<dyn RandomSource>>> = RwLock::new(Vec::new());

/// Register an entropy source with the multiplexer.
pub fn register_source(source: Arc<dyn RandomSource>) {
    log::info!("[Random] registered source {}", source.name());
    SOURCES.write().push(source);
}

/// Unregister a source by name.
pub fn unregister_source(name: &str) {
    SOURCES.write().retain(|s| s.name() != name);
}

/// Fill `buf` from the first registered source.
///
/// Returns the number of bytes produced; 0 when no source is registered
/// or the wait was interrupted.
pub fn get_random_bytes(buf: &mut [u8]) -> usize {
    let source = SOURCES.read().first().cloned();
    match source {
        Some(source) => source.get_random_bytes(buf),
        None => 0,
    }
}
