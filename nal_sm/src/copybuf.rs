//! The copy-slot arena: 64 fixed-size payload slots plus a 64-bit
//! availability bitmask, all in one shared-memory object.
//!
//! Bit *i* of the bitmask is set iff slot *i* is unowned. Producers
//! reserve a slot by CAS-clearing its bit, copy their payload in, and
//! publish the slot index through the peer's ring; the consumer copies
//! out and ORs the bit back.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};

use shmq::CachePadded;

/// Number of payload slots; one bitmask bit each.
pub const NUM_BUFS: usize = 64;
/// Bytes per slot, which is also the largest message payload.
pub const COPY_BUF_SIZE: usize = 4096;

/// The shared arena object.
#[repr(C)]
pub struct CopyBuf {
    /// Availability bitmask, 1 = free.
    available: CachePadded<AtomicU64>,
    bufs: [UnsafeCell<[u8; COPY_BUF_SIZE]>; NUM_BUFS],
}

// Slot contents are only touched by the reserver (until release) and the
// consumer named by a published header.
unsafe impl Send for CopyBuf {}
unsafe impl Sync for CopyBuf {}

impl CopyBuf {
    /// Bytes to request from the SHM allocator.
    pub const SHM_SIZE: usize = std::mem::size_of::<CopyBuf>();

    /// Initialize an arena inside a freshly created mapping: every slot
    /// free.
    ///
    /// # Safety
    /// `ptr` must be valid, aligned, and not yet shared.
    pub unsafe fn init_in_place(ptr: *mut CopyBuf) {
        std::ptr::write_bytes(ptr as *mut u8, 0, std::mem::size_of::<CopyBuf>());
        (*ptr).available.0.store(!0u64, Ordering::Release);
    }

    /// Reserve the lowest free slot and copy `data` into it. Returns the
    /// slot index, or `None` when every bit is taken.
    ///
    /// On a CAS race the scan resumes from the next bit rather than
    /// restarting, matching the producer fairness of the wire peer.
    pub fn reserve_and_copy(&self, data: &[u8]) -> Option<usize> {
        debug_assert!(data.len() <= COPY_BUF_SIZE);
        let mut bits = 1u64;
        let mut i = 0;
        while i < NUM_BUFS {
            let available = self.available.0.load(Ordering::Acquire);
            if available == 0 {
                return None;
            }
            if available & bits != bits {
                i += 1;
                bits <<= 1;
                continue;
            }
            if self
                .available
                .0
                .compare_exchange(
                    available,
                    available & !bits,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                unsafe {
                    let slot = self.bufs[i].get() as *mut u8;
                    std::ptr::copy_nonoverlapping(data.as_ptr(), slot, data.len());
                }
                tracing::debug!(index = i, "reserved copy slot");
                return Some(i);
            }
            // Lost the race for this bit; try the next one.
            i += 1;
            bits <<= 1;
        }
        None
    }

    /// Copy `dst.len()` bytes out of slot `idx`, then release it.
    ///
    /// # Safety
    /// `idx` must name a slot this side was handed through a ring header
    /// and which has not been released since.
    pub unsafe fn copy_and_release(&self, idx: usize, dst: &mut [u8]) {
        debug_assert!(idx < NUM_BUFS && dst.len() <= COPY_BUF_SIZE);
        let slot = self.bufs[idx].get() as *const u8;
        std::ptr::copy_nonoverlapping(slot, dst.as_mut_ptr(), dst.len());
        self.release(idx);
    }

    /// Release a reserved slot without reading it.
    pub fn release(&self, idx: usize) {
        debug_assert!(idx < NUM_BUFS);
        self.available.0.fetch_or(1u64 << idx, Ordering::AcqRel);
    }

    /// Current availability bitmask.
    pub fn available_mask(&self) -> u64 {
        self.available.0.load(Ordering::Acquire)
    }
}
