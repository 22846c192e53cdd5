//! Bounded lock-free MPMC queues of pointer-sized entries.
//!
//! The queue stores non-zero `u64` values in a fixed power-of-two ring.
//! Each slot's zero/non-zero state doubles as its empty/full flag, so a
//! ring that has been zero-initialized is a valid empty queue. Combined
//! with the `#[repr(C)]` layout this lets a [`Ring`] be placed directly
//! inside a shared-memory mapping and used concurrently by two processes,
//! or allocated on the heap with [`Ring::boxed`] for in-process use.
//!
//! Producers serialize on a CAS over the head index; consumers serialize
//! on a CAS over the tail index. A successful push is made visible to a
//! peer (thread or process) by the release store of the slot value.

use std::alloc::{alloc_zeroed, handle_alloc_error, Layout};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Pads a value out to its own cache line to keep the producer and
/// consumer indices from false-sharing.
#[repr(C, align(64))]
pub struct CachePadded<T>(pub T);

/// Error returned by [`Ring::push`] when the ring is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Full;

impl std::fmt::Display for Full {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ring is full")
    }
}

impl std::error::Error for Full {}

/// Bounded MPMC ring of `N` non-zero `u64` entries.
///
/// `N` must be a power of two. The all-zeroes bit pattern is a valid empty
/// ring, which is what makes in-place initialization inside a fresh SHM
/// mapping safe.
#[repr(C)]
pub struct Ring<const N: usize> {
    head: CachePadded<AtomicU32>,
    tail: CachePadded<AtomicU32>,
    entries: [AtomicU64; N],
}

impl<const N: usize> Ring<N> {
    const POW2: () = assert!(N.is_power_of_two() && N > 0, "capacity must be a power of two");

    /// Number of entries the ring can hold.
    pub const CAPACITY: usize = N;

    /// Allocate a zeroed ring on the heap.
    pub fn boxed() -> Box<Self> {
        #[allow(clippy::let_unit_value)]
        let _ = Self::POW2;
        let layout = Layout::new::<Self>();
        // Zeroed atomics are valid; see the type-level invariant above.
        unsafe {
            let ptr = alloc_zeroed(layout) as *mut Self;
            if ptr.is_null() {
                handle_alloc_error(layout);
            }
            Box::from_raw(ptr)
        }
    }

    /// Initialize a ring in place, e.g. inside a freshly created SHM
    /// mapping.
    ///
    /// # Safety
    /// `ptr` must be valid for writes of `size_of::<Self>()` bytes and
    /// properly aligned. No other thread or process may access the memory
    /// until this call returns.
    pub unsafe fn init_in_place(ptr: *mut Self) {
        #[allow(clippy::let_unit_value)]
        let _ = Self::POW2;
        std::ptr::write_bytes(ptr as *mut u8, 0, std::mem::size_of::<Self>());
    }

    /// Push a non-zero value. Returns [`Full`] when `N` entries are
    /// already queued.
    pub fn push(&self, val: u64) -> Result<(), Full> {
        debug_assert!(val != 0, "zero is reserved for empty slots");
        loop {
            let head = self.head.0.load(Ordering::Acquire);
            let tail = self.tail.0.load(Ordering::Acquire);
            if head.wrapping_sub(tail) >= N as u32 {
                return Err(Full);
            }
            if self
                .head
                .0
                .compare_exchange_weak(
                    head,
                    head.wrapping_add(1),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                let slot = &self.entries[head as usize & (N - 1)];
                // A consumer that claimed this slot on the previous lap may
                // not have cleared it yet.
                while slot.load(Ordering::Acquire) != 0 {
                    std::hint::spin_loop();
                }
                slot.store(val, Ordering::Release);
                return Ok(());
            }
        }
    }

    /// Pop the oldest value, or `None` when the ring is empty. Safe for
    /// concurrent consumers.
    pub fn pop(&self) -> Option<u64> {
        loop {
            let tail = self.tail.0.load(Ordering::Acquire);
            let head = self.head.0.load(Ordering::Acquire);
            if tail == head {
                return None;
            }
            if self
                .tail
                .0
                .compare_exchange_weak(
                    tail,
                    tail.wrapping_add(1),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                let slot = &self.entries[tail as usize & (N - 1)];
                loop {
                    // The producer that claimed this index may not have
                    // stored its value yet.
                    let val = slot.swap(0, Ordering::AcqRel);
                    if val != 0 {
                        return Some(val);
                    }
                    std::hint::spin_loop();
                }
            }
        }
    }

    /// True when no entries are queued.
    pub fn is_empty(&self) -> bool {
        let tail = self.tail.0.load(Ordering::Acquire);
        let head = self.head.0.load(Ordering::Acquire);
        tail == head
    }

    /// Number of queued entries at some instant.
    pub fn len(&self) -> usize {
        let tail = self.tail.0.load(Ordering::Acquire);
        let head = self.head.0.load(Ordering::Acquire);
        head.wrapping_sub(tail) as usize
    }
}
