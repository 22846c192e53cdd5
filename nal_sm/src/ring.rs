//! Shared message rings and the packed 64-bit header.
//!
//! Each connection maps one ring per direction into both processes. A
//! ring entry is a whole header packed into a single 64-bit word; zero is
//! reserved for "empty", which the header layout guarantees because the
//! message type field is never zero.

use shmq::Ring;

/// Entries per ring. Power of two.
pub const RING_DEPTH: usize = 64;

/// Message type carried in a ring header. Discriminants start at 1 so a
/// packed header is never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    SendUnexpected = 1,
    SendExpected = 2,
}

impl MsgType {
    fn from_bits(bits: u64) -> Option<MsgType> {
        match bits {
            1 => Some(MsgType::SendUnexpected),
            2 => Some(MsgType::SendExpected),
            _ => None,
        }
    }
}

/// Unpacked ring header.
///
/// Packed little-endian layout:
/// `{type:4, buf_idx:8, buf_size:16, tag:32, pad:4}` from bit 0 upward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHdr {
    pub ty: MsgType,
    pub buf_idx: u8,
    pub buf_size: u16,
    pub tag: u32,
}

impl MsgHdr {
    pub fn pack(&self) -> u64 {
        (self.ty as u64 & 0xf)
            | ((self.buf_idx as u64) << 4)
            | ((self.buf_size as u64) << 12)
            | ((self.tag as u64) << 28)
    }

    pub fn unpack(val: u64) -> Option<MsgHdr> {
        let ty = MsgType::from_bits(val & 0xf)?;
        Some(MsgHdr {
            ty,
            buf_idx: ((val >> 4) & 0xff) as u8,
            buf_size: ((val >> 12) & 0xffff) as u16,
            tag: ((val >> 28) & 0xffff_ffff) as u32,
        })
    }
}

/// The shared object mapped per direction per connection.
#[repr(C)]
pub struct MsgRing {
    ring: Ring<RING_DEPTH>,
}

impl MsgRing {
    /// Bytes to request from the SHM allocator.
    pub const SHM_SIZE: usize = std::mem::size_of::<MsgRing>();

    /// Initialize a ring inside a freshly created mapping.
    ///
    /// # Safety
    /// Same contract as [`Ring::init_in_place`].
    pub unsafe fn init_in_place(ptr: *mut MsgRing) {
        Ring::init_in_place(std::ptr::addr_of_mut!((*ptr).ring));
    }

    /// Publish a header. Fails when the peer has not drained
    /// [`RING_DEPTH`] headers.
    pub fn push(&self, hdr: MsgHdr) -> bool {
        self.ring.push(hdr.pack()).is_ok()
    }

    /// Consume the oldest header.
    pub fn pop(&self) -> Option<MsgHdr> {
        self.ring.pop().and_then(MsgHdr::unpack)
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let hdr = MsgHdr {
            ty: MsgType::SendExpected,
            buf_idx: 63,
            buf_size: 4096,
            tag: 0xdead_beef,
        };
        let packed = hdr.pack();
        assert_ne!(packed, 0);
        assert_eq!(MsgHdr::unpack(packed), Some(hdr));
    }

    #[test]
    fn header_field_isolation() {
        for ty in [MsgType::SendUnexpected, MsgType::SendExpected] {
            for buf_idx in [0u8, 1, 63, 255] {
                for buf_size in [0u16, 1, 17, 4096, u16::MAX] {
                    for tag in [0u32, 42, u32::MAX] {
                        let hdr = MsgHdr {
                            ty,
                            buf_idx,
                            buf_size,
                            tag,
                        };
                        assert_eq!(MsgHdr::unpack(hdr.pack()), Some(hdr));
                    }
                }
            }
        }
    }

    #[test]
    fn zero_is_not_a_header() {
        assert_eq!(MsgHdr::unpack(0), None);
    }

    #[test]
    fn ring_in_mapping() {
        let mut storage = vec![0u8; MsgRing::SHM_SIZE + 64];
        let addr = storage.as_mut_ptr() as usize;
        let aligned = (addr + 63) & !63;
        let ring = aligned as *mut MsgRing;
        unsafe {
            MsgRing::init_in_place(ring);
            let ring = &*ring;
            assert!(ring.is_empty());
            let hdr = MsgHdr {
                ty: MsgType::SendUnexpected,
                buf_idx: 3,
                buf_size: 17,
                tag: 42,
            };
            assert!(ring.push(hdr));
            assert!(!ring.is_empty());
            assert_eq!(ring.pop(), Some(hdr));
            assert_eq!(ring.pop(), None);
        }
    }

    #[test]
    fn ring_full_after_depth_pushes() {
        let mut storage = vec![0u8; MsgRing::SHM_SIZE + 64];
        let addr = storage.as_mut_ptr() as usize;
        let aligned = (addr + 63) & !63;
        let ring = aligned as *mut MsgRing;
        unsafe {
            MsgRing::init_in_place(ring);
            let ring = &*ring;
            let hdr = MsgHdr {
                ty: MsgType::SendUnexpected,
                buf_idx: 0,
                buf_size: 1,
                tag: 0,
            };
            for _ in 0..RING_DEPTH {
                assert!(ring.push(hdr));
            }
            assert!(!ring.push(hdr));
            assert!(ring.pop().is_some());
            assert!(ring.push(hdr));
        }
    }
}
