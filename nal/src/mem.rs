//! Memory handles for one-sided transfers.
//!
//! A handle is a sequence of `(base, length)` segments plus access flags.
//! Bases are virtual addresses in the owning process; a deserialized
//! handle is only ever dereferenced through a cross-process VM copy, never
//! directly. Cross-architecture handles are not supported: serialization
//! is host-endian and pointer-width 64.

use bitflags::bitflags;

use crate::error::{Error, Result};

bitflags! {
    /// Access rights granted by a memory handle.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessFlags: u64 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

impl AccessFlags {
    pub const READ_ONLY: AccessFlags = AccessFlags::READ;
    pub const WRITE_ONLY: AccessFlags = AccessFlags::WRITE;
    pub const READWRITE: AccessFlags =
        AccessFlags::from_bits_truncate(AccessFlags::READ.bits() | AccessFlags::WRITE.bits());
}

/// One contiguous registered region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Base virtual address in the owning process.
    pub base: u64,
    /// Length in bytes.
    pub len: u64,
}

/// Registered-memory descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemHandle {
    segments: Vec<Segment>,
    flags: AccessFlags,
    len: u64,
}

/// Serialized fixed header: segment count, flags, total length.
const SER_HEADER: usize = 3 * 8;

fn iov_max() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_IOV_MAX) };
    if n <= 0 {
        1024
    } else {
        n as usize
    }
}

impl MemHandle {
    /// Handle over a single contiguous buffer.
    pub fn new(buf: &[u8], flags: AccessFlags) -> Result<MemHandle> {
        Self::from_segments(
            vec![Segment {
                base: buf.as_ptr() as u64,
                len: buf.len() as u64,
            }],
            flags,
        )
    }

    /// Handle over an explicit segment list. The count is bounded by
    /// `IOV_MAX`.
    pub fn from_segments(segments: Vec<Segment>, flags: AccessFlags) -> Result<MemHandle> {
        if segments.is_empty() || flags.is_empty() {
            return Err(Error::InvalidArg);
        }
        if segments.len() > iov_max() {
            return Err(Error::InvalidArg);
        }
        let len = segments.iter().map(|s| s.len).sum();
        Ok(MemHandle {
            segments,
            flags,
            len,
        })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn flags(&self) -> AccessFlags {
        self.flags
    }

    /// Total registered length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of bytes [`MemHandle::serialize`] will write.
    pub fn serialize_size(&self) -> usize {
        SER_HEADER + self.segments.len() * 16
    }

    /// Serialize as `iovcnt | flags | length | (base, len)*`, host-endian.
    pub fn serialize(&self, buf: &mut [u8]) -> Result<usize> {
        let need = self.serialize_size();
        if buf.len() < need {
            return Err(Error::Overflow);
        }
        let mut words = Vec::with_capacity(3 + 2 * self.segments.len());
        words.push(self.segments.len() as u64);
        words.push(self.flags.bits());
        words.push(self.len);
        for seg in &self.segments {
            words.push(seg.base);
            words.push(seg.len);
        }
        for (i, word) in words.iter().enumerate() {
            buf[i * 8..i * 8 + 8].copy_from_slice(&word.to_ne_bytes());
        }
        Ok(need)
    }

    /// Reconstruct a handle serialized by [`MemHandle::serialize`].
    pub fn deserialize(buf: &[u8]) -> Result<MemHandle> {
        fn word(buf: &[u8], i: usize) -> u64 {
            u64::from_ne_bytes(buf[i * 8..i * 8 + 8].try_into().unwrap())
        }

        if buf.len() < SER_HEADER {
            return Err(Error::Overflow);
        }
        let iovcnt = word(buf, 0) as usize;
        let flags = AccessFlags::from_bits_truncate(word(buf, 1));
        let len = word(buf, 2);
        if iovcnt == 0 {
            return Err(Error::Fault);
        }
        if buf.len() < SER_HEADER + iovcnt * 16 {
            return Err(Error::Overflow);
        }
        let mut segments = Vec::with_capacity(iovcnt);
        for i in 0..iovcnt {
            segments.push(Segment {
                base: word(buf, 3 + 2 * i),
                len: word(buf, 4 + 2 * i),
            });
        }
        Ok(MemHandle {
            segments,
            flags,
            len,
        })
    }

    /// Translate `(offset, length)` within the handle into a segment list
    /// suitable for a scatter/gather transfer.
    ///
    /// The first returned segment starts inside the segment containing
    /// `offset`; subsequent segments consume whole registered segments,
    /// the last clipped to `length`.
    pub fn translate(&self, offset: u64, length: u64) -> Result<Vec<Segment>> {
        let end = offset.checked_add(length).ok_or(Error::InvalidArg)?;
        if end > self.len || length == 0 {
            return Err(Error::InvalidArg);
        }

        // Find the segment containing `offset`.
        let mut start_index = 0;
        let mut seg_offset = offset;
        let mut next_offset = 0u64;
        for (i, seg) in self.segments.iter().enumerate() {
            next_offset += seg.len;
            if offset < next_offset {
                start_index = i;
                break;
            }
            seg_offset -= seg.len;
        }

        let mut out = Vec::new();
        let first = &self.segments[start_index];
        let first_len = length.min(first.len - seg_offset);
        out.push(Segment {
            base: first.base + seg_offset,
            len: first_len,
        });
        let mut remaining = length - first_len;

        for seg in &self.segments[start_index + 1..] {
            if remaining == 0 {
                break;
            }
            let take_len = remaining.min(seg.len);
            out.push(Segment {
                base: seg.base,
                len: take_len,
            });
            remaining -= take_len;
        }

        if out.len() > iov_max() {
            return Err(Error::InvalidArg);
        }
        Ok(out)
    }
}
