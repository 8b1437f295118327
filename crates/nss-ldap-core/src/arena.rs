//! Fixed-capacity buffer arena for marshaled records.
//!
//! Results are written into one caller-supplied byte buffer that is never reallocated.
//! Strings are stored NUL-terminated and string lists are stored as a NULL-terminated
//! vector of pointer-sized slots holding the absolute address (`base + offset`) of each
//! string, in native byte order.
//!
//! Every allocation is atomic: when a request does not fit, the arena returns
//! [`Error::BufferTooSmall`] and the used counter is exactly what it was before the call.

use crate::{Error, Result};
use std::mem::{align_of, size_of};

const POINTER_SIZE: usize = size_of::<usize>();

/// Rounds `value` up to the next multiple of `align`, which must be a power of two.
const fn align_up(value: usize, align: usize) -> Option<usize> {
    match value.checked_add(align - 1) {
        Some(bumped) => Some(bumped & !(align - 1)),
        None => None,
    }
}

/// A NUL-terminated string stored in an arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaStr {
    offset: usize,
    len: usize,
}

impl ArenaStr {
    /// Offset of the first byte from the start of the buffer.
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    /// Length in bytes, excluding the terminator.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns true for the empty string.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A NULL-terminated pointer vector stored in an arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaVec {
    offset: usize,
    len: usize,
}

impl ArenaVec {
    /// Offset of the first pointer slot.
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    /// Number of non-NULL entries.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns true when the vector holds only the terminator.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Saved arena position for [`BufferArena::rollback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint(usize);

/// Bump allocator over a caller-owned byte buffer.
#[derive(Debug)]
pub struct BufferArena<'buf> {
    buf: &'buf mut [u8],
    used: usize,
}

impl<'buf> BufferArena<'buf> {
    /// Wraps a caller buffer. Nothing is written until the first allocation.
    pub fn new(buf: &'buf mut [u8]) -> Self {
        Self { buf, used: 0 }
    }

    /// Total size of the buffer.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes consumed so far, alignment padding included.
    #[must_use]
    pub const fn used(&self) -> usize {
        self.used
    }

    /// Bytes still available.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.used
    }

    /// Absolute address of the first byte.
    #[must_use]
    pub fn base_address(&self) -> usize {
        self.buf.as_ptr() as usize
    }

    /// Bytes written so far.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.used]
    }

    /// Records the current position.
    #[must_use]
    pub const fn checkpoint(&self) -> Checkpoint {
        Checkpoint(self.used)
    }

    /// Releases everything allocated since `checkpoint`.
    pub fn rollback(&mut self, checkpoint: Checkpoint) {
        if checkpoint.0 <= self.used {
            self.used = checkpoint.0;
        }
    }

    /// Reserves `size` bytes whose absolute address is a multiple of `align`.
    fn reserve(&mut self, size: usize, align: usize) -> Result<usize> {
        let base = self.base_address();
        let remaining = self.remaining();
        let too_small = || Error::buffer_too_small(size, remaining);

        let start_address = base.checked_add(self.used).ok_or_else(too_small)?;
        let aligned_address = align_up(start_address, align).ok_or_else(too_small)?;
        let padding = aligned_address - start_address;
        let requested = padding.checked_add(size).ok_or_else(too_small)?;

        if requested > remaining {
            return Err(Error::buffer_too_small(requested, remaining));
        }

        let offset = self.used + padding;
        self.used += requested;
        Ok(offset)
    }

    /// Reserves `len` unaligned bytes and returns their offset.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BufferTooSmall`] when the bytes do not fit.
    pub fn alloc_bytes(&mut self, len: usize) -> Result<usize> {
        self.reserve(len, 1)
    }

    /// Reserves room for `count` values of `T` aligned for `T`, returning the offset.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BufferTooSmall`] when the values do not fit.
    pub fn alloc_aligned<T>(&mut self, count: usize) -> Result<usize> {
        let size = size_of::<T>()
            .checked_mul(count)
            .ok_or_else(|| Error::buffer_too_small(usize::MAX, self.remaining()))?;
        self.reserve(size, align_of::<T>())
    }

    /// Copies `value` plus a NUL terminator.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BufferTooSmall`] when the string does not fit.
    pub fn push_str(&mut self, value: &str) -> Result<ArenaStr> {
        let bytes = value.as_bytes();
        let offset = self.alloc_bytes(bytes.len() + 1)?;
        self.buf[offset..offset + bytes.len()].copy_from_slice(bytes);
        self.buf[offset + bytes.len()] = 0;
        Ok(ArenaStr {
            offset,
            len: bytes.len(),
        })
    }

    /// Stores `values` as a NULL-terminated pointer vector, skipping entries equal to `omit`.
    ///
    /// The pointer slots are reserved first, then the strings are copied, then the slots
    /// and terminator are filled in.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BufferTooSmall`] when the vector does not fit. The arena is left
    /// as it was before the call.
    pub fn push_str_vec<S: AsRef<str>>(
        &mut self,
        values: &[S],
        omit: Option<&str>,
    ) -> Result<ArenaVec> {
        let kept: Vec<&str> = values
            .iter()
            .map(AsRef::as_ref)
            .filter(|value| omit != Some(*value))
            .collect();

        let start = self.checkpoint();
        match self.write_str_vec(&kept) {
            Ok(vec) => Ok(vec),
            Err(err) => {
                self.rollback(start);
                Err(err)
            }
        }
    }

    fn write_str_vec(&mut self, values: &[&str]) -> Result<ArenaVec> {
        let slots = self.alloc_aligned::<usize>(values.len() + 1)?;

        for (index, value) in values.iter().enumerate() {
            let stored = self.push_str(value)?;
            let address = self.base_address() + stored.offset;
            self.write_slot(slots + index * POINTER_SIZE, address);
        }
        self.write_slot(slots + values.len() * POINTER_SIZE, 0);

        Ok(ArenaVec {
            offset: slots,
            len: values.len(),
        })
    }

    fn write_slot(&mut self, offset: usize, address: usize) {
        self.buf[offset..offset + POINTER_SIZE].copy_from_slice(&address.to_ne_bytes());
    }

    /// Reads the pointer slot at `offset`.
    #[must_use]
    pub fn read_slot(&self, offset: usize) -> Option<usize> {
        let end = offset.checked_add(POINTER_SIZE)?;
        let bytes = self.as_bytes().get(offset..end)?;
        let mut raw = [0u8; POINTER_SIZE];
        raw.copy_from_slice(bytes);
        Some(usize::from_ne_bytes(raw))
    }

    /// Converts an absolute address back into an offset inside the used region.
    #[must_use]
    pub fn resolve(&self, address: usize) -> Option<usize> {
        let offset = address.checked_sub(self.base_address())?;
        (offset < self.used).then_some(offset)
    }

    /// Borrows a stored string.
    #[must_use]
    pub fn str_at(&self, stored: ArenaStr) -> Option<&str> {
        let bytes = self
            .as_bytes()
            .get(stored.offset..stored.offset + stored.len)?;
        std::str::from_utf8(bytes).ok()
    }

    /// Reads the NUL-terminated string at an absolute address.
    #[must_use]
    pub fn c_str_at(&self, address: usize) -> Option<&str> {
        let offset = self.resolve(address)?;
        let tail = &self.as_bytes()[offset..];
        let len = tail.iter().position(|byte| *byte == 0)?;
        std::str::from_utf8(&tail[..len]).ok()
    }

    /// Follows a pointer vector until its NULL terminator.
    #[must_use]
    pub fn strings(&self, vec: ArenaVec) -> Option<Vec<&str>> {
        let mut values = Vec::with_capacity(vec.len);
        let mut slot = vec.offset;
        loop {
            let address = self.read_slot(slot)?;
            if address == 0 {
                return Some(values);
            }
            values.push(self.c_str_at(address)?);
            slot += POINTER_SIZE;
        }
    }
}
