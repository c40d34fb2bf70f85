//! Page-aligned shared buffers.
//!
//! A [`Buffer`] is zero-initialized memory whose start is aligned to
//! [`PAGE_SIZE`] and whose capacity is rounded up to a whole number of
//! pages, so a transport can map it into the host without copying.

#![allow(unsafe_code)]

use std::alloc::{self, Layout};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use hvrpc_proto::PAGE_SIZE;

use crate::error::{Error, Invalid, Result};

/// Owned, page-aligned, zeroed byte region.
///
/// Released exactly once: either by [`Buffer::release`] or on drop.
pub struct Buffer {
    /// Start of the allocation; `None` once released.
    ptr: Option<NonNull<u8>>,
    /// Bytes requested by the caller.
    len: usize,
    /// Bytes actually allocated (a multiple of [`PAGE_SIZE`]).
    cap: usize,
}

// SAFETY: Buffer uniquely owns its allocation, like a Box<[u8]>.
unsafe impl Send for Buffer {}
// SAFETY: shared access only hands out &[u8].
unsafe impl Sync for Buffer {}

impl Buffer {
    /// Allocates `size` zeroed bytes on a page boundary.
    ///
    /// Fails with [`Invalid::ZeroSize`] for `size == 0` and [`Error::Alloc`]
    /// if the allocator refuses. Buffers above 64 MiB can be allocated but
    /// are refused by the calls.
    pub fn allocate(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Invalid::ZeroSize.into());
        }
        let cap = size
            .checked_next_multiple_of(PAGE_SIZE)
            .ok_or(Error::Alloc(size))?;
        let layout = Layout::from_size_align(cap, PAGE_SIZE).map_err(|_| Error::Alloc(size))?;

        // SAFETY: layout has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(Error::Alloc(size))?;

        tracing::trace!(size, cap, "allocated shared buffer");
        Ok(Self {
            ptr: Some(ptr),
            len: size,
            cap,
        })
    }

    /// Returns the memory to the allocator. Calling it again is a no-op.
    pub fn release(&mut self) {
        if let Some(ptr) = self.ptr.take() {
            // SAFETY: ptr came from alloc_zeroed with exactly this layout.
            unsafe {
                let layout = Layout::from_size_align_unchecked(self.cap, PAGE_SIZE);
                alloc::dealloc(ptr.as_ptr(), layout);
            }
            self.len = 0;
            self.cap = 0;
        }
    }

    /// Whether the memory has been released.
    pub const fn is_released(&self) -> bool {
        self.ptr.is_none()
    }

    /// Requested size in bytes (zero once released).
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether there are no usable bytes.
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Allocated size in bytes, a whole number of pages.
    pub const fn capacity(&self) -> usize {
        self.cap
    }

    /// Start address, used as the descriptor reference.
    pub fn addr(&self) -> u64 {
        self.ptr.map_or(0, |p| p.as_ptr() as u64)
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self.ptr {
            // SAFETY: ptr is valid for len initialized bytes while held.
            Some(p) => unsafe { std::slice::from_raw_parts(p.as_ptr(), self.len) },
            None => &[],
        }
    }
}

impl DerefMut for Buffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        match self.ptr {
            // SAFETY: ptr is valid for len bytes and we hold &mut self.
            Some(p) => unsafe { std::slice::from_raw_parts_mut(p.as_ptr(), self.len) },
            None => &mut [],
        }
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl AsMut<[u8]> for Buffer {
    fn as_mut(&mut self) -> &mut [u8] {
        self
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("len", &self.len)
            .field("cap", &self.cap)
            .finish()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use hvrpc_proto::MAX_BUFFER_SIZE;

    use super::*;

    #[test]
    fn page_aligned_and_zeroed() {
        let buf = Buffer::allocate(100).unwrap();
        assert_eq!(buf.len(), 100);
        assert_eq!(buf.capacity(), PAGE_SIZE);
        assert_eq!(buf.addr() % PAGE_SIZE as u64, 0);
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[test]
    fn capacity_rounds_to_pages() {
        let buf = Buffer::allocate(PAGE_SIZE + 1).unwrap();
        assert_eq!(buf.capacity(), 2 * PAGE_SIZE);
        let exact = Buffer::allocate(PAGE_SIZE).unwrap();
        assert_eq!(exact.capacity(), PAGE_SIZE);
    }

    #[test]
    fn zero_size_is_rejected() {
        assert!(matches!(
            Buffer::allocate(0),
            Err(Error::Invalid(Invalid::ZeroSize))
        ));
    }

    #[test]
    fn allocates_past_descriptor_limit() {
        let size = MAX_BUFFER_SIZE as usize + 1;
        let buf = Buffer::allocate(size).unwrap();
        assert_eq!(buf.len(), size);
        assert_eq!(buf.capacity(), size.next_multiple_of(PAGE_SIZE));
    }

    #[test]
    fn release_is_idempotent() {
        let mut buf = Buffer::allocate(4096).unwrap();
        buf[0] = 7;
        buf.release();
        assert!(buf.is_released());
        assert!(buf.is_empty());
        assert_eq!(buf.addr(), 0);
        buf.release();
        assert!(buf.is_empty());
    }

    #[test]
    fn writable_through_deref() {
        let mut buf = Buffer::allocate(16).unwrap();
        buf.fill(0xAB);
        assert_eq!(buf.as_ref(), &[0xAB; 16]);
    }
}
