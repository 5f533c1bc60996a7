//! Chunk-aligned owned buffers for direct I/O

use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use crate::protocol::CHUNK_BASE;

fn round_up(n: usize) -> usize {
    n.div_ceil(CHUNK_BASE) * CHUNK_BASE
}

/// A heap buffer aligned to [`CHUNK_BASE`], with its capacity rounded up
/// to the next multiple of [`CHUNK_BASE`] and zero-initialised.
///
/// The rounded tail lets a short final chunk be handed to an O_DIRECT
/// `pwrite` at [`AlignedBuf::padded_len`] without re-copying: the bytes
/// past `len` are the zero padding the write needs, and the close-time
/// `ftruncate` trims them again.
pub struct AlignedBuf {
    ptr: NonNull<u8>,
    cap: usize,
    len: usize,
}

// Plain owned memory; the raw pointer is only non-Send by default.
unsafe impl Send for AlignedBuf {}
unsafe impl Sync for AlignedBuf {}

impl AlignedBuf {
    /// Allocate a zeroed buffer of `len` usable bytes.
    pub fn with_len(len: usize) -> AlignedBuf {
        let cap = round_up(len);
        if cap == 0 {
            return AlignedBuf {
                ptr: NonNull::dangling(),
                cap: 0,
                len: 0,
            };
        }

        let layout = Layout::from_size_align(cap, CHUNK_BASE).expect("chunk layout");
        let raw = unsafe { alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            handle_alloc_error(layout);
        };

        AlignedBuf { ptr, cap, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// `len` rounded up to the next multiple of [`CHUNK_BASE`].
    pub fn padded_len(&self) -> usize {
        round_up(self.len)
    }

    /// The buffer including its zeroed alignment padding. Only meaningful
    /// while the bytes past `len` are untouched since allocation.
    pub fn padded(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.padded_len()) }
    }
}

impl Deref for AlignedBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for AlignedBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        if self.cap != 0 {
            let layout = Layout::from_size_align(self.cap, CHUNK_BASE).expect("chunk layout");
            unsafe { dealloc(self.ptr.as_ptr(), layout) };
        }
    }
}

impl std::fmt::Debug for AlignedBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuf")
            .field("len", &self.len)
            .field("cap", &self.cap)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_and_zero_fill() {
        let buf = AlignedBuf::with_len(100);
        assert_eq!(buf.as_ptr() as usize % CHUNK_BASE, 0);
        assert_eq!(buf.len(), 100);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn padded_len_rounds_to_chunk_base() {
        assert_eq!(AlignedBuf::with_len(0).padded_len(), 0);
        assert_eq!(AlignedBuf::with_len(1).padded_len(), CHUNK_BASE);
        assert_eq!(AlignedBuf::with_len(CHUNK_BASE).padded_len(), CHUNK_BASE);
        assert_eq!(AlignedBuf::with_len(34464).padded_len(), 40960);
    }

    #[test]
    fn padding_stays_zero_after_writes() {
        let mut buf = AlignedBuf::with_len(10);
        buf.copy_from_slice(b"0123456789");
        let padded = buf.padded();
        assert_eq!(padded.len(), CHUNK_BASE);
        assert_eq!(&padded[..10], b"0123456789");
        assert!(padded[10..].iter().all(|&b| b == 0));
    }

    #[test]
    fn empty_buffer() {
        let buf = AlignedBuf::with_len(0);
        assert!(buf.is_empty());
        assert_eq!(buf.padded().len(), 0);
    }
}
