//! Slab-backed byte buffer pool.
//!
//! Segments are fixed-size, power-of-two byte regions. A [`BufferHandle`]
//! pins one segment for the duration of exactly one I/O operation; the
//! pool itself is a `slab::Slab<Box<[u8]>>` so segment addresses stay
//! stable across insert/remove (moving the `Box` only moves the pointer,
//! never the heap allocation it owns), which is what lets a handle's raw
//! pointer be read into an `iovec`/`iocb` safely.

use parking_lot::Mutex;
use slab::Slab;

/// A pinned byte region checked out of the pool. Dropping a handle
/// without releasing it back to the pool leaks the segment rather than
/// risking a use-after-release during an in-flight AIO read; callers are
/// expected to call [`BufferPool::release`] explicitly once the I/O that
/// owns the handle has completed.
pub struct BufferHandle {
    key: usize,
    ptr: *mut u8,
    len: usize,
}

impl BufferHandle {
    #[inline]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // Safety: `ptr` points at a `len`-byte region owned by a `Box<[u8]>`
        // living in the pool's slab at `key`, pinned there for the life of
        // this handle.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    #[inline]
    pub fn as_slice(&self, n: usize) -> &[u8] {
        let n = n.min(self.len);
        unsafe { std::slice::from_raw_parts(self.ptr, n) }
    }
}

// Safety: the handle is just a typed view into pool-owned memory; the
// pool's mutex is what actually serializes access to the slab.
unsafe impl Send for BufferHandle {}

struct Segment {
    bytes: Box<[u8]>,
}

pub struct BufferPool {
    segment_size: usize,
    slab: Mutex<Slab<Segment>>,
}

impl BufferPool {
    /// `segment_size` must be a power of two.
    pub fn new(segment_size: usize) -> Self {
        assert!(segment_size.is_power_of_two(), "segment size must be a power of two");
        Self {
            segment_size,
            slab: Mutex::new(Slab::with_capacity(64)),
        }
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    /// Checks out one segment, zero-filled, pinned for the caller.
    pub fn acquire(&self) -> BufferHandle {
        let mut bytes = vec![0u8; self.segment_size].into_boxed_slice();
        let ptr = bytes.as_mut_ptr();
        let len = bytes.len();
        let key = self.slab.lock().insert(Segment { bytes });
        BufferHandle { key, ptr, len }
    }

    /// Returns a segment to the pool. Invariant 4 requires
    /// every handle acquired for a batch to eventually flow back here.
    pub fn release(&self, handle: BufferHandle) {
        self.slab.lock().remove(handle.key);
    }

    pub fn in_use(&self) -> usize {
        self.slab.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquired_segments_are_zeroed_and_sized() {
        let pool = BufferPool::new(4096);
        let mut h = pool.acquire();
        assert_eq!(h.len(), 4096);
        assert!(h.as_mut_slice().iter().all(|&b| b == 0));
        pool.release(h);
    }

    #[test]
    fn release_count_matches_acquire_count() {
        let pool = BufferPool::new(1024);
        let handles: Vec<_> = (0..16).map(|_| pool.acquire()).collect();
        assert_eq!(pool.in_use(), 16);
        for h in handles {
            pool.release(h);
        }
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    #[should_panic]
    fn non_power_of_two_segment_size_panics() {
        BufferPool::new(100);
    }
}
