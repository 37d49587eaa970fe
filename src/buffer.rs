//! Pool of reusable page-sized bounce buffers.
//!
//! Used for prepared packet headers (always) and for payload bounce-copy
//! when direct granting isn't viable. Buffers are identified by a stable
//! index into a fixed arena rather than by pointer, so the in-flight
//! `Pending` table in the rings never holds anything that needs unsafe
//! lifetime reasoning across threads.

use std::cell::UnsafeCell;
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

pub const PAGE_SIZE: usize = 4096;

struct Page(UnsafeCell<[u8; PAGE_SIZE]>);

// SAFETY: a page's index is only ever held by a single `PoolBuffer` at a
// time (the free-list only yields an index once, and it's returned exactly
// once on drop), so concurrent access to the same page never happens even
// though the pool itself is shared.
unsafe impl Sync for Page {}

/// Fixed-size arena of bounce-buffer pages with a lock-free free-list.
pub struct BufferPool {
    pages: Box<[Page]>,
    free: ArrayQueue<u32>,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        let pages: Box<[Page]> = (0..capacity)
            .map(|_| Page(UnsafeCell::new([0u8; PAGE_SIZE])))
            .collect();
        let free = ArrayQueue::new(capacity);
        for i in 0..capacity {
            let _ = free.push(i as u32);
        }
        tracing::debug!(capacity, page_size = PAGE_SIZE, "buffer pool created");
        Arc::new(BufferPool { pages, free })
    }

    pub fn alloc(self: &Arc<Self>) -> Option<PoolBuffer> {
        let index = self.free.pop()?;
        Some(PoolBuffer {
            pool: Arc::clone(self),
            index,
            start: 0,
            len: 0,
        })
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.pages.len()
    }

    fn page_ptr(&self, index: u32) -> *mut u8 {
        self.pages[index as usize].0.get().cast()
    }

    fn release(&self, index: u32) {
        let _ = self.free.push(index);
    }
}

/// A buffer checked out of the pool. Returns automatically on drop.
pub struct PoolBuffer {
    pool: Arc<BufferPool>,
    index: u32,
    pub start: usize,
    pub len: usize,
}

impl PoolBuffer {
    pub fn index(&self) -> u32 {
        self.index
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        // SAFETY: `start..start+len` is always kept within PAGE_SIZE by the
        // mutating methods below.
        unsafe { std::slice::from_raw_parts(self.pool.page_ptr(self.index).add(self.start), self.len) }
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.pool.page_ptr(self.index).add(self.start), self.len) }
    }

    /// Mutable slice from `start` to the end of the page, for writing in
    /// new data before committing a length with [`PoolBuffer::set_len`].
    #[inline]
    pub fn write_area(&mut self) -> &mut [u8] {
        let capacity = PAGE_SIZE - self.start;
        unsafe { std::slice::from_raw_parts_mut(self.pool.page_ptr(self.index).add(self.start), capacity) }
    }

    pub fn set_len(&mut self, len: usize) {
        assert!(self.start + len <= PAGE_SIZE, "buffer overflow");
        self.len = len;
    }

    pub fn remaining_capacity(&self) -> usize {
        PAGE_SIZE - self.start - self.len
    }

    /// Append bytes, growing `len`. Panics if they don't fit.
    pub fn extend(&mut self, bytes: &[u8]) {
        let at = self.start + self.len;
        assert!(at + bytes.len() <= PAGE_SIZE, "buffer overflow");
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.pool.page_ptr(self.index).add(at), bytes.len());
        }
        self.len += bytes.len();
    }

    /// Zero-pad the tail out to `total_len` (used to bring runt packets up
    /// to the Ethernet minimum frame size).
    pub fn pad_to(&mut self, total_len: usize) {
        if total_len <= self.len {
            return;
        }
        let pad = total_len - self.len;
        let at = self.start + self.len;
        assert!(at + pad <= PAGE_SIZE, "buffer overflow");
        unsafe {
            std::ptr::write_bytes(self.pool.page_ptr(self.index).add(at), 0, pad);
        }
        self.len = total_len;
    }

    pub fn reset(&mut self) {
        self.start = 0;
        self.len = 0;
    }
}

impl Drop for PoolBuffer {
    fn drop(&mut self) {
        self.pool.release(self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_drop_returns_to_pool() {
        let pool = BufferPool::new(4);
        assert_eq!(pool.available(), 4);
        {
            let _buf = pool.alloc().unwrap();
            assert_eq!(pool.available(), 3);
        }
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn test_extend_and_read_back() {
        let pool = BufferPool::new(1);
        let mut buf = pool.alloc().unwrap();
        buf.extend(&[1, 2, 3, 4]);
        assert_eq!(buf.data(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_pad_to_ethernet_minimum() {
        let pool = BufferPool::new(1);
        let mut buf = pool.alloc().unwrap();
        buf.extend(&[0u8; 40]);
        buf.pad_to(60);
        assert_eq!(buf.len, 60);
        assert!(buf.data()[40..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_exhausted_pool_returns_none() {
        let pool = BufferPool::new(1);
        let _b1 = pool.alloc().unwrap();
        assert!(pool.alloc().is_none());
    }
}
