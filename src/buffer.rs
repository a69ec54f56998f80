//! Pooled byte buffers and the message assembler.
//!
//! Steady-state receives must not touch the allocator: every payload lands
//! in a buffer rented from a process-wide pool and handed back on drop.
//! [`MessageAssembler`] builds one application message out of payload
//! chunks, growing by doubling and recycling its previous backing buffer
//! through the pool.

use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::Mutex;

/// Buffers retained by the pool beyond this count are dropped instead.
const SHELF_LIMIT: usize = 32;

static POOL: BufferPool = BufferPool::new();

/// A LIFO shelf of reusable byte buffers shared by the whole process.
///
/// Buffers come back cleared but keep their capacity, so a connection that
/// has reached its working-set size stops allocating entirely.
struct BufferPool {
    shelf: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    const fn new() -> Self {
        Self {
            shelf: Mutex::new(Vec::new()),
        }
    }

    /// Takes a buffer with at least `min_capacity` bytes of capacity,
    /// preferring the most recently released one that fits.
    fn acquire(&self, min_capacity: usize) -> Vec<u8> {
        let mut shelf = self.shelf.lock().unwrap_or_else(|e| e.into_inner());
        for idx in (0..shelf.len()).rev() {
            if shelf[idx].capacity() >= min_capacity {
                return shelf.swap_remove(idx);
            }
        }
        drop(shelf);
        Vec::with_capacity(min_capacity)
    }

    /// Returns a buffer to the shelf, cleared. Full shelf means the buffer
    /// is simply freed.
    fn release(&self, mut buf: Vec<u8>) {
        if buf.capacity() == 0 {
            return;
        }
        buf.clear();
        let mut shelf = self.shelf.lock().unwrap_or_else(|e| e.into_inner());
        if shelf.len() < SHELF_LIMIT {
            shelf.push(buf);
        }
    }
}

/// A byte buffer rented from the process-wide pool.
///
/// Dereferences to the underlying `Vec<u8>` and returns it to the pool on
/// drop, on every exit path.
pub(crate) struct PooledBuf {
    data: Vec<u8>,
}

impl PooledBuf {
    pub(crate) fn acquire(min_capacity: usize) -> Self {
        Self {
            data: POOL.acquire(min_capacity),
        }
    }
}

impl Deref for PooledBuf {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.data
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        POOL.release(mem::take(&mut self.data));
    }
}

/// Accumulates the payload of one application message in pooled storage.
///
/// `append` never reallocates in place: when the message outgrows the
/// current buffer, a larger one is rented, the written bytes are copied
/// over, and the old buffer goes back to the pool. `reset` only rewinds the
/// cursor; capacity and contents beyond it are left untouched.
pub(crate) struct MessageAssembler {
    buf: PooledBuf,
}

impl MessageAssembler {
    /// Creates an assembler whose first buffer holds `initial_capacity`
    /// bytes before any growth.
    pub(crate) fn with_capacity(initial_capacity: usize) -> Self {
        Self {
            buf: PooledBuf::acquire(initial_capacity.max(1)),
        }
    }

    /// Appends a payload chunk, doubling the backing buffer until it fits.
    pub(crate) fn append(&mut self, bytes: &[u8]) {
        let needed = self.buf.len() + bytes.len();
        if needed > self.buf.capacity() {
            let mut capacity = self.buf.capacity().max(1);
            while capacity < needed {
                capacity *= 2;
            }
            let mut next = PooledBuf::acquire(capacity);
            next.extend_from_slice(&self.buf);
            // the displaced buffer rejoins the pool when the guard drops
            let _ = mem::replace(&mut self.buf, next);
        }
        self.buf.extend_from_slice(bytes);
    }

    /// Rewinds the write cursor. O(1): no bytes are zeroed.
    pub(crate) fn reset(&mut self) {
        self.buf.clear();
    }

    /// The bytes written since the last reset.
    pub(crate) fn written(&self) -> &[u8] {
        &self.buf
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_reuses_released_buffers() {
        let pool = BufferPool::new();

        let mut buf = pool.acquire(64);
        buf.extend_from_slice(b"abc");
        let cap = buf.capacity();
        pool.release(buf);

        let again = pool.acquire(32);
        assert_eq!(again.capacity(), cap);
        assert!(again.is_empty(), "released buffers come back cleared");
    }

    #[test]
    fn test_pool_prefers_most_recent_release() {
        let pool = BufferPool::new();
        pool.release(Vec::with_capacity(100));
        pool.release(Vec::with_capacity(200));

        // Last released, first acquired.
        assert_eq!(pool.acquire(50).capacity(), 200);
        assert_eq!(pool.acquire(50).capacity(), 100);
    }

    #[test]
    fn test_pool_skips_undersized_buffers() {
        let pool = BufferPool::new();
        pool.release(Vec::with_capacity(16));

        let buf = pool.acquire(1024);
        assert!(buf.capacity() >= 1024);
    }

    #[test]
    fn test_pool_shelf_limit() {
        let pool = BufferPool::new();
        for _ in 0..SHELF_LIMIT + 10 {
            pool.release(Vec::with_capacity(8));
        }
        let shelf = pool.shelf.lock().unwrap();
        assert_eq!(shelf.len(), SHELF_LIMIT);
    }

    #[test]
    fn test_assembler_append_and_reset() {
        let mut asm = MessageAssembler::with_capacity(16);
        asm.append(b"hello ");
        asm.append(b"world");

        assert_eq!(asm.written(), b"hello world");
        assert_eq!(asm.len(), 11);

        asm.reset();
        assert_eq!(asm.len(), 0);
        assert_eq!(asm.written(), b"");
    }

    #[test]
    fn test_assembler_growth_preserves_contents() {
        let mut asm = MessageAssembler::with_capacity(4);
        let payload: Vec<u8> = (0..200u8).collect();
        // Append in odd-sized slices to force several doublings mid-chunk.
        for chunk in payload.chunks(7) {
            asm.append(chunk);
        }
        assert_eq!(asm.written(), &payload[..]);
    }

    #[test]
    fn test_assembler_reset_keeps_capacity() {
        let mut asm = MessageAssembler::with_capacity(8);
        asm.append(&[0u8; 500]);
        let grown = asm.buf.capacity();
        assert!(grown >= 500);

        asm.reset();
        assert_eq!(asm.buf.capacity(), grown);

        // Refilling to the same size must not grow again.
        asm.append(&[1u8; 500]);
        assert_eq!(asm.buf.capacity(), grown);
    }

    #[test]
    fn test_assembler_empty_append() {
        let mut asm = MessageAssembler::with_capacity(4);
        asm.append(b"");
        assert_eq!(asm.len(), 0);
    }
}
