//! Serializer session pooling.
//!
//! Encoding a command needs a scratch buffer for a few microseconds.
//! Rather than allocating per entry, buffers are pooled: `clear()`
//! preserves allocated capacity, so after warmup the encode hot path
//! performs no allocation. A [`Session`] is a scoped acquisition: the
//! buffer returns to the pool on drop, on every exit path.

use parking_lot::Mutex;
use std::sync::Arc;

/// Buffers retained per pool.
///
/// Enough for the handful of entries a single turn encodes; larger
/// bursts fall back to plain allocation.
const MAX_POOL_SIZE: usize = 8;

/// Shared pool of reusable scratch buffers.
#[derive(Debug, Clone, Default)]
pub struct SessionPool {
    buffers: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl SessionPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        SessionPool::default()
    }

    /// Acquire a cleared scratch buffer.
    ///
    /// Returns a pooled buffer if one is available, allocates otherwise.
    pub fn acquire(&self) -> Session {
        let buf = self.buffers.lock().pop().unwrap_or_default();
        Session {
            buf,
            pool: self.clone(),
        }
    }

    /// Number of buffers currently parked in the pool.
    pub fn idle(&self) -> usize {
        self.buffers.lock().len()
    }

    fn release(&self, mut buf: Vec<u8>) {
        buf.clear();
        let mut buffers = self.buffers.lock();
        if buffers.len() < MAX_POOL_SIZE {
            buffers.push(buf);
        }
    }
}

/// A scratch buffer on loan from a [`SessionPool`].
///
/// Dropping the session clears the buffer and parks it back in the pool.
pub struct Session {
    buf: Vec<u8>,
    pool: SessionPool,
}

impl Session {
    /// The scratch buffer for this session.
    pub fn buffer(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }

    /// Copy the encoded bytes out, leaving the session reusable.
    pub fn take_bytes(&mut self) -> Vec<u8> {
        let bytes = self.buf.clone();
        self.buf.clear();
        bytes
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.pool.release(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_cycle() {
        let pool = SessionPool::new();
        assert_eq!(pool.idle(), 0);
        {
            let mut session = pool.acquire();
            session.buffer().extend_from_slice(b"abc");
        }
        assert_eq!(pool.idle(), 1);

        // The recycled buffer comes back empty.
        let mut session = pool.acquire();
        assert!(session.buffer().is_empty());
    }

    #[test]
    fn test_capacity_preserved_across_reuse() {
        let pool = SessionPool::new();
        {
            let mut session = pool.acquire();
            session.buffer().extend_from_slice(&[0u8; 4096]);
        }
        let mut session = pool.acquire();
        assert!(session.buffer().capacity() >= 4096);
    }

    #[test]
    fn test_pool_is_bounded() {
        let pool = SessionPool::new();
        let sessions: Vec<_> = (0..MAX_POOL_SIZE + 4).map(|_| pool.acquire()).collect();
        drop(sessions);
        assert_eq!(pool.idle(), MAX_POOL_SIZE);
    }

    #[test]
    fn test_take_bytes_resets_buffer() {
        let pool = SessionPool::new();
        let mut session = pool.acquire();
        session.buffer().extend_from_slice(&[1, 2, 3]);
        assert_eq!(session.take_bytes(), vec![1, 2, 3]);
        assert!(session.buffer().is_empty());
    }
}
