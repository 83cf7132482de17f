//! Shared buffer pool.
//!
//! Connections lend reusable buffers to their requests; a buffer returns to
//! the pool when its guard drops. A buffer that grew past the sanity limit
//! is logged and discarded instead of being retained.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use tracing::warn;

/// Function the request event dispatcher uses to obtain buffer storage,
/// keeping it agnostic of any particular pool.
pub type AcquireBuffer = Arc<dyn Fn() -> BytesMut + Send + Sync>;

/// Configuration for a [`BufferPool`].
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Capacity of freshly allocated buffers.
    pub buffer_capacity: usize,
    /// Maximum number of idle buffers retained.
    pub max_pooled: usize,
    /// Returned buffers grown past this capacity are logged and dropped.
    pub warn_capacity: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        BufferPoolConfig {
            buffer_capacity: 4 * 1024,
            max_pooled: 32,
            warn_capacity: 64 * 1024,
        }
    }
}

/// Pool of reusable byte buffers shared by the requests on a connection.
#[derive(Debug)]
pub struct BufferPool {
    config: BufferPoolConfig,
    free: Mutex<VecDeque<BytesMut>>,
    acquired: AtomicU64,
    recycled: AtomicU64,
    oversized: AtomicU64,
}

impl BufferPool {
    pub fn new(config: BufferPoolConfig) -> Arc<Self> {
        Arc::new(BufferPool {
            config,
            free: Mutex::new(VecDeque::new()),
            acquired: AtomicU64::new(0),
            recycled: AtomicU64::new(0),
            oversized: AtomicU64::new(0),
        })
    }

    /// Borrows a buffer; it returns to the pool when the guard drops.
    pub fn acquire(self: &Arc<Self>) -> PooledBuffer {
        self.acquired.fetch_add(1, Ordering::Relaxed);
        let buf = {
            let mut free = self.free.lock().unwrap();
            free.pop_front()
        };
        let buf = buf.unwrap_or_else(|| BytesMut::with_capacity(self.config.buffer_capacity));
        PooledBuffer {
            buf: Some(buf),
            pool: Arc::clone(self),
        }
    }

    /// Takes a buffer out of the pool for good, e.g. to freeze it into a
    /// payload. Does not come back on drop.
    pub fn checkout(&self) -> BytesMut {
        self.acquired.fetch_add(1, Ordering::Relaxed);
        let buf = self.free.lock().unwrap().pop_front();
        buf.unwrap_or_else(|| BytesMut::with_capacity(self.config.buffer_capacity))
    }

    /// An [`AcquireBuffer`] drawing from this pool. Buffers handed out this
    /// way are consumed (frozen into payloads) rather than returned.
    pub fn acquire_fn(self: &Arc<Self>) -> AcquireBuffer {
        let pool = Arc::clone(self);
        Arc::new(move || pool.checkout())
    }

    fn put_back(&self, mut buf: BytesMut) {
        if buf.capacity() > self.config.warn_capacity {
            self.oversized.fetch_add(1, Ordering::Relaxed);
            warn!(
                capacity = buf.capacity(),
                limit = self.config.warn_capacity,
                "oversized buffer returned to pool, discarding"
            );
            return;
        }
        buf.clear();
        let mut free = self.free.lock().unwrap();
        if free.len() < self.config.max_pooled {
            free.push_back(buf);
            self.recycled.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Buffers currently idle in the pool.
    pub fn idle(&self) -> usize {
        self.free.lock().unwrap().len()
    }

    /// Number of oversized buffers discarded so far.
    pub fn oversized(&self) -> u64 {
        self.oversized.load(Ordering::Relaxed)
    }
}

/// Guard around a borrowed buffer.
#[derive(Debug)]
pub struct PooledBuffer {
    buf: Option<BytesMut>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        self.buf.as_ref().expect("buffer taken")
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        self.buf.as_mut().expect("buffer taken")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put_back(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_recycle() {
        let pool = BufferPool::new(BufferPoolConfig::default());
        {
            let mut buf = pool.acquire();
            buf.extend_from_slice(b"data");
        }
        assert_eq!(pool.idle(), 1);

        // Recycled buffer comes back cleared.
        let buf = pool.acquire();
        assert!(buf.is_empty());
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_oversized_buffer_discarded() {
        let pool = BufferPool::new(BufferPoolConfig {
            warn_capacity: 16,
            ..Default::default()
        });
        {
            let mut buf = pool.acquire();
            buf.extend_from_slice(&[0u8; 64]);
        }
        assert_eq!(pool.idle(), 0);
        assert_eq!(pool.oversized(), 1);
    }

    #[test]
    fn test_pool_bounded() {
        let pool = BufferPool::new(BufferPoolConfig {
            max_pooled: 2,
            ..Default::default()
        });
        let a = pool.acquire();
        let b = pool.acquire();
        let c = pool.acquire();
        drop(a);
        drop(b);
        drop(c);
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn test_acquire_fn_hands_out_buffers() {
        let pool = BufferPool::new(BufferPoolConfig::default());
        let acquire = pool.acquire_fn();
        let buf = acquire();
        assert!(buf.is_empty());
    }
}
