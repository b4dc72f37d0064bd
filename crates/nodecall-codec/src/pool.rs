use std::sync::LazyLock;

use bytes::BytesMut;
use crossbeam::queue::ArrayQueue;
use tracing::trace;

/// Default number of idle storages kept by a pool.
pub const DEFAULT_POOL_CAPACITY: usize = 1024;

/// Storages that grew beyond this capacity are dropped instead of pooled.
pub const DEFAULT_RETAIN_CAPACITY: usize = 1024 * 1024;

const INITIAL_STORAGE_CAPACITY: usize = 256;

static GLOBAL_POOL: LazyLock<BufferPool> = LazyLock::new(BufferPool::new);

/// Lock-free free-list of byte storages.
///
/// Producer threads acquire storage while building calls and the loop thread
/// releases it after writing, so both ends must be safe to use concurrently.
pub struct BufferPool {
    free: ArrayQueue<BytesMut>,
    retain_capacity: usize,
}

impl BufferPool {
    /// Create a pool with default limits.
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_POOL_CAPACITY, DEFAULT_RETAIN_CAPACITY)
    }

    /// Create a pool keeping at most `pool_capacity` idle storages, each at
    /// most `retain_capacity` bytes large.
    pub fn with_limits(pool_capacity: usize, retain_capacity: usize) -> Self {
        Self {
            free: ArrayQueue::new(pool_capacity.max(1)),
            retain_capacity,
        }
    }

    /// The process-wide pool backing [`crate::Buffer`].
    pub fn global() -> &'static BufferPool {
        &GLOBAL_POOL
    }

    /// Take an unused storage, allocating only when the pool is empty.
    pub fn acquire(&self) -> BytesMut {
        match self.free.pop() {
            Some(storage) => storage,
            None => BytesMut::with_capacity(INITIAL_STORAGE_CAPACITY),
        }
    }

    /// Clear a storage and return it to the pool.
    pub fn release(&self, mut storage: BytesMut) {
        if storage.capacity() > self.retain_capacity {
            trace!(capacity = storage.capacity(), "dropping oversized storage");
            return;
        }
        storage.clear();
        // A full pool simply drops the storage.
        let _ = self.free.push(storage);
    }

    /// Number of idle storages currently held.
    pub fn available(&self) -> usize {
        self.free.len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("available", &self.free.len())
            .field("capacity", &self.free.capacity())
            .field("retain_capacity", &self.retain_capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::BufMut;

    use super::*;

    #[test]
    fn test_acquire_reuses_released_storage() {
        let pool = BufferPool::with_limits(4, 1024);
        let mut storage = pool.acquire();
        storage.put_slice(b"scratch");
        pool.release(storage);
        assert_eq!(pool.available(), 1);

        let reused = pool.acquire();
        assert!(reused.is_empty(), "released storage must be cleared");
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_oversized_storage_is_not_retained() {
        let pool = BufferPool::with_limits(4, 64);
        let mut storage = pool.acquire();
        storage.put_slice(&[0u8; 512]);
        pool.release(storage);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_full_pool_drops_extra_storage() {
        let pool = BufferPool::with_limits(2, 1024);
        for _ in 0..5 {
            pool.release(BytesMut::with_capacity(8));
        }
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_concurrent_acquire_release() {
        let pool = Arc::new(BufferPool::with_limits(64, 4096));
        let workers: Vec<_> = (0..8)
            .map(|worker| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    for i in 0..500u32 {
                        let mut storage = pool.acquire();
                        assert!(storage.is_empty());
                        storage.put_u32_le(worker * 1000 + i);
                        pool.release(storage);
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().expect("worker should finish");
        }
        assert!(pool.available() <= 64);
    }
}
