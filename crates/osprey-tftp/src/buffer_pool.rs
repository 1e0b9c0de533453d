/// Buffer pool for reusing packet allocations
///
/// A transfer borrows one receive buffer and one send buffer for its whole
/// lifetime and gives them back when it ends, so steady-state transfers do
/// not allocate per packet.
use bytes::BytesMut;
use std::sync::{Arc, Mutex};

use crate::packet::MAX_PACKET_SIZE;

pub const DEFAULT_POOL_SIZE: usize = 64;

/// Receive buffers are larger than the biggest valid packet so an oversized
/// datagram is seen as oversized rather than silently truncated to fit.
pub const RECV_BUFFER_SIZE: usize = 1024;

/// The buffers one transfer owns exclusively while it runs.
#[derive(Debug)]
pub struct PacketBuffers {
    pub recv: Vec<u8>,
    pub send: BytesMut,
}

impl PacketBuffers {
    fn allocate() -> Self {
        Self {
            recv: vec![0u8; RECV_BUFFER_SIZE],
            send: BytesMut::with_capacity(MAX_PACKET_SIZE),
        }
    }
}

#[derive(Clone)]
pub struct BufferPool {
    pool: Arc<Mutex<Vec<PacketBuffers>>>,
    capacity: usize,
}

impl BufferPool {
    /// Create a pool that retains at most `capacity` buffer pairs
    pub fn new(capacity: usize) -> Self {
        let mut pool = Vec::with_capacity(capacity);

        // Pre-allocate some buffers
        for _ in 0..capacity / 2 {
            pool.push(PacketBuffers::allocate());
        }

        Self {
            pool: Arc::new(Mutex::new(pool)),
            capacity,
        }
    }

    pub fn new_default() -> Self {
        Self::new(DEFAULT_POOL_SIZE)
    }

    /// Borrow a buffer pair, allocating when the pool is empty
    pub fn acquire(&self) -> PooledBuffers {
        let buffers = self
            .pool
            .lock()
            .ok()
            .and_then(|mut pool| pool.pop())
            .unwrap_or_else(PacketBuffers::allocate);

        PooledBuffers {
            buffers: Some(buffers),
            pool: self.clone(),
        }
    }

    fn release(&self, mut buffers: PacketBuffers) {
        // A poisoned pool just stops recycling.
        if let Ok(mut pool) = self.pool.lock() {
            // Only return to pool if we're not at capacity
            if pool.len() < self.capacity {
                buffers.send.clear();
                pool.push(buffers);
            }
        }
    }

    /// Buffer pairs currently idle in the pool.
    pub fn available(&self) -> usize {
        self.pool.lock().map(|pool| pool.len()).unwrap_or(0)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new_default()
    }
}

/// Borrowed buffers that return to their pool when dropped
pub struct PooledBuffers {
    buffers: Option<PacketBuffers>,
    pool: BufferPool,
}

impl std::ops::Deref for PooledBuffers {
    type Target = PacketBuffers;

    fn deref(&self) -> &Self::Target {
        self.buffers
            .as_ref()
            .unwrap_or_else(|| unreachable!("buffers are only taken in drop"))
    }
}

impl std::ops::DerefMut for PooledBuffers {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buffers
            .as_mut()
            .unwrap_or_else(|| unreachable!("buffers are only taken in drop"))
    }
}

impl Drop for PooledBuffers {
    fn drop(&mut self) {
        if let Some(buffers) = self.buffers.take() {
            self.pool.release(buffers);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_return_to_the_pool_on_drop() {
        let pool = BufferPool::new(4);
        assert_eq!(pool.available(), 2);

        let first = pool.acquire();
        let second = pool.acquire();
        let third = pool.acquire();
        assert_eq!(pool.available(), 0);
        assert_eq!(third.recv.len(), RECV_BUFFER_SIZE);

        drop(first);
        drop(second);
        drop(third);
        assert_eq!(pool.available(), 3);
    }

    #[test]
    fn pool_never_grows_past_capacity() {
        let pool = BufferPool::new(2);
        let held: Vec<_> = (0..5).map(|_| pool.acquire()).collect();
        drop(held);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn released_send_buffer_is_cleared() {
        let pool = BufferPool::new(1);
        {
            let mut buffers = pool.acquire();
            buffers.send.extend_from_slice(b"stale");
        }
        assert!(pool.acquire().send.is_empty());
    }
}
