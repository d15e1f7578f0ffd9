// Packet buffer pool
//
// Fixed-size buffers are handed out as `PooledBuffer` guards. Dropping the
// guard puts the buffer back on the free list, so every exit path of the
// pipeline (forwarded, delivered, dropped, expired) returns it. When the
// free list is empty a fresh buffer is allocated and counted as a miss; the
// list never grows past its configured size.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

struct PoolShared {
    free: Mutex<Vec<Vec<u8>>>,
    buffer_size: usize,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl PoolShared {
    fn release(&self, mut data: Vec<u8>) {
        if data.capacity() < self.buffer_size {
            return;
        }
        data.resize(self.buffer_size, 0);
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(data);
        }
    }
}

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub available: usize,
    pub hits: u64,
    pub misses: u64,
    /// Fraction of acquisitions served from the free list
    pub reuse_rate: f64,
}

/// Shared handle to a free list of equally sized buffers.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    /// Pre-allocate `pool_size` buffers of `buffer_size` bytes.
    pub fn new(pool_size: usize, buffer_size: usize) -> Self {
        let free = (0..pool_size).map(|_| vec![0u8; buffer_size]).collect();
        Self {
            shared: Arc::new(PoolShared {
                free: Mutex::new(free),
                buffer_size,
                capacity: pool_size,
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
            }),
        }
    }

    /// Take a buffer of exactly `buffer_size` bytes.
    ///
    /// Contents are whatever the previous holder left; callers overwrite
    /// the whole buffer before reading it.
    pub fn acquire(&self) -> PooledBuffer {
        let reused = self.shared.free.lock().pop();
        let data = match reused {
            Some(buf) => {
                self.shared.hits.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => {
                self.shared.misses.fetch_add(1, Ordering::Relaxed);
                vec![0u8; self.shared.buffer_size]
            }
        };
        PooledBuffer {
            data,
            home: Some(Arc::clone(&self.shared)),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.shared.buffer_size
    }

    pub fn stats(&self) -> PoolStats {
        let hits = self.shared.hits.load(Ordering::Relaxed);
        let misses = self.shared.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        PoolStats {
            capacity: self.shared.capacity,
            available: self.shared.free.lock().len(),
            hits,
            misses,
            reuse_rate: if total == 0 { 1.0 } else { hits as f64 / total as f64 },
        }
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.shared.buffer_size)
            .field("capacity", &self.shared.capacity)
            .finish()
    }
}

/// A buffer on loan from a [`BufferPool`], returned on drop.
pub struct PooledBuffer {
    data: Vec<u8>,
    home: Option<Arc<PoolShared>>,
}

impl PooledBuffer {
    /// Wrap an owned vector that belongs to no pool.
    pub fn detached(data: Vec<u8>) -> Self {
        Self { data, home: None }
    }

    pub fn is_pooled(&self) -> bool {
        self.home.is_some()
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(home) = self.home.take() {
            home.release(std::mem::take(&mut self.data));
        }
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.data.len())
            .field("pooled", &self.home.is_some())
            .finish()
    }
}
