//! Reusable byte buffer pool
//!
//! Amortizes large part-sized allocations across the chunks of a single
//! pipeline. A slot semaphore caps outstanding buffers, which is what
//! bounds pipeline memory when the consumer is slow.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::error::{Result, SluiceError};

/// Thread-safe pool of fixed-size buffers
pub struct BufferPool {
    free: Mutex<Vec<BytesMut>>,
    slots: Semaphore,
    buf_size: AtomicUsize,
    max_cached: usize,
}

impl BufferPool {
    /// Create a pool handing out buffers of `buf_size` bytes, with at
    /// most `max_outstanding` alive at any instant.
    pub fn new(buf_size: usize, max_outstanding: usize) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::new()),
            slots: Semaphore::new(max_outstanding),
            buf_size: AtomicUsize::new(buf_size),
            max_cached: max_outstanding,
        })
    }

    /// Current target buffer capacity in bytes
    pub fn buffer_size(&self) -> usize {
        self.buf_size.load(Ordering::Acquire)
    }

    /// Switch the pool to a larger buffer size.
    ///
    /// Cached buffers of the old size are discarded; buffers already out
    /// are dropped on release because their capacity no longer matches.
    pub fn retarget(&self, new_size: usize) {
        self.buf_size.store(new_size, Ordering::Release);
        self.free.lock().clear();
    }

    /// Acquire a buffer, waiting while the outstanding cap is reached.
    ///
    /// Buffer contents are undefined; callers must not read stale bytes.
    /// Fails once the pool has been closed.
    pub async fn acquire(&self) -> Result<BytesMut> {
        let permit = self
            .slots
            .acquire()
            .await
            .map_err(|_| SluiceError::PoolClosed)?;
        permit.forget();
        let size = self.buffer_size();
        let recycled = self.free.lock().pop();
        Ok(match recycled {
            Some(buf) if buf.capacity() >= size => buf,
            _ => BytesMut::with_capacity(size),
        })
    }

    /// Return a buffer. Excess or stale-size buffers are dropped.
    pub fn release(&self, mut buf: BytesMut) {
        buf.clear();
        let size = self.buffer_size();
        {
            let mut free = self.free.lock();
            if free.len() < self.max_cached && buf.capacity() >= size {
                free.push(buf);
            }
        }
        if !self.slots.is_closed() {
            self.slots.add_permits(1);
        }
    }

    /// Give back a slot whose buffer cannot be reclaimed.
    pub fn forfeit(&self) {
        if !self.slots.is_closed() {
            self.slots.add_permits(1);
        }
    }

    /// Discard cached buffers and fail pending and future acquires.
    pub fn close(&self) {
        self.slots.close();
        self.free.lock().clear();
    }

    /// Number of cached buffers currently available
    pub fn cached(&self) -> usize {
        self.free.lock().len()
    }
}
