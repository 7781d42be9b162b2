//! Bounded memory accounting for buffered column data.
//!
//! One [`Allocator`] is shared across every iterator of a request (or of the
//! whole process); it is the only resource intentionally shared across
//! concurrent reads, so its counters are plain atomics.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::{Error, Result};

/// Tracks and bounds the bytes of buffered column data currently alive.
#[derive(Debug, Default)]
pub struct Allocator {
    limit: Option<usize>,
    allocated: AtomicUsize,
    max_allocated: AtomicUsize,
}

impl Allocator {
    /// An allocator that never rejects a request.
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// An allocator limited to `limit` bytes outstanding.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    /// Bytes currently accounted and not yet freed.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// High-water mark of [`allocated`](Self::allocated) over the allocator's
    /// lifetime.
    pub fn max_allocated(&self) -> usize {
        self.max_allocated.load(Ordering::Relaxed)
    }

    /// Account `size` additional bytes, failing fast if that would exceed the
    /// limit. Relaxed ordering suffices: the counter synchronizes nothing
    /// beyond itself.
    fn account(&self, size: usize) -> Result<()> {
        match self.limit {
            None => {
                self.allocated.fetch_add(size, Ordering::Relaxed);
            }
            Some(limit) => {
                let headroom = limit.checked_sub(size).ok_or(Error::MemoryExhausted {
                    requested: size,
                    allocated: self.allocated(),
                    limit,
                })?;
                self.allocated
                    .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                        // cannot overflow: current + size <= limit
                        (current <= headroom).then_some(current + size)
                    })
                    .map_err(|current| Error::MemoryExhausted {
                        requested: size,
                        allocated: current,
                        limit,
                    })?;
            }
        }
        self.max_allocated
            .fetch_max(self.allocated(), Ordering::Relaxed);
        Ok(())
    }

    /// Return `size` bytes to the allocator.
    fn free(&self, size: usize) {
        self.allocated.fetch_sub(size, Ordering::Relaxed);
    }

    /// Account `bytes` and return a guard that frees whatever it still holds
    /// when dropped.
    pub fn reserve(self: &Arc<Self>, bytes: usize) -> Result<Reservation> {
        self.account(bytes)?;
        Ok(Reservation {
            alloc: Arc::clone(self),
            bytes,
        })
    }
}

/// An accounted amount of memory. Freed exactly once: incrementally through
/// [`shrink_to`](Self::shrink_to) / [`release`](Self::release), with the
/// remainder returned on drop.
#[derive(Debug)]
pub struct Reservation {
    alloc: Arc<Allocator>,
    bytes: usize,
}

impl Reservation {
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Account `additional` bytes on top of this reservation.
    pub fn grow(&mut self, additional: usize) -> Result<()> {
        self.alloc.account(additional)?;
        self.bytes += additional;
        Ok(())
    }

    /// Free down to `bytes`. Growing via `shrink_to` is not possible; a
    /// target above the current size is a no-op.
    pub fn shrink_to(&mut self, bytes: usize) {
        if bytes < self.bytes {
            self.alloc.free(self.bytes - bytes);
            self.bytes = bytes;
        }
    }

    /// Free everything now rather than at drop.
    pub fn release(&mut self) {
        self.shrink_to(0);
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.alloc.free(self.bytes);
    }
}
