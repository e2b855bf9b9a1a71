//! Kernel workspace accounting
//!
//! Backward kernels need scratch memory (the dQ accumulator, or the
//! per-key-block dQ partials in deterministic mode). The amount depends on
//! the problem shape, so it is drawn from the device's pool when the kernel
//! executes, not when it is enqueued. Exhaustion is therefore an
//! asynchronous device failure.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScratchError {
    #[error("out of workspace memory: requested {requested} bytes, {available} of {limit} available")]
    OutOfMemory {
        requested: usize,
        available: usize,
        limit: usize,
    },
}

pub type ScratchResult<T> = Result<T, ScratchError>;

/// Device-wide workspace pool. `limit = None` means unbounded.
#[derive(Debug)]
pub struct WorkspacePool {
    limit: Option<usize>,
    in_use: AtomicUsize,
    peak: AtomicUsize,
}

impl WorkspacePool {
    pub fn new(limit: Option<usize>) -> Self {
        WorkspacePool {
            limit,
            in_use: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    /// High-water mark since the pool was created
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }

    /// Reserve `bytes` until the returned reservation is dropped
    pub fn reserve(self: &Arc<Self>, bytes: usize) -> ScratchResult<WorkspaceReservation> {
        let mut current = self.in_use.load(Ordering::Acquire);
        loop {
            let next = current.saturating_add(bytes);
            if let Some(limit) = self.limit {
                if next > limit {
                    return Err(ScratchError::OutOfMemory {
                        requested: bytes,
                        available: limit.saturating_sub(current),
                        limit,
                    });
                }
            }
            match self.in_use.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.peak.fetch_max(next, Ordering::AcqRel);
                    tracing::trace!(
                        "WorkspacePool::reserve: {} bytes ({} in use)",
                        bytes,
                        next
                    );
                    return Ok(WorkspaceReservation {
                        pool: Arc::clone(self),
                        bytes,
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }
}

/// RAII reservation; returns its bytes to the pool on drop
#[derive(Debug)]
pub struct WorkspaceReservation {
    pool: Arc<WorkspacePool>,
    bytes: usize,
}

impl WorkspaceReservation {
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for WorkspaceReservation {
    fn drop(&mut self) {
        self.pool.in_use.fetch_sub(self.bytes, Ordering::AcqRel);
    }
}
