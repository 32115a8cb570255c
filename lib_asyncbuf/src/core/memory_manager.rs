//! # Global Memory Manager and Backpressure Mechanism
//!
//! This module provides the process-wide ledger of buffering memory. Every
//! stream buffer obtains its quota here, and every flushed batch gives its
//! bytes back here. It is the system's primary backpressure mechanism: when
//! the budget is exhausted, producers asking for more memory are parked until
//! a flush releases some.
//!
//! ## Core Functionality:
//!
//! - **Single Ledger**: the allocated-byte counter and the waiter queue live
//!   under one mutex, so `allocated_bytes <= max_bytes` holds at every point
//!   any caller can observe, and no reader ever sees a torn value.
//!
//! - **Partial Grants**: `allocate` hands out `min(requested, free)`. A stream
//!   that asks for a full block while only a sliver is free still makes
//!   progress instead of waiting for a whole block.
//!
//! - **FIFO Waiters**: when nothing is free, callers queue up. `release`
//!   serves them strictly in arrival order, and a new caller never jumps the
//!   queue while older callers are still waiting.
//!
//! - **Bounded Waits**: a queued caller gives up after the configured
//!   allocate timeout with [`BufferError::AllocationTimeout`]. A caller whose
//!   future is dropped withdraws from the queue (or returns a grant it was
//!   handed but never observed), so cancellation never leaks memory.
//!
//! The manager is an explicit pool object shared through an `Arc`, never a
//! global, so tests can create isolated pools.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::error::{BufferError, Result};

/// One parked `allocate` call.
struct Waiter {
    id: u64,
    requested: u64,
    responder: oneshot::Sender<u64>,
}

struct Ledger {
    allocated: u64,
    waiters: VecDeque<Waiter>,
    next_waiter_id: u64,
}

/// # Global Memory Manager
///
/// A thread-safe ledger of the bytes granted to stream buffers and in-flight
/// batches, bounded by a fixed maximum.
pub struct GlobalMemoryManager {
    /// The maximum number of bytes that may be allocated at once.
    max_bytes: u64,
    /// How long a parked `allocate` waits before failing.
    allocate_timeout: Duration,
    ledger: Mutex<Ledger>,
}

impl GlobalMemoryManager {
    /// Creates a new `GlobalMemoryManager` with a fixed budget.
    ///
    /// # Example
    /// ```rust
    /// use std::sync::Arc;
    /// use std::time::Duration;
    /// use lib_asyncbuf::core::memory_manager::GlobalMemoryManager;
    ///
    /// // Initialize with a 512MB limit.
    /// let memory = Arc::new(GlobalMemoryManager::new(512 * 1024 * 1024, Duration::from_secs(60)));
    /// assert_eq!(memory.allocated_bytes(), 0);
    /// ```
    pub fn new(max_bytes: u64, allocate_timeout: Duration) -> Self {
        Self {
            max_bytes,
            allocate_timeout,
            ledger: Mutex::new(Ledger {
                allocated: 0,
                waiters: VecDeque::new(),
                next_waiter_id: 0,
            }),
        }
    }

    /// # Allocate
    ///
    /// Grants up to `requested` bytes, never more than what is currently free.
    /// Waits (FIFO) when nothing is free.
    ///
    /// # Errors
    /// - [`BufferError::QuotaExceeded`] if `requested` alone exceeds the budget.
    /// - [`BufferError::AllocationTimeout`] if no memory was released in time.
    pub async fn allocate(&self, requested: u64) -> Result<u64> {
        if requested > self.max_bytes {
            return Err(BufferError::QuotaExceeded {
                requested,
                max: self.max_bytes,
            });
        }
        if requested == 0 {
            return Ok(0);
        }

        let mut pending = {
            let mut ledger = self.ledger.lock();
            if ledger.waiters.is_empty() {
                let free = self.max_bytes - ledger.allocated;
                if free > 0 {
                    let granted = requested.min(free);
                    ledger.allocated += granted;
                    trace!(requested, granted, allocated = ledger.allocated, "memory granted");
                    return Ok(granted);
                }
            }
            let id = ledger.next_waiter_id;
            ledger.next_waiter_id += 1;
            let (responder, receiver) = oneshot::channel();
            ledger.waiters.push_back(Waiter {
                id,
                requested,
                responder,
            });
            PendingGrant {
                manager: self,
                id,
                receiver,
                settled: false,
            }
        };

        debug!(requested, "memory budget exhausted, waiting for a release");
        let outcome = tokio::time::timeout(self.allocate_timeout, &mut pending.receiver).await;
        match outcome {
            Ok(Ok(granted)) => {
                pending.settled = true;
                Ok(granted)
            }
            Ok(Err(_)) => {
                pending.settled = true;
                Err(BufferError::Closed)
            }
            Err(_) => match pending.withdraw() {
                Some(granted) => Ok(granted),
                None => Err(BufferError::AllocationTimeout {
                    requested,
                    waited: self.allocate_timeout,
                }),
            },
        }
    }

    /// Non-blocking variant of [`allocate`](Self::allocate).
    ///
    /// Returns `0` when nothing is free or other callers are already queued.
    pub fn try_allocate(&self, requested: u64) -> u64 {
        let mut ledger = self.ledger.lock();
        if !ledger.waiters.is_empty() {
            return 0;
        }
        let granted = requested.min(self.max_bytes - ledger.allocated);
        ledger.allocated += granted;
        granted
    }

    /// # Release
    ///
    /// Returns `bytes` to the pool and hands the freed memory to queued
    /// callers in arrival order.
    pub fn release(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let mut ledger = self.ledger.lock();
        if bytes > ledger.allocated {
            warn!(
                bytes,
                allocated = ledger.allocated,
                "released more memory than allocated; clamping to zero"
            );
            ledger.allocated = 0;
        } else {
            ledger.allocated -= bytes;
        }

        while !ledger.waiters.is_empty() {
            let free = self.max_bytes - ledger.allocated;
            if free == 0 {
                break;
            }
            let Some(waiter) = ledger.waiters.pop_front() else {
                break;
            };
            let granted = waiter.requested.min(free);
            // A waiter whose receiver is gone simply does not get the grant.
            if waiter.responder.send(granted).is_ok() {
                ledger.allocated += granted;
                trace!(waiter = waiter.id, granted, "memory handed to waiter");
            }
        }
    }

    /// Configured maximum in bytes.
    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Bytes currently granted and not yet released.
    pub fn allocated_bytes(&self) -> u64 {
        self.ledger.lock().allocated
    }

    /// Bytes that could be granted right now.
    pub fn available_bytes(&self) -> u64 {
        self.max_bytes - self.ledger.lock().allocated
    }

    /// Number of parked `allocate` calls.
    pub fn waiting(&self) -> usize {
        self.ledger.lock().waiters.len()
    }

    /// Allocated bytes as a share of the maximum, in `[0, 1]`.
    pub fn usage_ratio(&self) -> f64 {
        if self.max_bytes == 0 {
            0.0
        } else {
            self.allocated_bytes() as f64 / self.max_bytes as f64
        }
    }

    /// Calculates the current memory usage as a percentage of the total capacity.
    /// Useful for monitoring and diagnostics.
    pub fn usage_percent(&self) -> f64 {
        self.usage_ratio() * 100.0
    }
}

/// A queued `allocate` call. Dropping it unsettled withdraws from the queue
/// and returns any grant that raced with the drop.
struct PendingGrant<'a> {
    manager: &'a GlobalMemoryManager,
    id: u64,
    receiver: oneshot::Receiver<u64>,
    settled: bool,
}

impl PendingGrant<'_> {
    /// Leaves the queue. Returns the grant if `release` served us first.
    fn withdraw(&mut self) -> Option<u64> {
        self.settled = true;
        {
            let mut ledger = self.manager.ledger.lock();
            if let Some(pos) = ledger.waiters.iter().position(|w| w.id == self.id) {
                ledger.waiters.remove(pos);
                return None;
            }
        }
        self.receiver.try_recv().ok()
    }
}

impl Drop for PendingGrant<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Some(granted) = self.withdraw() {
            self.manager.release(granted);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    fn manager(max: u64) -> Arc<GlobalMemoryManager> {
        Arc::new(GlobalMemoryManager::new(max, Duration::from_secs(30)))
    }

    #[tokio::test]
    async fn grants_at_most_what_is_free() {
        let memory = manager(1000);
        assert_eq!(memory.allocate(600).await.unwrap(), 600);
        assert_eq!(memory.allocate(600).await.unwrap(), 400);
        assert_eq!(memory.allocated_bytes(), 1000);
        assert_eq!(memory.available_bytes(), 0);
        assert_eq!(memory.try_allocate(10), 0);
        assert!((memory.usage_percent() - 100.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn oversized_request_fails_immediately() {
        let memory = manager(1000);
        let err = memory.allocate(1001).await.unwrap_err();
        assert!(matches!(
            err,
            BufferError::QuotaExceeded {
                requested: 1001,
                max: 1000
            }
        ));
        assert_eq!(memory.allocated_bytes(), 0);
        assert_eq!(memory.allocate(0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn blocked_caller_is_served_by_release() {
        let memory = manager(100);
        assert_eq!(memory.allocate(100).await.unwrap(), 100);

        let waiter = {
            let memory = Arc::clone(&memory);
            tokio::spawn(async move { memory.allocate(50).await })
        };
        while memory.waiting() == 0 {
            tokio::task::yield_now().await;
        }

        memory.release(30);
        assert_eq!(waiter.await.unwrap().unwrap(), 30);
        assert_eq!(memory.allocated_bytes(), 100);
    }

    #[tokio::test]
    async fn waiters_are_served_in_arrival_order() {
        let memory = manager(100);
        memory.allocate(100).await.unwrap();

        let first = {
            let memory = Arc::clone(&memory);
            tokio::spawn(async move { memory.allocate(40).await })
        };
        while memory.waiting() < 1 {
            tokio::task::yield_now().await;
        }
        let second = {
            let memory = Arc::clone(&memory);
            tokio::spawn(async move { memory.allocate(40).await })
        };
        while memory.waiting() < 2 {
            tokio::task::yield_now().await;
        }

        // A newcomer must not overtake the queue even when memory frees up.
        memory.release(40);
        assert_eq!(memory.try_allocate(40), 0);
        assert_eq!(first.await.unwrap().unwrap(), 40);
        assert_eq!(memory.waiting(), 1);

        memory.release(40);
        assert_eq!(second.await.unwrap().unwrap(), 40);
        assert_eq!(memory.waiting(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_caller_times_out() {
        let memory = Arc::new(GlobalMemoryManager::new(10, Duration::from_secs(5)));
        memory.allocate(10).await.unwrap();

        let err = memory.allocate(5).await.unwrap_err();
        assert!(matches!(
            err,
            BufferError::AllocationTimeout { requested: 5, .. }
        ));
        assert!(err.is_retryable());
        assert_eq!(memory.waiting(), 0);
        assert_eq!(memory.allocated_bytes(), 10);
    }

    #[tokio::test]
    async fn cancelled_waiter_does_not_leak() {
        let memory = manager(100);
        memory.allocate(100).await.unwrap();

        let waiter = {
            let memory = Arc::clone(&memory);
            tokio::spawn(async move { memory.allocate(60).await })
        };
        while memory.waiting() == 0 {
            tokio::task::yield_now().await;
        }
        waiter.abort();
        let _ = waiter.await;

        assert_eq!(memory.waiting(), 0);
        memory.release(100);
        assert_eq!(memory.allocated_bytes(), 0);
    }

    #[tokio::test]
    async fn over_release_is_clamped() {
        let memory = manager(100);
        memory.allocate(10).await.unwrap();
        memory.release(50);
        assert_eq!(memory.allocated_bytes(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn allocated_never_exceeds_max_under_contention() {
        const MAX: u64 = 1_000;
        let memory = manager(MAX);
        let peak = Arc::new(AtomicU64::new(0));

        let mut handles = Vec::new();
        for task in 0..16u64 {
            let memory = Arc::clone(&memory);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                for round in 0..200u64 {
                    let want = 1 + (task * 37 + round * 11) % 300;
                    let granted = memory.allocate(want).await.unwrap();
                    assert!(granted >= 1 && granted <= want);
                    let seen = memory.allocated_bytes();
                    assert!(seen <= MAX);
                    peak.fetch_max(seen, Ordering::Relaxed);
                    tokio::task::yield_now().await;
                    memory.release(granted);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::Relaxed) <= MAX);
        assert_eq!(memory.allocated_bytes(), 0);
    }
}
