//! WorkerPool - resizable concurrency limiter for one tenant consumer
//!
//! Capacity and the count of outstanding permits live together under one
//! lock. Resizing only moves the admission threshold: permits already lent
//! out stay valid and are returned to the same structure, so shrinking below
//! the current in-flight count simply blocks admission until enough of them
//! come back.

use std::sync::Arc;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

struct PoolState {
    capacity: u32,
    outstanding: u32,
}

struct PoolInner {
    state: Mutex<PoolState>,
    /// Signalled when a slot may have opened up
    slot_freed: Notify,
    /// Signalled when outstanding drops to zero
    idle: Notify,
}

#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

/// Right to run one unit of work. Released on drop.
pub struct PoolPermit {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Create a pool; capacity is clamped to at least 1
    pub fn new(capacity: u32) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    capacity: capacity.max(1),
                    outstanding: 0,
                }),
                slot_freed: Notify::new(),
                idle: Notify::new(),
            }),
        }
    }

    /// Wait until `outstanding < capacity`, then take a permit
    pub async fn acquire(&self) -> PoolPermit {
        loop {
            let notified = self.inner.slot_freed.notified();
            tokio::pin!(notified);
            // Register before checking so a release between the check and the
            // await is not missed.
            notified.as_mut().enable();

            if let Some(permit) = self.try_acquire() {
                return permit;
            }

            notified.await;
        }
    }

    pub fn try_acquire(&self) -> Option<PoolPermit> {
        let mut state = self.inner.state.lock();
        if state.outstanding >= state.capacity {
            return None;
        }
        state.outstanding += 1;
        Some(PoolPermit {
            inner: self.inner.clone(),
        })
    }

    /// Change the admission threshold. Returns the previous capacity.
    pub fn resize(&self, new_capacity: u32) -> u32 {
        let new_capacity = new_capacity.max(1);
        let (previous, outstanding) = {
            let mut state = self.inner.state.lock();
            let previous = state.capacity;
            state.capacity = new_capacity;
            (previous, state.outstanding)
        };

        debug!(
            previous = previous,
            capacity = new_capacity,
            outstanding = outstanding,
            "Worker pool resized"
        );

        if new_capacity > previous {
            self.inner.slot_freed.notify_waiters();
        }

        previous
    }

    /// Wait until no permits are outstanding
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inner.state.lock().outstanding == 0 {
                return;
            }

            notified.await;
        }
    }

    pub fn capacity(&self) -> u32 {
        self.inner.state.lock().capacity
    }

    pub fn in_flight(&self) -> u32 {
        self.inner.state.lock().outstanding
    }

    /// Free slots under the current capacity (zero while over capacity after a shrink)
    pub fn available(&self) -> u32 {
        let state = self.inner.state.lock();
        state.capacity.saturating_sub(state.outstanding)
    }
}

impl Drop for PoolPermit {
    fn drop(&mut self) {
        let (has_room, idle) = {
            let mut state = self.inner.state.lock();
            state.outstanding = state.outstanding.saturating_sub(1);
            (state.outstanding < state.capacity, state.outstanding == 0)
        };

        if has_room {
            self.inner.slot_freed.notify_one();
        }
        if idle {
            self.inner.idle.notify_waiters();
        }
    }
}
