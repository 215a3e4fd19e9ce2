//! Bounded-concurrency admission gate for process invocations.
//!
//! Every discovery and test run acquires a [`TaskPermit`] from the shared
//! [`TaskPool`] before spawning. At most `max_task_count` tasks run at once
//! (a lowered limit takes effect as running tasks finish) and waiters are
//! admitted strictly in arrival order.
//!
//! # Example
//!
//! ```
//! use testmate::pool::TaskPool;
//!
//! # tokio_test::block_on(async {
//! let pool = TaskPool::new(2);
//! let answer = pool.schedule(async { 40 + 2 }).await;
//! assert_eq!(answer, 42);
//! assert_eq!(pool.running(), 0);
//! # });
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{error, warn};

struct PoolState {
    max: usize,
    running: usize,
    /// Permits still to be retired after the limit was lowered below the
    /// number of running tasks.
    excess: usize,
}

struct PoolInner {
    semaphore: Arc<Semaphore>,
    state: Mutex<PoolState>,
    waiting: AtomicUsize,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared admission gate. Cloning yields another handle to the same pool.
#[derive(Clone)]
pub struct TaskPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("TaskPool")
            .field("max", &state.max)
            .field("running", &state.running)
            .field("waiting", &self.inner.waiting.load(Ordering::SeqCst))
            .finish()
    }
}

/// Holds one slot of the pool until dropped.
pub struct TaskPermit {
    inner: Arc<PoolInner>,
    permit: Option<OwnedSemaphorePermit>,
}

impl std::fmt::Debug for TaskPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPermit").finish_non_exhaustive()
    }
}

impl Drop for TaskPermit {
    fn drop(&mut self) {
        let mut state = self.inner.lock();
        state.running = state.running.saturating_sub(1);
        if let Some(permit) = self.permit.take()
            && state.excess > 0
        {
            state.excess -= 1;
            permit.forget();
        }
    }
}

/// Counts a pending `acquire` until it is admitted or dropped.
struct Waiting<'a>(&'a AtomicUsize);

impl<'a> Waiting<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl TaskPool {
    /// Creates a pool admitting up to `max_task_count` tasks at once.
    pub fn new(max_task_count: usize) -> Self {
        let max = clamp_max(max_task_count);
        Self {
            inner: Arc::new(PoolInner {
                semaphore: Arc::new(Semaphore::new(max)),
                state: Mutex::new(PoolState {
                    max,
                    running: 0,
                    excess: 0,
                }),
                waiting: AtomicUsize::new(0),
            }),
        }
    }

    /// Waits for a free slot. Waiters are admitted in arrival order.
    ///
    /// Dropping the returned future before admission abandons the place in
    /// the queue; a slot already handed to it passes on to the next waiter.
    pub async fn acquire(&self) -> TaskPermit {
        let acquired = {
            let _waiting = Waiting::enter(&self.inner.waiting);
            self.inner.semaphore.clone().acquire_owned().await
        };
        let permit = match acquired {
            Ok(permit) => Some(permit),
            // The semaphore is never closed.
            Err(e) => {
                error!("Task pool unavailable ({}), admitting without a slot", e);
                None
            }
        };
        self.inner.lock().running += 1;
        TaskPermit {
            inner: self.inner.clone(),
            permit,
        }
    }

    /// Runs `task` once admitted and returns its result.
    pub async fn schedule<F, T>(&self, task: F) -> T
    where
        F: Future<Output = T>,
    {
        let _permit = self.acquire().await;
        task.await
    }

    /// Changes the concurrency limit. Running tasks are not interrupted; a
    /// higher limit admits waiters immediately.
    pub fn set_max_task_count(&self, max_task_count: usize) {
        let max = clamp_max(max_task_count);
        let mut state = self.inner.lock();
        if max > state.max {
            let mut grow = max - state.max;
            let repaid = grow.min(state.excess);
            state.excess -= repaid;
            grow -= repaid;
            self.inner.semaphore.add_permits(grow);
        } else if max < state.max {
            let shrink = state.max - max;
            let forgotten = self.inner.semaphore.forget_permits(shrink);
            state.excess += shrink - forgotten;
        }
        state.max = max;
    }

    pub fn max_task_count(&self) -> usize {
        self.inner.lock().max
    }

    /// Number of permits currently held.
    pub fn running(&self) -> usize {
        self.inner.lock().running
    }

    /// Number of tasks waiting for admission.
    pub fn waiting(&self) -> usize {
        self.inner.waiting.load(Ordering::SeqCst)
    }
}

fn clamp_max(max: usize) -> usize {
    if max == 0 {
        warn!("Parallel execution limit of 0 is invalid, using 1");
        1
    } else {
        max
    }
}
