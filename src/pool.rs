//! Bounded worker pools.
//!
//! The coordinator runs three disjoint pools: *async* (query execution),
//! *reader* (metadata loads), and *writer*. Each wraps a dedicated
//! [`rayon::ThreadPool`] and adds enqueue-with-result and join semantics.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::StorageError;

struct Slot {
    result: Mutex<Option<Result<(), StorageError>>>,
    done: Condvar,
}

/// A handle to a task enqueued on a [`ThreadPool`].
pub struct TaskHandle {
    slot: Arc<Slot>,
}

impl TaskHandle {
    /// Block until the task finishes and return its result.
    pub fn wait(self) -> Result<(), StorageError> {
        let mut result = self.slot.result.lock();
        while result.is_none() {
            self.slot.done.wait(&mut result);
        }
        result.take().unwrap_or(Ok(()))
    }
}

struct Outstanding {
    count: Mutex<usize>,
    zero: Condvar,
}

/// A bounded pool of worker threads.
pub struct ThreadPool {
    pool: rayon::ThreadPool,
    outstanding: Arc<Outstanding>,
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("num_threads", &self.num_threads())
            .finish()
    }
}

impl ThreadPool {
    /// Create a pool with `num_threads` workers.
    pub fn new(num_threads: usize) -> Result<Self, StorageError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()
            .map_err(|err| StorageError::Internal(format!("thread pool init: {err}")))?;
        Ok(Self {
            pool,
            outstanding: Arc::new(Outstanding {
                count: Mutex::new(0),
                zero: Condvar::new(),
            }),
        })
    }

    /// The number of worker threads.
    #[must_use]
    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Submit `work` for execution and return a waitable handle.
    pub fn enqueue<F>(&self, work: F) -> TaskHandle
    where
        F: FnOnce() -> Result<(), StorageError> + Send + 'static,
    {
        let slot = Arc::new(Slot {
            result: Mutex::new(None),
            done: Condvar::new(),
        });
        *self.outstanding.count.lock() += 1;
        let task_slot = slot.clone();
        let outstanding = self.outstanding.clone();
        self.pool.spawn(move || {
            let result = work();
            *task_slot.result.lock() = Some(result);
            task_slot.done.notify_all();
            let mut count = outstanding.count.lock();
            *count -= 1;
            if *count == 0 {
                outstanding.zero.notify_all();
            }
        });
        TaskHandle { slot }
    }

    /// Run `op` inside this pool, so that `rayon` parallel iterators used by
    /// `op` execute on these workers.
    pub fn install<R: Send>(&self, op: impl FnOnce() -> R + Send) -> R {
        self.pool.install(op)
    }

    /// Block until every enqueued task has finished.
    pub fn join(&self) {
        let mut count = self.outstanding.count.lock();
        while *count > 0 {
            self.outstanding.zero.wait(&mut count);
        }
    }
}
