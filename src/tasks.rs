//! A cancellable task queue over a worker pool.
//!
//! Every unit of work is enqueued with a paired cancel hook. For each task
//! exactly one of the two runs: either the work begins, or the task is
//! cancelled before it begins and its hook runs instead. The guarantee rests
//! on a single guarded phase transition per task.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::StorageError;
use crate::pool::{TaskHandle, ThreadPool};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Phase {
    Queued,
    Running,
    Cancelled,
}

type CancelFn = Box<dyn FnOnce() + Send>;

struct Task {
    phase: Mutex<Phase>,
    on_cancel: Mutex<Option<CancelFn>>,
}

impl Task {
    // Take the cancel hook iff the task has not started. The phase lock makes
    // this transition atomic with respect to the worker's Queued -> Running
    // transition.
    fn cancel(&self) -> Option<CancelFn> {
        let mut phase = self.phase.lock();
        if *phase == Phase::Queued {
            *phase = Phase::Cancelled;
            self.on_cancel.lock().take()
        } else {
            None
        }
    }

    fn begin(&self) -> bool {
        let mut phase = self.phase.lock();
        if *phase == Phase::Queued {
            *phase = Phase::Running;
            true
        } else {
            false
        }
    }
}

#[derive(Default)]
struct Registry {
    cancelling: bool,
    tasks: Vec<Weak<Task>>,
}

/// Tracks queued-but-not-started tasks so they can be cancelled as a group.
#[derive(Default)]
pub struct CancelableTasks {
    registry: Mutex<Registry>,
}

impl CancelableTasks {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Submit `work` onto `pool` with a paired `on_cancel` hook.
    ///
    /// If the task is cancelled before `work` begins, `on_cancel` runs
    /// instead and the returned handle yields [`StorageError::Cancelled`].
    /// A task enqueued while a cancellation sweep is underway is cancelled
    /// immediately.
    pub fn enqueue<W, C>(&self, pool: &ThreadPool, work: W, on_cancel: C) -> TaskHandle
    where
        W: FnOnce() -> Result<(), StorageError> + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        let task = Arc::new(Task {
            phase: Mutex::new(Phase::Queued),
            on_cancel: Mutex::new(Some(Box::new(on_cancel))),
        });
        {
            let mut registry = self.registry.lock();
            if registry.cancelling {
                drop(registry);
                if let Some(hook) = task.cancel() {
                    hook();
                }
            } else {
                registry.tasks.retain(|weak| weak.strong_count() > 0);
                registry.tasks.push(Arc::downgrade(&task));
            }
        }
        pool.enqueue(move || {
            if task.begin() {
                work()
            } else {
                Err(StorageError::Cancelled)
            }
        })
    }

    /// Cancel every queued-but-not-started task, running each cancel hook
    /// synchronously before returning.
    pub fn cancel_all(&self) {
        let tasks = {
            let mut registry = self.registry.lock();
            registry.cancelling = true;
            std::mem::take(&mut registry.tasks)
        };
        for task in tasks.iter().filter_map(Weak::upgrade) {
            if let Some(hook) = task.cancel() {
                hook();
            }
        }
        self.registry.lock().cancelling = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn work_or_cancel_exactly_once() {
        let pool = ThreadPool::new(1).unwrap();
        let tasks = CancelableTasks::new();
        let worked = Arc::new(AtomicUsize::new(0));
        let cancelled = Arc::new(AtomicUsize::new(0));

        // One task occupies the single worker so the rest stay queued; wait
        // until it has actually started before enqueueing them.
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let mut handles = vec![tasks.enqueue(
            &pool,
            move || {
                started_tx.send(()).unwrap();
                let _ = release_rx.recv();
                Ok(())
            },
            || {},
        )];
        started_rx.recv().unwrap();

        const N: usize = 8;
        for _ in 0..N {
            let worked = worked.clone();
            let cancelled = cancelled.clone();
            handles.push(tasks.enqueue(
                &pool,
                move || {
                    worked.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                move || {
                    cancelled.fetch_add(1, Ordering::SeqCst);
                },
            ));
        }

        tasks.cancel_all();
        release_tx.send(()).unwrap();
        for handle in handles {
            let _ = handle.wait();
        }
        assert_eq!(worked.load(Ordering::SeqCst) + cancelled.load(Ordering::SeqCst), N);
        assert_eq!(cancelled.load(Ordering::SeqCst), N);
    }

    #[test]
    fn enqueue_during_cancel_sweep_is_cancelled() {
        let pool = ThreadPool::new(1).unwrap();
        let tasks = CancelableTasks::new();
        {
            let mut registry = tasks.registry.lock();
            registry.cancelling = true;
        }
        let cancelled = Arc::new(AtomicUsize::new(0));
        let observed = cancelled.clone();
        let handle = tasks.enqueue(
            &pool,
            || Ok(()),
            move || {
                observed.fetch_add(1, Ordering::SeqCst);
            },
        );
        assert!(matches!(handle.wait(), Err(StorageError::Cancelled)));
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn completed_tasks_are_not_cancelled() {
        let pool = ThreadPool::new(2).unwrap();
        let tasks = CancelableTasks::new();
        let cancelled = Arc::new(AtomicUsize::new(0));
        let observed = cancelled.clone();
        let handle = tasks.enqueue(
            &pool,
            || Ok(()),
            move || {
                observed.fetch_add(1, Ordering::SeqCst);
            },
        );
        handle.wait().unwrap();
        tasks.cancel_all();
        assert_eq!(cancelled.load(Ordering::SeqCst), 0);
    }
}
