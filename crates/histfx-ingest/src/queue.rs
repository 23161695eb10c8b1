//! Work queues and the stage handoff
//!
//! A stage drains `current`, routes finished units into `next`, and once
//! `current.join()` returns, `next.dump(&current, None)` primes the following
//! stage. `join()` only returns when every unit handed out has been matched by
//! a `task_done()`, which is the backpressure point between stages.

use crate::record::Record;
use histfx_common::{HistfxError, Result};
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// The half of the queue contract stage code sees.
///
/// In-process this is a [`Records`] queue; inside a stage worker process it is
/// a pipe back to the parent, which applies the calls to its own queues.
pub trait QueueHandle: Send + Sync {
    fn put(&self, record: Record) -> Result<()>;
    fn task_done(&self) -> Result<()>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Count of outstanding tasks with a blocking wait for zero.
#[derive(Debug, Default)]
pub struct TaskCounter {
    pending: Mutex<usize>,
    settled: Condvar,
}

impl TaskCounter {
    pub fn add(&self, n: usize) {
        *lock(&self.pending) += n;
    }

    /// Mark one task finished. Errors if nothing is outstanding.
    pub fn done(&self) -> Result<()> {
        let mut pending = lock(&self.pending);
        if *pending == 0 {
            return Err(HistfxError::queue("task_done() called more times than items were queued"));
        }
        *pending -= 1;
        if *pending == 0 {
            self.settled.notify_all();
        }
        Ok(())
    }

    /// Forget up to `n` tasks that left without being processed.
    pub fn release(&self, n: usize) {
        let mut pending = lock(&self.pending);
        *pending = pending.saturating_sub(n);
        if *pending == 0 {
            self.settled.notify_all();
        }
    }

    pub fn pending(&self) -> usize {
        *lock(&self.pending)
    }

    /// Block until the count reaches zero.
    pub fn wait(&self) {
        let mut pending = lock(&self.pending);
        while *pending > 0 {
            pending = self
                .settled
                .wait(pending)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// FIFO of records. A `None` entry is the closed sentinel.
#[derive(Debug, Default)]
pub struct Records {
    items: Mutex<VecDeque<Option<Record>>>,
    available: Condvar,
    tasks: TaskCounter,
}

impl Records {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, record: Record) {
        // Counted before it becomes visible, so a consumer's task_done never
        // runs ahead of it.
        self.tasks.add(1);
        lock(&self.items).push_back(Some(record));
        self.available.notify_one();
    }

    /// Append the sentinel. Consumers that reach it stop.
    pub fn close(&self) {
        lock(&self.items).push_back(None);
        self.available.notify_all();
    }

    /// Take the next entry, blocking while the queue is empty.
    ///
    /// Returns `None` when the sentinel is reached.
    pub fn get(&self) -> Option<Record> {
        let mut items = lock(&self.items);
        loop {
            if let Some(entry) = items.pop_front() {
                return entry;
            }
            items = self
                .available
                .wait(items)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn task_done(&self) -> Result<()> {
        self.tasks.done()
    }

    /// Block until every queued unit has been marked done or dumped away.
    pub fn join(&self) {
        self.tasks.wait();
    }

    /// Entries currently queued, the sentinel included.
    pub fn size(&self) -> usize {
        lock(&self.items).len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Unfinished task count.
    pub fn unfinished(&self) -> usize {
        self.tasks.pending()
    }

    /// Move up to `limit` units (all when `None`) into `dst`, front first.
    ///
    /// Stops at the sentinel, consuming it. Units past the limit stay here in
    /// their original order. Returns how many units moved.
    pub fn dump(&self, dst: &Records, limit: Option<usize>) -> usize {
        let moved = self.take(limit);
        let count = moved.len();
        for record in moved {
            dst.put(record);
        }
        count
    }

    /// Remove and return every unit up to the sentinel.
    pub fn drain(&self) -> Vec<Record> {
        self.take(None)
    }

    fn take(&self, limit: Option<usize>) -> Vec<Record> {
        let cap = limit.unwrap_or(usize::MAX);
        let mut taken = Vec::new();
        {
            let mut items = lock(&self.items);
            while taken.len() < cap {
                match items.pop_front() {
                    Some(Some(record)) => taken.push(record),
                    Some(None) | None => break,
                }
            }
        }
        self.tasks.release(taken.len());
        taken
    }
}

impl QueueHandle for Records {
    fn put(&self, record: Record) -> Result<()> {
        Records::put(self, record);
        Ok(())
    }

    fn task_done(&self) -> Result<()> {
        Records::task_done(self)
    }
}

impl FromIterator<Record> for Records {
    fn from_iter<I: IntoIterator<Item = Record>>(iter: I) -> Self {
        let queue = Records::new();
        for record in iter {
            queue.put(record);
        }
        queue
    }
}
