// src/task.rs
//! Deferred work shared by every worker of a queue.
//!
//! Tasks are pushed from any thread into a mutex-guarded priority heap and a
//! shared eventfd is bumped once per task. Each wake pops at most one task;
//! a worker that reads a counter above one writes the remainder back so the
//! kernel wakes another worker. The forwarding spreads load on a best-effort
//! basis only: nothing guarantees which worker runs which task.

use crate::syscalls;
use libc::c_int;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{error, trace, warn};

pub const PRIORITY_LOWEST: u8 = 0;
pub const PRIORITY_LOW: u8 = 63;
pub const PRIORITY_NORMAL: u8 = 127;
pub const PRIORITY_HIGH: u8 = 191;
pub const PRIORITY_HIGHEST: u8 = 255;

const GROUP_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub type ExecuteFn = Box<dyn FnOnce(&AsyncTask) -> bool + Send>;
pub type CompleteFn = Box<dyn FnOnce(&AsyncTask, bool) + Send>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A unit of deferred work.
///
/// Execute callbacks run on whichever worker pops the task. Complete
/// callbacks run there too, unless the task belongs to a group: then they run
/// on the thread that calls [`AsyncTaskGroup::update`].
pub struct AsyncTask {
    priority: u8,
    group: Option<Arc<AsyncTaskGroup>>,
    execute: Vec<ExecuteFn>,
    complete: Vec<CompleteFn>,
    successful: bool,
}

impl AsyncTask {
    pub fn new() -> Self {
        Self {
            priority: PRIORITY_NORMAL,
            group: None,
            execute: Vec::new(),
            complete: Vec::new(),
            successful: false,
        }
    }

    /// Build a task in one closure, optionally attached to `group`.
    pub fn prepare<F>(group: Option<Arc<AsyncTaskGroup>>, f: F) -> Self
    where
        F: FnOnce(&mut AsyncTask),
    {
        let mut task = Self::new();
        task.group = group;
        f(&mut task);
        task
    }

    pub fn add_execute_fn<F>(&mut self, f: F)
    where
        F: FnOnce(&AsyncTask) -> bool + Send + 'static,
    {
        self.execute.push(Box::new(f));
    }

    pub fn add_complete_fn<F>(&mut self, f: F)
    where
        F: FnOnce(&AsyncTask, bool) + Send + 'static,
    {
        self.complete.push(Box::new(f));
    }

    pub fn set_priority(&mut self, priority: u8) {
        self.priority = priority;
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn group(&self) -> Option<&Arc<AsyncTaskGroup>> {
        self.group.as_ref()
    }

    pub fn set_successful(&mut self, value: bool) {
        self.successful = value;
    }

    pub fn is_successful(&self) -> bool {
        self.successful
    }

    /// Run execute callbacks in order; stops at the first one that fails.
    pub fn execute(&mut self) -> bool {
        let callbacks = std::mem::take(&mut self.execute);
        for cb in callbacks {
            if !cb(self) {
                return false;
            }
        }
        true
    }

    pub fn on_complete(&mut self) {
        let callbacks = std::mem::take(&mut self.complete);
        let successful = self.successful;
        for cb in callbacks {
            cb(self, successful);
        }
    }

    /// Execute and, for ungrouped tasks, complete.
    pub fn run(&mut self) {
        let successful = self.execute();
        self.set_successful(successful);
        if self.group.is_none() {
            self.on_complete();
        }
    }
}

impl Default for AsyncTask {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AsyncTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncTask")
            .field("priority", &self.priority)
            .field("grouped", &self.group.is_some())
            .field("execute", &self.execute.len())
            .field("complete", &self.complete.len())
            .field("successful", &self.successful)
            .finish()
    }
}

/// Collects finished tasks so their completion runs on the owner's thread.
pub struct AsyncTaskGroup {
    queue: Mutex<Vec<AsyncTask>>,
    condition: Condvar,
    added: AtomicUsize,
    completed: AtomicUsize,
    notify: Option<Box<dyn Fn() + Send + Sync>>,
}

impl AsyncTaskGroup {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(None))
    }

    /// Group whose `notify` runs on the worker thread every time a task of
    /// the group finishes.
    pub fn with_notify<F>(notify: F) -> Arc<Self>
    where
        F: Fn() + Send + Sync + 'static,
    {
        Arc::new(Self::build(Some(Box::new(notify))))
    }

    fn build(notify: Option<Box<dyn Fn() + Send + Sync>>) -> Self {
        Self {
            queue: Mutex::new(Vec::new()),
            condition: Condvar::new(),
            added: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            notify,
        }
    }

    pub fn on_added(&self) {
        self.added.fetch_add(1, Ordering::AcqRel);
    }

    pub fn on_performed(&self, task: AsyncTask) {
        lock(&self.queue).push(task);
        self.condition.notify_one();
        if let Some(notify) = &self.notify {
            notify();
        }
    }

    /// Run completion callbacks of every task finished since the last call.
    pub fn update(&self) {
        let finished = std::mem::take(&mut *lock(&self.queue));
        for mut task in finished {
            task.on_complete();
            self.completed.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Block until every added task has completed.
    pub fn wait_for_all(&self) {
        self.update();
        while self.added.load(Ordering::Acquire) != self.completed.load(Ordering::Acquire) {
            let guard = lock(&self.queue);
            if guard.is_empty() {
                let _ = self
                    .condition
                    .wait_timeout(guard, GROUP_POLL_INTERVAL)
                    .unwrap_or_else(PoisonError::into_inner);
            } else {
                drop(guard);
            }
            self.update();
        }
    }

    /// `(completed, added)`
    pub fn counters(&self) -> (usize, usize) {
        (
            self.completed.load(Ordering::Acquire),
            self.added.load(Ordering::Acquire),
        )
    }
}

struct QueuedTask {
    priority: u8,
    seq: u64,
    task: AsyncTask,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// One eventfd wakeup: the counter that was read and the task popped for it.
#[derive(Debug)]
pub struct Wake {
    pub value: u64,
    pub task: Option<AsyncTask>,
}

/// Shared priority queue of tasks plus the eventfd that announces them.
pub struct TaskQueue {
    heap: Mutex<BinaryHeap<QueuedTask>>,
    counter: AtomicUsize,
    seq: AtomicU64,
    event_fd: c_int,
}

/// Cloneable handle to a [`TaskQueue`]. Every clone keeps the queue alive,
/// so work submitted from a request outlives the request itself.
pub type TaskHandle = Arc<TaskQueue>;

impl TaskQueue {
    pub fn new() -> io::Result<TaskHandle> {
        let event_fd = syscalls::create_eventfd()?;
        Ok(Arc::new(Self {
            heap: Mutex::new(BinaryHeap::new()),
            counter: AtomicUsize::new(0),
            seq: AtomicU64::new(0),
            event_fd,
        }))
    }

    pub fn event_fd(&self) -> c_int {
        self.event_fd
    }

    /// Enqueue `task` and signal one eventfd unit.
    pub fn push_task(&self, task: AsyncTask) {
        if let Some(group) = task.group() {
            group.on_added();
        }
        let queued = QueuedTask {
            priority: task.priority(),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            task,
        };
        lock(&self.heap).push(queued);
        self.counter.fetch_add(1, Ordering::AcqRel);

        if let Err(e) = syscalls::eventfd_write(self.event_fd, 1) {
            error!("failed to signal task eventfd: {}", e);
        }
    }

    /// Highest-priority pending task, if any.
    pub fn pop_task(&self) -> Option<AsyncTask> {
        lock(&self.heap).pop().map(|queued| queued.task)
    }

    /// Hand a finished task to its group, or drop it.
    pub fn release_task(&self, task: AsyncTask) {
        match task.group().cloned() {
            Some(group) => group.on_performed(task),
            None => drop(task),
        }
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }

    /// Tasks pushed and not yet released.
    pub fn has_tasks(&self) -> bool {
        self.pending() > 0
    }

    pub fn pending(&self) -> usize {
        self.counter.load(Ordering::Acquire)
    }

    /// Consume one eventfd notification.
    ///
    /// Reads and resets the counter, pops at most one task and writes
    /// `value - 1` back so the remaining units reach another worker.
    /// Returns `Ok(None)` when there was nothing to read.
    pub fn take_wake(&self) -> io::Result<Option<Wake>> {
        let Some(value) = syscalls::eventfd_read(self.event_fd)? else {
            return Ok(None);
        };
        if value == 0 {
            return Ok(None);
        }
        let task = self.pop_task();
        if value > 1 {
            trace!(remaining = value - 1, "forwarding task wake");
            syscalls::eventfd_write(self.event_fd, value - 1)?;
        }
        Ok(Some(Wake { value, task }))
    }

    /// Run `task` on the current thread and release it.
    ///
    /// A panicking task counts as failed; ungrouped tasks still get their
    /// completion callbacks.
    pub fn run_task(&self, mut task: AsyncTask) -> bool {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| task.run()));
        if outcome.is_err() {
            warn!("async task panicked");
            task.set_successful(false);
            if task.group().is_none() {
                let _ = panic::catch_unwind(AssertUnwindSafe(|| task.on_complete()));
            }
        }
        let successful = task.is_successful();
        self.release_task(task);
        successful
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        syscalls::close(self.event_fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    fn labelled(priority: u8, label: u8, out: Arc<Mutex<Vec<u8>>>) -> AsyncTask {
        AsyncTask::prepare(None, |task| {
            task.set_priority(priority);
            task.add_execute_fn(move |_| {
                out.lock().unwrap().push(label);
                true
            });
        })
    }

    #[test]
    fn test_pop_in_priority_order() {
        let queue = TaskQueue::new().unwrap();
        let out = Arc::new(Mutex::new(Vec::new()));
        queue.push_task(labelled(PRIORITY_LOW, 1, out.clone()));
        queue.push_task(labelled(PRIORITY_HIGHEST, 2, out.clone()));
        queue.push_task(labelled(PRIORITY_NORMAL, 3, out.clone()));
        queue.push_task(labelled(PRIORITY_LOWEST, 4, out.clone()));
        assert_eq!(queue.pending(), 4);

        while let Some(task) = queue.pop_task() {
            assert!(queue.run_task(task));
        }
        assert_eq!(*out.lock().unwrap(), vec![2, 3, 1, 4]);
        assert!(!queue.has_tasks());
    }

    #[test]
    fn test_wake_accounting_delivers_each_task_once() {
        let queue = TaskQueue::new().unwrap();
        const K: u64 = 7;
        for _ in 0..K {
            queue.push_task(AsyncTask::new());
        }

        let mut deliveries = 0;
        let mut first_value = None;
        while let Some(wake) = queue.take_wake().unwrap() {
            first_value.get_or_insert(wake.value);
            deliveries += 1;
            let task = wake.task.expect("one task per wake unit");
            queue.run_task(task);
        }
        assert_eq!(first_value, Some(K));
        assert_eq!(deliveries, K);
        assert!(queue.pop_task().is_none());
        assert!(!queue.has_tasks());
    }

    #[test]
    fn test_wake_accounting_across_threads() {
        let queue = TaskQueue::new().unwrap();
        const K: usize = 32;
        for _ in 0..K {
            queue.push_task(AsyncTask::new());
        }

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                thread::spawn(move || {
                    let mut taken = 0;
                    while let Ok(Some(wake)) = queue.take_wake() {
                        if let Some(task) = wake.task {
                            queue.run_task(task);
                            taken += 1;
                        }
                    }
                    taken
                })
            })
            .collect();

        let mut total: usize = consumers.into_iter().map(|h| h.join().unwrap()).sum();
        // a consumer may stop between another's read and its write-back
        while let Some(wake) = queue.take_wake().unwrap() {
            if let Some(task) = wake.task {
                queue.run_task(task);
                total += 1;
            }
        }
        assert_eq!(total, K);
        assert!(!queue.has_tasks());
    }

    #[test]
    fn test_group_completes_on_owner_thread() {
        let queue = TaskQueue::new().unwrap();
        let notified = Arc::new(AtomicUsize::new(0));
        let n = notified.clone();
        let group = AsyncTaskGroup::with_notify(move || {
            n.fetch_add(1, Ordering::SeqCst);
        });

        let owner = thread::current().id();
        let completed_here = Arc::new(AtomicUsize::new(0));
        for i in 0..3 {
            let completed_here = completed_here.clone();
            queue.push_task(AsyncTask::prepare(Some(group.clone()), move |task| {
                task.add_execute_fn(move |_| i != 1);
                task.add_complete_fn(move |_, ok| {
                    assert_eq!(thread::current().id(), owner);
                    assert_eq!(ok, i != 1);
                    completed_here.fetch_add(1, Ordering::SeqCst);
                });
            }));
        }
        assert_eq!(group.counters(), (0, 3));

        let worker = {
            let queue = queue.clone();
            thread::spawn(move || {
                while let Some(task) = queue.pop_task() {
                    queue.run_task(task);
                }
            })
        };
        group.wait_for_all();
        worker.join().unwrap();

        assert_eq!(group.counters(), (3, 3));
        assert_eq!(completed_here.load(Ordering::SeqCst), 3);
        assert_eq!(notified.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_panicking_task_is_released_as_failed() {
        let queue = TaskQueue::new().unwrap();
        let completed = Arc::new(AtomicBool::new(true));
        let c = completed.clone();
        queue.push_task(AsyncTask::prepare(None, move |task| {
            task.add_execute_fn(|_| panic!("task failure"));
            task.add_complete_fn(move |_, ok| c.store(ok, Ordering::SeqCst));
        }));

        let task = queue.pop_task().unwrap();
        assert!(!queue.run_task(task));
        assert!(!completed.load(Ordering::SeqCst));
        assert!(!queue.has_tasks());
    }
}
