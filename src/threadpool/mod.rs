//! Fixed-cap worker pool with lazy thread spawn.
//!
//! A [`Pool`] owns up to [`MAX_THREADS`] OS worker threads, created one at a
//! time when a push finds no idle worker, and a FIFO task queue bounded at
//! [`MAX_TASKS`] entries. One mutex guards the queue, the counters and every
//! task state transition; `task_available` wakes workers, `task_completed`
//! wakes joiners. [`Task`] handles stay valid across completion, can be
//! joined with or without a deadline, re-pushed after finishing, or detached
//! so the pool cleans up after them.


use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::warn;
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

/// Most workers a pool may ever spawn.
pub const MAX_THREADS: usize = 20;

/// Most tasks that may sit queued in one pool at a time.
pub const MAX_TASKS: usize = 100_000;

/// Errors reported by pool and task operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolError {
    /// A parameter is out of its documented range.
    #[error("invalid argument")]
    InvalidArgument,
    /// The task queue is at capacity.
    #[error("too many queued tasks")]
    TooManyTasks,
    /// The operation needs a task that was pushed to a pool.
    #[error("task was never pushed, or its result is already taken")]
    TaskNotPushed,
    /// The task is currently queued or running.
    #[error("task is in a pool")]
    TaskInPool,
    /// The deadline elapsed before the task finished.
    #[error("timed out waiting for the task")]
    Timeout,
}

/// Error returned by [`Pool::shutdown`] when tasks are still queued or
/// running; the untouched pool is handed back for a later retry.
#[derive(Debug, Error)]
#[error("pool still has queued or running tasks")]
pub struct ShutdownError {
    /// The pool, still fully operational.
    pub pool: Pool,
}

const STATE_NEW: u8 = 0;
const STATE_QUEUED: u8 = 1;
const STATE_RUNNING: u8 = 2;
const STATE_FINISHED: u8 = 3;

type TaskFn = Box<dyn FnMut() -> Box<dyn Any + Send> + Send>;

struct TaskInner {
    /// Written only while the pool mutex is held; atomic so that
    /// `is_finished`/`is_running` stay lock-free.
    state: AtomicU8,
    detached: AtomicBool,
    joined: AtomicBool,
    func: Mutex<Option<TaskFn>>,
    result: Mutex<Option<Box<dyn Any + Send>>>,
    pool: Mutex<Option<Arc<PoolShared>>>,
}

struct PoolState {
    queue: VecDeque<Arc<TaskInner>>,
    /// Worker threads spawned so far.
    live: usize,
    /// Workers currently parked on `task_available`.
    idle: usize,
    active: bool,
    workers: Vec<JoinHandle<()>>,
}

struct PoolShared {
    state: Mutex<PoolState>,
    task_available: Condvar,
    task_completed: Condvar,
    max_threads: usize,
}

/// A unit of work submitted to a [`Pool`].
pub struct Task {
    inner: Arc<TaskInner>,
}

impl Task {
    /// Wrap a closure into a task. The closure may run more than once if
    /// the task is pushed again after finishing; its return value is
    /// type-erased and handed back by [`Task::join`].
    pub fn new<R, F>(mut f: F) -> Task
    where
        R: Any + Send,
        F: FnMut() -> R + Send + 'static,
    {
        let func: TaskFn = Box::new(move || Box::new(f()) as Box<dyn Any + Send>);
        Task {
            inner: Arc::new(TaskInner {
                state: AtomicU8::new(STATE_NEW),
                detached: AtomicBool::new(false),
                joined: AtomicBool::new(false),
                func: Mutex::new(Some(func)),
                result: Mutex::new(None),
                pool: Mutex::new(None),
            }),
        }
    }

    /// True once the task has run to completion.
    pub fn is_finished(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == STATE_FINISHED
    }

    /// True while a worker is executing the task.
    pub fn is_running(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == STATE_RUNNING
    }

    /// Wait until the task finishes and take its result.
    pub fn join(&self) -> Result<Box<dyn Any + Send>, PoolError> {
        self.wait(None)
    }

    /// Like [`Task::join`] but gives up after `timeout` with
    /// [`PoolError::Timeout`]. The task keeps running and can be joined
    /// again later.
    pub fn timed_join(&self, timeout: Duration) -> Result<Box<dyn Any + Send>, PoolError> {
        self.wait(Instant::now().checked_add(timeout))
    }

    fn wait(&self, deadline: Option<Instant>) -> Result<Box<dyn Any + Send>, PoolError> {
        if self.inner.state.load(Ordering::Acquire) == STATE_NEW {
            return Err(PoolError::TaskNotPushed);
        }
        let Some(shared) = self.inner.pool.lock().clone() else {
            return Err(PoolError::TaskNotPushed);
        };
        let mut state = shared.state.lock();
        while self.inner.state.load(Ordering::Acquire) != STATE_FINISHED {
            match deadline {
                None => shared.task_completed.wait(&mut state),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(PoolError::Timeout);
                    }
                    let _ = shared.task_completed.wait_for(&mut state, deadline - now);
                }
            }
        }
        drop(state);
        self.inner.joined.store(true, Ordering::Release);
        match self.inner.result.lock().take() {
            Some(result) => Ok(result),
            None => Err(PoolError::TaskNotPushed),
        }
    }

    /// Hand the task over to its pool: the worker cleans it up right after
    /// it finishes and nobody may join it. Legal only after a push.
    pub fn detach(self) -> Result<(), PoolError> {
        if self.inner.state.load(Ordering::Acquire) == STATE_NEW {
            return Err(PoolError::TaskNotPushed);
        }
        let pool = self.inner.pool.lock().clone();
        match pool {
            Some(shared) => {
                // Under the pool mutex so the flag cannot race the
                // finishing worker's broadcast decision.
                let _state = shared.state.lock();
                self.inner.detached.store(true, Ordering::Release);
            }
            None => self.inner.detached.store(true, Ordering::Release),
        }
        Ok(())
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.inner.state.load(Ordering::Acquire) {
            STATE_QUEUED => "queued",
            STATE_RUNNING => "running",
            STATE_FINISHED => "finished",
            _ => "new",
        };
        f.debug_struct("Task").field("state", &state).finish()
    }
}

/// A fixed-cap pool of lazily spawned worker threads.
pub struct Pool {
    shared: Arc<PoolShared>,
}

impl Pool {
    /// Create a pool running at most `max_threads` workers,
    /// `1..=`[`MAX_THREADS`].
    pub fn new(max_threads: usize) -> Result<Pool, PoolError> {
        if max_threads < 1 || max_threads > MAX_THREADS {
            return Err(PoolError::InvalidArgument);
        }
        Ok(Pool {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    queue: VecDeque::new(),
                    live: 0,
                    idle: 0,
                    active: true,
                    workers: Vec::new(),
                }),
                task_available: Condvar::new(),
                task_completed: Condvar::new(),
                max_threads,
            }),
        })
    }

    /// Number of worker threads spawned so far.
    pub fn thread_count(&self) -> usize {
        self.shared.state.lock().live
    }

    /// Queue a task for execution. Spawns a worker when none is idle and
    /// the cap allows. Fails with [`PoolError::TooManyTasks`] at the queue
    /// bound and [`PoolError::TaskInPool`] when the task is already queued
    /// or running.
    pub fn push(&self, task: &Task) -> Result<(), PoolError> {
        let mut state = self.shared.state.lock();
        if state.queue.len() >= MAX_TASKS {
            return Err(PoolError::TooManyTasks);
        }
        match task.inner.state.load(Ordering::Acquire) {
            STATE_QUEUED | STATE_RUNNING => return Err(PoolError::TaskInPool),
            _ => {}
        }
        *task.inner.pool.lock() = Some(Arc::clone(&self.shared));
        *task.inner.result.lock() = None;
        task.inner.joined.store(false, Ordering::Release);
        task.inner.state.store(STATE_QUEUED, Ordering::Release);
        state.queue.push_back(Arc::clone(&task.inner));

        if state.idle == 0 && state.live < self.shared.max_threads {
            let shared = Arc::clone(&self.shared);
            let spawned = thread::Builder::new()
                .name("pool-worker".into())
                .spawn(move || worker(shared));
            match spawned {
                Ok(handle) => {
                    state.workers.push(handle);
                    state.live += 1;
                    state.idle += 1;
                }
                Err(err) => warn!("failed to spawn a worker thread: {err}"),
            }
        }
        self.shared.task_available.notify_one();
        Ok(())
    }

    /// Shut the pool down: deactivate, wake every worker and join them.
    /// Fails with the pool handed back when any task is still queued or
    /// running.
    pub fn shutdown(self) -> Result<(), ShutdownError> {
        {
            let state = self.shared.state.lock();
            if !state.queue.is_empty() || state.idle != state.live {
                drop(state);
                return Err(ShutdownError { pool: self });
            }
        }
        // Drop performs the actual teardown.
        Ok(())
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        let workers = {
            let mut state = self.shared.state.lock();
            state.active = false;
            std::mem::take(&mut state.workers)
        };
        self.shared.task_available.notify_all();
        for worker in workers {
            if worker.join().is_err() {
                warn!("a worker thread panicked before shutdown");
            }
        }
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Pool")
            .field("live", &state.live)
            .field("idle", &state.idle)
            .field("queued", &state.queue.len())
            .finish()
    }
}

fn worker(shared: Arc<PoolShared>) {
    let mut state = shared.state.lock();
    while state.active {
        while state.queue.is_empty() && state.active {
            shared.task_available.wait(&mut state);
        }
        if !state.active {
            break;
        }
        let Some(task) = state.queue.pop_front() else {
            continue;
        };
        state.idle -= 1;
        task.state.store(STATE_RUNNING, Ordering::Release);
        drop(state);

        // User code runs with no locks held.
        if let Some(mut func) = task.func.lock().take() {
            let result = func();
            *task.func.lock() = Some(func);
            *task.result.lock() = Some(result);
        }

        state = shared.state.lock();
        task.state.store(STATE_FINISHED, Ordering::Release);
        state.idle += 1;
        if !task.detached.load(Ordering::Acquire) {
            shared.task_completed.notify_all();
        }
    }
}
