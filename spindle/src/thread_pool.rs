// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
use crate::{error::BuilderErrorKind, sys, Result};
use flume::Sender;
use std::{
    any::Any,
    cell::Cell,
    fmt,
    io,
    mem,
    os::unix::io::{AsRawFd, OwnedFd, RawFd},
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex, PoisonError},
    thread::{self, JoinHandle},
};

/// Identifies a task submitted to a [`ThreadPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct Job {
    id: TaskId,
    run: Box<dyn FnOnce() -> Box<dyn Any + Send> + Send>,
}

/// A task that finished running, with what it returned or the payload of
/// the panic that ended it.
pub struct CompletedTask {
    id: TaskId,
    outcome: thread::Result<Box<dyn Any + Send>>,
}

impl fmt::Debug for CompletedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletedTask")
            .field("id", &self.id)
            .field("panicked", &self.outcome.is_err())
            .finish()
    }
}

impl CompletedTask {
    /// The task this is the outcome of.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Whether the task panicked.
    pub fn panicked(&self) -> bool {
        self.outcome.is_err()
    }

    /// Returns the task's result, or resumes its panic on the calling
    /// thread.
    pub fn check(self) -> Box<dyn Any + Send> {
        match self.outcome {
            Ok(value) => value,
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    /// The task's outcome, without resuming a panic.
    pub fn into_result(self) -> thread::Result<Box<dyn Any + Send>> {
        self.outcome
    }
}

struct Shared {
    completed: Mutex<Vec<CompletedTask>>,
    eventfd: OwnedFd,
}

impl Shared {
    fn complete(&self, task: CompletedTask) {
        let was_empty = {
            let mut completed = self.completed.lock().unwrap_or_else(PoisonError::into_inner);
            let was_empty = completed.is_empty();
            completed.push(task);
            was_empty
        };
        // one signal per batch: whoever drains the list also resets the
        // eventfd before draining
        if was_empty {
            if let Err(err) = sys::write_eventfd(self.eventfd.as_raw_fd()) {
                log::error!("failed to signal task completion: {}", err);
            }
        }
    }
}

/// A fixed set of worker threads running submitted closures.
///
/// Completions are collected in a list that the owner drains with
/// [`completed_tasks`]. The pool's [`eventfd`] becomes readable whenever
/// that list goes from empty to non-empty, so an event loop can watch it
/// instead of polling the list.
///
/// Dropping the pool lets the workers finish the queued tasks, then joins
/// them.
///
/// [`completed_tasks`]: ThreadPool::completed_tasks
/// [`eventfd`]: ThreadPool::eventfd
pub struct ThreadPool {
    tx: Option<Sender<Job>>,
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
    next_id: Cell<u64>,
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("threads", &self.threads.len())
            .field("eventfd", &self.shared.eventfd)
            .finish()
    }
}

impl ThreadPool {
    /// Starts a pool of `threads` workers named `spindle-pool-<n>`.
    pub fn new(threads: usize) -> Result<ThreadPool> {
        ThreadPool::with_name("spindle", threads)
    }

    /// Starts a pool of `threads` workers named `<name>-pool-<n>`.
    pub fn with_name(name: &str, threads: usize) -> Result<ThreadPool> {
        if threads == 0 {
            return Err(BuilderErrorKind::NoThreads.into());
        }
        let shared = Arc::new(Shared {
            completed: Mutex::new(Vec::new()),
            eventfd: sys::create_eventfd()?,
        });
        let (tx, rx) = flume::unbounded::<Job>();

        let mut handles = Vec::with_capacity(threads);
        for n in 0..threads {
            let rx = rx.clone();
            let shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-pool-{}", name, n))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        let outcome = panic::catch_unwind(AssertUnwindSafe(job.run));
                        shared.complete(CompletedTask {
                            id: job.id,
                            outcome,
                        });
                    }
                })?;
            handles.push(handle);
        }

        Ok(ThreadPool {
            tx: Some(tx),
            shared,
            threads: handles,
            next_id: Cell::new(0),
        })
    }

    /// Queues `f` to run on one of the workers.
    ///
    /// A panic in `f` is caught and kept in the task's outcome; the worker
    /// carries on with the next task.
    pub fn add_task<F, T>(&self, f: F) -> Result<TaskId>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let id = TaskId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        let job = Job {
            id,
            run: Box::new(move || Box::new(f()) as Box<dyn Any + Send>),
        };
        let tx = self.tx.as_ref().ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "thread pool is shutting down")
        })?;
        tx.send(job).map_err(|_| {
            io::Error::new(io::ErrorKind::BrokenPipe, "thread pool workers are gone")
        })?;
        Ok(id)
    }

    /// Takes every task that completed since the last call.
    pub fn completed_tasks(&self) -> Vec<CompletedTask> {
        let mut completed = self
            .shared
            .completed
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        mem::take(&mut *completed)
    }

    /// The descriptor signaled when completed tasks are waiting to be
    /// collected. It is nonblocking; reading it resets the signal.
    pub fn eventfd(&self) -> RawFd {
        self.shared.eventfd.as_raw_fd()
    }

    /// Number of worker threads.
    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        drop(self.tx.take());
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                log::error!("thread pool worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::SpindleError;
    use std::{collections::BTreeMap, time::Duration};

    fn wait_readable(fd: RawFd) {
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let res = unsafe { libc::poll(&mut pfd, 1, 5000) };
        assert_eq!(res, 1, "no completion signaled");
    }

    #[test]
    fn completions_arrive_once_each() {
        let pool = ThreadPool::new(4).unwrap();
        let mut ids = BTreeMap::new();
        for i in 0..32u32 {
            let id = pool
                .add_task(move || {
                    if i % 2 == 1 {
                        std::panic::panic_any(i);
                    }
                    i
                })
                .unwrap();
            ids.insert(id, i);
        }

        let mut seen = BTreeMap::new();
        while seen.len() < ids.len() {
            wait_readable(pool.eventfd());
            sys::read_eventfd(pool.eventfd()).unwrap();
            for task in pool.completed_tasks() {
                assert!(seen.insert(task.id(), task).is_none());
            }
        }

        for (id, task) in seen {
            let i = ids[&id];
            assert_eq!(task.panicked(), i % 2 == 1);
            match task.into_result() {
                Ok(value) => assert_eq!(*value.downcast::<u32>().unwrap(), i),
                Err(payload) => assert_eq!(*payload.downcast::<u32>().unwrap(), i),
            }
        }
        assert!(pool.completed_tasks().is_empty());
    }

    #[test]
    fn check_resumes_the_task_panic() {
        let pool = ThreadPool::with_name("checker", 1).unwrap();
        pool.add_task(|| std::panic::panic_any(239i32)).unwrap();
        pool.add_task(|| thread::current().name().map(String::from))
            .unwrap();

        let mut tasks = Vec::new();
        while tasks.len() < 2 {
            wait_readable(pool.eventfd());
            sys::read_eventfd(pool.eventfd()).unwrap();
            tasks.extend(pool.completed_tasks());
        }
        tasks.sort_by_key(|task| task.id());
        let named = tasks.pop().unwrap();
        let failed = tasks.pop().unwrap();

        let payload = panic::catch_unwind(AssertUnwindSafe(|| failed.check())).unwrap_err();
        assert_eq!(payload.downcast_ref::<i32>(), Some(&239));

        let name = named.check().downcast::<Option<String>>().unwrap();
        assert_eq!(name.as_deref(), Some("checker-pool-0"));
    }

    #[test]
    fn signal_is_coalesced() {
        let pool = ThreadPool::new(1).unwrap();
        let (release_tx, release_rx) = flume::bounded::<()>(0);
        pool.add_task(move || release_rx.recv().unwrap()).unwrap();
        for _ in 0..3 {
            pool.add_task(|| ()).unwrap();
        }
        release_tx.send(()).unwrap();

        wait_readable(pool.eventfd());
        // let the remaining tasks land in the same batch
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(sys::read_eventfd(pool.eventfd()).unwrap(), 1);
        assert_eq!(pool.completed_tasks().len(), 4);
    }

    #[test]
    fn zero_threads_is_rejected() {
        assert!(matches!(
            ThreadPool::new(0),
            Err(SpindleError::BuilderError(BuilderErrorKind::NoThreads))
        ));
    }

    #[test]
    fn drop_finishes_queued_work() {
        let counter = Arc::new(Mutex::new(0));
        {
            let pool = ThreadPool::new(2).unwrap();
            for _ in 0..10 {
                let counter = counter.clone();
                pool.add_task(move || *counter.lock().unwrap() += 1).unwrap();
            }
        }
        assert_eq!(*counter.lock().unwrap(), 10);
    }
}
