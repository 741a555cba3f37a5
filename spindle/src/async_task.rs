// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
use crate::{
    error::FiberErrorKind,
    event_loop::Loop,
    poller::IoCondition,
    scheduler::{FiberId, FiberState},
    sys,
    thread_pool::{CompletedTask, TaskId, ThreadPool},
    Result,
};
use ahash::AHashMap;
use scopeguard::guard;
use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::Rc,
};
use tracing::{debug, trace};

struct TaskWaiter {
    fiber: FiberId,
    completed: Option<CompletedTask>,
}

struct AsyncInner {
    event_loop: Loop,
    pool: ThreadPool,
    waiters: RefCell<AHashMap<TaskId, TaskWaiter>>,
    in_flight: Cell<usize>,
    dispatcher: Cell<Option<FiberId>>,
}

impl Drop for AsyncInner {
    fn drop(&mut self) {
        if let Err(err) = self.event_loop.unregister_fd(self.pool.eventfd()) {
            log::warn!("failed to unregister the thread pool eventfd: {}", err);
        }
    }
}

/// Runs blocking closures on a thread pool on behalf of fibers.
///
/// [`execute_task`] looks like a plain blocking call to the fiber that makes
/// it, while the loop keeps running other fibers. Completions are noticed
/// through the pool's eventfd by a dispatcher fiber that only exists while
/// tasks are in flight, so [`Loop::run`] still returns once everything is
/// done.
///
/// [`execute_task`]: Async::execute_task
#[derive(Clone)]
pub struct Async {
    inner: Rc<AsyncInner>,
}

impl fmt::Debug for Async {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Async")
            .field("pool", &self.inner.pool)
            .field("in_flight", &self.inner.in_flight.get())
            .finish()
    }
}

impl Async {
    /// Starts a thread pool sized and named after `event_loop`'s
    /// configuration and watches it from that loop.
    pub fn new(event_loop: &Loop) -> Result<Async> {
        let pool = ThreadPool::with_name(event_loop.name(), event_loop.thread_pool_size())?;
        Async::with_pool(event_loop, pool)
    }

    /// Watches `pool` from `event_loop`.
    pub fn with_pool(event_loop: &Loop, pool: ThreadPool) -> Result<Async> {
        event_loop.register_fd(pool.eventfd())?;
        Ok(Async {
            inner: Rc::new(AsyncInner {
                event_loop: event_loop.clone(),
                pool,
                waiters: RefCell::new(AHashMap::new()),
                in_flight: Cell::new(0),
                dispatcher: Cell::new(None),
            }),
        })
    }

    /// Runs `f` on the thread pool and suspends the calling fiber until it
    /// returns.
    ///
    /// A panic in `f` is resumed in the calling fiber. If the fiber is
    /// interrupted while waiting, this returns
    /// [`Interrupted`](crate::SpindleError::Interrupted) right away and the
    /// task's outcome is dropped when it arrives.
    pub fn execute_task<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let lp = &self.inner.event_loop;
        let fiber = lp
            .current_fiber()
            .ok_or(FiberErrorKind::NoCurrentFiber)?;

        let id = self.inner.pool.add_task(f)?;
        self.inner.in_flight.set(self.inner.in_flight.get() + 1);
        self.inner.waiters.borrow_mut().insert(
            id,
            TaskWaiter {
                fiber,
                completed: None,
            },
        );
        let task = guard(id, |id| {
            self.inner.waiters.borrow_mut().remove(&id);
        });
        trace!(fiber = %fiber, task = %id, "task submitted");
        self.ensure_dispatcher()?;

        let completed = loop {
            let completed = self
                .inner
                .waiters
                .borrow_mut()
                .get_mut(&id)
                .and_then(|waiter| waiter.completed.take());
            match completed {
                Some(completed) => break completed,
                None => lp.suspend_fiber(fiber)?,
            }
        };
        drop(task);

        match completed.check().downcast::<T>() {
            Ok(value) => Ok(*value),
            Err(_) => unreachable!("task result of the wrong type"),
        }
    }

    /// Number of tasks submitted and not completed yet.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.get()
    }

    fn ensure_dispatcher(&self) -> Result<()> {
        if self.inner.dispatcher.get().is_some() {
            return Ok(());
        }
        let inner = self.inner.clone();
        let id = self
            .inner
            .event_loop
            .create_fiber(move || dispatch(&inner))?;
        debug!(fiber = %id, "task dispatcher started");
        self.inner.dispatcher.set(Some(id));
        Ok(())
    }
}

/// Body of the dispatcher fiber: hands completed tasks to their waiters
/// until no task is left in flight.
fn dispatch(inner: &AsyncInner) -> Result<()> {
    let lp = &inner.event_loop;
    let eventfd = inner.pool.eventfd();
    let stop = guard((), |_| inner.dispatcher.set(None));

    while inner.in_flight.get() > 0 {
        // reset before draining, so a completion racing with the drain
        // signals again
        sys::read_eventfd(eventfd)?;
        for completed in inner.pool.completed_tasks() {
            inner.in_flight.set(inner.in_flight.get() - 1);
            let task = completed.id();
            let fiber = match inner.waiters.borrow_mut().get_mut(&task) {
                Some(waiter) => {
                    waiter.completed = Some(completed);
                    waiter.fiber
                }
                None => {
                    trace!(task = %task, "abandoned task completed");
                    continue;
                }
            };
            trace!(task = %task, fiber = %fiber, "task completed");
            if lp.scheduler().fiber_state(fiber) == Some(FiberState::Suspended) {
                lp.resume_fiber(fiber)?;
            }
        }
        if inner.in_flight.get() > 0 {
            lp.wait_for_fd(eventfd, IoCondition::READABLE, None)?;
        }
    }
    drop(stop);
    debug!("task dispatcher done");
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{test_utils::init_tracing, LoopBuilder, SpindleError};
    use enclose::enclose;
    use std::{
        panic::{self, AssertUnwindSafe},
        sync::{
            atomic::{AtomicBool, Ordering},
            mpsc,
            Arc,
        },
        time::{Duration, Instant},
    };

    #[test]
    fn panic_resumes_in_the_waiting_fiber() {
        init_tracing();
        let lp = LoopBuilder::new().thread_pool_size(2).make().unwrap();
        let tasks = Async::new(&lp).unwrap();
        let t = Rc::new(Cell::new(100));

        lp.create_fiber(enclose!((tasks, t) move || {
            let res = panic::catch_unwind(AssertUnwindSafe(|| {
                tasks.execute_task(|| -> u32 { panic::panic_any(239i32) })
            }));
            let payload = res.unwrap_err();
            assert_eq!(payload.downcast_ref::<i32>(), Some(&239));
            t.set(t.get() - 1);
            Ok(())
        }))
        .unwrap();

        lp.run().unwrap();
        assert_eq!(t.get(), 99);
        assert_eq!(tasks.in_flight(), 0);
    }

    #[test]
    fn fibers_keep_running_while_tasks_block() {
        let lp = Loop::default();
        let tasks = Async::new(&lp).unwrap();
        let ticks = Rc::new(Cell::new(0));
        let results = Rc::new(RefCell::new(Vec::new()));

        for i in 0..4u64 {
            lp.create_fiber(enclose!((tasks, results) move || {
                let v = tasks.execute_task(move || {
                    std::thread::sleep(Duration::from_millis(20 * (4 - i)));
                    i * 10
                })?;
                results.borrow_mut().push(v);
                Ok(())
            }))
            .unwrap();
        }
        lp.create_fiber(enclose!((lp, ticks) move || {
            for _ in 0..3 {
                lp.sleep(Duration::from_millis(5))?;
                ticks.set(ticks.get() + 1);
            }
            Ok(())
        }))
        .unwrap();

        let start = Instant::now();
        lp.run().unwrap();
        assert!(start.elapsed() < Duration::from_millis(200));
        assert_eq!(ticks.get(), 3);
        let mut results = results.borrow().clone();
        results.sort_unstable();
        assert_eq!(results, vec![0, 10, 20, 30]);
    }

    #[test]
    fn dispatcher_restarts_for_later_tasks() {
        let lp = Loop::default();
        let tasks = Async::new(&lp).unwrap();
        let sum = Rc::new(Cell::new(0));

        lp.create_fiber(enclose!((lp, tasks, sum) move || {
            sum.set(sum.get() + tasks.execute_task(|| 1)?);
            // give the dispatcher a chance to wind down
            lp.sleep(Duration::from_millis(5))?;
            sum.set(sum.get() + tasks.execute_task(|| 2)?);
            Ok(())
        }))
        .unwrap();

        lp.run().unwrap();
        assert_eq!(sum.get(), 3);
        assert!(tasks.inner.dispatcher.get().is_none());
    }

    #[test]
    fn interrupted_waiter_abandons_its_task() {
        let lp = Loop::default();
        let tasks = Async::new(&lp).unwrap();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let outcome = Rc::new(Cell::new(None));

        let waiter = lp
            .create_fiber(enclose!((tasks, outcome) move || {
                let res = tasks.execute_task(move || release_rx.recv().is_ok());
                outcome.set(Some(matches!(res, Err(SpindleError::Interrupted))));
                Ok(())
            }))
            .unwrap();
        lp.create_fiber(enclose!((lp) move || {
            lp.sleep(Duration::from_millis(5))?;
            lp.interrupt_fiber(waiter)?;
            lp.sleep(Duration::from_millis(5))?;
            release_tx.send(()).map_err(SpindleError::other)
        }))
        .unwrap();

        lp.run().unwrap();
        assert_eq!(outcome.get(), Some(true));
        assert_eq!(tasks.in_flight(), 0);
        assert!(tasks.inner.waiters.borrow().is_empty());
    }

    #[test]
    fn execute_outside_a_fiber_fails() {
        let lp = Loop::default();
        let tasks = Async::new(&lp).unwrap();
        assert!(matches!(
            tasks.execute_task(|| ()),
            Err(SpindleError::FiberError(FiberErrorKind::NoCurrentFiber))
        ));
    }

    #[test]
    fn dropping_the_loop_joins_the_pool() {
        struct SetOnDrop(Arc<AtomicBool>);
        impl Drop for SetOnDrop {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }
        thread_local! {
            static ON_EXIT: RefCell<Option<SetOnDrop>> = RefCell::new(None);
        }

        let lp = LoopBuilder::new().thread_pool_size(1).make().unwrap();
        let tasks = Async::new(&lp).unwrap();
        let exited = Arc::new(AtomicBool::new(false));

        lp.create_fiber(enclose!((lp, tasks, exited) move || {
            // fires when the worker thread ends
            tasks.execute_task(move || {
                ON_EXIT.with(|slot| *slot.borrow_mut() = Some(SetOnDrop(exited)));
            })?;
            let me = lp.current_fiber().unwrap();
            lp.suspend_fiber(me)
        }))
        .unwrap();
        assert!(matches!(lp.run(), Err(SpindleError::Stalled { fibers: 1 })));

        drop(tasks);
        assert!(!exited.load(Ordering::SeqCst));
        drop(lp);
        assert!(exited.load(Ordering::SeqCst));
    }
}
