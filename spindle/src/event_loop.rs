// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! The event loop.
//!
//! A [`Loop`] drives a [`Scheduler`] together with an [`IoClock`] and an
//! [`IoPoller`]. Fibers that wait for a deadline or for a file descriptor
//! to become ready park themselves with a timer or a watcher and suspend;
//! each iteration of [`Loop::run`] lets every runnable fiber run, blocks in
//! the poller until the next deadline, then resumes the fibers whose timer
//! expired, followed by the fibers whose watcher is ready.
//!
//! # Examples
//!
//! ```
//! use spindle::Loop;
//! use std::{cell::Cell, rc::Rc, time::Duration};
//!
//! let event_loop = Loop::default();
//! let woke = Rc::new(Cell::new(false));
//! let (lp, flag) = (event_loop.clone(), woke.clone());
//! event_loop
//!     .create_fiber(move || {
//!         lp.sleep(Duration::from_millis(5))?;
//!         flag.set(true);
//!         Ok(())
//!     })
//!     .unwrap();
//! event_loop.run().unwrap();
//! assert!(woke.get());
//! ```

use crate::{
    clock::IoClock,
    error::{BuilderErrorKind, FiberErrorKind},
    poller::{IoCondition, IoPoller},
    scheduler::{FiberId, FiberState, InterruptAt, Scheduler},
    sys,
    Result,
    SpindleError,
};
use scopeguard::guard;
use std::{
    cell::{Cell, RefCell},
    convert::Infallible,
    fmt,
    io,
    os::unix::io::RawFd,
    rc::Rc,
    time::{Duration, Instant},
};
use tracing::trace;

/// Stack size of each fiber unless configured otherwise: 256 KiB.
pub const DEFAULT_STACK_SIZE: usize = 256 << 10;
/// Smallest fiber stack accepted: 16 KiB.
pub const MIN_STACK_SIZE: usize = 16 << 10;
/// Worker threads available to [`Async`](crate::Async) by default.
pub const DEFAULT_THREAD_POOL_SIZE: usize = 4;
/// Kernel events collected per poll by default.
pub const DEFAULT_EVENTS_CAPACITY: usize = 1024;

const DEFAULT_LOOP_NAME: &str = "unnamed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wakeup {
    Deadline,
    Ready,
}

/// What a timer or a watcher registered by the loop carries: the fiber to
/// resume and where to tell it why.
#[derive(Debug, Clone)]
struct Waiter {
    fiber: FiberId,
    wakeup: Rc<Cell<Option<Wakeup>>>,
}

impl Waiter {
    fn signal(&self, wakeup: Wakeup) {
        // readiness wins over a deadline expiring in the same iteration
        if wakeup == Wakeup::Ready || self.wakeup.get().is_none() {
            self.wakeup.set(Some(wakeup));
        }
    }
}

/// Configuration for a [`Loop`], from which configuration methods can be
/// chained.
#[derive(Debug, Clone)]
pub struct LoopBuilder {
    /// Used to name the loop's worker threads
    name: String,
    /// Stack size of each fiber
    stack_size: usize,
    /// Threads backing [`Async`](crate::Async)
    thread_pool_size: usize,
    /// Kernel events collected per poll
    events_capacity: usize,
}

impl Default for LoopBuilder {
    fn default() -> Self {
        LoopBuilder::new()
    }
}

impl LoopBuilder {
    /// Generates the base configuration for a [`Loop`].
    pub fn new() -> LoopBuilder {
        LoopBuilder {
            name: String::from(DEFAULT_LOOP_NAME),
            stack_size: DEFAULT_STACK_SIZE,
            thread_pool_size: DEFAULT_THREAD_POOL_SIZE,
            events_capacity: DEFAULT_EVENTS_CAPACITY,
        }
    }

    /// Names the loop. Worker threads started on its behalf are called
    /// `<name>-pool-<n>`.
    #[must_use = "The builder must be built to be useful"]
    pub fn name(mut self, name: &str) -> LoopBuilder {
        self.name = String::from(name);
        self
    }

    /// The stack size of every fiber, at least 16 KiB. Defaults to 256 KiB.
    #[must_use = "The builder must be built to be useful"]
    pub fn stack_size(mut self, stack_size: usize) -> LoopBuilder {
        self.stack_size = stack_size;
        self
    }

    /// How many threads run the tasks handed to [`Async`](crate::Async).
    /// Defaults to 4.
    #[must_use = "The builder must be built to be useful"]
    pub fn thread_pool_size(mut self, threads: usize) -> LoopBuilder {
        self.thread_pool_size = threads;
        self
    }

    /// How many kernel events a single poll collects. Readiness beyond that
    /// is picked up by the next iteration. Defaults to 1024.
    #[must_use = "The builder must be built to be useful"]
    pub fn events_capacity(mut self, capacity: usize) -> LoopBuilder {
        self.events_capacity = capacity;
        self
    }

    /// Makes a new [`Loop`] from this configuration.
    pub fn make(self) -> Result<Loop> {
        if self.thread_pool_size == 0 {
            return Err(BuilderErrorKind::NoThreads.into());
        }
        if self.events_capacity == 0 {
            return Err(BuilderErrorKind::NoEventsCapacity.into());
        }
        let scheduler = Scheduler::with_stack_size(self.stack_size)?;
        let poller = IoPoller::with_capacity(self.events_capacity)?;
        trace!(name = %self.name, "creating loop");
        Ok(Loop {
            inner: Rc::new(LoopInner {
                scheduler,
                clock: RefCell::new(IoClock::new()),
                poller: RefCell::new(poller),
                config: self,
            }),
            owner: true,
        })
    }
}

/// `timeout` from now, or `None` if that cannot be represented, in which case
/// the wait has no deadline.
fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

struct LoopInner {
    scheduler: Scheduler,
    clock: RefCell<IoClock<Waiter>>,
    poller: RefCell<IoPoller<Waiter>>,
    config: LoopBuilder,
}

/// Single-threaded event loop running fibers.
///
/// Cloning gives another handle to the same loop; fibers keep one to sleep,
/// wait for I/O, or spawn more fibers.
///
/// The handle returned by [`LoopBuilder::make`] owns the fibers. Dropping it
/// releases every fiber that has not finished, the way dropping the owner of
/// a [`Scheduler`] does, along with the loop handles those fibers hold.
pub struct Loop {
    inner: Rc<LoopInner>,
    owner: bool,
}

impl Clone for Loop {
    fn clone(&self) -> Self {
        Loop {
            inner: self.inner.clone(),
            owner: false,
        }
    }
}

impl Drop for Loop {
    fn drop(&mut self) {
        if self.owner {
            self.inner.scheduler.shutdown();
        }
    }
}

impl fmt::Debug for Loop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loop")
            .field("name", &self.inner.config.name)
            .field("scheduler", &self.inner.scheduler)
            .field("timers", &self.timer_count())
            .field("watchers", &self.watcher_count())
            .finish()
    }
}

impl Default for Loop {
    fn default() -> Self {
        match LoopBuilder::new().make() {
            Ok(event_loop) => event_loop,
            Err(err) => panic!("failed to create the event loop: {}", err),
        }
    }
}

impl Loop {
    /// Creates a loop with the default configuration.
    pub fn new() -> Result<Loop> {
        LoopBuilder::new().make()
    }

    /// The loop's name.
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub(crate) fn thread_pool_size(&self) -> usize {
        self.inner.config.thread_pool_size
    }

    /// The scheduler running this loop's fibers.
    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    /// Runs until no fiber, timer or watcher is left.
    ///
    /// Fails with [`SpindleError::Stalled`] if fibers are left that nothing
    /// can ever resume. Errors and panics escaping fibers are forwarded the
    /// way [`Scheduler::run`] does.
    pub fn run(&self) -> Result<()> {
        let mut expired = Vec::new();
        let mut ready = Vec::new();
        loop {
            self.inner.scheduler.run()?;

            let timers = self.timer_count();
            let watchers = self.watcher_count();
            if timers == 0 && watchers == 0 {
                return match self.inner.scheduler.fiber_count() {
                    0 => Ok(()),
                    fibers => Err(SpindleError::Stalled { fibers }),
                };
            }

            trace!(timers, watchers, "polling");
            self.inner
                .poller
                .borrow_mut()
                .get_ready_watchers(&self.inner.clock.borrow(), &mut ready)?;
            self.inner.clock.borrow_mut().get_expired_timers(&mut expired);

            for (_, waiter) in expired.drain(..) {
                waiter.signal(Wakeup::Deadline);
                self.wake(waiter.fiber);
            }
            for key in ready.drain(..) {
                let waiter = self.inner.poller.borrow().watcher(key).cloned();
                if let Some(waiter) = waiter {
                    waiter.signal(Wakeup::Ready);
                    self.wake(waiter.fiber);
                }
            }
        }
    }

    fn wake(&self, fiber: FiberId) {
        let scheduler = &self.inner.scheduler;
        if scheduler.fiber_state(fiber) == Some(FiberState::Suspended) {
            if let Err(err) = scheduler.resume_fiber(fiber) {
                log::warn!("failed to wake fiber {}: {}", fiber, err);
            }
        }
    }

    /// Creates a fiber running `procedure`. See [`Scheduler::create_fiber`].
    pub fn create_fiber<F>(&self, procedure: F) -> Result<FiberId>
    where
        F: FnOnce() -> Result<()> + 'static,
    {
        self.inner.scheduler.create_fiber(procedure)
    }

    /// See [`Scheduler::yield_now`].
    pub fn yield_now(&self) -> Result<()> {
        self.inner.scheduler.yield_now()
    }

    /// See [`Scheduler::suspend_fiber`].
    pub fn suspend_fiber(&self, id: FiberId) -> Result<()> {
        self.inner.scheduler.suspend_fiber(id)
    }

    /// See [`Scheduler::resume_fiber`].
    pub fn resume_fiber(&self, id: FiberId) -> Result<()> {
        self.inner.scheduler.resume_fiber(id)
    }

    /// See [`Scheduler::exit_current`].
    pub fn exit_current(&self) -> Result<Infallible> {
        self.inner.scheduler.exit_current()
    }

    /// See [`Scheduler::current_fiber`].
    pub fn current_fiber(&self) -> Option<FiberId> {
        self.inner.scheduler.current_fiber()
    }

    /// Interrupts a fiber at its next resumption, waking it up if it is
    /// suspended.
    ///
    /// A fiber blocked in [`sleep`], [`wait_for_fd`] or a task of
    /// [`Async`](crate::Async) gets [`SpindleError::Interrupted`] from that
    /// call on the next iteration.
    ///
    /// [`sleep`]: Loop::sleep
    /// [`wait_for_fd`]: Loop::wait_for_fd
    pub fn interrupt_fiber(&self, id: FiberId) -> Result<()> {
        self.interrupt_fiber_at(id, InterruptAt::NextResume)?;
        self.wake(id);
        Ok(())
    }

    /// Requests an interruption without waking the target. See
    /// [`Scheduler::interrupt_fiber`].
    pub fn interrupt_fiber_at(&self, id: FiberId, at: InterruptAt) -> Result<()> {
        self.inner.scheduler.interrupt_fiber(id, at)
    }

    fn current(&self) -> Result<FiberId> {
        self.current_fiber()
            .ok_or_else(|| FiberErrorKind::NoCurrentFiber.into())
    }

    /// Suspends the calling fiber until `wakeup` is set. Resumptions by
    /// anyone else are ignored.
    fn park(&self, fiber: FiberId, wakeup: &Cell<Option<Wakeup>>) -> Result<Wakeup> {
        loop {
            if let Some(wakeup) = wakeup.get() {
                return Ok(wakeup);
            }
            self.inner.scheduler.suspend_fiber(fiber)?;
        }
    }

    /// Suspends the calling fiber for `duration`.
    ///
    /// A duration too long for the monotonic clock sleeps until the fiber is
    /// interrupted.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        self.sleep_until_deadline(deadline_after(duration))
    }

    /// Suspends the calling fiber until `deadline`.
    pub fn sleep_until(&self, deadline: Instant) -> Result<()> {
        self.sleep_until_deadline(Some(deadline))
    }

    fn sleep_until_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        let fiber = self.current()?;
        let wakeup = Rc::new(Cell::new(None));
        let timer = deadline.map(|deadline| {
            self.inner.clock.borrow_mut().add_timer_at(
                Waiter {
                    fiber,
                    wakeup: wakeup.clone(),
                },
                deadline,
            )
        });
        let _timer = guard(timer, |timer| {
            if let Some(timer) = timer {
                self.inner.clock.borrow_mut().remove_timer(timer);
            }
        });
        trace!(fiber = %fiber, "sleeping");
        self.park(fiber, &wakeup).map(drop)
    }

    /// Starts watching `fd`, and switches it to nonblocking mode.
    pub fn register_fd(&self, fd: RawFd) -> Result<()> {
        sys::set_nonblocking(fd)?;
        self.inner.poller.borrow_mut().create_object(fd)
    }

    /// Stops watching `fd`. No fiber may still be waiting on it.
    pub fn unregister_fd(&self, fd: RawFd) -> Result<()> {
        self.inner.poller.borrow_mut().destroy_object(fd)
    }

    /// Suspends the calling fiber until `fd`, which must be registered,
    /// satisfies `condition`.
    ///
    /// Returns `false` if `timeout` elapsed first. A timeout too long for the
    /// monotonic clock waits without a deadline.
    pub fn wait_for_fd(
        &self,
        fd: RawFd,
        condition: IoCondition,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        self.wait_for_fd_until(fd, condition, timeout.and_then(deadline_after))
    }

    fn wait_for_fd_until(
        &self,
        fd: RawFd,
        condition: IoCondition,
        deadline: Option<Instant>,
    ) -> Result<bool> {
        let fiber = self.current()?;
        let wakeup = Rc::new(Cell::new(None));
        let waiter = Waiter {
            fiber,
            wakeup: wakeup.clone(),
        };

        let timer = deadline.map(|deadline| {
            self.inner
                .clock
                .borrow_mut()
                .add_timer_at(waiter.clone(), deadline)
        });
        let _timer = guard(timer, |timer| {
            if let Some(timer) = timer {
                self.inner.clock.borrow_mut().remove_timer(timer);
            }
        });
        let watcher = self
            .inner
            .poller
            .borrow_mut()
            .add_watcher(waiter, fd, condition)?;
        let _watcher = guard(watcher, |watcher| {
            self.inner.poller.borrow_mut().remove_watcher(watcher);
        });

        trace!(fiber = %fiber, fd, ?condition, "waiting for fd");
        Ok(self.park(fiber, &wakeup)? == Wakeup::Ready)
    }

    /// Reads from a registered `fd` into `buf`, suspending the calling fiber
    /// while there is nothing to read.
    ///
    /// Fails with [`io::ErrorKind::TimedOut`] if nothing could be read
    /// within `timeout`.
    pub fn read(&self, fd: RawFd, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        let deadline = timeout.and_then(deadline_after);
        self.retry(fd, IoCondition::READABLE, deadline, || sys::read(fd, buf))
    }

    /// Writes `buf` to a registered `fd`, suspending the calling fiber while
    /// it cannot take more data.
    ///
    /// Fails with [`io::ErrorKind::TimedOut`] if nothing could be written
    /// within `timeout`.
    pub fn write(&self, fd: RawFd, buf: &[u8], timeout: Option<Duration>) -> Result<usize> {
        let deadline = timeout.and_then(deadline_after);
        self.retry(fd, IoCondition::WRITABLE, deadline, || sys::write(fd, buf))
    }

    fn retry<F>(
        &self,
        fd: RawFd,
        condition: IoCondition,
        deadline: Option<Instant>,
        mut op: F,
    ) -> Result<usize>
    where
        F: FnMut() -> io::Result<usize>,
    {
        loop {
            match op() {
                Ok(n) => return Ok(n),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
            if !self.wait_for_fd_until(fd, condition, deadline)? {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("fd {} not ready before the deadline", fd),
                )
                .into());
            }
        }
    }

    /// Number of pending timers.
    pub fn timer_count(&self) -> usize {
        self.inner.clock.borrow().len()
    }

    /// Number of fibers waiting on a file descriptor.
    pub fn watcher_count(&self) -> usize {
        self.inner.poller.borrow().watcher_count()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::{init_tracing, pipe};
    use enclose::enclose;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn builder_validation() {
        assert!(matches!(
            LoopBuilder::new().stack_size(4096).make(),
            Err(SpindleError::BuilderError(BuilderErrorKind::StackTooSmall { .. }))
        ));
        assert!(matches!(
            LoopBuilder::new().thread_pool_size(0).make(),
            Err(SpindleError::BuilderError(BuilderErrorKind::NoThreads))
        ));
        assert!(matches!(
            LoopBuilder::new().events_capacity(0).make(),
            Err(SpindleError::BuilderError(BuilderErrorKind::NoEventsCapacity))
        ));
        let lp = LoopBuilder::new().name("named").make().unwrap();
        assert_eq!(lp.name(), "named");
    }

    #[test]
    fn empty_loop_returns() {
        Loop::default().run().unwrap();
    }

    #[test]
    fn sleepers_wake_in_deadline_order() {
        init_tracing();
        let lp = Loop::default();
        let order = Rc::new(RefCell::new(Vec::new()));

        for (name, ms) in [("slow", 60), ("fast", 20), ("medium", 40)] {
            lp.create_fiber(enclose!((lp, order) move || {
                lp.sleep(Duration::from_millis(ms))?;
                order.borrow_mut().push(name);
                Ok(())
            }))
            .unwrap();
        }

        let start = Instant::now();
        lp.run().unwrap();
        assert!(start.elapsed() >= Duration::from_millis(60));
        assert_eq!(*order.borrow(), vec!["fast", "medium", "slow"]);
        assert_eq!(lp.timer_count(), 0);
    }

    #[test]
    fn reader_waits_for_writer() {
        let lp = Loop::default();
        let (reader, writer) = pipe();
        let (rfd, wfd) = (reader.as_raw_fd(), writer.as_raw_fd());
        lp.register_fd(rfd).unwrap();
        lp.register_fd(wfd).unwrap();
        let received = Rc::new(RefCell::new(Vec::new()));

        lp.create_fiber(enclose!((lp, received) move || {
            let mut buf = [0u8; 16];
            let n = lp.read(rfd, &mut buf, None)?;
            received.borrow_mut().extend_from_slice(&buf[..n]);
            Ok(())
        }))
        .unwrap();
        lp.create_fiber(enclose!((lp) move || {
            lp.sleep(Duration::from_millis(10))?;
            lp.write(wfd, b"ping", None)?;
            Ok(())
        }))
        .unwrap();

        lp.run().unwrap();
        assert_eq!(*received.borrow(), b"ping");
        assert_eq!(lp.watcher_count(), 0);
        lp.unregister_fd(rfd).unwrap();
        lp.unregister_fd(wfd).unwrap();
    }

    #[test]
    fn read_times_out() {
        let lp = Loop::default();
        let (reader, _writer) = pipe();
        let rfd = reader.as_raw_fd();
        lp.register_fd(rfd).unwrap();
        let outcome = Rc::new(RefCell::new(None));

        lp.create_fiber(enclose!((lp, outcome) move || {
            let ready = lp.wait_for_fd(rfd, IoCondition::READABLE, Some(Duration::from_millis(10)))?;
            let mut buf = [0u8; 1];
            let err = lp.read(rfd, &mut buf, Some(Duration::from_millis(10))).unwrap_err();
            *outcome.borrow_mut() = Some((ready, err.to_string()));
            Ok(())
        }))
        .unwrap();

        lp.run().unwrap();
        let (ready, err) = outcome.borrow_mut().take().unwrap();
        assert!(!ready);
        assert!(err.contains("not ready before the deadline"));
        assert_eq!(lp.timer_count(), 0);
        assert_eq!(lp.watcher_count(), 0);
    }

    #[test]
    fn interrupt_wakes_a_sleeper() {
        let lp = Loop::default();
        let outcome = Rc::new(Cell::new(None));

        let sleeper = lp
            .create_fiber(enclose!((lp, outcome) move || {
                let res = lp.sleep(Duration::from_secs(60));
                outcome.set(Some(res.map_err(|e| e.is_interrupted())));
                Ok(())
            }))
            .unwrap();
        lp.create_fiber(enclose!((lp) move || {
            lp.sleep(Duration::from_millis(5))?;
            lp.interrupt_fiber(sleeper)
        }))
        .unwrap();

        let start = Instant::now();
        lp.run().unwrap();
        assert!(start.elapsed() < Duration::from_secs(60));
        assert_eq!(outcome.get(), Some(Err(true)));
        assert_eq!(lp.timer_count(), 0);
    }

    #[test]
    fn forgotten_fiber_is_reported() {
        let lp = Loop::default();
        lp.create_fiber(enclose!((lp) move || {
            let me = lp.current_fiber().unwrap();
            lp.suspend_fiber(me)
        }))
        .unwrap();

        assert!(matches!(
            lp.run(),
            Err(SpindleError::Stalled { fibers: 1 })
        ));
    }

    #[test]
    fn spurious_resume_keeps_sleeping() {
        let lp = Loop::default();
        let slept = Rc::new(Cell::new(Duration::ZERO));

        let sleeper = lp
            .create_fiber(enclose!((lp, slept) move || {
                let start = Instant::now();
                lp.sleep(Duration::from_millis(30))?;
                slept.set(start.elapsed());
                Ok(())
            }))
            .unwrap();
        lp.create_fiber(enclose!((lp) move || {
            lp.yield_now()?;
            lp.resume_fiber(sleeper)
        }))
        .unwrap();

        lp.run().unwrap();
        assert!(slept.get() >= Duration::from_millis(30));
    }

    #[test]
    fn unbounded_waits_end_on_interrupt() {
        let lp = Loop::default();
        let (reader, _writer) = pipe();
        let rfd = reader.as_raw_fd();
        lp.register_fd(rfd).unwrap();
        let outcomes = Rc::new(RefCell::new(Vec::new()));

        let sleeper = lp
            .create_fiber(enclose!((lp, outcomes) move || {
                let res = lp.sleep(Duration::MAX);
                outcomes.borrow_mut().push(res.map_err(|e| e.is_interrupted()));
                Ok(())
            }))
            .unwrap();
        let waiter = lp
            .create_fiber(enclose!((lp, outcomes) move || {
                let res = lp.wait_for_fd(rfd, IoCondition::READABLE, Some(Duration::MAX));
                outcomes.borrow_mut().push(res.map(drop).map_err(|e| e.is_interrupted()));
                Ok(())
            }))
            .unwrap();
        lp.create_fiber(enclose!((lp) move || {
            lp.yield_now()?;
            assert_eq!(lp.timer_count(), 0);
            lp.sleep(Duration::from_millis(5))?;
            lp.interrupt_fiber(sleeper)?;
            lp.interrupt_fiber(waiter)
        }))
        .unwrap();

        lp.run().unwrap();
        assert_eq!(*outcomes.borrow(), vec![Err(true), Err(true)]);
        assert_eq!(lp.watcher_count(), 0);
        lp.unregister_fd(rfd).unwrap();
    }

    #[test]
    fn dropping_the_owner_frees_a_stalled_loop() {
        let lp = Loop::default();
        let inner = Rc::downgrade(&lp.inner);
        lp.create_fiber(enclose!((lp) move || {
            let me = lp.current_fiber().unwrap();
            lp.suspend_fiber(me)
        }))
        .unwrap();
        assert!(matches!(lp.run(), Err(SpindleError::Stalled { fibers: 1 })));

        let handle = lp.clone();
        drop(handle);
        assert!(inner.upgrade().is_some());
        drop(lp);
        assert!(inner.upgrade().is_none());
    }
}
