// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! Cooperative fibers.
//!
//! A [`Scheduler`] owns a set of fibers, each running a procedure on a stack
//! of its own. Fibers run one at a time and only give up control at explicit
//! points: [`yield_now`], [`suspend_fiber`] on themselves, or returning.
//! [`run`] switches into runnable fibers in the order they were queued until
//! none is left.
//!
//! The flow that called [`run`] acts as the idle fiber: every fiber switches
//! back to it when it stops running, and it decides who runs next.
//!
//! # Interruption
//!
//! A fiber can be asked to stop through [`interrupt_fiber`]. The request is
//! only delivered at a suspension point of the target, as an
//! [`Interrupted`] error from the call that suspended (or that was about to
//! suspend). A fiber procedure that propagates it with `?` ends cleanly.
//!
//! # Failures
//!
//! Any other error returned by a fiber procedure, and any panic escaping it,
//! stops the scheduler: [`run`] returns the error, or resumes the panic on the
//! caller's stack. Fibers that were still queued stay queued.
//!
//! [`yield_now`]: Scheduler::yield_now
//! [`suspend_fiber`]: Scheduler::suspend_fiber
//! [`run`]: Scheduler::run
//! [`interrupt_fiber`]: Scheduler::interrupt_fiber
//! [`Interrupted`]: crate::SpindleError::Interrupted

mod context;

use self::context::{ExecutionContext, Suspender};
use crate::{
    error::{BuilderErrorKind, FiberErrorKind},
    event_loop::{DEFAULT_STACK_SIZE, MIN_STACK_SIZE},
    Result,
    SpindleError,
};
use ahash::AHashMap;
use intrusive_collections::{intrusive_adapter, LinkedList, LinkedListLink};
use std::{
    any::Any,
    cell::{Cell, RefCell},
    convert::Infallible,
    fmt,
    panic::{self, AssertUnwindSafe},
    rc::{Rc, Weak},
};
use tracing::{debug, trace};

/// Identifies a fiber. Identifiers are never reused by a scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(u64);

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a fiber is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    /// Created, never switched into.
    Created,
    /// Waiting in the run queue.
    Runnable,
    /// Executing. At most one fiber is running at any time.
    Running,
    /// Out of every queue until resumed.
    Suspended,
    /// Finished, waiting for its stack to be released.
    Dead,
}

/// When an interruption request is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptAt {
    /// The next time the fiber is switched into, including its very first
    /// run, in which case its procedure never runs.
    NextResume,
    /// The next time the fiber is about to be switched away from.
    NextSwitch,
}

/// Payload unwinding the stack of a fiber that called
/// [`Scheduler::exit_current`].
struct FiberExit;

enum Fatal {
    Error(SpindleError),
    Panic(Box<dyn Any + Send>),
}

struct FiberNode {
    id: FiberId,
    link: LinkedListLink,
    state: Cell<FiberState>,
    interrupt_on_resume: Cell<bool>,
    interrupt_on_switch: Cell<bool>,
    /// Taken out while the fiber runs.
    context: RefCell<Option<ExecutionContext>>,
    suspender: Suspender,
}

intrusive_adapter!(RunQueueAdapter = Rc<FiberNode> : FiberNode { link : LinkedListLink });

impl fmt::Debug for FiberNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberNode")
            .field("id", &self.id)
            .field("state", &self.state.get())
            .finish()
    }
}

impl FiberNode {
    /// Post-run hook: fires right before the fiber gives up control.
    fn before_switch(&self) -> Result<()> {
        if self.interrupt_on_switch.replace(false) {
            trace!(fiber = %self.id, "interrupted before switching out");
            return Err(SpindleError::Interrupted);
        }
        Ok(())
    }

    /// Pre-run hook: fires as soon as the fiber gets control back.
    fn after_resume(&self) -> Result<()> {
        if self.interrupt_on_resume.replace(false) {
            trace!(fiber = %self.id, "interrupted on resume");
            return Err(SpindleError::Interrupted);
        }
        Ok(())
    }

    /// Gives control back to the idle flow until someone switches into
    /// this fiber again.
    fn switch_out(&self) -> Result<()> {
        self.suspender.suspend();
        self.after_resume()
    }
}

struct SchedulerInner {
    fibers: RefCell<AHashMap<FiberId, Rc<FiberNode>>>,
    run_queue: RefCell<LinkedList<RunQueueAdapter>>,
    current: RefCell<Option<Rc<FiberNode>>>,
    /// The last fiber to finish. Its stack is released on the next switch.
    retired: RefCell<Option<Rc<FiberNode>>>,
    fatal: RefCell<Option<Fatal>>,
    next_id: Cell<u64>,
    active: Cell<usize>,
    runnable: Cell<usize>,
    running: Cell<bool>,
    /// Set once the owning handle is gone.
    closed: Cell<bool>,
    stack_size: usize,
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        self.release_fibers();
    }
}

impl SchedulerInner {
    fn node(&self, id: FiberId) -> Result<Rc<FiberNode>> {
        self.fibers
            .borrow()
            .get(&id)
            .cloned()
            .ok_or_else(|| FiberErrorKind::NotFound(id).into())
    }

    fn current_node(&self) -> Result<Rc<FiberNode>> {
        self.current
            .borrow()
            .clone()
            .ok_or_else(|| FiberErrorKind::NoCurrentFiber.into())
    }

    fn is_current(&self, node: &FiberNode) -> bool {
        match &*self.current.borrow() {
            Some(current) => current.id == node.id,
            None => false,
        }
    }

    fn enqueue(&self, node: Rc<FiberNode>) {
        node.state.set(FiberState::Runnable);
        self.run_queue.borrow_mut().push_back(node);
        self.runnable.set(self.runnable.get() + 1);
    }

    fn dequeue(&self) -> Option<Rc<FiberNode>> {
        let node = self.run_queue.borrow_mut().pop_front()?;
        self.runnable.set(self.runnable.get() - 1);
        Some(node)
    }

    fn unlink(&self, node: &FiberNode) {
        if node.link.is_linked() {
            // SAFETY: fibers are only ever linked into their own scheduler's
            // run queue
            let mut queue = self.run_queue.borrow_mut();
            let mut cursor = unsafe { queue.cursor_mut_from_ptr(node) };
            if cursor.remove().is_none() {
                panic!("fiber has to be linked into the run queue");
            }
            self.runnable.set(self.runnable.get() - 1);
        }
    }

    fn flush_retired(&self) {
        let retired = self.retired.borrow_mut().take();
        drop(retired);
    }

    /// Runs `node` until it gives control back.
    fn switch_to(&self, node: Rc<FiberNode>) {
        self.flush_retired();
        let mut context = match node.context.borrow_mut().take() {
            Some(context) => context,
            None => return,
        };

        node.state.set(FiberState::Running);
        *self.current.borrow_mut() = Some(node.clone());
        let finished = context.resume();
        *self.current.borrow_mut() = None;

        *node.context.borrow_mut() = Some(context);
        if finished {
            node.state.set(FiberState::Dead);
            self.fibers.borrow_mut().remove(&node.id);
            *self.retired.borrow_mut() = Some(node);
        }
    }

    fn fail(&self, fatal: Fatal) {
        let mut slot = self.fatal.borrow_mut();
        if slot.is_none() {
            *slot = Some(fatal);
        }
    }

    /// Switches into queued fibers until the queue is empty or one of them
    /// failed.
    fn drain_run_queue(&self) -> std::result::Result<(), Fatal> {
        while let Some(node) = self.dequeue() {
            self.switch_to(node);
            let fatal = self.fatal.borrow_mut().take();
            if let Some(fatal) = fatal {
                return Err(fatal);
            }
        }
        Ok(())
    }

    /// Called when the owning handle goes away. Fibers are released right
    /// away, or once the current run is over.
    fn shutdown(&self) {
        self.closed.set(true);
        if !self.running.get() {
            self.release_fibers();
        }
    }

    /// Drops every fiber that has not finished, unwinding the stacks of the
    /// ones that started.
    fn release_fibers(&self) {
        loop {
            self.run_queue.borrow_mut().clear();
            self.runnable.set(0);
            let fibers: Vec<_> = self
                .fibers
                .borrow_mut()
                .drain()
                .map(|(_, node)| node)
                .collect();
            if fibers.is_empty() {
                break;
            }
            debug!(fibers = fibers.len(), "releasing unfinished fibers");
            for node in fibers {
                node.state.set(FiberState::Dead);
                // unwinding runs the fiber's destructors, which may call back
                // into the scheduler
                let context = node.context.borrow_mut().take();
                drop(context);
            }
        }
        self.active.set(0);
        self.flush_retired();
    }
}

/// Entry point of every fiber.
fn trampoline<F>(scheduler: Weak<SchedulerInner>, procedure: F)
where
    F: FnOnce() -> Result<()>,
{
    let node = match scheduler.upgrade().map(|inner| inner.current_node()) {
        Some(Ok(node)) => node,
        _ => return,
    };
    let id = node.id;
    if let Some(inner) = scheduler.upgrade() {
        inner.active.set(inner.active.get() + 1);
    }

    let outcome = match node.after_resume() {
        Err(err) => Ok(Err(err)),
        Ok(()) => {
            trace!(fiber = %id, "fiber started");
            panic::catch_unwind(AssertUnwindSafe(procedure))
        }
    };
    let outcome = match outcome {
        Err(payload) if node.suspender.is_unwinding() => panic::resume_unwind(payload),
        outcome => outcome,
    };
    drop(node);

    let inner = match scheduler.upgrade() {
        Some(inner) => inner,
        None => return,
    };
    inner.active.set(inner.active.get() - 1);
    match outcome {
        Ok(Ok(())) => trace!(fiber = %id, "fiber finished"),
        Ok(Err(SpindleError::Interrupted)) => debug!(fiber = %id, "fiber interrupted"),
        Ok(Err(err)) => {
            debug!(fiber = %id, error = %err, "fiber failed");
            inner.fail(Fatal::Error(err));
        }
        Err(payload) if payload.is::<FiberExit>() => trace!(fiber = %id, "fiber exited"),
        Err(payload) => {
            debug!(fiber = %id, "fiber panicked");
            inner.fail(Fatal::Panic(payload));
        }
    }
}

/// A set of cooperatively scheduled fibers.
///
/// Cloning gives another handle to the same scheduler, which is how fibers
/// get to call back into it.
///
/// Only the handle the scheduler was created with owns the fibers. When it
/// is dropped, every fiber that has not finished is released: a fiber that
/// never ran has its procedure dropped, and one stopped at a suspension
/// point has its stack unwound. Clones captured by those fibers go away
/// with them. A procedure that catches panics has to resume the ones it
/// does not recognize, or its stack cannot be unwound.
pub struct Scheduler {
    inner: Rc<SchedulerInner>,
    owner: bool,
}

impl Clone for Scheduler {
    fn clone(&self) -> Self {
        Scheduler {
            inner: self.inner.clone(),
            owner: false,
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if self.owner {
            self.inner.shutdown();
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("fibers", &self.fiber_count())
            .field("runnable", &self.runnable_count())
            .field("current", &self.current_fiber())
            .finish()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler::new()
    }
}

impl Scheduler {
    /// Creates a scheduler whose fibers get stacks of the default size.
    pub fn new() -> Scheduler {
        Scheduler::build(DEFAULT_STACK_SIZE)
    }

    /// Creates a scheduler whose fibers get stacks of `stack_size` bytes.
    pub fn with_stack_size(stack_size: usize) -> Result<Scheduler> {
        if stack_size < MIN_STACK_SIZE {
            return Err(BuilderErrorKind::StackTooSmall {
                requested: stack_size,
                minimum: MIN_STACK_SIZE,
            }
            .into());
        }
        Ok(Scheduler::build(stack_size))
    }

    fn build(stack_size: usize) -> Scheduler {
        Scheduler {
            inner: Rc::new(SchedulerInner {
                fibers: RefCell::new(AHashMap::new()),
                run_queue: RefCell::new(LinkedList::new(RunQueueAdapter::new())),
                current: RefCell::new(None),
                retired: RefCell::new(None),
                fatal: RefCell::new(None),
                next_id: Cell::new(0),
                active: Cell::new(0),
                runnable: Cell::new(0),
                running: Cell::new(false),
                closed: Cell::new(false),
                stack_size,
            }),
            owner: true,
        }
    }

    /// Releases the fibers as if the owning handle had been dropped.
    pub(crate) fn shutdown(&self) {
        self.inner.shutdown();
    }

    /// Creates a fiber that will run `procedure`, and queues it.
    ///
    /// The stack is mapped right away, so running out of memory is reported
    /// here as [`SpindleError::StackAllocation`]. Fails with
    /// [`FiberErrorKind::Closed`] once the owning handle was dropped.
    pub fn create_fiber<F>(&self, procedure: F) -> Result<FiberId>
    where
        F: FnOnce() -> Result<()> + 'static,
    {
        if self.inner.closed.get() {
            return Err(FiberErrorKind::Closed.into());
        }
        let id = FiberId(self.inner.next_id.get());
        let scheduler = Rc::downgrade(&self.inner);
        let entry = Box::new(move || trampoline(scheduler, procedure));
        let (context, suspender) = ExecutionContext::new(self.inner.stack_size, entry)
            .map_err(SpindleError::StackAllocation)?;
        self.inner.next_id.set(id.0 + 1);

        let node = Rc::new(FiberNode {
            id,
            link: LinkedListLink::new(),
            state: Cell::new(FiberState::Created),
            interrupt_on_resume: Cell::new(false),
            interrupt_on_switch: Cell::new(false),
            context: RefCell::new(Some(context)),
            suspender,
        });
        self.inner.fibers.borrow_mut().insert(id, node.clone());
        self.inner.run_queue.borrow_mut().push_back(node);
        self.inner.runnable.set(self.inner.runnable.get() + 1);
        trace!(fiber = %id, "fiber created");
        Ok(id)
    }

    /// Switches into queued fibers, in queue order, until the queue is
    /// empty.
    ///
    /// Suspended fibers stay alive; a later call runs them once they are
    /// resumed. Fails with [`FiberErrorKind::NestedRun`] when called from a
    /// fiber.
    pub fn run(&self) -> Result<()> {
        if self.inner.running.replace(true) {
            return Err(FiberErrorKind::NestedRun.into());
        }
        let outcome = self.inner.drain_run_queue();
        self.inner.running.set(false);
        self.inner.flush_retired();
        if self.inner.closed.get() {
            self.inner.release_fibers();
        }

        match outcome {
            Ok(()) => Ok(()),
            Err(Fatal::Error(err)) => Err(err),
            Err(Fatal::Panic(payload)) => panic::resume_unwind(payload),
        }
    }

    /// Moves the calling fiber to the back of the run queue and lets the
    /// fibers ahead of it run.
    pub fn yield_now(&self) -> Result<()> {
        let node = self.inner.current_node()?;
        node.before_switch()?;
        self.inner.enqueue(node.clone());
        node.switch_out()
    }

    /// Takes a fiber out of the run queue until [`resume_fiber`] is called.
    ///
    /// When `id` is the calling fiber, this returns once it is resumed.
    /// Suspending a fiber that is already suspended does nothing.
    ///
    /// [`resume_fiber`]: Scheduler::resume_fiber
    pub fn suspend_fiber(&self, id: FiberId) -> Result<()> {
        let node = self.inner.node(id)?;
        if self.inner.is_current(&node) {
            node.before_switch()?;
            node.state.set(FiberState::Suspended);
            trace!(fiber = %id, "fiber suspended");
            return node.switch_out();
        }

        match node.state.get() {
            FiberState::Created | FiberState::Runnable => {
                self.inner.unlink(&node);
                node.state.set(FiberState::Suspended);
                trace!(fiber = %id, "fiber suspended");
            }
            FiberState::Running | FiberState::Suspended | FiberState::Dead => {}
        }
        Ok(())
    }

    /// Queues a suspended fiber again.
    pub fn resume_fiber(&self, id: FiberId) -> Result<()> {
        let node = self.inner.node(id)?;
        if node.state.get() != FiberState::Suspended {
            return Err(FiberErrorKind::NotSuspended(id).into());
        }
        trace!(fiber = %id, "fiber resumed");
        self.inner.enqueue(node);
        Ok(())
    }

    /// Requests that `id` be interrupted at its next resumption or switch.
    ///
    /// The target is not woken up; see
    /// [`Loop::interrupt_fiber`](crate::Loop::interrupt_fiber) for that.
    pub fn interrupt_fiber(&self, id: FiberId, at: InterruptAt) -> Result<()> {
        let node = self.inner.node(id)?;
        match at {
            InterruptAt::NextResume => node.interrupt_on_resume.set(true),
            InterruptAt::NextSwitch => node.interrupt_on_switch.set(true),
        }
        trace!(fiber = %id, ?at, "interruption requested");
        Ok(())
    }

    /// Ends the calling fiber right away, as if its procedure had returned.
    ///
    /// The fiber's stack is unwound, so values living on it are dropped.
    /// This only returns, with [`FiberErrorKind::NoCurrentFiber`], when
    /// called outside of a fiber.
    pub fn exit_current(&self) -> Result<Infallible> {
        self.inner.current_node()?;
        panic::resume_unwind(Box::new(FiberExit))
    }

    /// The fiber that is running, if any.
    pub fn current_fiber(&self) -> Option<FiberId> {
        self.inner.current.borrow().as_ref().map(|node| node.id)
    }

    /// The state of a fiber, or `None` once it has been released.
    pub fn fiber_state(&self, id: FiberId) -> Option<FiberState> {
        if let Some(node) = self.inner.fibers.borrow().get(&id) {
            return Some(node.state.get());
        }
        match &*self.inner.retired.borrow() {
            Some(node) if node.id == id => Some(FiberState::Dead),
            _ => None,
        }
    }

    /// Number of fibers that have not finished yet.
    pub fn fiber_count(&self) -> usize {
        self.inner.fibers.borrow().len()
    }

    /// Number of fibers that started running and have not finished yet.
    pub fn active_fiber_count(&self) -> usize {
        self.inner.active.get()
    }

    /// Number of fibers in the run queue.
    pub fn runnable_count(&self) -> usize {
        self.inner.runnable.get()
    }
}
