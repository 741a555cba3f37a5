// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! Stackful execution contexts.
//!
//! This is the only place that knows how fibers get a stack of their own and
//! how control moves in and out of it. Everything above works with two
//! operations: [`ExecutionContext::resume`], called from the scheduler's main
//! flow, and [`Suspender::suspend`], called from inside the fiber.

use crate::sys;
use corosensei::{stack::DefaultStack, Coroutine, CoroutineResult, Yielder};
use std::{
    cell::Cell,
    fmt,
    io,
    panic::{self, AssertUnwindSafe},
    ptr,
    rc::Rc,
};

type FiberCoroutine = Coroutine<(), (), (), DefaultStack>;

/// A fiber's stack, together with where it last stopped.
pub(crate) struct ExecutionContext {
    coroutine: Option<FiberCoroutine>,
    unwinding: Rc<Cell<bool>>,
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (started, done) = match &self.coroutine {
            Some(co) => (co.started(), co.done()),
            None => (false, true),
        };
        f.debug_struct("ExecutionContext")
            .field("started", &started)
            .field("done", &done)
            .finish()
    }
}

impl ExecutionContext {
    /// Maps a stack of `stack_size` bytes that will run `entry` on its first
    /// resumption. Nothing runs yet.
    pub(crate) fn new(
        stack_size: usize,
        entry: Box<dyn FnOnce()>,
    ) -> io::Result<(ExecutionContext, Suspender)> {
        // the mapping also holds a guard page and is rounded up to whole pages
        if stack_size.checked_add(2 * sys::page_size()).is_none() {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                format!("a stack of {} bytes cannot be mapped", stack_size),
            ));
        }
        let stack = DefaultStack::new(stack_size)?;
        let suspender = Suspender {
            yielder: Rc::new(Cell::new(ptr::null())),
            unwinding: Rc::new(Cell::new(false)),
        };
        let slot = suspender.yielder.clone();
        let coroutine = Coroutine::with_stack(stack, move |yielder: &Yielder<(), ()>, ()| {
            slot.set(yielder as *const _);
            entry();
            slot.set(ptr::null());
        });
        Ok((
            ExecutionContext {
                coroutine: Some(coroutine),
                unwinding: suspender.unwinding.clone(),
            },
            suspender,
        ))
    }

    /// Transfers control into the fiber, starting it or continuing it from
    /// its last suspension, until it suspends again or its entry returns.
    ///
    /// Returns `true` once the entry has returned.
    pub(crate) fn resume(&mut self) -> bool {
        match &mut self.coroutine {
            Some(co) if !co.done() => matches!(co.resume(()), CoroutineResult::Return(())),
            _ => true,
        }
    }
}

impl Drop for ExecutionContext {
    /// A fiber stopped in the middle of its procedure has its stack unwound,
    /// so the values living on it are dropped.
    fn drop(&mut self) {
        let mut co = match self.coroutine.take() {
            Some(co) => co,
            None => return,
        };
        if co.started() && !co.done() {
            self.unwinding.set(true);
            let res = panic::catch_unwind(AssertUnwindSafe(|| co.force_unwind()));
            if res.is_err() {
                log::error!("a fiber stack could not be unwound cleanly");
            }
        }
    }
}

/// Suspends the fiber that owns it, handing control back to whoever
/// resumed it.
#[derive(Clone)]
pub(crate) struct Suspender {
    yielder: Rc<Cell<*const Yielder<(), ()>>>,
    unwinding: Rc<Cell<bool>>,
}

impl fmt::Debug for Suspender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Suspender")
            .field("running", &!self.yielder.get().is_null())
            .finish()
    }
}

impl Suspender {
    /// Returns when the owning fiber is resumed.
    ///
    /// Must be called from the owning fiber's own stack.
    pub(crate) fn suspend(&self) {
        let yielder = self.yielder.get();
        assert!(!yielder.is_null(), "suspending a fiber that is not running");
        // SAFETY: the yielder lives in the coroutine's entry frame, which
        // stays alive until the pointer is cleared on the way out. Callers
        // run on that same stack, so the frame is below them.
        unsafe { (*yielder).suspend(()) }
    }

    /// Whether the owning fiber's stack is being unwound because its context
    /// was dropped. A panic caught on that stack must then be resumed.
    pub(crate) fn is_unwinding(&self) -> bool {
        self.unwinding.get()
    }
}
