// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020
// Datadog, Inc.
//
//! # Spindle - cooperative fibers with an event loop.
//!
//! ## What is Spindle
//!
//! Spindle runs many logical tasks on a single thread. Each task is a fiber:
//! a plain closure with a stack of its own, written as ordinary sequential
//! code. Fibers switch among themselves cooperatively, and are woken when a
//! file descriptor becomes ready, when a deadline passes, or when blocking
//! work handed to a thread pool completes.
//!
//! This library depends on linux's `epoll` and `eventfd` interfaces, so it is
//! Linux-only.
//!
//! ### Fibers
//!
//! A fiber procedure returns a [`Result`]. Calls that can suspend the fiber
//! return one too, so that an interruption requested by another fiber can be
//! propagated with `?`:
//!
//! ```
//! use spindle::{enclose, Loop};
//! use std::{cell::RefCell, rc::Rc};
//!
//! let event_loop = Loop::default();
//! let trace = Rc::new(RefCell::new(String::new()));
//! for c in ['a', 'b', 'c'] {
//!     event_loop
//!         .create_fiber(enclose!((event_loop, trace) move || {
//!             for _ in 0..3 {
//!                 trace.borrow_mut().push(c);
//!                 event_loop.yield_now()?;
//!             }
//!             Ok(())
//!         }))
//!         .unwrap();
//! }
//! event_loop.run().unwrap();
//! assert_eq!(*trace.borrow(), "abcabcabc");
//! ```
//!
//! ### Blocking work
//!
//! Code that must block, such as DNS resolution or a library without a
//! nonblocking interface, can run on a thread pool through [`Async`]. The
//! calling fiber is suspended until the work is done; every other fiber keeps
//! running in the meantime.
//!
//! ```
//! use spindle::{enclose, Async, Loop};
//!
//! let event_loop = Loop::default();
//! let tasks = Async::new(&event_loop).unwrap();
//! event_loop
//!     .create_fiber(enclose!((tasks) move || {
//!         let sum = tasks.execute_task(|| (1..=10u64).sum::<u64>())?;
//!         assert_eq!(sum, 55);
//!         Ok(())
//!     }))
//!     .unwrap();
//! event_loop.run().unwrap();
//! ```
//!
//! ### Building blocks
//!
//! The pieces the loop is made of are usable on their own: [`Scheduler`]
//! runs fibers without any I/O, [`IoClock`] keeps timers, [`IoPoller`] tracks
//! file descriptor readiness, [`ThreadPool`] runs closures on worker threads,
//! and [`heap::Heap`] is the priority queue underneath the timers.

#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]
#![cfg_attr(doc, deny(rustdoc::broken_intra_doc_links))]

mod free_list;
mod sys;

mod async_task;
mod clock;
mod error;
mod event_loop;
pub mod heap;
mod poller;
mod scheduler;
mod thread_pool;

pub use crate::{
    async_task::Async,
    clock::{IoClock, TimerKey},
    error::{
        BuilderErrorKind,
        FiberErrorKind,
        ReactorErrorKind,
        Result,
        SpindleError,
    },
    event_loop::{
        Loop,
        LoopBuilder,
        DEFAULT_EVENTS_CAPACITY,
        DEFAULT_STACK_SIZE,
        DEFAULT_THREAD_POOL_SIZE,
        MIN_STACK_SIZE,
    },
    poller::{IoCondition, IoPoller, WatcherKey},
    scheduler::{FiberId, FiberState, InterruptAt, Scheduler},
    thread_pool::{CompletedTask, TaskId, ThreadPool},
};
pub use enclose::enclose;
pub use scopeguard::defer;

/// Provides common imports that almost all spindle applications will need
pub mod prelude {
    #[doc(no_inline)]
    pub use crate::{
        enclose,
        Async,
        FiberId,
        IoCondition,
        Loop,
        LoopBuilder,
        Result,
        SpindleError,
    };
}
