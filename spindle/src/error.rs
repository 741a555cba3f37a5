// Unless explicitly stated otherwise all files in this repository are licensed under the
// MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
use crate::scheduler::FiberId;
use std::fmt::{self, Debug};
use std::os::unix::io::RawFd;
use thiserror::Error;

/// Result type alias that all spindle public API functions can use.
pub type Result<T> = std::result::Result<T, SpindleError>;

/// Ways in which a fiber handle can be misused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberErrorKind {
    /// Only suspended fibers can be resumed.
    NotSuspended(FiberId),
    /// The fiber is dead, or was never created by this scheduler.
    NotFound(FiberId),
    /// The operation must be called from inside a running fiber.
    NoCurrentFiber,
    /// The scheduler was asked to run from inside one of its own fibers.
    NestedRun,
    /// The scheduler's owning handle was dropped, so no fiber can be added.
    Closed,
}

impl fmt::Display for FiberErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FiberErrorKind::NotSuspended(id) => write!(f, "fiber {} is not suspended", id),
            FiberErrorKind::NotFound(id) => write!(f, "fiber {} not found", id),
            FiberErrorKind::NoCurrentFiber => f.write_str("not called from a fiber"),
            FiberErrorKind::NestedRun => f.write_str("scheduler is already running"),
            FiberErrorKind::Closed => f.write_str("scheduler is shut down"),
        }
    }
}

/// Ways in which the poller's object registry can be misused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactorErrorKind {
    /// The file descriptor is already registered.
    AlreadyRegistered(RawFd),
    /// The file descriptor was never registered, or was already destroyed.
    NotRegistered(RawFd),
    /// The object still has watchers attached.
    Busy(RawFd),
}

impl fmt::Display for ReactorErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReactorErrorKind::AlreadyRegistered(fd) => write!(f, "fd {} already registered", fd),
            ReactorErrorKind::NotRegistered(fd) => write!(f, "fd {} is not registered", fd),
            ReactorErrorKind::Busy(fd) => write!(f, "fd {} still has watchers", fd),
        }
    }
}

/// Invalid loop configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuilderErrorKind {
    /// Fiber stacks must be at least this large.
    StackTooSmall {
        /// Requested size
        requested: usize,
        /// Smallest accepted size
        minimum: usize,
    },
    /// The thread pool needs at least one thread.
    NoThreads,
    /// epoll cannot return events in batches of zero.
    NoEventsCapacity,
}

impl fmt::Display for BuilderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuilderErrorKind::StackTooSmall { requested, minimum } => write!(
                f,
                "stack size {} is below the minimum of {}",
                requested, minimum
            ),
            BuilderErrorKind::NoThreads => f.write_str("thread pool size must be at least 1"),
            BuilderErrorKind::NoEventsCapacity => f.write_str("events capacity must be at least 1"),
        }
    }
}

#[derive(Error, Debug)]
/// Composite error type to encompass all error types spindle produces.
pub enum SpindleError {
    /// IO error from standard library functions
    #[error("IO error occurred: {0}")]
    IoError(#[from] std::io::Error),

    /// A fiber stack could not be mapped
    #[error("Failed to allocate fiber stack: {0}")]
    StackAllocation(std::io::Error),

    /// The current fiber was interrupted while it was suspended. Fiber code
    /// that wants cleanup semantics can match on it; propagating it out of
    /// the fiber procedure ends the fiber without failing the run.
    #[error("Fiber interrupted")]
    Interrupted,

    /// Misuse of a fiber handle
    #[error("Fiber error: {0}")]
    FiberError(FiberErrorKind),

    /// Misuse of the poller's registry
    #[error("Reactor error: {0}")]
    ReactorError(ReactorErrorKind),

    /// Invalid builder configuration
    #[error("Builder error: {0}")]
    BuilderError(BuilderErrorKind),

    /// Fibers are alive but no queued fiber, timer, watcher or in-flight
    /// task can ever wake them
    #[error("Event loop stalled with {fibers} fibers suspended forever")]
    Stalled {
        /// Fibers left behind
        fibers: usize,
    },

    /// Error returned by application code running in a fiber
    #[error("{0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl SpindleError {
    /// Wraps an application error.
    pub fn other<E>(err: E) -> SpindleError
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        SpindleError::Other(err.into())
    }

    /// Whether this is the cancellation signal delivered to interrupted
    /// fibers.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, SpindleError::Interrupted)
    }
}

impl From<FiberErrorKind> for SpindleError {
    fn from(kind: FiberErrorKind) -> Self {
        SpindleError::FiberError(kind)
    }
}

impl From<ReactorErrorKind> for SpindleError {
    fn from(kind: ReactorErrorKind) -> Self {
        SpindleError::ReactorError(kind)
    }
}

impl From<BuilderErrorKind> for SpindleError {
    fn from(kind: BuilderErrorKind) -> Self {
        SpindleError::BuilderError(kind)
    }
}

/// Augments an `io::Error` with more information about what was happening
/// and to which file descriptor when the error occurred.
pub(crate) struct ErrorEnhancer {
    pub(crate) inner: std::io::Error,
    pub(crate) op: &'static str,
    pub(crate) fd: Option<RawFd>,
}

impl fmt::Debug for ErrorEnhancer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for ErrorEnhancer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, op: {}", self.inner, self.op)?;
        if let Some(fd) = self.fd {
            write!(f, " with fd {}", fd)?;
        }
        Ok(())
    }
}

impl From<ErrorEnhancer> for std::io::Error {
    fn from(err: ErrorEnhancer) -> std::io::Error {
        std::io::Error::new(err.inner.kind(), format!("{}", err))
    }
}

impl From<ErrorEnhancer> for SpindleError {
    fn from(err: ErrorEnhancer) -> SpindleError {
        SpindleError::IoError(err.into())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io;

    #[test]
    fn composite_error_from_into() {
        let _: SpindleError = io::Error::new(io::ErrorKind::Other, "test other io-error").into();
        let _: SpindleError = FiberErrorKind::NoCurrentFiber.into();
        let _: SpindleError = ReactorErrorKind::Busy(3).into();
        let _: SpindleError = BuilderErrorKind::NoThreads.into();
        let _: SpindleError = ErrorEnhancer {
            inner: io::Error::from_raw_os_error(9),
            op: "testing enhancer",
            fd: None,
        }
        .into();
    }

    #[test]
    fn error_messages() {
        let err: SpindleError = ReactorErrorKind::AlreadyRegistered(7).into();
        assert_eq!(err.to_string(), "Reactor error: fd 7 already registered");

        let err = SpindleError::other("connection reset by peer");
        assert_eq!(err.to_string(), "connection reset by peer");
        assert!(!err.is_interrupted());
        assert!(SpindleError::Interrupted.is_interrupted());

        let err: SpindleError = BuilderErrorKind::StackTooSmall {
            requested: 10,
            minimum: 16,
        }
        .into();
        assert_eq!(
            err.to_string(),
            "Builder error: stack size 10 is below the minimum of 16"
        );
    }

    #[test]
    fn enhance_error() {
        let inner = io::Error::from_raw_os_error(9);
        let enhanced = ErrorEnhancer {
            inner,
            op: "testing enhancer",
            fd: Some(32),
        };
        let s = format!("{}", enhanced);
        assert_eq!(
            s,
            "Bad file descriptor (os error 9), op: testing enhancer with fd 32"
        );
    }

    fn convert_error() -> io::Result<()> {
        let inner = io::Error::from_raw_os_error(9);
        let enhanced = ErrorEnhancer {
            inner,
            op: "testing enhancer",
            fd: Some(32),
        };
        Err(enhanced)?;
        Ok(())
    }

    #[test]
    fn enhance_error_converted() {
        let io_error = convert_error().unwrap_err();
        let s = format!("{}", io_error.into_inner().unwrap());
        assert_eq!(
            s,
            "Bad file descriptor (os error 9), op: testing enhancer with fd 32"
        );
    }
}
