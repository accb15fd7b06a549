//! Crate-wide error taxonomy.
//!
//! Mirrors the split the reactor-thread module upstream uses: `thiserror`
//! for the `Display`/`source` plumbing, `miette::Diagnostic` for actionable
//! `help` text, with OS-specific remediation behind `cfg_attr`.

use std::fmt;

use miette::Diagnostic;
use thiserror::Error;

/// Every fallible operation in this crate returns this error type.
#[derive(Debug, Error, Diagnostic)]
pub enum EvloopError {
    /// Returned to any submitter once the loop has entered `Terminating` or
    /// `Terminated`.
    #[error("loop is terminated or terminating; no further work is accepted")]
    #[diagnostic(
        code(evloop::loop_terminated),
        help("stop submitting work once `shutdown` has been called")
    )]
    LoopTerminated,

    /// `run` was called while the loop was already `Running`/`Sleeping`.
    #[error("loop is already running on another thread")]
    #[diagnostic(
        code(evloop::already_running),
        help("only one thread may call `run` at a time; await its return instead")
    )]
    LoopAlreadyRunning,

    /// `run` was called from within a task executing on the loop thread.
    #[error("cannot call `run` re-entrantly from within a running task")]
    #[diagnostic(
        code(evloop::reentrant_run),
        help("schedule a microtask or submit a task instead of calling `run` again")
    )]
    ReentrantRun,

    /// A negative or otherwise out-of-range file descriptor was passed to
    /// `register_fd`.
    #[error("file descriptor {fd} is out of range")]
    #[diagnostic(code(evloop::fd_out_of_range))]
    FDOutOfRange {
        /// The offending descriptor.
        fd: i32,
    },

    /// `modify_fd`/`unregister_fd` referenced a descriptor with no active
    /// registration.
    #[error("file descriptor {fd} is not registered")]
    #[diagnostic(
        code(evloop::fd_not_registered),
        help("call `register_fd` before `modify_fd` or `unregister_fd`")
    )]
    FDNotRegistered {
        /// The offending descriptor.
        fd: i32,
    },

    /// `register_fd` was called twice for the same descriptor without an
    /// intervening `unregister_fd`.
    #[error("file descriptor {fd} is already registered")]
    #[diagnostic(
        code(evloop::fd_already_registered),
        help("call `unregister_fd` (or `modify_fd` to change interest) instead of registering twice")
    )]
    FDAlreadyRegistered {
        /// The offending descriptor.
        fd: i32,
    },

    /// A task or promise handler panicked; the panic payload is captured
    /// best-effort as a string.
    #[error("task panicked: {value}")]
    #[diagnostic(code(evloop::panic))]
    Panic {
        /// The panic payload, downcast to a string where possible.
        value: String,
    },

    /// A spawned [`crate::goroutine_bridge`] thread exited without returning
    /// normally and without unwinding — the closest Rust analog to a
    /// goroutine calling `runtime.Goexit`, reachable here only via a
    /// poisoned `JoinHandle`.
    #[error("goroutine thread exited without completing normally")]
    #[diagnostic(code(evloop::goroutine_exit))]
    GoroutineExit,

    /// A deadline/timeout elapsed before the operation completed.
    #[error("operation timed out")]
    #[diagnostic(code(evloop::timeout))]
    Timeout,

    /// A value was used at a type the promise chain did not expect (the
    /// analog of a JavaScript `TypeError`) — currently only raised for
    /// self-resolution cycles.
    #[error("type error: {0}")]
    #[diagnostic(code(evloop::type_error))]
    TypeError(String),

    /// A value fell outside its accepted range (e.g. a negative timer
    /// delay).
    #[error("range error: {0}")]
    #[diagnostic(code(evloop::range_error))]
    RangeError(String),

    /// The operation was aborted via a cancellation signal.
    #[error("aborted: {reason}")]
    #[diagnostic(code(evloop::abort))]
    AbortError {
        /// Human-readable abort reason.
        reason: String,
    },

    /// One or more promises in an aggregate combinator rejected.
    #[error("all {} inputs rejected", .errors.len())]
    #[diagnostic(code(evloop::aggregate))]
    AggregateError {
        /// The rejection reasons, in input order. Shared via `Arc` since
        /// the same reason may already be held by a promise's settled
        /// state and by its unhandled-rejection tracker.
        errors: Vec<std::sync::Arc<EvloopError>>,
    },

    /// Wraps an arbitrary error with an explicit cause, preserving the
    /// chain for [`std::error::Error::source`].
    #[error("{message}")]
    #[diagnostic(code(evloop::with_cause))]
    ErrorWithCause {
        /// The top-level message.
        message: String,
        /// The underlying cause.
        #[source]
        cause: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    /// The OS poller's `poll_io` syscall failed for a reason other than
    /// `EINTR`. Fatal: the loop transitions to `Terminating` and this error
    /// is surfaced from `run`.
    #[error("I/O poller failed")]
    #[diagnostic(
        code(evloop::poll_io),
        help("this is almost always a process-wide file-descriptor exhaustion; check `ulimit -n`")
    )]
    #[cfg_attr(
        target_os = "macos",
        diagnostic(help("check `launchctl limit maxfiles` and the kqueue limit via `sysctl kern.maxfiles`"))
    )]
    PollIo(#[source] std::io::Error),

    /// An option passed to [`crate::options::LoopOptions`] failed
    /// validation at construction time.
    #[error("invalid loop option: {0}")]
    #[diagnostic(code(evloop::invalid_option))]
    InvalidOption(String),
}

impl EvloopError {
    /// Wraps an arbitrary boxed error with a message, preserving the source
    /// chain.
    #[must_use]
    pub fn with_cause(
        message: impl Into<String>,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::ErrorWithCause {
            message: message.into(),
            cause: Box::new(cause),
        }
    }

    /// True for the lifecycle bucket (`LoopTerminated`) that submitters
    /// should treat as "stop trying", not as a bug.
    #[must_use]
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, Self::LoopTerminated)
    }
}

/// A lightweight `Debug`-only wrapper used when a caught panic payload is
/// neither a `&str` nor a `String`.
pub(crate) struct OpaquePanic;

impl fmt::Display for OpaquePanic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<non-string panic payload>")
    }
}

/// Downcasts a `Box<dyn Any + Send>` panic payload to a displayable string,
/// the way `std::panic::catch_unwind`'s result is conventionally rendered.
#[must_use]
pub(crate) fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        OpaquePanic.to_string()
    }
}
