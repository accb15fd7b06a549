//! A minimal cancellation context, modeled on Go's `context.Context`, built
//! from plain atomics instead of pulling in an async runtime — `evloop` has
//! no `tokio` dependency, and a cooperative single-threaded loop has no use
//! for one.
//!
//! [`Context`] is deliberately small: a shared cancellation flag plus an
//! optional deadline. [`Loop::run`](crate::driver::Loop::run) and
//! [`promisify`](crate::goroutine_bridge::promisify) are the two consumers;
//! both only need "has this been told to stop" and "why".

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::EvloopError;

struct Inner {
    cancelled: AtomicBool,
    deadline: Option<Instant>,
}

/// A cancellable, optionally deadline-bound handle, shareable across threads.
///
/// Cloning shares the same underlying flag: cancelling any clone cancels all
/// of them, matching `context.Context`'s parent/child propagation for the
/// cancellation signal (though this type has no child-context tree — each
/// [`Context::with_timeout`]/[`Context::with_deadline`] call produces an
/// independent flag, which is sufficient for `evloop`'s two consumers).
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("cancelled", &self.inner.cancelled.load(Ordering::Acquire))
            .field("deadline", &self.inner.deadline)
            .finish()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl Context {
    /// A context that is never cancelled and carries no deadline — the
    /// root context most callers start from.
    #[must_use]
    pub fn background() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                deadline: None,
            }),
        }
    }

    /// A context with a deadline `duration` from now. Observed as cancelled
    /// (with [`EvloopError::Timeout`] as its `err()`) once the deadline
    /// passes, with no timer thread required: every check is a cheap
    /// `Instant::now()` comparison.
    #[must_use]
    pub fn with_timeout(duration: Duration) -> Self {
        Self::with_deadline(Instant::now() + duration)
    }

    /// A context with an absolute deadline.
    #[must_use]
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                deadline: Some(deadline),
            }),
        }
    }

    /// Derives a child context that is cancelled either when `self` is
    /// cancelled/expired, or after `duration`, whichever comes first.
    #[must_use]
    pub fn child_with_timeout(&self, duration: Duration) -> Self {
        self.child_with_deadline(Instant::now() + duration)
    }

    /// Derives a child context cancelled either when `self` is
    /// cancelled/expired, or at `deadline`, whichever comes first.
    #[must_use]
    pub fn child_with_deadline(&self, deadline: Instant) -> Self {
        let child_deadline = match self.inner.deadline {
            Some(parent) if parent < deadline => Some(parent),
            _ => Some(deadline),
        };
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(self.inner.cancelled.load(Ordering::Acquire)),
                deadline: child_deadline,
            }),
        }
    }

    /// Explicitly cancels this context (and every clone sharing its flag).
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
    }

    /// `true` iff cancelled explicitly or past its deadline.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        if self.inner.cancelled.load(Ordering::Acquire) {
            return true;
        }
        self.inner.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// The reason this context is cancelled, or `None` if it is still live.
    /// Distinguishes an elapsed deadline ([`EvloopError::Timeout`]) from an
    /// explicit [`Self::cancel`] ([`EvloopError::AbortError`]).
    #[must_use]
    pub fn err(&self) -> Option<EvloopError> {
        let explicitly_cancelled = self.inner.cancelled.load(Ordering::Acquire);
        let expired = self.inner.deadline.is_some_and(|d| Instant::now() >= d);
        if explicitly_cancelled {
            Some(EvloopError::AbortError {
                reason: "context cancelled".to_string(),
            })
        } else if expired {
            Some(EvloopError::Timeout)
        } else {
            None
        }
    }
}
