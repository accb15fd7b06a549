//! The wake protocol: a single coalescing atomic flag plus whatever
//! mechanism actually unblocks an in-flight `poll_io` (a `mio::Waker` in
//! I/O mode, or a bounded channel in fast mode).
//!
//! This is the producer side of "Write-Then-Check" / consumer side of
//! "Check-Then-Sleep": any number of producer threads may race to signal a
//! wake, but at most one actual wake syscall (or channel send) happens per
//! sleep cycle, because the flag's `0 -> 1` CAS only succeeds for the first
//! racer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Anything capable of unblocking a sleeping consumer. Implemented by the
/// concrete [`crate::poller::MioPoller`] (I/O mode) and by
/// [`FastModeWaker`] (fast mode, no registered file descriptors).
pub trait Waker: Send + Sync {
    /// Idempotent: concurrent calls are safe, and coalescing multiple calls
    /// into one wake is correct, since the consumer always re-checks its
    /// own state rather than trusting the wake count.
    fn wake(&self) -> std::io::Result<()>;
}

/// The single coalescing flag shared between producers and the consumer.
#[derive(Debug, Default)]
pub struct WakeSlot {
    pending: AtomicBool,
}

impl WakeSlot {
    /// Creates a new, unset slot.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
        }
    }

    /// Producer-side step 2/3 of "Write-Then-Check": attempts to claim the
    /// right to issue the actual wake. Returns `true` if this caller won
    /// the race and should call the underlying waker; `false` means
    /// someone else already has a wake in flight.
    #[must_use]
    pub fn try_claim(&self) -> bool {
        self.pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Consumer-side: clears the flag after waking up, so the next producer
    /// can claim it again.
    pub fn clear(&self) {
        self.pending.store(false, Ordering::Release);
    }

    /// Whether a wake is currently pending (diagnostic / testing only).
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }
}

/// Performs the full producer-side protocol: claim the slot, and if this
/// caller won the race, invoke `waker`.
pub fn signal(slot: &WakeSlot, waker: &dyn Waker) -> std::io::Result<()> {
    if slot.try_claim() {
        waker.wake()?;
    }
    Ok(())
}

/// Fast-mode waker: a size-1 mailbox used when no file descriptor is
/// registered with the poller, so there is no OS object to ping. Sending
/// when the mailbox already holds a value is a harmless no-op — the
/// consumer is going to wake up and re-check state regardless of how many
/// wakes coalesced.
#[derive(Debug, Clone)]
pub struct FastModeWaker {
    flagged: Arc<AtomicBool>,
    thread: Arc<std::thread::Thread>,
}

impl Default for FastModeWaker {
    // `std::thread::Thread` has no `Default` impl (only obtainable via
    // `std::thread::current()`), so this can't be `#[derive]`d. Binds to
    // whichever thread happens to construct the waker; harmless, since
    // `Loop::run` always rebinds via `for_current_thread` before parking.
    fn default() -> Self {
        Self {
            flagged: Arc::new(AtomicBool::new(false)),
            thread: Arc::new(std::thread::current()),
        }
    }
}

impl FastModeWaker {
    /// Creates a waker bound to the thread that will park/unpark around it
    /// (the loop thread).
    #[must_use]
    pub fn for_current_thread() -> Self {
        Self {
            flagged: Arc::new(AtomicBool::new(false)),
            thread: Arc::new(std::thread::current()),
        }
    }

    /// Consumer-side: parks the calling thread until a wake arrives or
    /// `timeout` elapses, then clears the flag.
    pub fn park_timeout(&self, timeout: std::time::Duration) {
        if self.flagged.swap(false, Ordering::AcqRel) {
            return;
        }
        std::thread::park_timeout(timeout);
        self.flagged.store(false, Ordering::Release);
    }
}

impl Waker for FastModeWaker {
    fn wake(&self) -> std::io::Result<()> {
        self.flagged.store(true, Ordering::Release);
        self.thread.unpark();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingWaker(AtomicUsize);
    impl Waker for CountingWaker {
        fn wake(&self) -> std::io::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn coalesces_concurrent_signals() {
        let slot = Arc::new(WakeSlot::new());
        let waker = Arc::new(CountingWaker(AtomicUsize::new(0)));
        // Simulate the slot already being claimed (consumer hasn't woken
        // yet): further signals must not trigger another wake.
        assert!(slot.try_claim());
        assert!(!slot.try_claim());
        signal(&slot, waker.as_ref()).unwrap();
        // try_claim above already consumed the slot, so signal's internal
        // try_claim correctly sees it held and does not call the waker.
        assert_eq!(waker.0.load(Ordering::SeqCst), 0);
        slot.clear();
        signal(&slot, waker.as_ref()).unwrap();
        assert_eq!(waker.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clear_allows_next_claim() {
        let slot = WakeSlot::new();
        assert!(slot.try_claim());
        assert!(!slot.try_claim());
        slot.clear();
        assert!(slot.try_claim());
    }
}
