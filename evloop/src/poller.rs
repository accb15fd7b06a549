//! OS readiness notification: the `Poller` contract, and a concrete `mio`
//! backend (epoll on Linux, kqueue on macOS).
//!
//! The token-to-callback table lives here, not in `mio` — `mio` only ever
//! hands back an opaque [`mio::Token`], so this module keeps its own
//! `RawFd`-keyed map and uses the fd itself as the token, reserving one
//! sentinel token for the self-wake [`mio::Waker`].

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::{Events, Interest, Poll, Token};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::error::EvloopError;
use crate::wake::Waker as WakeWaker;

/// Readiness interest bitset. `Read = 1`, `Write = 2`; combine with `|`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FdEvents(u8);

impl FdEvents {
    /// Readable interest.
    pub const READ: FdEvents = FdEvents(0b01);
    /// Writable interest.
    pub const WRITE: FdEvents = FdEvents(0b10);
    /// No interest (valid: `modify_fd(fd, NONE)` deregisters interest while
    /// keeping the table entry).
    pub const NONE: FdEvents = FdEvents(0);

    /// `true` iff the readable bit is set.
    #[must_use]
    pub fn is_readable(self) -> bool {
        self.0 & Self::READ.0 != 0
    }

    /// `true` iff the writable bit is set.
    #[must_use]
    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }

    fn to_mio_interest(self) -> Option<Interest> {
        match (self.is_readable(), self.is_writable()) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

impl std::ops::BitOr for FdEvents {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Callback invoked with the readiness bits actually observed for a
/// registered descriptor.
pub type FdCallback = Box<dyn FnMut(FdEvents) + Send>;

/// The self-wake token, reserved so it can never collide with a real
/// non-negative file descriptor used as a token.
const WAKE_TOKEN: Token = Token(usize::MAX);

struct Registration {
    events: FdEvents,
    callback: FdCallback,
}

/// Contract for OS readiness notification. See module docs for the
/// concrete [`MioPoller`] backend.
pub trait Poller: Send {
    /// Registers `fd` for `events`, invoking `callback` on each readiness
    /// event observed for it.
    ///
    /// # Errors
    ///
    /// [`EvloopError::FDOutOfRange`] if `fd < 0`;
    /// [`EvloopError::FDAlreadyRegistered`] on a duplicate registration.
    fn register_fd(&mut self, fd: RawFd, events: FdEvents, callback: FdCallback) -> Result<(), EvloopError>;

    /// Updates the interest set for an already-registered `fd`. An empty
    /// `events` is valid and deregisters interest while keeping the table
    /// entry.
    ///
    /// # Errors
    ///
    /// [`EvloopError::FDNotRegistered`] if `fd` has no active registration.
    fn modify_fd(&mut self, fd: RawFd, events: FdEvents) -> Result<(), EvloopError>;

    /// Removes both the kernel interest and the table entry for `fd`.
    ///
    /// # Errors
    ///
    /// [`EvloopError::FDNotRegistered`] if `fd` has no active registration.
    fn unregister_fd(&mut self, fd: RawFd) -> Result<(), EvloopError>;

    /// Blocks up to `timeout` (or indefinitely if `None`), then invokes
    /// every registered callback whose descriptor became ready. Returns
    /// the number of ready events observed.
    ///
    /// # Errors
    ///
    /// [`EvloopError::PollIo`] on a non-`EINTR` kernel failure. Callers
    /// must treat this as fatal to the loop.
    fn poll_io(&mut self, timeout: Option<Duration>) -> Result<usize, EvloopError>;

    /// Returns a cloneable handle capable of idempotently unblocking an
    /// in-flight [`Self::poll_io`] from any thread.
    fn waker(&self) -> Arc<dyn WakeWaker>;
}

struct MioWakerHandle(mio::Waker);

impl WakeWaker for MioWakerHandle {
    fn wake(&self) -> std::io::Result<()> {
        self.0.wake()
    }
}

/// `mio`-backed [`Poller`]: `mio::Poll` + `mio::Waker` + a `RawFd`-indexed
/// callback table.
pub struct MioPoller {
    poll: Poll,
    events: Events,
    registrations: FxHashMap<RawFd, Registration>,
    waker: Arc<MioWakerHandle>,
    registered_count: AtomicUsize,
}

impl MioPoller {
    /// Creates a new poller, acquiring the kernel poll object and the
    /// self-wake [`mio::Waker`].
    ///
    /// # Errors
    ///
    /// Propagates the underlying `mio::Poll::new`/`mio::Waker::new`
    /// I/O errors as [`EvloopError::PollIo`].
    pub fn new() -> Result<Self, EvloopError> {
        let poll = Poll::new().map_err(EvloopError::PollIo)?;
        let waker = mio::Waker::new(poll.registry(), WAKE_TOKEN).map_err(EvloopError::PollIo)?;
        Ok(Self {
            poll,
            events: Events::with_capacity(1024),
            registrations: FxHashMap::default(),
            waker: Arc::new(MioWakerHandle(waker)),
            registered_count: AtomicUsize::new(0),
        })
    }

    /// Number of currently registered file descriptors.
    #[must_use]
    pub fn registered_count(&self) -> usize {
        self.registered_count.load(Ordering::Relaxed)
    }
}

impl Poller for MioPoller {
    fn register_fd(
        &mut self,
        fd: RawFd,
        events: FdEvents,
        callback: FdCallback,
    ) -> Result<(), EvloopError> {
        if fd < 0 {
            return Err(EvloopError::FDOutOfRange { fd });
        }
        if self.registrations.contains_key(&fd) {
            return Err(EvloopError::FDAlreadyRegistered { fd });
        }
        let mut source = mio::unix::SourceFd(&fd);
        if let Some(interest) = events.to_mio_interest() {
            self.poll
                .registry()
                .register(&mut source, Token(fd as usize), interest)
                .map_err(EvloopError::PollIo)?;
        }
        self.registrations.insert(fd, Registration { events, callback });
        self.registered_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn modify_fd(&mut self, fd: RawFd, events: FdEvents) -> Result<(), EvloopError> {
        let reg = self
            .registrations
            .get_mut(&fd)
            .ok_or(EvloopError::FDNotRegistered { fd })?;
        let mut source = mio::unix::SourceFd(&fd);
        match events.to_mio_interest() {
            Some(interest) => {
                self.poll
                    .registry()
                    .reregister(&mut source, Token(fd as usize), interest)
                    .map_err(EvloopError::PollIo)?;
            }
            None => {
                // A zero event set: stop watching the descriptor at the
                // kernel level but keep the table entry, per contract.
                let _ = self.poll.registry().deregister(&mut source);
            }
        }
        reg.events = events;
        Ok(())
    }

    fn unregister_fd(&mut self, fd: RawFd) -> Result<(), EvloopError> {
        if self.registrations.remove(&fd).is_none() {
            return Err(EvloopError::FDNotRegistered { fd });
        }
        let mut source = mio::unix::SourceFd(&fd);
        let _ = self.poll.registry().deregister(&mut source);
        self.registered_count.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }

    fn poll_io(&mut self, timeout: Option<Duration>) -> Result<usize, EvloopError> {
        loop {
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(EvloopError::PollIo(e)),
            }
        }

        let mut count = 0;
        // Collect fds first: `self.events` borrows `self` immutably while
        // callbacks need `&mut self.registrations`. A handful of ready
        // descriptors per `poll_io` call is the overwhelmingly common case,
        // so a small inline buffer avoids a heap allocation on every tick
        // that has I/O to dispatch.
        let ready: SmallVec<[(RawFd, FdEvents); 16]> = self
            .events
            .iter()
            .filter(|e| e.token() != WAKE_TOKEN)
            .map(|e| {
                let fd = e.token().0 as RawFd;
                let mut bits = FdEvents::NONE;
                if e.is_readable() {
                    bits = bits | FdEvents::READ;
                }
                if e.is_writable() {
                    bits = bits | FdEvents::WRITE;
                }
                (fd, bits)
            })
            .collect();

        for (fd, bits) in ready {
            if let Some(reg) = self.registrations.get_mut(&fd) {
                (reg.callback)(bits);
                count += 1;
            }
        }
        Ok(count)
    }

    fn waker(&self) -> Arc<dyn WakeWaker> {
        self.waker.clone()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::*;

    #[test_case(FdEvents::NONE, false, false; "no interest")]
    #[test_case(FdEvents::READ, true, false; "read only")]
    #[test_case(FdEvents::WRITE, false, true; "write only")]
    #[test_case(FdEvents::READ | FdEvents::WRITE, true, true; "read and write")]
    fn fd_events_bit_combinations(events: FdEvents, readable: bool, writable: bool) {
        assert_eq!(events.is_readable(), readable);
        assert_eq!(events.is_writable(), writable);
    }

    #[test]
    fn negative_fd_is_rejected() {
        let mut poller = MioPoller::new().expect("poll object available in test environment");
        let err = poller
            .register_fd(-1, FdEvents::READ, Box::new(|_| {}))
            .unwrap_err();
        assert!(matches!(err, EvloopError::FDOutOfRange { fd: -1 }));
    }

    #[test]
    fn modify_unregistered_fd_errors() {
        let mut poller = MioPoller::new().expect("poll object available in test environment");
        let err = poller.modify_fd(999, FdEvents::READ).unwrap_err();
        assert!(matches!(err, EvloopError::FDNotRegistered { fd: 999 }));
    }

    #[test]
    fn duplicate_registration_errors() {
        use std::os::unix::io::AsRawFd;
        let mut poller = MioPoller::new().expect("poll object available in test environment");
        let (r, _w) = std::io::pipe().expect("pipe available in test environment");
        let fd = r.as_raw_fd();
        poller.register_fd(fd, FdEvents::READ, Box::new(|_| {})).unwrap();
        let err = poller.register_fd(fd, FdEvents::READ, Box::new(|_| {})).unwrap_err();
        assert!(matches!(err, EvloopError::FDAlreadyRegistered { .. }));
    }
}
