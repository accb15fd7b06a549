//! `Loop`: the tick-phase driver that ties ingress, microtasks, timers and
//! the poller together.
//!
//! Grounded on the reactor-thread module's worker loop: a single dedicated
//! thread runs the body, shutdown is driven by an RAII-guarded drain rather
//! than an abrupt stop, and a panicking task is caught at the boundary
//! instead of taking the whole loop down with it.

use std::cell::Cell;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::context::Context;
use crate::error::EvloopError;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::options::{FastPathPolicy, LoopOptions};
use crate::poller::{FdCallback, FdEvents, MioPoller, Poller};
use crate::promise::{self, MicrotaskScheduler, Promise, Resolver, Rejecter, SchedulerHandle, SettledResult};
use crate::state::{LoopState, StateMachine};
use crate::timer_heap::{TimerHandle, TimerHeap};
use crate::wake::{self, FastModeWaker, WakeSlot, Waker};
use crate::Task;

thread_local! {
    static CURRENT_LOOP_ID: Cell<Option<u64>> = const { Cell::new(None) };
}

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Bounded fast-mode budget: in `FastPathPolicy::Force`/`Auto` with no
/// registered descriptors there is nothing an OS poll would ever wait on
/// other than a timer, so sleeping indefinitely would mean ignoring a
/// cancelled `ctx` until the next external wake. Capping the park duration
/// keeps `run`'s cancellation check responsive even when idle.
const FAST_MODE_MAX_SLEEP: Duration = Duration::from_secs(10);

enum Backend {
    Fast(FastModeWaker),
    Io(MioPoller),
}

impl Backend {
    fn waker(&self) -> Arc<dyn Waker> {
        match self {
            Self::Fast(w) => Arc::new(w.clone()),
            Self::Io(p) => p.waker(),
        }
    }
}

enum IngressQueue {
    Linked(crate::ingress::Ingress),
    Chunked(crate::chunked_ingress::ChunkedIngress),
}

impl IngressQueue {
    fn push(&self, task: Task) {
        match self {
            Self::Linked(q) => q.push(task),
            Self::Chunked(q) => q.push(task),
        }
    }

    fn pop(&self) -> Option<Task> {
        match self {
            Self::Linked(q) => q.pop(),
            Self::Chunked(q) => q.pop(),
        }
    }

    fn pop_batch(&self, out: &mut Vec<Task>, max: usize) {
        match self {
            Self::Linked(q) => q.pop_batch(out, max),
            Self::Chunked(q) => q.pop_batch(out, max),
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Self::Linked(q) => q.is_empty(),
            Self::Chunked(q) => q.is_empty(),
        }
    }
}

/// A wait-group guarding in-flight [`crate::goroutine_bridge::promisify`]
/// threads against a concurrent shutdown. The check-and-increment and the
/// state transition to `Terminating` share one mutex, so a `promisify` call
/// either happens-before the transition (and is waited on) or happens-after
/// (and is rejected outright) — never both unobserved.
#[derive(Default)]
struct PromisifyGuard {
    registration: Mutex<usize>,
    drained: Condvar,
}

impl PromisifyGuard {
    fn try_register(&self, can_accept: impl FnOnce() -> bool) -> bool {
        let mut count = self
            .registration
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if !can_accept() {
            return false;
        }
        *count += 1;
        true
    }

    fn done(&self) {
        let mut count = self
            .registration
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *count -= 1;
        if *count == 0 {
            self.drained.notify_all();
        }
    }

    fn wait_until_drained(&self) {
        let mut count = self
            .registration
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        while *count > 0 {
            count = self
                .drained
                .wait(count)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }
}

/// The single-threaded event loop driver.
///
/// `Loop` is always held behind an `Arc` (see [`Loop::new`]): promises bind
/// to it as a [`MicrotaskScheduler`], and [`crate::goroutine_bridge::promisify`]
/// threads hold a clone to marshal their result back.
pub struct Loop {
    id: u64,
    options: LoopOptions,
    state: StateMachine,
    ingress: IngressQueue,
    microtask_ring: crate::microtask_ring::MicrotaskRing,
    timers: Mutex<TimerHeap>,
    backend: Mutex<Backend>,
    // Mirrors `backend`'s current waker outside the mutex, so `signal_wake`
    // never needs to contend with a thread parked inside a blocking
    // `poll_io` holding the `backend` lock. Kept in sync at every site that
    // replaces `backend`'s contents.
    cached_waker: Mutex<Arc<dyn Waker>>,
    wake_slot: WakeSlot,
    metrics: Metrics,
    tick_time: Mutex<Option<Instant>>,
    drain_claimed: AtomicBool,
    promisify_guard: PromisifyGuard,
    unhandled_rejection_hook: Mutex<Option<Box<dyn Fn(Arc<EvloopError>) + Send + Sync>>>,
}

impl std::fmt::Debug for Loop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loop")
            .field("id", &self.id)
            .field("state", &self.state.load())
            .finish_non_exhaustive()
    }
}

impl Loop {
    /// Constructs a new loop from `options`. The poller (or fast-mode
    /// waker) is acquired eagerly; the loop thread itself is not spawned
    /// here — call [`Self::run`] on whichever thread should drive it.
    ///
    /// # Errors
    ///
    /// Propagates [`EvloopError::PollIo`] if `FastPathPolicy::Never`
    /// requires an OS poller that fails to initialize.
    pub fn new(options: LoopOptions) -> Result<Arc<Self>, EvloopError> {
        let backend = match options.fast_path_policy {
            FastPathPolicy::Never => Backend::Io(MioPoller::new()?),
            FastPathPolicy::Auto | FastPathPolicy::Force => Backend::Fast(FastModeWaker::default()),
        };
        let ingress = match options.ingress_backend {
            crate::options::IngressBackend::Chunked => {
                IngressQueue::Chunked(crate::chunked_ingress::ChunkedIngress::new())
            }
            crate::options::IngressBackend::Linked => IngressQueue::Linked(crate::ingress::Ingress::new()),
        };
        let metrics = Metrics::new(options.metrics_enabled);
        let microtask_ring = crate::microtask_ring::MicrotaskRing::new(options.microtask_ring_capacity);
        let initial_waker = backend.waker();
        Ok(Arc::new(Self {
            id: NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed),
            options,
            state: StateMachine::new(),
            ingress,
            microtask_ring,
            timers: Mutex::new(TimerHeap::new()),
            backend: Mutex::new(backend),
            cached_waker: Mutex::new(initial_waker),
            wake_slot: WakeSlot::new(),
            metrics,
            tick_time: Mutex::new(None),
            drain_claimed: AtomicBool::new(false),
            promisify_guard: PromisifyGuard::default(),
            unhandled_rejection_hook: Mutex::new(None),
        }))
    }

    /// Registers a callback invoked whenever a promise bound to this loop
    /// rejects with no attached handler one tick after settlement.
    pub fn on_unhandled_rejection<F>(&self, callback: F)
    where
        F: Fn(Arc<EvloopError>) + Send + Sync + 'static,
    {
        *self
            .unhandled_rejection_hook
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(Box::new(callback));
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LoopState {
        self.state.load()
    }

    /// The wall-clock instant the current (or most recently completed) tick
    /// began. `None` before the first tick.
    #[must_use]
    pub fn current_tick_time(&self) -> Option<Instant> {
        *self
            .tick_time
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// A snapshot of the rolling-window metrics.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// A [`SchedulerHandle`] bound to this loop, for constructing promises
    /// that run their handlers as microtasks here.
    #[must_use]
    pub fn scheduler_handle(self: &Arc<Self>) -> SchedulerHandle {
        SchedulerHandle::Bound(self.clone() as Arc<dyn MicrotaskScheduler>)
    }

    fn instrument_task(&self, f: Task) -> Task {
        let task_id = NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed);
        Box::new(move || {
            let span = tracing::trace_span!("evloop_task", task_id);
            let _enter = span.enter();
            f();
        })
    }

    /// Submits a task to run on the loop thread. Callable from any thread.
    ///
    /// # Errors
    ///
    /// [`EvloopError::LoopTerminated`] once shutdown has begun.
    pub fn submit<F>(&self, f: F) -> Result<(), EvloopError>
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.state.can_accept_work() {
            return Err(EvloopError::LoopTerminated);
        }
        self.ingress.push(self.instrument_task(Box::new(f)));
        self.signal_wake();
        Ok(())
    }

    /// Schedules a microtask, to run before the next ingress/timer phase.
    ///
    /// # Errors
    ///
    /// [`EvloopError::LoopTerminated`] once shutdown has begun.
    pub fn schedule_microtask<F>(&self, f: F) -> Result<(), EvloopError>
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.state.can_accept_work() {
            return Err(EvloopError::LoopTerminated);
        }
        self.push_microtask(self.instrument_task(Box::new(f)));
        Ok(())
    }

    fn push_microtask(&self, task: Task) {
        self.microtask_ring.push(Some(task));
        self.signal_wake();
    }

    /// Schedules `f` to run after `delay`.
    ///
    /// # Errors
    ///
    /// [`EvloopError::LoopTerminated`] once shutdown has begun.
    pub fn schedule_timer<F>(&self, delay: Duration, f: F) -> Result<TimerHandle, EvloopError>
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.state.can_accept_work() {
            return Err(EvloopError::LoopTerminated);
        }
        let deadline = Instant::now() + delay;
        let handle = self
            .timers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .schedule(deadline, self.instrument_task(Box::new(f)));
        self.signal_wake();
        Ok(handle)
    }

    /// Cancels a pending timer. No-op if already fired or unknown.
    pub fn cancel_timer(&self, handle: TimerHandle) {
        self.timers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .cancel(handle);
    }

    /// Registers `fd` for readiness notification. In `FastPathPolicy::Auto`
    /// with no descriptors registered yet, this lazily switches the backend
    /// from fast mode to the OS poller.
    ///
    /// # Errors
    ///
    /// [`EvloopError::InvalidOption`] under `FastPathPolicy::Force`, where
    /// registering a descriptor is a programmer error; otherwise whatever
    /// [`Poller::register_fd`] returns.
    pub fn register_fd(&self, fd: RawFd, events: FdEvents, cb: FdCallback) -> Result<(), EvloopError> {
        let mut backend = self
            .backend
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match &mut *backend {
            Backend::Io(poller) => poller.register_fd(fd, events, cb),
            Backend::Fast(_) => {
                if self.options.fast_path_policy == FastPathPolicy::Force {
                    return Err(EvloopError::InvalidOption(
                        "register_fd is not permitted under FastPathPolicy::Force".to_string(),
                    ));
                }
                let mut poller = MioPoller::new()?;
                poller.register_fd(fd, events, cb)?;
                *backend = Backend::Io(poller);
                *self
                    .cached_waker
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner) = backend.waker();
                Ok(())
            }
        }
    }

    /// Updates the interest set for an already-registered descriptor.
    ///
    /// # Errors
    ///
    /// [`EvloopError::FDNotRegistered`] if no OS poller backend is active
    /// (fast mode never has registrations) or the descriptor is unknown.
    pub fn modify_fd(&self, fd: RawFd, events: FdEvents) -> Result<(), EvloopError> {
        match &mut *self
            .backend
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
        {
            Backend::Io(poller) => poller.modify_fd(fd, events),
            Backend::Fast(_) => Err(EvloopError::FDNotRegistered { fd }),
        }
    }

    /// Removes a descriptor's registration entirely.
    ///
    /// # Errors
    ///
    /// [`EvloopError::FDNotRegistered`] if no OS poller backend is active or
    /// the descriptor is unknown.
    pub fn unregister_fd(&self, fd: RawFd) -> Result<(), EvloopError> {
        match &mut *self
            .backend
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
        {
            Backend::Io(poller) => poller.unregister_fd(fd),
            Backend::Fast(_) => Err(EvloopError::FDNotRegistered { fd }),
        }
    }

    /// Unblocks a sleeping loop thread. Harmless if the loop is not
    /// currently sleeping: the wake is coalesced and simply observed on the
    /// next `Check-Then-Sleep` pass.
    pub fn wake(&self) -> Result<(), EvloopError> {
        self.signal_wake();
        Ok(())
    }

    fn signal_wake(&self) {
        // Deliberately reads `cached_waker`, not `backend`: `wake_protocol`'s
        // I/O-mode arm holds `backend` for the whole blocking `poll_io`
        // call, and a producer locking the same mutex here would deadlock
        // against a sleeping consumer instead of waking it.
        let waker = self
            .cached_waker
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        let _ = wake::signal(&self.wake_slot, waker.as_ref());
    }

    fn has_pending_work(&self, now: Instant) -> bool {
        !self.ingress.is_empty()
            || !self.microtask_ring.is_empty()
            || self
                .timers
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .next_deadline(now)
                .is_some_and(|d| d == Duration::ZERO)
    }

    /// Registers intent to run a [`crate::goroutine_bridge::promisify`]
    /// thread, atomically with respect to a concurrent shutdown.
    pub(crate) fn try_register_promisify(&self) -> bool {
        self.promisify_guard.try_register(|| self.state.can_accept_work())
    }

    pub(crate) fn promisify_done(&self) {
        self.promisify_guard.done();
    }

    /// Submits a boxed task, returning it back on failure instead of
    /// discarding it — used by [`crate::goroutine_bridge`] so a result that
    /// can't be marshalled onto a terminated loop is still settled directly.
    pub(crate) fn try_submit_task(&self, task: Task) -> Result<(), Task> {
        if !self.state.can_accept_work() {
            return Err(task);
        }
        self.ingress.push(self.instrument_task(task));
        self.signal_wake();
        Ok(())
    }

    /// Runs the loop on the calling thread until `ctx` is cancelled or
    /// [`Self::shutdown`] is called (from any thread). Blocks.
    ///
    /// # Errors
    ///
    /// [`EvloopError::LoopAlreadyRunning`] if another thread is already
    /// driving this loop; [`EvloopError::ReentrantRun`] if called from
    /// within a task already executing on this loop's thread;
    /// [`EvloopError::LoopTerminated`] if the loop has already terminated;
    /// otherwise propagates a fatal [`EvloopError::PollIo`] from the
    /// poller.
    pub fn run(self: &Arc<Self>, ctx: &Context) -> Result<(), EvloopError> {
        if CURRENT_LOOP_ID.with(Cell::get) == Some(self.id) {
            return Err(EvloopError::ReentrantRun);
        }

        match self.state.load() {
            LoopState::Terminated => return Err(EvloopError::LoopTerminated),
            LoopState::Running | LoopState::Sleeping => return Err(EvloopError::LoopAlreadyRunning),
            LoopState::Terminating => {
                self.drain_and_terminate();
                return Ok(());
            }
            LoopState::Awake => {}
        }
        if !self.state.try_transition(LoopState::Awake, LoopState::Running) {
            return Err(EvloopError::LoopAlreadyRunning);
        }

        // Bind the fast-mode waker's park/unpark target to this thread now
        // that we know which thread is actually driving the loop.
        {
            let mut backend = self
                .backend
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if matches!(&*backend, Backend::Fast(_)) {
                *backend = Backend::Fast(FastModeWaker::for_current_thread());
                *self
                    .cached_waker
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner) = backend.waker();
            }
        }

        CURRENT_LOOP_ID.with(|c| c.set(Some(self.id)));
        let result = self.run_inner(ctx);
        CURRENT_LOOP_ID.with(|c| c.set(None));
        result
    }

    fn run_inner(self: &Arc<Self>, ctx: &Context) -> Result<(), EvloopError> {
        loop {
            if ctx.is_cancelled() || self.state.is_terminal() {
                // `is_terminal` (not just `== Terminating`) matters here: a
                // task running during this very tick may have called
                // `shutdown` reentrantly and already driven the state all
                // the way to `Terminated` before this check runs, in which
                // case `drain_and_terminate`'s own claim-guard makes this a
                // harmless no-op rather than a second, redundant drain.
                self.drain_and_terminate();
                return Ok(());
            }

            self.run_tick_phases();

            let now = Instant::now();
            let next_timer = self
                .timers
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .next_deadline(now);
            let budget = self.compute_budget(next_timer);

            if let Err(e) = self.wake_protocol(budget) {
                self.drain_and_terminate();
                return Err(e);
            }
        }
    }

    fn compute_budget(&self, next_timer: Option<Duration>) -> Option<Duration> {
        let is_fast = matches!(
            &*self
                .backend
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
            Backend::Fast(_)
        );
        match (is_fast, next_timer) {
            (true, Some(d)) => Some(d.min(FAST_MODE_MAX_SLEEP)),
            (true, None) => Some(FAST_MODE_MAX_SLEEP),
            (false, other) => other,
        }
    }

    fn run_tick_phases(&self) {
        let tick_start = Instant::now();
        *self
            .tick_time
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(tick_start);

        // Phase 1: drain ingress.
        let mut batch = Vec::with_capacity(self.options.ingress_drain_batch);
        self.ingress.pop_batch(&mut batch, self.options.ingress_drain_batch);
        for task in batch {
            self.run_task_catching(task);
            self.metrics.record_task();
        }

        // Phase 2: drain microtasks.
        self.drain_microtasks();

        // Phase 3: expire timers. Microtasks a timer callback schedules are
        // deliberately left for the next tick's phase 2, never drained here.
        let now = Instant::now();
        let due = self
            .timers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop_due(now);
        for cb in due {
            self.run_task_catching(cb);
            self.metrics.record_timer();
        }

        self.metrics.record_tick(tick_start.elapsed());
    }

    fn drain_microtasks(&self) {
        while let Some(task) = self.microtask_ring.pop() {
            self.run_task_catching(task);
            self.metrics.record_microtask();
        }
    }

    fn run_task_catching(&self, task: Task) {
        if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(task)) {
            let message = crate::error::panic_payload_to_string(&*payload);
            tracing::error!(panic = %message, "task panicked; continuing with the next task");
        }
    }

    fn wake_protocol(&self, budget: Option<Duration>) -> Result<(), EvloopError> {
        self.state.try_transition(LoopState::Running, LoopState::Sleeping);

        if self.has_pending_work(Instant::now()) {
            self.state.try_transition(LoopState::Sleeping, LoopState::Running);
            return Ok(());
        }

        let result = {
            let mut backend = self
                .backend
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            match &mut *backend {
                Backend::Fast(w) => {
                    let w = w.clone();
                    drop(backend);
                    w.park_timeout(budget.unwrap_or(FAST_MODE_MAX_SLEEP));
                    Ok(0)
                }
                Backend::Io(poller) => poller.poll_io(budget),
            }
        };

        match result {
            Ok(ready) => {
                self.state.try_transition(LoopState::Sleeping, LoopState::Running);
                self.wake_slot.clear();
                // `MioPoller::poll_io` already ran each ready descriptor's
                // callback inline; under strict ordering, any microtask one
                // of those callbacks scheduled runs now instead of waiting
                // for the next tick's phase 2.
                if ready > 0 && self.options.strict_microtask_ordering {
                    self.drain_microtasks();
                }
                Ok(())
            }
            Err(e) => {
                self.state.transition_any(&[LoopState::Sleeping, LoopState::Running], LoopState::Terminating);
                tracing::error!(error = %e, "poll_io failed; terminating loop");
                Err(e)
            }
        }
    }

    fn try_claim_drain(&self) -> bool {
        self.drain_claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn drain_and_terminate(&self) {
        if !self.try_claim_drain() {
            return;
        }
        while let Some(task) = self.ingress.pop() {
            self.run_task_catching(task);
        }
        self.drain_microtasks();
        self.promisify_guard.wait_until_drained();
        // A promisify thread still in flight above settles its promise
        // directly (via `try_submit_task`'s fallback, since the loop no
        // longer accepts ingress work once `Terminating`), which schedules
        // that promise's `.then()` handlers as microtasks with no loop
        // thread left to drain them. Drain once more so those handlers —
        // and anything they chain into synchronously — still run before
        // the loop is marked `Terminated`.
        self.drain_microtasks();
        self.state.store(LoopState::Terminated);
    }

    /// Forces shutdown from any thread: transitions to `Terminating`, wakes
    /// a sleeping loop thread, and blocks the caller until the drain
    /// completes (performing the drain itself if no loop thread is
    /// currently running it).
    pub fn shutdown(&self, ctx: &Context) -> Result<(), EvloopError> {
        self.state.transition_any(
            &[LoopState::Awake, LoopState::Running, LoopState::Sleeping],
            LoopState::Terminating,
        );
        let _ = self.wake();
        self.drain_and_terminate();
        while self.state.load() != LoopState::Terminated {
            if ctx.is_cancelled() {
                return Err(ctx.err().unwrap_or(EvloopError::Timeout));
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    }

    /// Releases poller resources: shuts down (if not already terminated),
    /// then drops the backend's file descriptors by replacing it with a
    /// fresh fast-mode waker. Idempotent; safe to call more than once.
    ///
    /// # Errors
    ///
    /// Whatever [`Self::shutdown`] returns, if shutdown was still pending.
    pub fn close(&self) -> Result<(), EvloopError> {
        if self.state.load() != LoopState::Terminated {
            self.shutdown(&Context::background())?;
        }
        let fresh = Backend::Fast(FastModeWaker::default());
        *self
            .cached_waker
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = fresh.waker();
        *self
            .backend
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = fresh;
        Ok(())
    }

    // -- Promise convenience constructors, bound to this loop's scheduler --

    /// An already-fulfilled promise bound to this loop.
    #[must_use]
    pub fn promise_resolved<T: Send + 'static>(self: &Arc<Self>, value: T) -> Promise<T> {
        Promise::resolved(self.scheduler_handle(), value)
    }

    /// An already-rejected promise bound to this loop.
    #[must_use]
    pub fn promise_rejected<T: Send + 'static>(self: &Arc<Self>, reason: EvloopError) -> Promise<T> {
        Promise::rejected(self.scheduler_handle(), reason)
    }

    /// A pending promise with its resolver/rejecter, bound to this loop.
    #[must_use]
    pub fn promise_with_resolvers<T: Send + 'static>(
        self: &Arc<Self>,
    ) -> (Promise<T>, Resolver<T>, Rejecter<T>) {
        Promise::new_with_resolvers(self.scheduler_handle())
    }

    /// `Promise.all` over promises bound to this loop.
    #[must_use]
    pub fn promise_all<T: Send + 'static>(self: &Arc<Self>, promises: Vec<Promise<T>>) -> Promise<Vec<Arc<T>>> {
        promise::all(self.scheduler_handle(), promises)
    }

    /// `Promise.race` over promises bound to this loop.
    #[must_use]
    pub fn promise_race<T: Send + 'static>(self: &Arc<Self>, promises: Vec<Promise<T>>) -> Promise<T> {
        promise::race(self.scheduler_handle(), promises)
    }

    /// `Promise.any` over promises bound to this loop.
    #[must_use]
    pub fn promise_any<T: Send + 'static>(self: &Arc<Self>, promises: Vec<Promise<T>>) -> Promise<T> {
        promise::any(self.scheduler_handle(), promises)
    }

    /// `Promise.allSettled` over promises bound to this loop.
    #[must_use]
    pub fn promise_all_settled<T: Send + 'static>(
        self: &Arc<Self>,
        promises: Vec<Promise<T>>,
    ) -> Promise<Vec<SettledResult<T>>> {
        promise::all_settled(self.scheduler_handle(), promises)
    }
}

impl MicrotaskScheduler for Loop {
    fn schedule_microtask(&self, task: Task) {
        self.push_microtask(task);
    }

    fn report_unhandled_rejection(&self, reason: Arc<EvloopError>) {
        tracing::warn!(reason = %reason, "unhandled promise rejection");
        if let Some(cb) = &*self
            .unhandled_rejection_hook
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
        {
            cb(reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn new_fast_loop() -> Arc<Loop> {
        Loop::new(
            LoopOptions::builder()
                .fast_path_policy(FastPathPolicy::Force)
                .build()
                .unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn submit_runs_and_then_shutdown_drains() {
        let lp = new_fast_loop();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let lp2 = lp.clone();
        lp.submit(move || {
            ran2.store(true, Ordering::SeqCst);
            let _ = lp2.shutdown(&Context::background());
        })
        .unwrap();

        lp.run(&Context::background()).unwrap();
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(lp.state(), LoopState::Terminated);
    }

    #[test]
    fn linked_ingress_backend_runs_submitted_tasks() {
        let lp = Loop::new(
            LoopOptions::builder()
                .fast_path_policy(FastPathPolicy::Force)
                .ingress_backend(crate::options::IngressBackend::Linked)
                .build()
                .unwrap(),
        )
        .unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let ran2 = ran.clone();
            lp.submit(move || {
                ran2.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        let lp2 = lp.clone();
        lp.submit(move || {
            let _ = lp2.shutdown(&Context::background());
        })
        .unwrap();

        lp.run(&Context::background()).unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn timer_fires_and_schedules_shutdown() {
        let lp = new_fast_loop();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        let lp2 = lp.clone();
        lp.schedule_timer(Duration::from_millis(1), move || {
            fired2.store(true, Ordering::SeqCst);
            let _ = lp2.shutdown(&Context::background());
        })
        .unwrap();

        lp.run(&Context::background()).unwrap();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn ctx_cancellation_stops_the_loop() {
        let lp = new_fast_loop();
        let ctx = Context::background();
        let ctx_for_timer = ctx.clone();
        lp.schedule_timer(Duration::from_millis(1), move || ctx_for_timer.cancel())
            .unwrap();
        lp.run(&ctx).unwrap();
        assert_eq!(lp.state(), LoopState::Terminated);
    }

    #[test]
    fn reentrant_run_is_rejected() {
        let lp = new_fast_loop();
        let lp2 = lp.clone();
        let err = Arc::new(Mutex::new(None));
        let err2 = err.clone();
        lp.submit(move || {
            let result = lp2.run(&Context::background());
            *err2.lock().unwrap() = Some(result);
            let _ = lp2.shutdown(&Context::background());
        })
        .unwrap();
        lp.run(&Context::background()).unwrap();
        let guard = err.lock().unwrap();
        assert!(matches!(guard.as_ref().unwrap(), Err(EvloopError::ReentrantRun)));
    }

    #[test]
    fn running_twice_from_different_threads_rejects_second() {
        let lp = new_fast_loop();
        let lp2 = lp.clone();
        let started = Arc::new(AtomicBool::new(false));
        let started2 = started.clone();
        let handle = std::thread::spawn(move || {
            started2.store(true, Ordering::SeqCst);
            lp2.run(&Context::background())
        });
        while !started.load(Ordering::SeqCst) {
            std::thread::yield_now();
        }
        std::thread::sleep(Duration::from_millis(10));
        let err = lp.run(&Context::background());
        assert!(matches!(err, Err(EvloopError::LoopAlreadyRunning)));
        lp.shutdown(&Context::background()).unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn submit_after_shutdown_is_rejected() {
        let lp = new_fast_loop();
        lp.shutdown(&Context::background()).unwrap();
        assert!(matches!(lp.submit(|| {}), Err(EvloopError::LoopTerminated)));
    }

    #[test]
    fn close_terminates_and_is_idempotent() {
        let lp = new_fast_loop();
        lp.close().unwrap();
        assert_eq!(lp.state(), LoopState::Terminated);
        lp.close().unwrap();
        assert_eq!(lp.state(), LoopState::Terminated);
    }

    #[test]
    fn microtasks_drain_before_next_ingress_batch() {
        let lp = new_fast_loop();
        let order = Arc::new(Mutex::new(Vec::new()));
        let order2 = order.clone();
        let lp2 = lp.clone();
        lp.submit(move || {
            order2.lock().unwrap().push("task");
            let order3 = order2.clone();
            let _ = lp2.schedule_microtask(move || order3.lock().unwrap().push("microtask"));
            let _ = lp2.shutdown(&Context::background());
        })
        .unwrap();
        lp.run(&Context::background()).unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["task", "microtask"]);
    }

    #[test]
    fn wake_torture_all_submissions_run() {
        // A hundred producer threads hammering the ingress queue at once is
        // the scenario most likely to wedge on a wake-protocol regression;
        // capture trace output so a hang shows up as a log tail instead of
        // a bare timeout.
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let lp = new_fast_loop();
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..100 {
            let lp = lp.clone();
            let counter = counter.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    let counter = counter.clone();
                    let _ = lp.submit(move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                    });
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let lp2 = lp.clone();
        lp.schedule_timer(Duration::from_millis(50), move || {
            let _ = lp2.shutdown(&Context::background());
        })
        .unwrap();
        lp.run(&Context::background()).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 100_000);
    }
}
