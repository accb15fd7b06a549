//! Promise/A+-style settlement and chaining.
//!
//! Rather than the classic JS representation (a dynamically-typed value
//! slot plus `Box<dyn Any>` type erasure for chaining), each `Promise<T>`
//! keeps its settled value behind an `Arc<T>` so multiple handlers can
//! observe it without requiring `T: Clone`, and chaining across types is
//! expressed by each `then` call storing a concretely-typed
//! `FnOnce(Settled<T>)` closure on the *source* promise rather than by
//! erasing values to `dyn Any`. `U` only has to be known at the call site
//! of `then`, never inside `PromiseInner` itself — the idiomatic Rust
//! shape for this problem.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};

use crate::error::{panic_payload_to_string, EvloopError};
use crate::Task;

/// A promise's settlement as a bare enum, with no payload attached —
/// mirrors the three-way `status` JS exposes on an inspected promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
    /// Neither fulfilled nor rejected yet.
    Pending,
    /// Fulfilled; a value is available via [`Promise::value`].
    Fulfilled,
    /// Rejected; a reason is available via [`Promise::reason`].
    Rejected,
}

/// Anything capable of scheduling a microtask — implemented by
/// [`crate::driver::Loop`]. Promises created off-loop (no scheduler bound)
/// run their handlers synchronously at settlement instead; this is the
/// documented, non-spec-compliant degraded path used only for
/// adapter-less, purely-internal promises.
pub trait MicrotaskScheduler: Send + Sync {
    /// Schedules `task` to run as a microtask, from whichever thread calls
    /// this (on-loop or off-loop).
    fn schedule_microtask(&self, task: Task);

    /// Reports a promise that rejected and, one tick later, still has no
    /// attached rejection handler. The default implementation is a no-op;
    /// [`crate::driver::Loop`] overrides it to invoke a user callback or
    /// log via `tracing`.
    fn report_unhandled_rejection(&self, _reason: Arc<EvloopError>) {}
}

/// Binds a promise to whatever schedules its handler invocations.
#[derive(Clone)]
pub enum SchedulerHandle {
    /// Bound to a loop: handlers run as microtasks on that loop's thread.
    Bound(Arc<dyn MicrotaskScheduler>),
    /// Unbound: handlers run synchronously, inline, at settlement.
    Standalone,
}

impl SchedulerHandle {
    fn dispatch(&self, task: Task) {
        match self {
            Self::Bound(s) => s.schedule_microtask(task),
            Self::Standalone => task(),
        }
    }

    fn report_unhandled(&self, reason: Arc<EvloopError>) {
        if let Self::Bound(s) = self {
            s.report_unhandled_rejection(reason);
        }
    }
}

/// A promise's settled outcome, shared via `Arc` so every handler observes
/// the same data without requiring `T: Clone`.
pub enum Settled<T> {
    /// Fulfilled with this value.
    Fulfilled(Arc<T>),
    /// Rejected with this reason.
    Rejected(Arc<EvloopError>),
}

impl<T> Clone for Settled<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Fulfilled(v) => Self::Fulfilled(v.clone()),
            Self::Rejected(r) => Self::Rejected(r.clone()),
        }
    }
}

/// What a `then` handler produces: a fresh value, a reused `Arc` (the
/// pass-through case), a rejection, or adoption of another promise's
/// eventual state (the Promise/A+ "thenable" resolution step).
pub enum Outcome<T> {
    /// Fulfill the downstream promise with a freshly produced value.
    Fulfill(T),
    /// Fulfill the downstream promise, reusing an existing `Arc` (used for
    /// pass-through handlers).
    FulfillShared(Arc<T>),
    /// Reject the downstream promise with a freshly produced reason.
    Reject(EvloopError),
    /// Reject the downstream promise, reusing an existing `Arc`.
    RejectShared(Arc<EvloopError>),
    /// Adopt another promise's eventual state. If that promise is the
    /// downstream promise itself, this becomes a `TypeError` rejection
    /// (self-resolution cycle) instead of deadlocking.
    Adopt(Promise<T>),
}

/// Input to [`Resolver::resolve`]: either a plain value, or another promise
/// to adopt (the executor-style `resolve()` behavior JS gives you, where
/// resolving with a thenable defers to its eventual state).
pub enum ResolveInput<T> {
    /// Fulfill directly with this value.
    Value(T),
    /// Adopt this promise's eventual state.
    Promise(Promise<T>),
}

enum InnerState<T> {
    Pending(Vec<Box<dyn FnOnce(Settled<T>) + Send>>),
    Settled(Settled<T>),
}

struct PromiseInner<T> {
    state: Mutex<InnerState<T>>,
    scheduler: SchedulerHandle,
    was_subscribed: AtomicBool,
}

impl<T: Send + 'static> PromiseInner<T> {
    fn new(scheduler: SchedulerHandle) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(InnerState::Pending(Vec::new())),
            scheduler,
            was_subscribed: AtomicBool::new(false),
        })
    }

    fn subscribe(self: &Arc<Self>, handler: Box<dyn FnOnce(Settled<T>) + Send>) {
        self.was_subscribed.store(true, Ordering::Release);
        let mut guard = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match &mut *guard {
            InnerState::Pending(handlers) => handlers.push(handler),
            InnerState::Settled(s) => {
                let s = s.clone();
                drop(guard);
                self.scheduler.dispatch(Box::new(move || handler(s)));
            }
        }
    }

    fn fulfill(self: &Arc<Self>, value: Arc<T>) {
        let handlers = {
            let mut guard = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            match &mut *guard {
                InnerState::Settled(_) => return,
                InnerState::Pending(handlers) => {
                    let handlers = std::mem::take(handlers);
                    *guard = InnerState::Settled(Settled::Fulfilled(value.clone()));
                    handlers
                }
            }
        };
        for h in handlers {
            let v = value.clone();
            self.scheduler.dispatch(Box::new(move || h(Settled::Fulfilled(v))));
        }
    }

    fn reject(self: &Arc<Self>, reason: Arc<EvloopError>) {
        let handlers = {
            let mut guard = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            match &mut *guard {
                InnerState::Settled(_) => return,
                InnerState::Pending(handlers) => {
                    let handlers = std::mem::take(handlers);
                    *guard = InnerState::Settled(Settled::Rejected(reason.clone()));
                    handlers
                }
            }
        };
        for h in handlers {
            let r = reason.clone();
            self.scheduler.dispatch(Box::new(move || h(Settled::Rejected(r))));
        }
        // Scheduled after every handler-scheduling microtask above, and
        // `was_subscribed` reflects every `subscribe()` call made before
        // this closure actually runs — including ones made after `reject`
        // returns but before the loop reaches this microtask — so a late
        // `.catch()` in the same tick still correctly suppresses this.
        let this = self.clone();
        self.scheduler.dispatch(Box::new(move || {
            if !this.was_subscribed.load(Ordering::Acquire) {
                this.scheduler.report_unhandled(reason);
            }
        }));
    }

    fn settle_with_outcome(self: &Arc<Self>, outcome: Outcome<T>) {
        match outcome {
            Outcome::Fulfill(v) => self.fulfill(Arc::new(v)),
            Outcome::FulfillShared(v) => self.fulfill(v),
            Outcome::Reject(e) => self.reject(Arc::new(e)),
            Outcome::RejectShared(e) => self.reject(e),
            Outcome::Adopt(p) => {
                if Arc::ptr_eq(&p.inner, self) {
                    self.reject(Arc::new(EvloopError::TypeError(
                        "promise resolved with itself (chaining cycle)".to_string(),
                    )));
                    return;
                }
                let downstream = self.clone();
                p.inner.subscribe(Box::new(move |settled| match settled {
                    Settled::Fulfilled(v) => downstream.fulfill(v),
                    Settled::Rejected(r) => downstream.reject(r),
                }));
            }
        }
    }
}

fn run_catching<T, F: FnOnce() -> Outcome<T>>(f: F) -> Outcome<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(outcome) => outcome,
        Err(payload) => Outcome::Reject(EvloopError::Panic {
            value: panic_payload_to_string(&*payload),
        }),
    }
}

/// A promise: the handle type applications hold. Cheap to clone (an `Arc`
/// underneath); clones share identity (`Arc::ptr_eq`) for cycle detection.
pub struct Promise<T> {
    inner: Arc<PromiseInner<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> Promise<T> {
    /// Creates an already-fulfilled promise.
    #[must_use]
    pub fn resolved(scheduler: SchedulerHandle, value: T) -> Self {
        let inner = PromiseInner::new(scheduler);
        inner.fulfill(Arc::new(value));
        Self { inner }
    }

    /// Creates an already-rejected promise. Goes through the same path as
    /// an async rejection, so unhandled-rejection tracking applies here
    /// too (mirrors `Promise.reject()` in that respect).
    #[must_use]
    pub fn rejected(scheduler: SchedulerHandle, reason: EvloopError) -> Self {
        let inner = PromiseInner::new(scheduler);
        inner.reject(Arc::new(reason));
        Self { inner }
    }

    /// Creates a pending promise along with its resolve/reject handles
    /// (the `Promise.withResolvers()` shape).
    #[must_use]
    pub fn new_with_resolvers(scheduler: SchedulerHandle) -> (Self, Resolver<T>, Rejecter<T>) {
        let inner = PromiseInner::new(scheduler);
        let promise = Self { inner: inner.clone() };
        let resolver = Resolver { inner: inner.clone() };
        let rejecter = Rejecter { inner };
        (promise, resolver, rejecter)
    }

    /// `Arc` pointer identity, used by the resolution procedure's cycle
    /// check and available to callers for their own de-duplication.
    #[must_use]
    pub fn is_same_promise(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Returns the current settlement, or `None` if still pending. Does not
    /// consume or attach a handler.
    #[must_use]
    pub fn peek(&self) -> Option<Settled<T>> {
        match &*self
            .inner
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
        {
            InnerState::Settled(s) => Some(s.clone()),
            InnerState::Pending(_) => None,
        }
    }

    /// The promise's current status, with no payload — `peek()` without
    /// having to match on `Settled`.
    #[must_use]
    pub fn state(&self) -> PromiseState {
        match self.peek() {
            None => PromiseState::Pending,
            Some(Settled::Fulfilled(_)) => PromiseState::Fulfilled,
            Some(Settled::Rejected(_)) => PromiseState::Rejected,
        }
    }

    /// The fulfillment value, if settled and fulfilled.
    #[must_use]
    pub fn value(&self) -> Option<Arc<T>> {
        match self.peek() {
            Some(Settled::Fulfilled(v)) => Some(v),
            _ => None,
        }
    }

    /// The rejection reason, if settled and rejected.
    #[must_use]
    pub fn reason(&self) -> Option<Arc<EvloopError>> {
        match self.peek() {
            Some(Settled::Rejected(r)) => Some(r),
            _ => None,
        }
    }

    /// Bridges settlement onto a channel for a thread with no loop of its
    /// own to poll from — the receiver yields exactly one [`SettledResult`]
    /// once this promise settles, then the channel closes.
    #[must_use]
    pub fn to_channel(&self) -> mpsc::Receiver<SettledResult<T>> {
        let (tx, rx) = mpsc::channel();
        self.inner.subscribe(Box::new(move |settled| {
            let result = match settled {
                Settled::Fulfilled(v) => SettledResult::Fulfilled(v),
                Settled::Rejected(r) => SettledResult::Rejected(r),
            };
            let _ = tx.send(result);
        }));
        rx
    }

    /// Attaches handlers, returning a new downstream promise. Both
    /// handlers are required because the general case changes `T` to `U`;
    /// see [`Self::catch`] and [`Self::map`] for the common homogeneous
    /// shortcuts that default the other branch to pass-through.
    pub fn then<U, FOk, FErr>(&self, on_fulfilled: FOk, on_rejected: FErr) -> Promise<U>
    where
        U: Send + 'static,
        FOk: FnOnce(Arc<T>) -> Outcome<U> + Send + 'static,
        FErr: FnOnce(Arc<EvloopError>) -> Outcome<U> + Send + 'static,
    {
        let downstream = PromiseInner::<U>::new(self.inner.scheduler.clone());
        let downstream_promise = Promise { inner: downstream.clone() };
        self.inner.subscribe(Box::new(move |settled| {
            let outcome = match settled {
                Settled::Fulfilled(v) => run_catching(|| on_fulfilled(v)),
                Settled::Rejected(r) => run_catching(|| on_rejected(r)),
            };
            downstream.settle_with_outcome(outcome);
        }));
        downstream_promise
    }

    /// Homogeneous `then`: on success, transforms the value; on rejection,
    /// passes it through untouched.
    pub fn map<FOk>(&self, on_fulfilled: FOk) -> Promise<T>
    where
        FOk: FnOnce(&T) -> T + Send + 'static,
    {
        self.then(
            move |v| Outcome::Fulfill(on_fulfilled(&v)),
            |r| Outcome::RejectShared(r),
        )
    }

    /// Attaches a rejection handler; fulfillment passes through untouched.
    pub fn catch<FErr>(&self, on_rejected: FErr) -> Promise<T>
    where
        FErr: FnOnce(Arc<EvloopError>) -> Outcome<T> + Send + 'static,
    {
        self.then(Outcome::FulfillShared, on_rejected)
    }

    /// Runs `on_finally` regardless of settlement, then passes the
    /// original settlement through untouched. `on_finally`'s return value
    /// is ignored, matching Promise/A+ `finally` semantics.
    pub fn finally<F>(&self, on_finally: F) -> Promise<T>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let on_finally = Arc::new(on_finally);
        let f1 = on_finally.clone();
        let f2 = on_finally;
        self.then(
            move |v| {
                f1();
                Outcome::FulfillShared(v)
            },
            move |r| {
                f2();
                Outcome::RejectShared(r)
            },
        )
    }
}

/// Resolves a pending promise (the executor-style half of
/// [`Promise::new_with_resolvers`]).
pub struct Resolver<T> {
    inner: Arc<PromiseInner<T>>,
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T: Send + 'static> Resolver<T> {
    /// Resolves with a plain value, or adopts another promise's eventual
    /// state (detecting and rejecting self-resolution cycles).
    pub fn resolve(&self, input: ResolveInput<T>) {
        match input {
            ResolveInput::Value(v) => self.inner.settle_with_outcome(Outcome::Fulfill(v)),
            ResolveInput::Promise(p) => self.inner.settle_with_outcome(Outcome::Adopt(p)),
        }
    }

    /// Resolves by reusing an existing `Arc<T>`, for internal combinators
    /// forwarding a value they only ever observed behind a shared handle.
    pub(crate) fn resolve_shared(&self, value: Arc<T>) {
        self.inner.fulfill(value);
    }
}

/// Rejects a pending promise.
pub struct Rejecter<T> {
    inner: Arc<PromiseInner<T>>,
}

impl<T> Clone for Rejecter<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T: Send + 'static> Rejecter<T> {
    /// Rejects with `reason`.
    pub fn reject(&self, reason: EvloopError) {
        self.inner.reject(Arc::new(reason));
    }

    /// Rejects by reusing an existing `Arc<EvloopError>`, for internal
    /// combinators forwarding a reason they only ever observed behind a
    /// shared handle.
    pub(crate) fn reject_shared(&self, reason: Arc<EvloopError>) {
        self.inner.reject(reason);
    }
}

/// Waits for every input to fulfill, collecting results in input order;
/// rejects as soon as any input rejects (first rejection wins, matching
/// settle-once on the aggregate promise).
pub fn all<T: Send + 'static>(
    scheduler: SchedulerHandle,
    promises: Vec<Promise<T>>,
) -> Promise<Vec<Arc<T>>> {
    let n = promises.len();
    let (out, resolver, rejecter) = Promise::<Vec<Arc<T>>>::new_with_resolvers(scheduler);
    if n == 0 {
        resolver.resolve(ResolveInput::Value(Vec::new()));
        return out;
    }
    let results: Arc<Mutex<Vec<Option<Arc<T>>>>> = Arc::new(Mutex::new((0..n).map(|_| None).collect()));
    let remaining = Arc::new(std::sync::atomic::AtomicUsize::new(n));
    for (i, p) in promises.into_iter().enumerate() {
        let results = results.clone();
        let remaining = remaining.clone();
        let resolver = resolver.clone();
        let rejecter = rejecter.clone();
        p.then(
            move |v| {
                results.lock().unwrap_or_else(std::sync::PoisonError::into_inner)[i] = Some(v);
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let collected = results
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .iter()
                        .map(|o| o.clone().expect("all slots filled when remaining hits zero"))
                        .collect();
                    resolver.resolve(ResolveInput::Value(collected));
                }
                Outcome::Fulfill(())
            },
            move |r| {
                rejecter.reject_shared(r);
                // The discarded downstream promise from `then` settles here,
                // not the one callers actually observe — `reject_shared`
                // above already drove the real `out` promise, so fulfilling
                // this one avoids a bogus unhandled-rejection report.
                Outcome::Fulfill(())
            },
        );
    }
    out
}

/// Settles with the first input to settle (fulfilled or rejected),
/// ignoring the rest.
pub fn race<T: Send + 'static>(scheduler: SchedulerHandle, promises: Vec<Promise<T>>) -> Promise<T> {
    let (out, resolver, rejecter) = Promise::<T>::new_with_resolvers(scheduler);
    for p in promises {
        let resolver = resolver.clone();
        let rejecter = rejecter.clone();
        p.then(
            move |v| {
                resolver.resolve_shared(v);
                Outcome::Fulfill(())
            },
            move |r| {
                rejecter.reject_shared(r);
                // Same reasoning as `all`: this settles the discarded
                // `then` downstream, not `out`.
                Outcome::Fulfill(())
            },
        );
    }
    out
}

/// Fulfills with the first input to fulfill; rejects with an
/// `AggregateError` carrying every reason only once all inputs have
/// rejected.
pub fn any<T: Send + 'static>(scheduler: SchedulerHandle, promises: Vec<Promise<T>>) -> Promise<T> {
    let n = promises.len();
    let (out, resolver, rejecter) = Promise::<T>::new_with_resolvers(scheduler);
    if n == 0 {
        rejecter.reject(EvloopError::AggregateError { errors: Vec::new() });
        return out;
    }
    let errors: Arc<Mutex<Vec<Option<Arc<EvloopError>>>>> =
        Arc::new(Mutex::new((0..n).map(|_| None).collect()));
    let remaining = Arc::new(std::sync::atomic::AtomicUsize::new(n));
    for (i, p) in promises.into_iter().enumerate() {
        let errors = errors.clone();
        let remaining = remaining.clone();
        let resolver = resolver.clone();
        let rejecter = rejecter.clone();
        p.then(
            move |v| {
                resolver.resolve_shared(v);
                Outcome::Fulfill(())
            },
            move |r| {
                errors.lock().unwrap_or_else(std::sync::PoisonError::into_inner)[i] = Some(r);
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let all_errors = errors
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .drain(..)
                        .map(|o| o.expect("all slots filled when remaining hits zero"))
                        .collect();
                    rejecter.reject(EvloopError::AggregateError { errors: all_errors });
                }
                // The real aggregate rejection already went through
                // `rejecter` above; this only settles the discarded `then`
                // downstream.
                Outcome::Fulfill(())
            },
        );
    }
    out
}

/// The per-input result of [`all_settled`]: either a fulfillment value or a
/// rejection reason, never a further promise.
pub enum SettledResult<T> {
    /// The input fulfilled with this value.
    Fulfilled(Arc<T>),
    /// The input rejected with this reason.
    Rejected(Arc<EvloopError>),
}

/// Waits for every input to settle (never rejects itself), collecting each
/// one's outcome in input order.
pub fn all_settled<T: Send + 'static>(
    scheduler: SchedulerHandle,
    promises: Vec<Promise<T>>,
) -> Promise<Vec<SettledResult<T>>> {
    let n = promises.len();
    let (out, resolver, _rejecter) = Promise::<Vec<SettledResult<T>>>::new_with_resolvers(scheduler);
    if n == 0 {
        resolver.resolve(ResolveInput::Value(Vec::new()));
        return out;
    }
    let results: Arc<Mutex<Vec<Option<SettledResult<T>>>>> =
        Arc::new(Mutex::new((0..n).map(|_| None).collect()));
    let remaining = Arc::new(std::sync::atomic::AtomicUsize::new(n));
    for (i, p) in promises.into_iter().enumerate() {
        let results = results.clone();
        let remaining = remaining.clone();
        let resolver = resolver.clone();
        let finish = move |results: &Arc<Mutex<Vec<Option<SettledResult<T>>>>>,
                            remaining: &Arc<std::sync::atomic::AtomicUsize>,
                            resolver: &Resolver<Vec<SettledResult<T>>>| {
            if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                let collected = results
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .drain(..)
                    .map(|o| o.expect("all slots filled when remaining hits zero"))
                    .collect();
                resolver.resolve(ResolveInput::Value(collected));
            }
        };
        let f1 = finish.clone();
        let f2 = finish;
        let results1 = results.clone();
        let remaining1 = remaining.clone();
        let resolver1 = resolver.clone();
        let results2 = results;
        let remaining2 = remaining;
        let resolver2 = resolver.clone();
        p.then(
            move |v| {
                results1.lock().unwrap_or_else(std::sync::PoisonError::into_inner)[i] =
                    Some(SettledResult::Fulfilled(v));
                f1(&results1, &remaining1, &resolver1);
                Outcome::Fulfill(())
            },
            move |r| {
                results2.lock().unwrap_or_else(std::sync::PoisonError::into_inner)[i] =
                    Some(SettledResult::Rejected(r));
                f2(&results2, &remaining2, &resolver2);
                // `all_settled` never rejects `out` itself; this only
                // settles the discarded `then` downstream.
                Outcome::Fulfill(())
            },
        );
    }
    out
}
