//! A single-threaded, cooperative event loop with JavaScript-style
//! semantics — microtasks, promises, timers, and epoll/kqueue I/O
//! readiness — designed to run as one thread inside a larger multi-threaded
//! host process.
//!
//! The loop itself never spawns threads to do task work: everything
//! submitted through [`driver::Loop::submit`], [`driver::Loop::schedule_microtask`]
//! and [`driver::Loop::schedule_timer`] runs on whichever thread calls
//! [`driver::Loop::run`]. The one place genuine OS threads enter the
//! picture is [`goroutine_bridge::promisify`], which bridges a blocking
//! computation onto a promise settled back on the loop thread — the same
//! shape a Node.js addon or a Go goroutine feeding a channel would take.

pub mod chunked_ingress;
pub mod context;
pub mod driver;
pub mod error;
pub mod goroutine_bridge;
pub mod ingress;
pub mod metrics;
pub mod microtask_ring;
pub mod options;
pub mod poller;
pub mod promise;
pub mod state;
pub mod timer_heap;
pub mod wake;

/// A unit of deferred work: a one-shot thunk, owned by whichever queue is
/// currently holding it (ingress, microtask ring, or timer heap).
pub type Task = Box<dyn FnOnce() + Send>;

pub use context::Context;
pub use driver::Loop;
pub use error::EvloopError;
pub use goroutine_bridge::{promisify, promisify_with_deadline, promisify_with_timeout};
pub use metrics::{Metrics, MetricsSnapshot};
pub use options::{FastPathPolicy, IngressBackend, LoopOptions, LoopOptionsBuilder};
pub use poller::{FdCallback, FdEvents, Poller};
pub use promise::{
    all, all_settled, any, race, MicrotaskScheduler, Outcome, Promise, PromiseState, Rejecter,
    ResolveInput, Resolver, SchedulerHandle, Settled, SettledResult,
};
pub use state::LoopState;
pub use timer_heap::TimerHandle;
