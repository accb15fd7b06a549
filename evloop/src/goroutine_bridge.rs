//! Promisify: bridges a blocking, OS-thread-bound computation into a
//! promise settled on the loop thread.
//!
//! Grounded on the reactor-thread module's worker-loop pattern: the
//! spawned thread wraps its body in `catch_unwind` exactly the way
//! `run_worker_loop` does, and in-flight threads are tracked by a
//! wait-group whose registration is atomic with respect to shutdown — the
//! same ordering discipline `TerminationGuard` uses to avoid a waker being
//! cleared out from under a subscriber that raced the termination check.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::context::Context;
use crate::driver::Loop;
use crate::error::EvloopError;
use crate::promise::{Promise, Rejecter, ResolveInput};

/// Marshals the result of `f`, run on a dedicated OS thread, back onto
/// `loop_`'s thread as a settled [`Promise`].
///
/// `f` receives `&ctx` so it can cooperatively check for cancellation; this
/// bridge itself only checks once, at thread start, since — unlike a
/// scheduler-managed goroutine — nothing here can forcibly interrupt a
/// thread already running user code.
pub fn promisify<T, F>(loop_: &Arc<Loop>, ctx: Context, f: F) -> Promise<T>
where
    T: Send + 'static,
    F: FnOnce(&Context) -> Result<T, EvloopError> + Send + 'static,
{
    let scheduler = loop_.scheduler_handle();

    if !loop_.try_register_promisify() {
        return Promise::rejected(scheduler, EvloopError::LoopTerminated);
    }

    let (promise, resolver, rejecter) = Promise::<T>::new_with_resolvers(scheduler);

    let loop_for_thread = loop_.clone();
    let resolver_for_thread = resolver;
    let rejecter_for_thread = rejecter.clone();
    let rejecter_for_finalizer = rejecter.clone();

    let spawn_result = thread::Builder::new()
        .name("evloop-promisify".to_string())
        .spawn(move || {
            // Deferred finalizer: if this thread unwinds past here without
            // `completed` having been set (only reachable via a bug in this
            // bridge's own plumbing below, not via a panic inside `f` —
            // that's caught), the promise is rejected rather than left
            // dangling forever, the closest analog to a goroutine exiting
            // via `runtime.Goexit`.
            struct DoneGuard<T: Send + 'static> {
                loop_: Arc<Loop>,
                rejecter: Rejecter<T>,
                completed: bool,
            }
            impl<T: Send + 'static> Drop for DoneGuard<T> {
                fn drop(&mut self) {
                    if !self.completed {
                        self.rejecter.reject(EvloopError::GoroutineExit);
                    }
                    self.loop_.promisify_done();
                }
            }
            let mut guard = DoneGuard {
                loop_: loop_for_thread.clone(),
                rejecter: rejecter_for_finalizer,
                completed: false,
            };

            let settle: crate::Task = if let Some(err) = ctx.err() {
                Box::new(move || rejecter_for_thread.reject(err))
            } else {
                match catch_unwind(AssertUnwindSafe(|| f(&ctx))) {
                    Ok(Ok(value)) => {
                        Box::new(move || resolver_for_thread.resolve(ResolveInput::Value(value)))
                    }
                    Ok(Err(reason)) => Box::new(move || rejecter_for_thread.reject(reason)),
                    Err(payload) => {
                        let value = crate::error::panic_payload_to_string(&*payload);
                        Box::new(move || rejecter_for_thread.reject(EvloopError::Panic { value }))
                    }
                }
            };
            guard.completed = true;

            match loop_for_thread.try_submit_task(settle) {
                Ok(()) => {}
                // Loop terminated between registration and completion: the
                // wait-group above guarantees this can't happen during a
                // normal shutdown (it would have blocked), but settle
                // directly anyway so the promise never hangs if it does.
                Err(settle) => settle(),
            }
        });

    if let Err(io_err) = spawn_result {
        // The closure (and its captured `resolver_for_thread`) never ran;
        // `rejecter` is still live here since it was cloned above, so
        // reject the promise we already handed back rather than fabricate
        // a disconnected one.
        loop_.promisify_done();
        rejecter.reject(EvloopError::with_cause("failed to spawn promisify thread", io_err));
    }

    promise
}

/// [`promisify`] with a relative timeout applied to `ctx`.
pub fn promisify_with_timeout<T, F>(loop_: &Arc<Loop>, ctx: &Context, timeout: Duration, f: F) -> Promise<T>
where
    T: Send + 'static,
    F: FnOnce(&Context) -> Result<T, EvloopError> + Send + 'static,
{
    let child = ctx.child_with_timeout(timeout);
    let child_for_cancel = child.clone();
    promisify(loop_, child, f).finally(move || child_for_cancel.cancel())
}

/// [`promisify`] with an absolute deadline applied to `ctx`.
pub fn promisify_with_deadline<T, F>(loop_: &Arc<Loop>, ctx: &Context, deadline: Instant, f: F) -> Promise<T>
where
    T: Send + 'static,
    F: FnOnce(&Context) -> Result<T, EvloopError> + Send + 'static,
{
    let child = ctx.child_with_deadline(deadline);
    let child_for_cancel = child.clone();
    promisify(loop_, child, f).finally(move || child_for_cancel.cancel())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{FastPathPolicy, LoopOptions};
    use crate::promise::{Outcome, Settled};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

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
    fn promisify_settles_with_returned_value() {
        let lp = new_fast_loop();
        let seen = Arc::new(Mutex::new(None));
        let seen2 = seen.clone();
        let lp2 = lp.clone();
        let p = promisify(&lp, Context::background(), |_ctx| Ok(42));
        p.then(
            move |v: Arc<i32>| {
                *seen2.lock().unwrap() = Some(*v);
                let _ = lp2.shutdown(&Context::background());
                Outcome::FulfillShared(v)
            },
            |r| Outcome::RejectShared(r),
        );
        lp.run(&Context::background()).unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(42));
    }

    #[test]
    fn promisify_panic_becomes_panic_error() {
        let lp = new_fast_loop();
        let got_panic = Arc::new(AtomicBool::new(false));
        let got_panic2 = got_panic.clone();
        let lp2 = lp.clone();
        let p: Promise<i32> = promisify(&lp, Context::background(), |_ctx| {
            panic!("boom");
        });
        p.then(
            |v| Outcome::FulfillShared(v),
            move |r| {
                got_panic2.store(matches!(&*r, EvloopError::Panic { .. }), Ordering::SeqCst);
                let _ = lp2.shutdown(&Context::background());
                Outcome::RejectShared(r)
            },
        );
        lp.run(&Context::background()).unwrap();
        assert!(got_panic.load(Ordering::SeqCst));
    }

    #[test]
    fn promisify_observes_already_cancelled_ctx() {
        let lp = new_fast_loop();
        let ctx = Context::background();
        ctx.cancel();
        let rejected = Arc::new(AtomicBool::new(false));
        let rejected2 = rejected.clone();
        let lp2 = lp.clone();
        let p: Promise<i32> = promisify(&lp, ctx, |_ctx| Ok(1));
        p.then(
            |v| Outcome::FulfillShared(v),
            move |r| {
                rejected2.store(matches!(&*r, EvloopError::AbortError { .. }), Ordering::SeqCst);
                let _ = lp2.shutdown(&Context::background());
                Outcome::RejectShared(r)
            },
        );
        lp.run(&Context::background()).unwrap();
        assert!(rejected.load(Ordering::SeqCst));
    }

    #[test]
    fn promisify_after_shutdown_rejects_immediately() {
        let lp = new_fast_loop();
        lp.shutdown(&Context::background()).unwrap();
        let p: Promise<i32> = promisify(&lp, Context::background(), |_ctx| Ok(1));
        assert!(matches!(
            p.peek(),
            Some(Settled::Rejected(r)) if matches!(&*r, EvloopError::LoopTerminated)
        ));
    }

    #[test]
    fn timeout_cancels_ctx_observed_inside_f() {
        let lp = new_fast_loop();
        let timed_out = Arc::new(AtomicBool::new(false));
        let timed_out2 = timed_out.clone();
        let lp2 = lp.clone();
        let p: Promise<()> = promisify_with_timeout(
            &lp,
            &Context::background(),
            Duration::from_millis(5),
            |ctx| {
                let deadline = Instant::now() + Duration::from_millis(200);
                while Instant::now() < deadline {
                    if ctx.is_cancelled() {
                        return Err(ctx.err().unwrap());
                    }
                    thread::sleep(Duration::from_millis(1));
                }
                Ok(())
            },
        );
        p.then(
            |v| Outcome::FulfillShared(v),
            move |r| {
                timed_out2.store(matches!(&*r, EvloopError::Timeout), Ordering::SeqCst);
                let _ = lp2.shutdown(&Context::background());
                Outcome::RejectShared(r)
            },
        );
        lp.run(&Context::background()).unwrap();
        assert!(timed_out.load(Ordering::SeqCst));
    }
}
