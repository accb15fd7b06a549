//! End-to-end scenario tests driving `evloop` purely through its public
//! API, one per concrete scenario called out for this crate.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use evloop::{
    promisify, Context, EvloopError, FastPathPolicy, Loop, LoopOptions, LoopState, Outcome,
    Settled,
};

fn new_fast_loop() -> Arc<Loop> {
    Loop::new(
        LoopOptions::builder()
            .fast_path_policy(FastPathPolicy::Force)
            .build()
            .unwrap(),
    )
    .unwrap()
}

/// Scenario 1: FIFO across chunks. `ChunkedIngress`'s own unit tests cover
/// the queue in isolation; this drives the same property through the real
/// loop, so task submission order is observed end to end.
#[test]
fn fifo_across_chunks_end_to_end() {
    let lp = new_fast_loop();
    let order = Arc::new(Mutex::new(Vec::with_capacity(1000)));
    for i in 0..1000 {
        let order = order.clone();
        lp.submit(move || order.lock().unwrap().push(i)).unwrap();
    }
    let lp2 = lp.clone();
    lp.submit(move || {
        let _ = lp2.shutdown(&Context::background());
    })
    .unwrap();
    lp.run(&Context::background()).unwrap();
    let seen = order.lock().unwrap();
    assert_eq!(seen.len(), 1000);
    assert!(seen.iter().enumerate().all(|(i, v)| i == *v));
}

/// Scenario 2: wake torture. 100 producer threads submit 1000 tasks each
/// while the loop is (or is about to be) running; every one of the 100,000
/// tasks must be observed, with no deadlock and no lost wake.
#[test]
fn wake_torture_observes_every_submission() {
    let lp = new_fast_loop();
    let counter = Arc::new(AtomicUsize::new(0));

    let lp_runner = lp.clone();
    let runner = std::thread::spawn(move || lp_runner.run(&Context::background()));

    let mut handles = Vec::new();
    for _ in 0..100 {
        let lp = lp.clone();
        let counter = counter.clone();
        handles.push(std::thread::spawn(move || {
            for _ in 0..1000 {
                let counter = counter.clone();
                loop {
                    match lp.submit(move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }) {
                        Ok(()) => break,
                        Err(EvloopError::LoopTerminated) => break,
                        Err(_) => continue,
                    }
                }
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while counter.load(Ordering::SeqCst) < 100_000 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(counter.load(Ordering::SeqCst), 100_000);

    lp.shutdown(&Context::background()).unwrap();
    runner.join().unwrap().unwrap();
}

/// Scenario 4: `Promise.any` with every input rejected must reject the
/// aggregate with an `AggregateError` carrying all three reasons.
#[test]
fn promise_any_all_rejections_yields_aggregate_error() {
    let lp = new_fast_loop();
    let a: evloop::Promise<i32> = lp.promise_rejected(EvloopError::TypeError("a".to_string()));
    let b: evloop::Promise<i32> = lp.promise_rejected(EvloopError::TypeError("b".to_string()));
    let c: evloop::Promise<i32> = lp.promise_rejected(EvloopError::TypeError("c".to_string()));

    let outcome = Arc::new(Mutex::new(None));
    let outcome2 = outcome.clone();
    let lp2 = lp.clone();
    lp.promise_any(vec![a, b, c]).then(
        move |v| Outcome::FulfillShared(v),
        move |r| {
            *outcome2.lock().unwrap() = Some(r.clone());
            let _ = lp2.shutdown(&Context::background());
            Outcome::RejectShared(r)
        },
    );
    lp.run(&Context::background()).unwrap();

    let got = outcome.lock().unwrap().take().expect("any() settled");
    match &*got {
        EvloopError::AggregateError { errors } => assert_eq!(errors.len(), 3),
        other => panic!("expected AggregateError, got {other:?}"),
    }
}

/// Scenario 5: a panicking `promisify` body settles the returned promise
/// with a `Panic` rejection carrying the panic payload.
#[test]
fn promisify_panic_carries_payload() {
    let lp = new_fast_loop();
    let payload = Arc::new(Mutex::new(None));
    let payload2 = payload.clone();
    let lp2 = lp.clone();
    let p: evloop::Promise<()> = promisify(&lp, Context::background(), |_ctx| {
        panic!("x");
    });
    p.then(
        |v| Outcome::FulfillShared(v),
        move |r| {
            *payload2.lock().unwrap() = Some(r.clone());
            let _ = lp2.shutdown(&Context::background());
            Outcome::RejectShared(r)
        },
    );
    lp.run(&Context::background()).unwrap();

    match &*payload.lock().unwrap().take().expect("promisify settled") {
        EvloopError::Panic { value } => assert_eq!(value, "x"),
        other => panic!("expected Panic, got {other:?}"),
    }
}

/// Scenario 6: resolving a promise with itself rejects it with a
/// `TypeError` rather than deadlocking, observed after the loop has
/// processed the resulting microtask.
#[test]
fn self_resolution_rejects_with_type_error() {
    let lp = new_fast_loop();
    let (p, resolver, _rejecter) = lp.promise_with_resolvers::<i32>();
    resolver.resolve(evloop::ResolveInput::Promise(p.clone()));

    let settled = Arc::new(Mutex::new(None));
    let settled2 = settled.clone();
    let lp2 = lp.clone();
    p.then(
        |v| Outcome::FulfillShared(v),
        move |r| {
            *settled2.lock().unwrap() = Some(r.clone());
            let _ = lp2.shutdown(&Context::background());
            Outcome::RejectShared(r)
        },
    );
    lp.run(&Context::background()).unwrap();

    assert!(matches!(
        &*settled.lock().unwrap().take().expect("self-resolution settled"),
        EvloopError::TypeError(_)
    ));
}

/// Scenario 7: shutting down while 20 `promisify` calls are in flight (each
/// sleeping 0..19ms) must let every one settle — either with its value or
/// with `LoopTerminated` — with none left pending.
#[test]
fn shutdown_during_promisify_settles_every_promise() {
    let lp = new_fast_loop();
    let settled_count = Arc::new(AtomicUsize::new(0));

    let promises: Vec<evloop::Promise<u64>> = (0u64..20)
        .map(|i| {
            let settled_count = settled_count.clone();
            let p = promisify(&lp, Context::background(), move |_ctx| {
                std::thread::sleep(Duration::from_millis(i));
                Ok(i)
            });
            p.then(
                {
                    let settled_count = settled_count.clone();
                    move |v| {
                        settled_count.fetch_add(1, Ordering::SeqCst);
                        Outcome::FulfillShared(v)
                    }
                },
                move |r| {
                    settled_count.fetch_add(1, Ordering::SeqCst);
                    Outcome::RejectShared(r)
                },
            )
        })
        .collect();

    let lp_runner = lp.clone();
    let runner = std::thread::spawn(move || lp_runner.run(&Context::background()));

    std::thread::sleep(Duration::from_millis(5));
    // `shutdown` only returns once `drain_and_terminate` has fully run,
    // including the wait for every in-flight `promisify` thread and the
    // final microtask drain that settles their `.then()` handlers — so no
    // further polling is needed past this point.
    lp.shutdown(&Context::background()).unwrap();
    runner.join().unwrap().unwrap();

    assert_eq!(lp.state(), LoopState::Terminated);
    for p in &promises {
        match p.peek() {
            Some(Settled::Fulfilled(_) | Settled::Rejected(_)) => {}
            None => panic!("promise left pending after shutdown"),
        }
    }
    assert_eq!(settled_count.load(Ordering::SeqCst), 20);
}
