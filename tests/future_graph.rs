use cadence::{
    AffinityContext, Diagnostics, Fault, Outcome, Promise, Runtime, RuntimeBuilder, RuntimeError,
    StepError,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

fn runtime() -> Runtime {
    RuntimeBuilder::new()
        .min_threads(2)
        .max_threads(8)
        .diagnostics(Diagnostics::new())
        .build()
        .unwrap()
}

#[test]
fn test_submit_completes_with_value() {
    let rt = runtime();
    let future = rt.submit(|_cx| Ok(6 * 7), None);

    assert!(matches!(rt.block_on(&future).unwrap(), Outcome::Completed(42)));
}

#[test]
fn test_observe_is_pending_then_completed() {
    let rt = runtime();
    let future = rt.submit(
        |_cx| {
            thread::sleep(Duration::from_millis(50));
            Ok(42)
        },
        None,
    );

    assert!(future.observe().is_pending());
    rt.block_on(&future).unwrap();
    assert!(matches!(future.observe(), Outcome::Completed(42)));
}

#[test]
fn test_resolution_is_idempotent() {
    let rt = runtime();
    let future = rt.pending::<u32>();

    future.complete(1).unwrap();
    assert!(matches!(
        future.complete(2),
        Err(RuntimeError::InvalidStateTransition { state: "completed", .. })
    ));
    assert!(future.cancel().is_err());
    assert!(future.fault(Fault::new("late")).is_err());

    assert!(matches!(future.observe(), Outcome::Completed(1)));
}

#[test]
fn test_every_waiter_is_notified_exactly_once() {
    let rt = runtime();
    let source = rt.pending::<u64>();
    let (tx, rx) = mpsc::channel();

    for i in 0..100 {
        let tx = tx.clone();
        source.then(&AffinityContext::None, move |outcome| {
            tx.send((i, outcome.completed())).unwrap();
        });
    }
    drop(tx);

    source.complete(9).unwrap();

    let mut seen: Vec<_> = rx.iter().collect();
    seen.sort_by_key(|(i, _)| *i);
    assert_eq!(seen.len(), 100);
    for (i, (index, value)) in seen.into_iter().enumerate() {
        assert_eq!(index, i);
        assert_eq!(value, Some(9));
    }
}

#[test]
fn test_then_on_resolved_future_is_still_scheduled() {
    let rt = runtime();
    let future = rt.pending::<&'static str>();
    future.complete("ready").unwrap();

    let (tx, rx) = mpsc::channel();
    let caller = thread::current().id();
    future.then(&AffinityContext::None, move |outcome| {
        tx.send((thread::current().id(), outcome.completed())).unwrap();
    });

    let (ran_on, value) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_ne!(ran_on, caller, "continuation must not run inline");
    assert_eq!(value, Some("ready"));
}

#[test]
fn test_suspend_on_resumes_with_other_outcome() {
    let rt = runtime();
    let input = rt.pending::<Vec<u8>>();

    let parsed = rt.submit_with(
        {
            let input = input.clone();
            move |promise: Promise<usize>| {
                promise
                    .suspend_on(&input, |promise, outcome| match outcome {
                        Outcome::Completed(bytes) => {
                            let _ = promise.complete(bytes.len());
                        }
                        _ => {
                            let _ = promise.cancel();
                        }
                    })
                    .unwrap();
            }
        },
        None,
    );

    thread::sleep(Duration::from_millis(20));
    assert!(parsed.observe().is_pending());

    input.complete(vec![1, 2, 3]).unwrap();
    assert!(matches!(rt.block_on(&parsed).unwrap(), Outcome::Completed(3)));
}

#[test]
fn test_error_faults_the_future() {
    let rt = runtime();
    let future = rt.submit(|_cx| Err::<u32, _>(StepError::fail("x")), None);

    match rt.block_on(&future).unwrap() {
        Outcome::Faulted(fault) => assert_eq!(fault.to_string(), "x"),
        other => panic!("expected a fault, got {other:?}"),
    }
}

#[test]
fn test_panic_faults_the_future_and_spares_the_worker() {
    let rt = runtime();
    let future = rt.submit(|_cx| -> Result<u32, StepError> { panic!("boom") }, None);

    match rt.block_on(&future).unwrap() {
        Outcome::Faulted(Fault::Panicked(message)) => assert!(message.contains("boom")),
        other => panic!("expected a panic fault, got {other:?}"),
    }

    let after = rt.submit(|_cx| Ok(1), None);
    assert!(matches!(rt.block_on(&after).unwrap(), Outcome::Completed(1)));
    assert!(rt.active_threads() >= 2);
}

#[test]
fn test_dropped_promise_abandons_the_future() {
    let rt = runtime();
    let future = rt.submit_with(|promise: Promise<u32>| drop(promise), None);

    assert!(matches!(
        rt.block_on(&future).unwrap(),
        Outcome::Faulted(Fault::Abandoned)
    ));
}

#[test]
fn test_external_resolution_wins_over_late_work() {
    let rt = runtime();
    let gate = Arc::new(Mutex::new(()));
    let held = gate.lock().unwrap();

    let g = gate.clone();
    let future = rt.submit(
        move |_cx| {
            let _held = g.lock().unwrap();
            Ok(1)
        },
        None,
    );
    future.cancel().unwrap();
    drop(held);

    thread::sleep(Duration::from_millis(20));
    assert!(matches!(rt.block_on(&future).unwrap(), Outcome::Cancelled));
}

#[test]
fn test_handle_can_be_awaited() {
    let rt = runtime();
    let future = rt.submit(
        |_cx| {
            thread::sleep(Duration::from_millis(10));
            Ok(String::from("awaited"))
        },
        None,
    );

    let outcome = futures::executor::block_on(future.clone());
    assert_eq!(outcome.completed().as_deref(), Some("awaited"));
}

#[test]
fn test_chain_of_suspensions_completes_in_order() {
    let rt = runtime();
    let steps = Arc::new(AtomicUsize::new(0));

    let first = rt.submit(|_cx| Ok(1u32), None);
    let s = steps.clone();
    let second = rt.submit_with(
        {
            let first = first.clone();
            move |promise: Promise<u32>| {
                promise
                    .suspend_on(&first, move |promise, outcome| {
                        s.fetch_add(1, Ordering::SeqCst);
                        let _ = promise.complete(outcome.completed().unwrap_or(0) + 1);
                    })
                    .unwrap();
            }
        },
        None,
    );
    let s = steps.clone();
    let third = rt.submit_with(
        {
            let second = second.clone();
            move |promise: Promise<u32>| {
                promise
                    .suspend_on(&second, move |promise, outcome| {
                        s.fetch_add(1, Ordering::SeqCst);
                        let _ = promise.complete(outcome.completed().unwrap_or(0) + 1);
                    })
                    .unwrap();
            }
        },
        None,
    );

    assert!(matches!(rt.block_on(&third).unwrap(), Outcome::Completed(3)));
    assert_eq!(steps.load(Ordering::SeqCst), 2);
}
