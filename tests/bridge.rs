use cadence::{
    AffinityContext, DiagnosticKind, Diagnostics, Outcome, Promise, Runtime, RuntimeBuilder,
    RuntimeError, StepError, block_on, block_on_timeout,
};
use std::thread;
use std::time::{Duration, Instant};

fn runtime(diagnostics: &Diagnostics) -> Runtime {
    RuntimeBuilder::new()
        .min_threads(2)
        .max_threads(8)
        .deadlock_detection(true)
        .unobserved_fault_grace(Duration::from_millis(20))
        .diagnostics(diagnostics.clone())
        .build()
        .unwrap()
}

#[test]
fn test_block_on_returns_fault_without_reporting_it() {
    let diagnostics = Diagnostics::new();
    let rt = runtime(&diagnostics);

    let future = rt.submit(|_cx| Err::<(), _>(StepError::fail("x")), None);
    let outcome = block_on(&future).unwrap();
    assert_eq!(outcome.fault().map(ToString::to_string).as_deref(), Some("x"));

    thread::sleep(Duration::from_millis(100));
    assert_eq!(diagnostics.count(DiagnosticKind::UnobservedFault), 0);
}

#[test]
fn test_cancel_after_unblocks_a_cooperative_wait() {
    let diagnostics = Diagnostics::new();
    let rt = runtime(&diagnostics);
    let signal = rt.signal();

    let future = rt.submit(
        |cx| -> Result<(), StepError> {
            loop {
                cx.checkpoint()?;
                thread::sleep(Duration::from_millis(1));
            }
        },
        signal.clone(),
    );

    let start = Instant::now();
    let _guard = rt.cancel_after(&signal, Duration::from_millis(10));
    let outcome = block_on(&future).unwrap();

    assert!(outcome.is_cancelled());
    assert!(start.elapsed() < Duration::from_secs(2), "cancellation took too long");
}

#[test]
fn test_block_on_owner_thread_of_resume_context_fails_fast() {
    let diagnostics = Diagnostics::new();
    let rt = runtime(&diagnostics);
    let ui = rt.exclusive_context("ui").unwrap();
    let never = rt.pending::<()>();

    let waiting = rt.submit_on(
        &AffinityContext::from(ui.clone()),
        {
            let never = never.clone();
            move |promise: Promise<()>| {
                promise
                    .suspend_on(&never, |promise, _| {
                        let _ = promise.complete(());
                    })
                    .unwrap();
            }
        },
        None,
    );

    // Wait until the step has suspended and captured the context.
    ui.send(|| ()).unwrap();

    let blocked = waiting.clone();
    let result = ui.send(move || block_on(&blocked).map(|o| o.is_terminal())).unwrap();
    assert!(matches!(result, Err(RuntimeError::SelfBlockDeadlock { .. })));

    never.complete(()).unwrap();
    assert!(block_on(&waiting).unwrap().is_completed());
}

#[test]
fn test_block_on_timeout_gives_up() {
    let diagnostics = Diagnostics::new();
    let rt = runtime(&diagnostics);
    let future = rt.pending::<u8>();

    let start = Instant::now();
    let result = block_on_timeout(&future, Duration::from_millis(30));

    assert!(matches!(result, Err(RuntimeError::Timeout(_))));
    assert!(start.elapsed() >= Duration::from_millis(30));
    assert!(future.observe().is_pending());
}

#[test]
fn test_block_on_already_resolved_returns_immediately() {
    let diagnostics = Diagnostics::new();
    let rt = runtime(&diagnostics);
    let future = rt.pending::<u8>();
    future.complete(3).unwrap();

    assert!(matches!(
        rt.block_on_timeout(&future, Duration::from_millis(1)).unwrap(),
        Outcome::Completed(3)
    ));
}

#[test]
fn test_many_threads_block_on_the_same_future() {
    let diagnostics = Diagnostics::new();
    let rt = runtime(&diagnostics);
    let future = rt.pending::<u32>();

    let waiters: Vec<_> = (0..8)
        .map(|_| {
            let future = future.clone();
            thread::spawn(move || block_on(&future).unwrap().completed())
        })
        .collect();

    thread::sleep(Duration::from_millis(20));
    future.complete(11).unwrap();

    for waiter in waiters {
        assert_eq!(waiter.join().unwrap(), Some(11));
    }
}

#[test]
fn test_block_on_timeout_accepts_unbounded_durations() {
    let diagnostics = Diagnostics::new();
    let rt = runtime(&diagnostics);

    let done = rt.pending::<u8>();
    done.complete(1).unwrap();
    assert!(matches!(
        rt.block_on_timeout(&done, Duration::MAX).unwrap(),
        Outcome::Completed(1)
    ));

    let work = rt.submit(
        |_cx| {
            thread::sleep(Duration::from_millis(10));
            Ok(2u8)
        },
        None,
    );
    assert!(matches!(
        rt.block_on_timeout(&work, Duration::MAX).unwrap(),
        Outcome::Completed(2)
    ));
}

#[test]
fn test_cancel_after_unbounded_delay_never_fires() {
    let diagnostics = Diagnostics::new();
    let rt = runtime(&diagnostics);
    let signal = rt.signal();

    let guard = rt.cancel_after(&signal, Duration::MAX);
    thread::sleep(Duration::from_millis(30));
    assert!(!signal.is_triggered());
    assert!(guard.dispose(), "an armed trigger can still be disarmed");
}

#[test]
fn test_timed_out_waits_can_be_repeated() {
    let diagnostics = Diagnostics::new();
    let rt = runtime(&diagnostics);
    let future = rt.pending::<u8>();

    for _ in 0..200 {
        assert!(matches!(
            rt.block_on_timeout(&future, Duration::from_micros(1)),
            Err(RuntimeError::Timeout(_))
        ));
    }

    let resolver = future.clone();
    rt.spawn(move || {
        let _ = resolver.complete(9);
    });
    assert!(matches!(
        rt.block_on_timeout(&future, Duration::from_secs(5)).unwrap(),
        Outcome::Completed(9)
    ));
}

#[test]
fn test_block_on_resolved_future_from_owner_thread_returns() {
    let diagnostics = Diagnostics::new();
    let rt = runtime(&diagnostics);
    let ui = rt.exclusive_context("ui").unwrap();

    let future = rt.submit_on(
        &AffinityContext::from(ui.clone()),
        |promise: Promise<u8>| {
            let _ = promise.complete(6);
        },
        None,
    );
    ui.send(|| ()).unwrap();

    let resolved = future.clone();
    let outcome = ui.send(move || block_on(&resolved).map(|o| o.completed())).unwrap();
    assert_eq!(outcome.unwrap(), Some(6));
}
