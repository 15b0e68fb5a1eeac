//! Cross-thread behavior of event executors and groups.

use strand_core::{Executor, EventExecutor, ExecutorGroup, ExecutorError, Promise};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[test]
fn tasks_from_one_submitter_run_in_fifo_order() {
    let executor = EventExecutor::new("fifo-test");
    let log = Arc::new(Mutex::new(Vec::new()));

    for i in 0..100 {
        let log = Arc::clone(&log);
        executor
            .execute(Box::new(move || log.lock().unwrap().push(i)))
            .unwrap();
    }

    let done: Promise<()> = Promise::new();
    let signal = done.clone();
    executor
        .execute(Box::new(move || {
            signal.set_success(()).unwrap();
        }))
        .unwrap();
    done.await_done().unwrap();

    let observed = log.lock().unwrap().clone();
    let expected: Vec<i32> = (0..100).collect();
    assert_eq!(observed, expected);
    executor.shutdown_gracefully(Duration::ZERO, Duration::from_secs(2));
}

#[test]
fn in_event_loop_identifies_the_worker_thread() {
    let executor = EventExecutor::new("identity-test");
    assert!(!executor.in_event_loop());

    let result: Promise<bool> = Promise::new();
    let signal = result.clone();
    let probe = Arc::clone(&executor);
    executor
        .execute(Box::new(move || {
            signal.set_success(probe.in_event_loop()).unwrap();
        }))
        .unwrap();

    assert!(result.sync().unwrap());
    executor.shutdown_gracefully(Duration::ZERO, Duration::from_secs(2));
}

#[test]
fn scheduled_task_fires_after_its_delay() {
    let executor = EventExecutor::new("schedule-test");
    let done: Promise<Duration> = Promise::new();

    let started = Instant::now();
    let signal = done.clone();
    executor
        .schedule(
            Duration::from_millis(50),
            Box::new(move || {
                signal.set_success(started.elapsed()).unwrap();
            }),
        )
        .unwrap();

    let elapsed = done.sync().unwrap();
    assert!(elapsed >= Duration::from_millis(50), "fired at {elapsed:?}");
    executor.shutdown_gracefully(Duration::ZERO, Duration::from_secs(2));
}

#[test]
fn fixed_rate_task_fires_repeatedly_until_cancelled() {
    let executor = EventExecutor::new("periodic-test");
    let fired = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&fired);
    let handle = executor
        .schedule_at_fixed_rate(
            Duration::from_millis(5),
            Duration::from_millis(5),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

    while fired.load(Ordering::SeqCst) < 3 {
        std::thread::sleep(Duration::from_millis(1));
    }
    handle.cancel();
    let after_cancel = fired.load(Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(30));
    assert!(fired.load(Ordering::SeqCst) <= after_cancel + 1);
    executor.shutdown_gracefully(Duration::ZERO, Duration::from_secs(2));
}

#[test]
fn blocking_await_on_the_loop_is_refused() {
    let executor = EventExecutor::new("deadlock-test");
    let bound: Promise<()> = Promise::bound(executor.clone() as Arc<dyn Executor>);

    let verdict: Promise<bool> = Promise::new();
    let signal = verdict.clone();
    let probe = bound.clone();
    executor
        .execute(Box::new(move || {
            let refused = probe.await_timeout(Duration::from_millis(1)).is_err();
            signal.set_success(refused).unwrap();
        }))
        .unwrap();

    assert!(verdict.sync().unwrap());
    bound.set_success(()).unwrap();
    executor.shutdown_gracefully(Duration::ZERO, Duration::from_secs(2));
}

#[test]
fn graceful_shutdown_completes_the_termination_promise() {
    let group = ExecutorGroup::new("shutdown-test", 3);
    let ran = Arc::new(AtomicUsize::new(0));

    for _ in 0..6 {
        let ran = Arc::clone(&ran);
        group
            .next()
            .execute(Box::new(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
    }

    let termination =
        group.shutdown_gracefully(Duration::from_millis(10), Duration::from_secs(2));
    assert!(group.is_shutting_down());
    termination.await_done().unwrap();

    assert!(group.is_terminated());
    assert_eq!(ran.load(Ordering::SeqCst), 6);
}

#[test]
fn terminated_executor_rejects_submissions() {
    let executor = EventExecutor::new("reject-test");
    executor
        .shutdown_gracefully(Duration::ZERO, Duration::from_millis(500))
        .await_done()
        .unwrap();

    let result = executor.execute(Box::new(|| {}));
    assert_eq!(result.unwrap_err(), ExecutorError::Terminated);
}

#[test]
fn round_robin_covers_every_member() {
    let group = ExecutorGroup::new("chooser-test", 4);
    let mut seen = std::collections::HashSet::new();
    for _ in 0..4 {
        seen.insert(Arc::as_ptr(&group.next()) as usize);
    }
    assert_eq!(seen.len(), 4);
    group
        .shutdown_gracefully(Duration::ZERO, Duration::from_secs(2))
        .await_done()
        .unwrap();
}

#[test]
fn listeners_of_a_bound_promise_run_on_the_loop() {
    let executor = EventExecutor::new("listener-test");
    let bound: Promise<u32> = Promise::bound(executor.clone() as Arc<dyn Executor>);

    let observed: Promise<bool> = Promise::new();
    let signal = observed.clone();
    let loop_probe = Arc::clone(&executor);
    bound.add_listener(move |_| {
        signal.set_success(loop_probe.in_event_loop()).unwrap();
    });

    bound.set_success(9).unwrap();
    assert!(observed.sync().unwrap());
    executor.shutdown_gracefully(Duration::ZERO, Duration::from_secs(2));
}
