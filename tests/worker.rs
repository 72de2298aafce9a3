// SPDX-FileCopyrightText: Copyright (c) 2025-2026 Spindle Project Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Integration tests for the worker trip loop: mailbox ordering, timers,
//! wait sources, thread donation, and shutdown semantics.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use spindle_runtime::{
    Event, HostAllocator, LoopStatus, Priority, RuntimeError, Worker, WorkerOptions,
};

/// Short quantum so shutdown-latency assertions stay tight.
const QUANTUM: Duration = Duration::from_millis(100);

fn options(name: &str) -> WorkerOptions {
    WorkerOptions::new(HostAllocator::system(), name).with_quantum(QUANTUM)
}

fn owned_worker(name: &str) -> Arc<Worker> {
    let worker = Worker::new(options(name));
    worker.start().unwrap();
    worker
}

#[test]
fn test_ping_pong_trace_and_bounded_shutdown() {
    let worker = Worker::new(options("t-pingpong"));
    let trace: Arc<Mutex<Vec<&str>>> = Arc::new(Mutex::new(Vec::new()));

    let t = trace.clone();
    worker.call_threadsafe(move || t.lock().push("A"));
    let t = trace.clone();
    let killer = worker.clone();
    worker.call_threadsafe(move || {
        t.lock().push("B");
        killer.kill();
    });

    let started = Instant::now();
    worker.start().unwrap();
    worker.wait_for_shutdown().unwrap();

    assert_eq!(*trace.lock(), vec!["A", "B"]);
    assert!(started.elapsed() < QUANTUM * 2);
}

#[test]
fn test_threadsafe_submissions_run_in_fifo_order() {
    let worker = owned_worker("t-fifo");
    let trace: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));

    for i in 0..100 {
        let t = trace.clone();
        worker.call_threadsafe(move || t.lock().push(i));
    }
    let killer = worker.clone();
    worker.call_threadsafe(move || killer.kill());

    worker.wait_for_shutdown().unwrap();
    assert_eq!(*trace.lock(), (0..100).collect::<Vec<_>>());
}

#[test]
fn test_timer_fires_within_quantum_window() {
    let worker = owned_worker("t-timer");
    let delta: Arc<Mutex<Option<Duration>>> = Arc::new(Mutex::new(None));

    let observed = delta.clone();
    worker.call_threadsafe(move || {
        let worker = Worker::current().unwrap();
        let started = Instant::now();
        let deadline = worker.deadline_after(Duration::from_millis(50));
        let killer = worker.clone();
        worker
            .wait_until_low_level(deadline, move |_, status| {
                assert!(status.is_ok());
                *observed.lock() = Some(started.elapsed());
                killer.kill();
                Ok(())
            })
            .unwrap();
    });

    worker.wait_for_shutdown().unwrap();
    let delta = delta.lock().expect("timer did not fire");
    assert!(delta >= Duration::from_millis(50));
    // Deadline + quantum, with scheduling slack for loaded CI machines.
    assert!(delta < Duration::from_millis(50) + QUANTUM + Duration::from_millis(100));
}

#[test]
fn test_wait_source_signalled_from_sidecar_thread() {
    let worker = owned_worker("t-waitsource");
    let fence = Event::manual_reset();
    let observed: Arc<Mutex<Option<(LoopStatus, Duration)>>> = Arc::new(Mutex::new(None));

    let register_fence = fence.clone();
    let register_observed = observed.clone();
    worker.call_threadsafe(move || {
        let worker = Worker::current().unwrap();
        let started = Instant::now();
        let killer = worker.clone();
        worker
            .wait_one_low_level(&register_fence.wait_source(), None, move |_, status| {
                *register_observed.lock() = Some((status, started.elapsed()));
                killer.kill();
                Ok(())
            })
            .unwrap();
    });

    let signaller_fence = fence.clone();
    let signaller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        signaller_fence.signal();
    });

    worker.wait_for_shutdown().unwrap();
    let (status, elapsed) = observed.lock().expect("wait callback did not fire");
    assert_eq!(status, LoopStatus::Ok);
    assert!(elapsed < Duration::from_millis(100));
    signaller.join().unwrap();
}

#[test]
fn test_donated_thread_runs_and_exposes_current() {
    let worker = Worker::new(options("t-donated").donated());
    let matched = Arc::new(Mutex::new(false));

    let observed = matched.clone();
    let submitted = worker.clone();
    worker.call_threadsafe(move || {
        let current = Worker::current().unwrap();
        *observed.lock() = Arc::ptr_eq(&current, &submitted);
        current.kill();
    });

    worker.run_on_current_thread().unwrap();
    assert!(*matched.lock());
}

#[test]
fn test_kill_idle_worker_shuts_down_promptly() {
    let worker = owned_worker("t-kill-idle");
    // Let the loop park inside a trip first.
    thread::sleep(Duration::from_millis(20));

    let started = Instant::now();
    worker.kill();
    worker.kill(); // idempotent
    worker.wait_for_shutdown().unwrap();
    assert!(started.elapsed() < QUANTUM * 2);
}

#[test]
fn test_low_priority_defers_to_default_within_trip() {
    let worker = owned_worker("t-priority");
    let trace: Arc<Mutex<Vec<&str>>> = Arc::new(Mutex::new(Vec::new()));

    let submitted = trace.clone();
    worker.call_threadsafe(move || {
        let worker = Worker::current().unwrap();
        let t = submitted.clone();
        let killer = worker.clone();
        worker
            .call_low_level(Priority::Low, move |_, _| {
                t.lock().push("low");
                killer.kill();
                Ok(())
            })
            .unwrap();
        let t = submitted.clone();
        worker
            .call_low_level(Priority::Default, move |_, _| {
                t.lock().push("default");
                Ok(())
            })
            .unwrap();
    });

    worker.wait_for_shutdown().unwrap();
    assert_eq!(*trace.lock(), vec!["default", "low"]);
}

#[test]
fn test_callback_failure_surfaces_through_shutdown() {
    let worker = owned_worker("t-callback-err");
    worker.call_threadsafe(move || {
        let worker = Worker::current().unwrap();
        worker
            .call_low_level(Priority::Default, |_, _| {
                Err(RuntimeError::CallbackFailed("device fault".to_string()))
            })
            .unwrap();
    });

    let err = worker.wait_for_shutdown().unwrap_err();
    assert_eq!(err, RuntimeError::CallbackFailed("device fault".to_string()));
}

#[test]
fn test_thunk_panic_is_reported_as_status() {
    let worker = owned_worker("t-thunk-panic");
    worker.call_threadsafe(|| panic!("bad thunk"));

    let err = worker.wait_for_shutdown().unwrap_err();
    match err {
        RuntimeError::CallbackPanic(msg) => assert!(msg.contains("bad thunk")),
        other => panic!("expected CallbackPanic, got {other:?}"),
    }
}

#[test]
fn test_submissions_after_shutdown_are_discarded() {
    let worker = owned_worker("t-kill-discard");
    worker.kill();
    worker.wait_for_shutdown().unwrap();

    let ran = Arc::new(Mutex::new(false));
    let observed = ran.clone();
    worker.call_threadsafe(move || *observed.lock() = true);
    thread::sleep(Duration::from_millis(50));
    assert!(!*ran.lock());
}

#[test]
fn test_wait_for_shutdown_observable_by_multiple_threads() {
    let worker = owned_worker("t-multi-wait");
    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let worker = worker.clone();
            thread::spawn(move || worker.wait_for_shutdown())
        })
        .collect();

    worker.kill();
    for waiter in waiters {
        waiter.join().unwrap().unwrap();
    }
}
