// SPDX-FileCopyrightText: Copyright (c) 2025-2026 Spindle Project Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Integration tests for the process lifecycle and the foreground runner.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use spindle_runtime::{
    sleep, Continuation, Process, ProcessState, RuntimeConfig, RuntimeError, System,
    SystemBuilder,
};

/// Generous bound for anything that should complete almost immediately.
const WAIT: Duration = Duration::from_secs(2);

fn test_system() -> Arc<System> {
    let config = RuntimeConfig {
        worker_quantum_ms: 100,
        ..RuntimeConfig::default()
    };
    SystemBuilder::with_config(config).build()
}

#[test]
fn test_synchronous_run_terminates_immediately() {
    let system = test_system();
    let worker = system.create_worker("proc-sync").unwrap();
    let process = Process::new(system.create_scope(&worker));
    assert_eq!(process.state(), ProcessState::Initialized);
    assert_eq!(process.pid(), None);

    let pid = process.launch(|_| Continuation::Done).unwrap();
    assert!(pid >= 1);
    assert_eq!(process.pid(), Some(pid));

    assert!(process.on_termination().wait_timeout(WAIT));
    assert_eq!(process.state(), ProcessState::Terminated);
    system.shutdown();
}

#[test]
fn test_async_run_terminates_after_future() {
    let system = test_system();
    let worker = system.create_worker("proc-async").unwrap();
    let process = Process::new(system.create_scope(&worker));

    let ran = Arc::new(Mutex::new(false));
    let observed = ran.clone();
    process
        .launch(move |process| {
            assert_eq!(process.state(), ProcessState::Running);
            Continuation::from_future(async move {
                sleep(Duration::from_millis(30)).await;
                *observed.lock() = true;
            })
        })
        .unwrap();

    assert!(process.on_termination().wait_timeout(WAIT));
    assert!(*ran.lock());
    system.shutdown();
}

#[test]
fn test_double_launch_is_rejected() {
    let system = test_system();
    let worker = system.create_worker("proc-double").unwrap();
    let process = Process::new(system.create_scope(&worker));

    process.launch(|_| Continuation::Done).unwrap();
    let err = process.launch(|_| Continuation::Done).unwrap_err();
    assert!(matches!(err, RuntimeError::Misuse(_)));
    system.shutdown();
}

#[test]
fn test_pids_increase_across_launches() {
    let system = test_system();
    let worker = system.create_worker("proc-pids").unwrap();

    let first = Process::new(system.create_scope(&worker));
    let second = Process::new(system.create_scope(&worker));
    let a = first.launch(|_| Continuation::Done).unwrap();
    let b = second.launch(|_| Continuation::Done).unwrap();
    assert!(b > a);
    system.shutdown();
}

#[test]
fn test_observer_process_awaits_peer_termination() {
    let system = test_system();
    let sleeper_worker = system.create_worker("proc-peer-a").unwrap();
    let observer_worker = system.create_worker("proc-peer-b").unwrap();

    let sleeper = Process::new(system.create_scope(&sleeper_worker));
    sleeper
        .launch(|_| {
            Continuation::from_future(async {
                sleep(Duration::from_millis(30)).await;
            })
        })
        .unwrap();

    let observed = Arc::new(Mutex::new(None));
    let observer = Process::new(system.create_scope(&observer_worker));
    let peer = sleeper.clone();
    let result = observed.clone();
    observer
        .launch(move |_| {
            Continuation::from_future(async move {
                *result.lock() = Some(peer.on_termination().await);
            })
        })
        .unwrap();

    assert!(observer.on_termination().wait_timeout(WAIT));
    assert_eq!(*observed.lock(), Some(Ok(())));
    assert_eq!(sleeper.state(), ProcessState::Terminated);
    system.shutdown();
}

#[test]
fn test_run_returns_coroutine_result() {
    let system = test_system();
    let value = system.run(async { 40 + 2 }).unwrap();
    assert_eq!(value, 42);
}

#[test]
fn test_run_drives_processes_to_completion() {
    let system = test_system();
    let worker = system.create_worker("fg-proc").unwrap();
    let scope = system.create_scope(&worker);

    let value = system
        .run(async move {
            let process = Process::new(scope);
            process
                .launch(|_| {
                    Continuation::from_future(async {
                        sleep(Duration::from_millis(20)).await;
                    })
                })
                .unwrap();
            process.on_termination().await.unwrap();
            7
        })
        .unwrap();
    assert_eq!(value, 7);
}

#[test]
fn test_run_surfaces_panics_and_shuts_down() {
    let system = test_system();
    let err = system
        .run(async {
            panic!("induced failure");
        })
        .unwrap_err();
    assert!(err.to_string().contains("induced failure"));

    // The exceptional exit still shut the whole system down.
    assert!(system.create_worker("late").is_err());
}

#[test]
fn test_run_is_single_use() {
    let system = test_system();
    let value = system.run(async { 1 }).unwrap();
    assert_eq!(value, 1);
    // The init worker is single-use; a second run fails fast instead of
    // hanging.
    assert!(system.run(async { 2 }).is_err());
}
