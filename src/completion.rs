// SPDX-FileCopyrightText: Copyright (c) 2025-2026 Spindle Project Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Bridges from loop primitives to awaitable futures.
//!
//! [`CompletionEvent`] adapts a [`WaitSource`] into a future for coroutines
//! hosted on a worker's executor: the first poll registers a wait-one with
//! the current worker's loop, and the loop callback resolves the future from
//! the worker thread. [`sleep`] is the timer counterpart.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::RuntimeError;
use crate::event_loop::LoopStatus;
use crate::wait::WaitSource;
use crate::worker::Worker;

/// Shared slot between a bridge future and its loop callback. The callback
/// stores the firing status and wakes whatever waker the future stashed
/// last; the future refreshes the waker on every poll.
struct BridgeState {
    status: Option<LoopStatus>,
    waker: Option<Waker>,
}

type SharedBridgeState = Arc<Mutex<BridgeState>>;

fn bridge_state(waker: Waker) -> SharedBridgeState {
    Arc::new(Mutex::new(BridgeState {
        status: None,
        waker: Some(waker),
    }))
}

/// Resolve-and-wake half of the bridge, run as a loop callback.
fn complete_bridge(state: &SharedBridgeState, status: LoopStatus) {
    let waker = {
        let mut guard = state.lock();
        guard.status = Some(status);
        guard.waker.take()
    };
    if let Some(waker) = waker {
        waker.wake();
    }
}

/// Awaitable adapter over a [`WaitSource`].
///
/// Awaiting requires a current worker; off-worker observers use
/// [`CompletionEvent::wait_timeout`] instead. The registration clones the
/// wait source, which keeps the underlying event alive until the callback
/// fires.
pub struct CompletionEvent {
    source: WaitSource,
    registered: Option<SharedBridgeState>,
}

impl CompletionEvent {
    pub fn new(source: WaitSource) -> Self {
        CompletionEvent {
            source,
            registered: None,
        }
    }

    pub fn wait_source(&self) -> &WaitSource {
        &self.source
    }

    /// Synchronously block until the source signals or `timeout` elapses.
    /// Returns true when the signal was observed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.source.wait_timeout(timeout)
    }
}

impl Future for CompletionEvent {
    type Output = Result<(), RuntimeError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(state) = &this.registered {
            let mut guard = state.lock();
            if let Some(status) = guard.status {
                return Poll::Ready(status.into_result());
            }
            guard.waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let worker = match Worker::current() {
            Ok(worker) => worker,
            Err(error) => return Poll::Ready(Err(error)),
        };
        let state = bridge_state(cx.waker().clone());
        let callback_state = state.clone();
        let registered = worker.wait_one_low_level(&this.source, None, move |_, status| {
            complete_bridge(&callback_state, status);
            Ok(())
        });
        if let Err(error) = registered {
            return Poll::Ready(Err(error));
        }
        this.registered = Some(state);
        Poll::Pending
    }
}

/// Suspend the current task for at least `duration`, measured on the hosting
/// worker's clock. Fires no earlier than the deadline and no later than the
/// deadline plus the worker's quantum.
pub fn sleep(duration: Duration) -> Sleep {
    Sleep {
        duration,
        registered: None,
    }
}

/// Future returned by [`sleep`]. Must be polled on a worker thread.
pub struct Sleep {
    duration: Duration,
    registered: Option<SharedBridgeState>,
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if let Some(state) = &this.registered {
            let mut guard = state.lock();
            if guard.status.is_some() {
                return Poll::Ready(());
            }
            guard.waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let worker = Worker::current()
            .unwrap_or_else(|_| panic!("sleep() polled off any worker thread"));
        let state = bridge_state(cx.waker().clone());
        let callback_state = state.clone();
        let deadline_ns = worker.deadline_after(this.duration);
        let registered = worker.wait_until_low_level(deadline_ns, move |_, status| {
            complete_bridge(&callback_state, status);
            Ok(())
        });
        if let Err(error) = registered {
            // The loop is tearing down; this task is about to be dropped, so
            // parking forever is the safe outcome.
            tracing::debug!(%error, "sleep registration rejected during teardown");
            return Poll::Pending;
        }
        this.registered = Some(state);
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::HostAllocator;
    use crate::executor::{ExecutorHooks, LocalExecutor};
    use crate::wait::Event;
    use crate::worker::WorkerOptions;
    use std::thread;
    use std::time::Instant;

    fn spawn_worker(name: &str) -> Arc<Worker> {
        let options = WorkerOptions::new(HostAllocator::system(), name)
            .with_quantum(Duration::from_millis(100));
        let worker = Worker::with_hooks(options, ExecutorHooks);
        worker.start().unwrap();
        worker
    }

    #[test]
    fn test_completion_event_resolves_on_signal() {
        let worker = spawn_worker("t-bridge-signal");
        let latch = Event::manual_reset();
        let observed = Arc::new(Mutex::new(None));

        let task_latch = latch.clone();
        let task_observed = observed.clone();
        worker.call_threadsafe(move || {
            let executor = LocalExecutor::current().unwrap();
            let worker = Worker::current().unwrap();
            executor.spawn(async move {
                let result = CompletionEvent::new(task_latch.wait_source()).await;
                *task_observed.lock() = Some(result);
                worker.kill();
            });
        });

        let signaller_latch = latch.clone();
        let signaller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            signaller_latch.signal();
        });

        worker.wait_for_shutdown().unwrap();
        assert_eq!(*observed.lock(), Some(Ok(())));
        signaller.join().unwrap();
    }

    #[test]
    fn test_completion_event_sync_wait() {
        let latch = Event::manual_reset();
        let event = CompletionEvent::new(latch.wait_source());
        assert!(!event.wait_timeout(Duration::from_millis(10)));
        latch.signal();
        assert!(event.wait_timeout(Duration::from_millis(10)));
        // Manual latches stay signalled for later observers.
        assert!(event.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_sleep_observes_deadline() {
        let worker = spawn_worker("t-bridge-sleep");
        let elapsed = Arc::new(Mutex::new(None));

        let task_elapsed = elapsed.clone();
        worker.call_threadsafe(move || {
            let executor = LocalExecutor::current().unwrap();
            let worker = Worker::current().unwrap();
            executor.spawn(async move {
                let started = Instant::now();
                sleep(Duration::from_millis(30)).await;
                *task_elapsed.lock() = Some(started.elapsed());
                worker.kill();
            });
        });

        worker.wait_for_shutdown().unwrap();
        let elapsed = elapsed.lock().expect("sleep task did not run");
        assert!(elapsed >= Duration::from_millis(30));
        // Bounded by deadline + quantum, with scheduling slack.
        assert!(elapsed < Duration::from_millis(400));
    }
}
