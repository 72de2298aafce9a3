// SPDX-FileCopyrightText: Copyright (c) 2025-2026 Spindle Project Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Signalling primitives underneath the worker loop.
//!
//! [`Event`] is the OS-level signallable used by the runtime: auto-reset for
//! wake-ups that are consumed by exactly one observer (the worker's transact
//! signal), manual-reset for one-shot latches that stay signalled (worker
//! ended, process termination). [`WaitSource`] is the opaque handle the loop
//! registers waits against; device fences surface through the same handle.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

struct EventCore {
    signalled: bool,
    /// Parked loops to poke on signal. One entry per registered wait.
    watchers: Vec<Weak<Notify>>,
}

struct EventShared {
    core: Mutex<EventCore>,
    cv: Condvar,
    auto_reset: bool,
}

/// A signallable event with either auto-reset or manual-reset semantics.
#[derive(Clone)]
pub struct Event {
    shared: Arc<EventShared>,
}

impl Event {
    fn new(auto_reset: bool) -> Self {
        Event {
            shared: Arc::new(EventShared {
                core: Mutex::new(EventCore {
                    signalled: false,
                    watchers: Vec::new(),
                }),
                cv: Condvar::new(),
                auto_reset,
            }),
        }
    }

    /// An event that is reset by the observer that consumes the signal.
    pub fn auto_reset() -> Self {
        Event::new(true)
    }

    /// An event that stays signalled until explicitly [`reset`](Event::reset).
    pub fn manual_reset() -> Self {
        Event::new(false)
    }

    /// Signal the event, waking blocked waiters and any loops parked on a
    /// registered wait.
    pub fn signal(&self) {
        let watchers: Vec<Arc<Notify>> = {
            let mut core = self.shared.core.lock();
            core.signalled = true;
            self.shared.cv.notify_all();
            // Prune dead registrations while we are here.
            core.watchers.retain(|w| w.strong_count() > 0);
            core.watchers.iter().filter_map(Weak::upgrade).collect()
        };
        for notify in watchers {
            notify.notify();
        }
    }

    pub fn reset(&self) {
        self.shared.core.lock().signalled = false;
    }

    pub fn is_signalled(&self) -> bool {
        self.shared.core.lock().signalled
    }

    /// Block until the event is signalled. Consumes the signal when the event
    /// is auto-reset.
    pub fn wait(&self) {
        let mut core = self.shared.core.lock();
        while !core.signalled {
            self.shared.cv.wait(&mut core);
        }
        if self.shared.auto_reset {
            core.signalled = false;
        }
    }

    /// Block until the event is signalled or `timeout` elapses. Returns true
    /// when the signal was observed (and consumed, for auto-reset events).
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut core = self.shared.core.lock();
        while !core.signalled {
            if self.shared.cv.wait_until(&mut core, deadline).timed_out() {
                break;
            }
        }
        if core.signalled {
            if self.shared.auto_reset {
                core.signalled = false;
            }
            true
        } else {
            false
        }
    }

    /// The handle a loop registers waits against.
    pub fn wait_source(&self) -> WaitSource {
        WaitSource {
            shared: self.shared.clone(),
        }
    }
}

/// Opaque handle to a signallable primitive, registered with a worker loop
/// via `wait_one`. Cloning is cheap and keeps the underlying event alive.
#[derive(Clone)]
pub struct WaitSource {
    shared: Arc<EventShared>,
}

impl WaitSource {
    pub fn is_signalled(&self) -> bool {
        self.shared.core.lock().signalled
    }

    /// Block until signalled or `timeout` elapses, mirroring
    /// [`Event::wait_timeout`]. Used by off-worker observers.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        Event {
            shared: self.shared.clone(),
        }
        .wait_timeout(timeout)
    }

    /// Observe and, for auto-reset events, consume a pending signal.
    pub(crate) fn try_consume(&self) -> bool {
        let mut core = self.shared.core.lock();
        if !core.signalled {
            return false;
        }
        if self.shared.auto_reset {
            core.signalled = false;
        }
        true
    }

    /// Register a parked-loop watcher, poked on every signal. One
    /// registration per pending wait; paired with [`remove_watcher`].
    ///
    /// [`remove_watcher`]: WaitSource::remove_watcher
    pub(crate) fn add_watcher(&self, notify: &Arc<Notify>) {
        self.shared.core.lock().watchers.push(Arc::downgrade(notify));
    }

    /// Remove one registration for `notify`, if present.
    pub(crate) fn remove_watcher(&self, notify: &Arc<Notify>) {
        let mut core = self.shared.core.lock();
        if let Some(pos) = core.watchers.iter().position(|w| {
            w.upgrade()
                .map_or(false, |a| Arc::ptr_eq(&a, notify))
        }) {
            core.watchers.swap_remove(pos);
        }
    }

    pub(crate) fn ptr_eq(&self, other: &WaitSource) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

/// Park/unpark primitive for a blocked worker loop. Spurious wake-ups are
/// harmless; the loop re-checks its queues after every wake.
pub(crate) struct Notify {
    pending: Mutex<bool>,
    cv: Condvar,
}

impl Notify {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Notify {
            pending: Mutex::new(false),
            cv: Condvar::new(),
        })
    }

    pub(crate) fn notify(&self) {
        let mut pending = self.pending.lock();
        *pending = true;
        self.cv.notify_one();
    }

    /// Park until poked or until `deadline` (when given) passes. Consumes the
    /// pending poke.
    pub(crate) fn wait_until(&self, deadline: Option<Instant>) {
        let mut pending = self.pending.lock();
        while !*pending {
            match deadline {
                Some(d) => {
                    if self.cv.wait_until(&mut pending, d).timed_out() {
                        break;
                    }
                }
                None => self.cv.wait(&mut pending),
            }
        }
        *pending = false;
    }
}
