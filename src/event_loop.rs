// SPDX-FileCopyrightText: Copyright (c) 2025-2026 Spindle Project Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Single-threaded cooperative loop.
//!
//! The loop multiplexes three kinds of work: ready callbacks in two priority
//! lanes, timers keyed by absolute deadline, and waits against
//! [`WaitSource`]s. It is the underlying scheduler the [`Worker`] drives in
//! transact trips; everything here runs on the worker's thread and the handle
//! is deliberately `!Send` (`Rc`-based).
//!
//! Callbacks are status-returning: a callback observing [`LoopStatus::Ok`]
//! performs its work; [`LoopStatus::TimedOut`] means a wait deadline elapsed
//! before the source signalled; [`LoopStatus::Cancelled`] is delivered to
//! every still-pending registration at teardown. A callback that returns an
//! error (or panics; panics are caught at this boundary and converted) aborts
//! the current trip and takes the whole loop down with that status.
//!
//! [`Worker`]: crate::Worker

use std::cell::{Cell, RefCell};
use std::collections::{BinaryHeap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{panic_message, RuntimeError};
use crate::wait::{Notify, WaitSource};

/// Opaque handle to the host allocator. The loop retains it for the device
/// layers that allocate through the worker; the runtime itself never
/// allocates through it.
#[derive(Clone, Debug)]
pub struct HostAllocator {
    label: &'static str,
}

impl HostAllocator {
    /// The process-default allocator.
    pub fn system() -> Self {
        HostAllocator { label: "system" }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }
}

impl Default for HostAllocator {
    fn default() -> Self {
        HostAllocator::system()
    }
}

/// Scheduling class for ready callbacks. Within one trip, all `Default` work
/// runs before any `Low` work; FIFO within a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Default,
    Low,
}

impl Priority {
    fn lane(self) -> usize {
        match self {
            Priority::Default => 0,
            Priority::Low => 1,
        }
    }
}

/// Status handed to a loop callback when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStatus {
    /// The callback fired normally (ready work ran, timer reached its
    /// deadline, wait source signalled).
    Ok,
    /// A wait's deadline elapsed before its source signalled.
    TimedOut,
    /// The registration was cancelled at loop teardown.
    Cancelled,
}

impl LoopStatus {
    pub fn is_ok(self) -> bool {
        matches!(self, LoopStatus::Ok)
    }

    /// Project the status into a `Result` for bridge futures.
    pub fn into_result(self) -> Result<(), RuntimeError> {
        match self {
            LoopStatus::Ok => Ok(()),
            LoopStatus::TimedOut => Err(RuntimeError::TimedOut),
            LoopStatus::Cancelled => Err(RuntimeError::Cancelled),
        }
    }
}

/// A callback registered with the loop. Invoked exactly once, on the loop's
/// thread, with the loop handle and the firing status.
pub type LoopCallback = Box<dyn FnOnce(&EventLoop, LoopStatus) -> Result<(), RuntimeError>>;

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    callback: LoopCallback,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // Reversed so the BinaryHeap pops the earliest deadline first; seq breaks
    // ties FIFO.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct WaitEntry {
    source: WaitSource,
    deadline: Option<Instant>,
    callback: LoopCallback,
}

struct LoopInner {
    ready: [VecDeque<LoopCallback>; 2],
    timers: BinaryHeap<TimerEntry>,
    waits: Vec<WaitEntry>,
    seq: u64,
    closed: bool,
}

/// Handle to the cooperative loop bound to one worker thread.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<RefCell<LoopInner>>,
    notify: Arc<Notify>,
    epoch: Instant,
    allocator: HostAllocator,
}

impl EventLoop {
    pub(crate) fn new(epoch: Instant, allocator: HostAllocator) -> Self {
        EventLoop {
            inner: Rc::new(RefCell::new(LoopInner {
                ready: [VecDeque::new(), VecDeque::new()],
                timers: BinaryHeap::new(),
                waits: Vec::new(),
                seq: 0,
                closed: false,
            })),
            notify: Notify::new(),
            epoch,
            allocator,
        }
    }

    pub fn allocator(&self) -> &HostAllocator {
        &self.allocator
    }

    /// Current absolute time in nanoseconds on the loop's monotonic clock.
    pub fn now_ns(&self) -> u64 {
        (Instant::now() - self.epoch).as_nanos() as u64
    }

    /// Convert a relative timeout into an absolute deadline in nanoseconds.
    pub fn deadline_after(&self, timeout: Duration) -> u64 {
        self.now_ns().saturating_add(timeout.as_nanos() as u64)
    }

    fn instant_of(&self, deadline_ns: u64) -> Instant {
        self.epoch + Duration::from_nanos(deadline_ns)
    }

    /// Register a ready callback at the given priority.
    pub fn call(&self, priority: Priority, callback: LoopCallback) -> Result<(), RuntimeError> {
        let mut inner = self.inner.borrow_mut();
        if inner.closed {
            return Err(RuntimeError::SubmissionFailed(
                "loop is shut down".to_string(),
            ));
        }
        inner.ready[priority.lane()].push_back(callback);
        Ok(())
    }

    /// Register a timer that fires at or after `deadline_ns`.
    pub fn call_at(&self, deadline_ns: u64, callback: LoopCallback) -> Result<(), RuntimeError> {
        let deadline = self.instant_of(deadline_ns);
        let mut inner = self.inner.borrow_mut();
        if inner.closed {
            return Err(RuntimeError::SubmissionFailed(
                "loop is shut down".to_string(),
            ));
        }
        inner.seq += 1;
        let seq = inner.seq;
        inner.timers.push(TimerEntry {
            deadline,
            seq,
            callback,
        });
        Ok(())
    }

    /// Register a wait against `source`. Fires with [`LoopStatus::Ok`] once
    /// the source signals, or [`LoopStatus::TimedOut`] when `deadline_ns`
    /// (absolute, `None` for infinite) elapses first.
    pub fn wait_one(
        &self,
        source: &WaitSource,
        deadline_ns: Option<u64>,
        callback: LoopCallback,
    ) -> Result<(), RuntimeError> {
        let deadline = deadline_ns.map(|ns| self.instant_of(ns));
        let mut inner = self.inner.borrow_mut();
        if inner.closed {
            return Err(RuntimeError::SubmissionFailed(
                "loop is shut down".to_string(),
            ));
        }
        source.add_watcher(&self.notify);
        inner.waits.push(WaitEntry {
            source: source.clone(),
            deadline,
            callback,
        });
        Ok(())
    }

    /// Drive the loop until `stop` is set by one of its callbacks. Ready work
    /// runs first (Default lane before Low), then due timers, then completed
    /// or expired waits; the loop parks on its notifier when idle. An error
    /// from any callback aborts immediately; subsequent work in the trip does
    /// not run.
    pub(crate) fn run_until(&self, stop: &Cell<bool>) -> Result<(), RuntimeError> {
        loop {
            let mut progress = false;

            // Ready lanes.
            loop {
                let callback = {
                    let mut inner = self.inner.borrow_mut();
                    let lane = if inner.ready[0].is_empty() { 1 } else { 0 };
                    inner.ready[lane].pop_front()
                };
                match callback {
                    Some(cb) => {
                        progress = true;
                        self.invoke(cb, LoopStatus::Ok)?;
                    }
                    None => break,
                }
            }

            // Due timers.
            loop {
                let now = Instant::now();
                let callback = {
                    let mut inner = self.inner.borrow_mut();
                    match inner.timers.peek() {
                        Some(t) if t.deadline <= now => inner.timers.pop().map(|t| t.callback),
                        _ => None,
                    }
                };
                match callback {
                    Some(cb) => {
                        progress = true;
                        self.invoke(cb, LoopStatus::Ok)?;
                    }
                    None => break,
                }
            }

            // Completed or expired waits.
            loop {
                let now = Instant::now();
                let fired = {
                    let mut inner = self.inner.borrow_mut();
                    let mut found = None;
                    for (i, w) in inner.waits.iter().enumerate() {
                        if w.source.try_consume() {
                            found = Some((i, LoopStatus::Ok));
                            break;
                        }
                        if w.deadline.map_or(false, |d| d <= now) {
                            found = Some((i, LoopStatus::TimedOut));
                            break;
                        }
                    }
                    found.map(|(i, status)| (inner.waits.swap_remove(i), status))
                };
                match fired {
                    Some((entry, status)) => {
                        progress = true;
                        entry.source.remove_watcher(&self.notify);
                        self.invoke(entry.callback, status)?;
                    }
                    None => break,
                }
            }

            if stop.get() {
                return Ok(());
            }
            if progress {
                continue;
            }

            // Idle: park until the earliest deadline or an external poke.
            let deadline = {
                let inner = self.inner.borrow();
                let timer = inner.timers.peek().map(|t| t.deadline);
                let wait = inner.waits.iter().filter_map(|w| w.deadline).min();
                match (timer, wait) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                }
            };
            self.notify.wait_until(deadline);
        }
    }

    /// Tear the loop down: every still-pending registration fires exactly
    /// once with [`LoopStatus::Cancelled`], and all further submissions are
    /// rejected.
    pub(crate) fn shutdown(&self) {
        self.inner.borrow_mut().closed = true;
        loop {
            let next = {
                let mut inner = self.inner.borrow_mut();
                if let Some(cb) = inner.ready[0].pop_front() {
                    Some((cb, None))
                } else if let Some(cb) = inner.ready[1].pop_front() {
                    Some((cb, None))
                } else if let Some(t) = inner.timers.pop() {
                    Some((t.callback, None))
                } else if !inner.waits.is_empty() {
                    let w = inner.waits.swap_remove(0);
                    Some((w.callback, Some(w.source)))
                } else {
                    None
                }
            };
            match next {
                Some((callback, source)) => {
                    if let Some(source) = source {
                        source.remove_watcher(&self.notify);
                    }
                    if let Err(error) = self.invoke(callback, LoopStatus::Cancelled) {
                        tracing::warn!(%error, "callback failed during loop teardown");
                    }
                }
                None => break,
            }
        }
    }

    /// Run one callback outside any borrow of the loop state, converting
    /// panics to [`RuntimeError::CallbackPanic`] so they never unwind through
    /// the loop.
    fn invoke(&self, callback: LoopCallback, status: LoopStatus) -> Result<(), RuntimeError> {
        match panic::catch_unwind(AssertUnwindSafe(|| callback(self, status))) {
            Ok(result) => result,
            Err(payload) => Err(RuntimeError::CallbackPanic(panic_message(payload.as_ref()))),
        }
    }
}
