// SPDX-FileCopyrightText: Copyright (c) 2025-2026 Spindle Project Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Cooperative worker.
//!
//! A [`Worker`] binds one cooperative [`EventLoop`] to one OS thread — its
//! own when `owned_thread` is set, otherwise a thread donated through
//! [`Worker::run_on_current_thread`] — and is the single point of async
//! progress for everything dispatched to it. External threads reach a worker
//! only through [`Worker::call_threadsafe`] and [`Worker::kill`]; everything
//! else happens on the worker's thread.
//!
//! The loop is driven in *transact trips*: drain the cross-thread mailbox,
//! arm a watchdog on the transact signal bounded by the worker's quantum,
//! yield to the loop, and re-check the kill flag. The quantum bounds how long
//! a device wait can defer shutdown or mailbox delivery.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{panic_message, RuntimeError};
use crate::event_loop::{EventLoop, HostAllocator, LoopStatus, Priority};
use crate::wait::{Event, WaitSource};

/// Options consumed by the worker factory.
#[derive(Clone)]
pub struct WorkerOptions {
    /// Allocator handle passed through to the loop.
    pub allocator: HostAllocator,
    /// Human-readable label; also the OS thread name for owned workers.
    pub name: String,
    /// Maximum duration that can transpire between outer trips where the
    /// loop can exit and perform outside-world maintenance. Without this the
    /// loop could block forever on a long async wait.
    pub quantum: Duration,
    /// Whether the worker runs on an owned thread. If false, the worker is
    /// set up to be adopted and a thread will not be created.
    pub owned_thread: bool,
}

impl WorkerOptions {
    pub fn new(allocator: HostAllocator, name: impl Into<String>) -> Self {
        WorkerOptions {
            allocator,
            name: name.into(),
            quantum: Duration::from_millis(500),
            owned_thread: true,
        }
    }

    pub fn with_quantum(mut self, quantum: Duration) -> Self {
        self.quantum = quantum;
        self
    }

    /// Configure the worker for thread donation instead of an owned thread.
    pub fn donated(mut self) -> Self {
        self.owned_thread = false;
        self
    }
}

/// Extension points run on the worker thread immediately after loop creation
/// and immediately before loop teardown. This is the only integration seam
/// for hosting a per-thread coroutine scheduler; the base worker knows
/// nothing about what the hooks install.
pub trait WorkerHooks: Send + Sync + 'static {
    fn on_thread_start(&self, _worker: &Arc<Worker>) {}
    fn on_thread_stop(&self, _worker: &Arc<Worker>) {}
}

type Thunk = Box<dyn FnOnce() + Send + 'static>;

/// Cross-thread mailbox state. `pending` and `kill` are only touched under
/// the worker mutex; the drain swaps `pending` into an on-thread scratch
/// vector so submitters never contend with callback execution.
struct Mailbox {
    pending: Vec<Thunk>,
    kill: bool,
}

struct CurrentEntry {
    worker: Arc<Worker>,
    event_loop: EventLoop,
}

thread_local! {
    static CURRENT_WORKER: RefCell<Option<CurrentEntry>> = const { RefCell::new(None) };
}

/// Cooperative worker. See the module docs for the threading contract.
pub struct Worker {
    options: WorkerOptions,
    epoch: Instant,
    mailbox: Mutex<Mailbox>,
    signal_transact: Event,
    signal_ended: Event,
    ended_status: Mutex<Option<RuntimeError>>,
    has_run: AtomicBool,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
    hooks: Option<Box<dyn WorkerHooks>>,
}

impl Worker {
    pub fn new(options: WorkerOptions) -> Arc<Worker> {
        Worker::build(options, None)
    }

    /// A worker with binding hooks installed. The hooks run on the worker
    /// thread around the loop's lifetime.
    pub fn with_hooks(options: WorkerOptions, hooks: impl WorkerHooks) -> Arc<Worker> {
        Worker::build(options, Some(Box::new(hooks)))
    }

    fn build(options: WorkerOptions, hooks: Option<Box<dyn WorkerHooks>>) -> Arc<Worker> {
        Arc::new(Worker {
            options,
            epoch: Instant::now(),
            mailbox: Mutex::new(Mailbox {
                pending: Vec::new(),
                kill: false,
            }),
            signal_transact: Event::auto_reset(),
            signal_ended: Event::manual_reset(),
            ended_status: Mutex::new(None),
            has_run: AtomicBool::new(false),
            thread: Mutex::new(None),
            hooks,
        })
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    pub(crate) fn has_run(&self) -> bool {
        self.has_run.load(Ordering::SeqCst)
    }

    /// The worker associated with the running thread.
    pub fn current() -> Result<Arc<Worker>, RuntimeError> {
        CURRENT_WORKER.with(|current| {
            current
                .borrow()
                .as_ref()
                .map(|entry| entry.worker.clone())
                .ok_or_else(|| {
                    RuntimeError::misuse("no worker is associated with the current thread")
                })
        })
    }

    /// Spawn the owned thread and return immediately. Single-use.
    pub fn start(self: &Arc<Self>) -> Result<(), RuntimeError> {
        if !self.options.owned_thread {
            return Err(RuntimeError::misuse(format!(
                "worker '{}' does not own a thread; use run_on_current_thread",
                self.name()
            )));
        }
        self.mark_run()?;
        let this = self.clone();
        let handle = thread::Builder::new()
            .name(self.options.name.clone())
            .spawn(move || {
                let _ = this.thread_main();
            })
            .map_err(|e| {
                RuntimeError::SubmissionFailed(format!("failed to spawn worker thread: {e}"))
            })?;
        *self.thread.lock() = Some(handle);
        Ok(())
    }

    /// Donate the calling thread to the worker; returns the worker's terminal
    /// status once the loop has shut down. Single-use.
    pub fn run_on_current_thread(self: &Arc<Self>) -> Result<(), RuntimeError> {
        if self.options.owned_thread {
            return Err(RuntimeError::misuse(format!(
                "worker '{}' owns its thread; use start",
                self.name()
            )));
        }
        self.mark_run()?;
        self.thread_main()
    }

    /// Request exit after the next drain. Callable from any thread,
    /// idempotent, does not join.
    pub fn kill(&self) {
        {
            let mut mailbox = self.mailbox.lock();
            if mailbox.kill {
                return;
            }
            mailbox.kill = true;
        }
        tracing::debug!(worker = %self.options.name, "kill requested");
        self.signal_transact.signal();
    }

    /// Block until the loop has exited, then return its terminal status.
    /// Waiting for a worker from its own thread would deadlock and is
    /// rejected as misuse.
    pub fn wait_for_shutdown(&self) -> Result<(), RuntimeError> {
        if self.is_current_thread() {
            return Err(RuntimeError::misuse(format!(
                "worker '{}' cannot wait for its own shutdown",
                self.name()
            )));
        }
        self.signal_ended.wait();
        match self.ended_status.lock().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Enqueue a callback from another thread. Runs on the worker thread, in
    /// FIFO order with respect to other `call_threadsafe` submissions.
    pub fn call_threadsafe(&self, f: impl FnOnce() + Send + 'static) {
        {
            let mut mailbox = self.mailbox.lock();
            mailbox.pending.push(Box::new(f));
        }
        self.signal_transact.signal();
    }

    /// Register a callback with the underlying loop at the given priority.
    /// Must be called from the worker thread; the callback is invoked exactly
    /// once with the loop handle and a firing status.
    pub fn call_low_level<F>(&self, priority: Priority, f: F) -> Result<(), RuntimeError>
    where
        F: FnOnce(&EventLoop, LoopStatus) -> Result<(), RuntimeError> + 'static,
    {
        self.current_loop()?.call(priority, Box::new(f))
    }

    /// Register a timer with the underlying loop; fires at or after the
    /// absolute `deadline_ns` on the worker's clock.
    pub fn wait_until_low_level<F>(&self, deadline_ns: u64, f: F) -> Result<(), RuntimeError>
    where
        F: FnOnce(&EventLoop, LoopStatus) -> Result<(), RuntimeError> + 'static,
    {
        self.current_loop()?.call_at(deadline_ns, Box::new(f))
    }

    /// Register a wait against `source`; fires when the source signals or
    /// when `deadline_ns` (absolute, `None` for infinite) elapses, with a
    /// status distinguishing the two.
    pub fn wait_one_low_level<F>(
        &self,
        source: &WaitSource,
        deadline_ns: Option<u64>,
        f: F,
    ) -> Result<(), RuntimeError>
    where
        F: FnOnce(&EventLoop, LoopStatus) -> Result<(), RuntimeError> + 'static,
    {
        self.current_loop()?.wait_one(source, deadline_ns, Box::new(f))
    }

    /// Current absolute time in nanoseconds on the worker's monotonic clock.
    pub fn now_ns(&self) -> u64 {
        (Instant::now() - self.epoch).as_nanos() as u64
    }

    /// Convert a relative timeout to an absolute deadline on the worker's
    /// clock.
    pub fn deadline_after(&self, timeout: Duration) -> u64 {
        self.now_ns().saturating_add(timeout.as_nanos() as u64)
    }

    /// Join the owned thread, if one is still attached.
    pub(crate) fn join(&self) {
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!(worker = %self.options.name, "worker thread panicked outside the loop");
            }
        }
    }

    fn mark_run(&self) -> Result<(), RuntimeError> {
        if self.has_run.swap(true, Ordering::SeqCst) {
            return Err(RuntimeError::misuse(format!(
                "worker '{}' was already run; workers are single-use",
                self.name()
            )));
        }
        Ok(())
    }

    fn is_current_thread(&self) -> bool {
        CURRENT_WORKER.with(|current| {
            current
                .borrow()
                .as_ref()
                .map_or(false, |entry| std::ptr::eq(Arc::as_ptr(&entry.worker), self))
        })
    }

    fn current_loop(&self) -> Result<EventLoop, RuntimeError> {
        CURRENT_WORKER.with(|current| {
            let borrowed = current.borrow();
            match borrowed.as_ref() {
                Some(entry) if std::ptr::eq(Arc::as_ptr(&entry.worker), self) => {
                    Ok(entry.event_loop.clone())
                }
                _ => Err(RuntimeError::misuse(format!(
                    "operation requires the loop thread of worker '{}'",
                    self.name()
                ))),
            }
        })
    }

    /// Loop entry point, on the hosting thread. Creates the loop, runs the
    /// hooks and the trip sequence, and guarantees teardown plus the ended
    /// signal on every exit path.
    fn thread_main(self: &Arc<Self>) -> Result<(), RuntimeError> {
        let event_loop = EventLoop::new(self.epoch, self.options.allocator.clone());
        CURRENT_WORKER.with(|current| {
            *current.borrow_mut() = Some(CurrentEntry {
                worker: self.clone(),
                event_loop: event_loop.clone(),
            });
        });

        // Hooks are binding code; a panic there must not unwind the thread
        // without releasing the loop and signalling shutdown.
        let started = panic::catch_unwind(AssertUnwindSafe(|| {
            if let Some(hooks) = &self.hooks {
                hooks.on_thread_start(self);
            }
        }));
        let result = match started {
            Ok(()) => {
                tracing::debug!(worker = %self.options.name, "worker loop started");
                self.trip_loop(&event_loop)
            }
            Err(payload) => Err(RuntimeError::CallbackPanic(panic_message(payload.as_ref()))),
        };
        match &result {
            Ok(()) => tracing::debug!(worker = %self.options.name, "worker loop exiting"),
            Err(error) => {
                tracing::error!(worker = %self.options.name, %error, "worker loop aborted")
            }
        }

        let stopped = panic::catch_unwind(AssertUnwindSafe(|| {
            if let Some(hooks) = &self.hooks {
                hooks.on_thread_stop(self);
            }
        }));
        if stopped.is_err() {
            tracing::error!(worker = %self.options.name, "on_thread_stop hook panicked");
        }

        // Clear the backpointer before teardown so cancellation callbacks
        // cannot observe a half-dead worker as current.
        CURRENT_WORKER.with(|current| current.borrow_mut().take());
        event_loop.shutdown();

        *self.ended_status.lock() = result.clone().err();
        self.signal_ended.signal();
        result
    }

    /// The outer trip sequence: drain the mailbox, arm the transact watchdog,
    /// yield to the loop, re-check kill.
    fn trip_loop(&self, event_loop: &EventLoop) -> Result<(), RuntimeError> {
        let mut next_thunks: Vec<Thunk> = Vec::new();
        let transact_fired = Rc::new(Cell::new(false));
        let transact_source = self.signal_transact.wait_source();
        loop {
            // Drain external submissions. The swap keeps submitters off the
            // execution path; thunks run without the mutex held.
            let kill = {
                let mut mailbox = self.mailbox.lock();
                std::mem::swap(&mut mailbox.pending, &mut next_thunks);
                mailbox.kill
            };
            for thunk in next_thunks.drain(..) {
                panic::catch_unwind(AssertUnwindSafe(thunk))
                    .map_err(|payload| {
                        RuntimeError::CallbackPanic(panic_message(payload.as_ref()))
                    })?;
            }
            // Exit after the drain that observed the kill; submissions that
            // made that drain have run, later ones are discarded.
            if kill {
                return Ok(());
            }

            // Arm the external-transact watchdog for this trip.
            transact_fired.set(false);
            let fired = transact_fired.clone();
            event_loop.wait_one(
                &transact_source,
                Some(event_loop.deadline_after(self.options.quantum)),
                Box::new(move |_, _| {
                    fired.set(true);
                    Ok(())
                }),
            )?;

            // Yield to the loop until the watchdog fires or a callback
            // aborts the trip.
            event_loop.run_until(&transact_fired)?;
        }
    }
}

impl fmt::Display for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Worker(name='{}')", self.options.name)
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.options.name)
            .field("owned_thread", &self.options.owned_thread)
            .field("has_run", &self.has_run())
            .finish()
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        // Best-effort: an owned thread still attached at drop is killed and
        // joined so the loop resource is never leaked.
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                // Last reference released on the worker's own thread; the
                // loop has already exited and there is nothing to join.
                return;
            }
            self.kill();
            if handle.join().is_err() {
                tracing::error!(worker = %self.options.name, "worker thread panicked outside the loop");
            }
        }
    }
}
