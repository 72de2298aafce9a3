// SPDX-FileCopyrightText: Copyright (c) 2025-2026 Spindle Project Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Process lifecycle wrapper.
//!
//! A [`Process`] packages "run this routine on this scope's worker and
//! signal me when it terminates". The routine runs on-loop; it either
//! completes synchronously ([`Continuation::Done`]) or hands back a future
//! that the worker's executor drives to completion. Termination is a
//! one-shot latch any number of observers can await through
//! [`Process::on_termination`].

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::LocalBoxFuture;
use futures::FutureExt;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::completion::CompletionEvent;
use crate::error::RuntimeError;
use crate::executor::LocalExecutor;
use crate::system::Scope;
use crate::wait::Event;

/// Process id, monotonically increasing per system, assigned at launch.
pub type Pid = u64;

/// Lifecycle states. Transitions are monotonic:
/// `Initialized -> Running -> Terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Initialized,
    Running,
    Terminated,
}

/// What a process routine hands back from its on-loop invocation.
pub enum Continuation {
    /// The routine completed synchronously; the process terminates at once.
    Done,
    /// The routine continues as a future on the worker's executor; the
    /// process terminates when it finishes.
    Future(LocalBoxFuture<'static, ()>),
}

impl Continuation {
    pub fn from_future(future: impl Future<Output = ()> + 'static) -> Self {
        Continuation::Future(future.boxed_local())
    }
}

/// A launched routine with an observable termination.
pub struct Process {
    scope: Scope,
    pid: OnceCell<Pid>,
    state: Mutex<ProcessState>,
    termination: Event,
}

impl Process {
    pub fn new(scope: Scope) -> Arc<Process> {
        Arc::new(Process {
            scope,
            pid: OnceCell::new(),
            state: Mutex::new(ProcessState::Initialized),
            termination: Event::manual_reset(),
        })
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// The pid, once assigned by [`launch`](Process::launch).
    pub fn pid(&self) -> Option<Pid> {
        self.pid.get().copied()
    }

    pub fn state(&self) -> ProcessState {
        *self.state.lock()
    }

    /// Assign a pid and schedule `routine` on the scope's worker. The
    /// routine receives a strong handle to this process. A second launch is
    /// an error.
    pub fn launch<F>(self: &Arc<Self>, routine: F) -> Result<Pid, RuntimeError>
    where
        F: FnOnce(Arc<Process>) -> Continuation + Send + 'static,
    {
        {
            let mut state = self.state.lock();
            if *state != ProcessState::Initialized {
                return Err(RuntimeError::Misuse(format!(
                    "process {} was already launched",
                    self.pid().map_or_else(|| "?".to_string(), |p| p.to_string())
                )));
            }
            *state = ProcessState::Running;
        }
        let pid = self.scope.system().allocate_pid();
        let _ = self.pid.set(pid);
        tracing::debug!(pid, worker = %self.scope.worker().name(), "launching process");
        self.schedule_on_worker(routine);
        Ok(pid)
    }

    /// A wait-source adapter signalled exactly once when the process
    /// terminates; it stays signalled for late observers.
    pub fn on_termination(&self) -> CompletionEvent {
        CompletionEvent::new(self.termination.wait_source())
    }

    fn schedule_on_worker<F>(self: &Arc<Self>, routine: F)
    where
        F: FnOnce(Arc<Process>) -> Continuation + Send + 'static,
    {
        // The thunk carries a strong reference across the thread boundary;
        // for async routines the spawned future holds another, so the
        // process outlives any in-flight run.
        let this = self.clone();
        self.scope.worker().call_threadsafe(move || {
            match routine(this.clone()) {
                Continuation::Done => this.terminate(),
                Continuation::Future(future) => match LocalExecutor::current() {
                    Ok(executor) => {
                        let done = this.clone();
                        executor.spawn(async move {
                            future.await;
                            done.terminate();
                        });
                    }
                    Err(error) => {
                        tracing::error!(
                            %error,
                            "scope worker hosts no executor; terminating process"
                        );
                        this.terminate();
                    }
                },
            }
        });
    }

    /// Runs on-loop, exactly once per process.
    fn terminate(&self) {
        {
            let mut state = self.state.lock();
            if *state == ProcessState::Terminated {
                tracing::warn!(pid = ?self.pid(), "process terminated twice");
                return;
            }
            *state = ProcessState::Terminated;
        }
        tracing::debug!(pid = ?self.pid(), "process terminated");
        self.termination.signal();
    }
}

impl fmt::Display for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pid() {
            Some(pid) => write!(f, "Process(pid={pid})"),
            None => write!(f, "Process(unlaunched)"),
        }
    }
}
