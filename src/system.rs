// SPDX-FileCopyrightText: Copyright (c) 2025-2026 Spindle Project Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! System assembly: worker registry, scopes, and the foreground runner.
//!
//! A [`System`] owns a fleet of named workers plus the *init worker* — a
//! donated-thread worker driven by [`System::run`]. Workers are produced by
//! a pluggable factory; the default factory installs [`ExecutorHooks`] so
//! every worker hosts a coroutine scheduler. Bindings substitute their own
//! factory to marry the loop with an external scheduler.

use std::collections::HashMap;
use std::future::Future;
use std::panic;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, bail};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use crate::event_loop::HostAllocator;
use crate::executor::{ExecutorHooks, LocalExecutor};
use crate::worker::{Worker, WorkerOptions};

/// Produces a worker for the given options. Substituted by bindings that
/// attach their own per-thread scheduler through worker hooks.
pub type WorkerFactory = Box<dyn Fn(WorkerOptions) -> Arc<Worker> + Send + Sync>;

pub struct SystemBuilder {
    config: RuntimeConfig,
    allocator: HostAllocator,
    worker_factory: WorkerFactory,
}

impl SystemBuilder {
    pub fn new() -> Self {
        SystemBuilder::with_config(RuntimeConfig::default())
    }

    /// Builder with configuration resolved from the environment.
    pub fn from_settings() -> crate::Result<Self> {
        Ok(SystemBuilder::with_config(RuntimeConfig::from_settings()?))
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        SystemBuilder {
            config,
            allocator: HostAllocator::system(),
            worker_factory: Box::new(|options| Worker::with_hooks(options, ExecutorHooks)),
        }
    }

    pub fn worker_factory(mut self, factory: WorkerFactory) -> Self {
        self.worker_factory = factory;
        self
    }

    pub fn build(self) -> Arc<System> {
        let init_options =
            WorkerOptions::new(self.allocator.clone(), self.config.init_worker_name.clone())
                .with_quantum(self.config.quantum())
                .donated();
        let init_worker = (self.worker_factory)(init_options);
        let system = Arc::new(System {
            id: Uuid::new_v4().to_string(),
            config: self.config,
            allocator: self.allocator,
            worker_factory: self.worker_factory,
            init_worker,
            workers: Mutex::new(HashMap::new()),
            next_pid: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
        });
        tracing::debug!(system = %system.id, "system created");
        system
    }
}

impl Default for SystemBuilder {
    fn default() -> Self {
        SystemBuilder::new()
    }
}

/// Local system: the worker fleet and its shared services.
pub struct System {
    id: String,
    config: RuntimeConfig,
    allocator: HostAllocator,
    worker_factory: WorkerFactory,
    init_worker: Arc<Worker>,
    workers: Mutex<HashMap<String, Arc<Worker>>>,
    next_pid: AtomicU64,
    shutting_down: AtomicBool,
}

impl System {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn host_allocator(&self) -> HostAllocator {
        self.allocator.clone()
    }

    /// The donated-thread worker driven by the foreground runner.
    pub fn init_worker(&self) -> Arc<Worker> {
        self.init_worker.clone()
    }

    /// Create and start a named worker on its own thread. Names are unique
    /// within the system.
    pub fn create_worker(&self, name: impl Into<String>) -> crate::Result<Arc<Worker>> {
        let name = name.into();
        if self.shutting_down.load(Ordering::SeqCst) {
            bail!("system is shutting down");
        }
        let mut workers = self.workers.lock();
        if workers.contains_key(&name) || name == self.config.init_worker_name {
            bail!("worker '{name}' already exists");
        }
        let options = WorkerOptions::new(self.allocator.clone(), name.clone())
            .with_quantum(self.config.quantum());
        let worker = (self.worker_factory)(options);
        worker.start()?;
        workers.insert(name, worker.clone());
        Ok(worker)
    }

    /// A scope dispatching onto the given worker.
    pub fn create_scope(self: &Arc<Self>, worker: &Arc<Worker>) -> Scope {
        Scope {
            system: self.clone(),
            worker: worker.clone(),
        }
    }

    /// A scope dispatching onto the init worker.
    pub fn init_scope(self: &Arc<Self>) -> Scope {
        Scope {
            system: self.clone(),
            worker: self.init_worker.clone(),
        }
    }

    pub(crate) fn allocate_pid(&self) -> u64 {
        self.next_pid.fetch_add(1, Ordering::Relaxed)
    }

    /// Kill every worker, wait for loops that ran, and join owned threads.
    /// Idempotent; later calls return immediately.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(system = %self.id, "system shutdown initiated");
        let workers: Vec<Arc<Worker>> = self.workers.lock().values().cloned().collect();
        for worker in workers.iter().chain(std::iter::once(&self.init_worker)) {
            worker.kill();
        }
        for worker in workers.iter().chain(std::iter::once(&self.init_worker)) {
            if worker.has_run() {
                match worker.wait_for_shutdown() {
                    Ok(()) => {}
                    // Shutdown invoked from this worker's own thread.
                    Err(RuntimeError::Misuse(_)) => {}
                    Err(error) => tracing::warn!(
                        worker = %worker.name(),
                        %error,
                        "worker ended with error during shutdown"
                    ),
                }
            }
            worker.join();
        }
        tracing::info!(system = %self.id, "system shutdown complete");
    }

    /// Foreground runner: drive `future` to completion on the init worker,
    /// donating the calling thread to its loop, then shut the system down
    /// and return the future's output.
    ///
    /// From the process main thread the loop is hosted on a sidecar thread
    /// and joined, which shields it from signal-induced interrupts landing
    /// mid-trip. A panic propagated out of the join kills the worker, shuts
    /// the system down, and is then re-raised.
    pub fn run<F, T>(self: &Arc<Self>, future: F) -> crate::Result<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let worker = self.init_worker();
        let result: Arc<Mutex<Option<T>>> = Arc::new(Mutex::new(None));

        let slot = result.clone();
        let kill_worker = worker.clone();
        worker.call_threadsafe(move || match LocalExecutor::current() {
            Ok(executor) => {
                executor.spawn(async move {
                    let output = future.await;
                    *slot.lock() = Some(output);
                    kill_worker.kill();
                });
            }
            Err(error) => {
                tracing::error!(%error, "init worker hosts no executor");
                kill_worker.kill();
            }
        });

        let run_result = if is_main_thread() {
            let sidecar = worker.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-loop", worker.name()))
                .spawn(move || sidecar.run_on_current_thread())
                .map_err(|e| anyhow!("failed to spawn foreground loop thread: {e}"))?;
            match handle.join() {
                Ok(result) => result,
                Err(payload) => {
                    tracing::warn!("exception caught in run(); shutting down");
                    worker.kill();
                    self.shutdown();
                    panic::resume_unwind(payload);
                }
            }
        } else {
            worker.run_on_current_thread()
        };

        self.shutdown();
        run_result?;
        let output = result.lock().take();
        output.ok_or_else(|| anyhow!("foreground task did not produce a result"))
    }
}

impl Drop for System {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn is_main_thread() -> bool {
    thread::current().name() == Some("main")
}

/// A dispatch target: one worker within one system. Devices attach here in
/// the layers above the core runtime.
#[derive(Clone)]
pub struct Scope {
    system: Arc<System>,
    worker: Arc<Worker>,
}

impl Scope {
    pub fn system(&self) -> &Arc<System> {
        &self.system
    }

    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_names_are_unique() {
        let system = SystemBuilder::new().build();
        system.create_worker("w0").unwrap();
        assert!(system.create_worker("w0").is_err());
        assert!(system.create_worker("__init__").is_err());
        system.shutdown();
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let system = SystemBuilder::new().build();
        system.create_worker("w0").unwrap();
        system.shutdown();
        system.shutdown();
        assert!(system.create_worker("w1").is_err());
    }

    #[test]
    fn test_scopes_reference_their_worker() {
        let system = SystemBuilder::new().build();
        let worker = system.create_worker("w0").unwrap();
        let scope = system.create_scope(&worker);
        assert_eq!(scope.worker().name(), "w0");
        assert_eq!(system.init_scope().worker().name(), "__init__");
        system.shutdown();
    }

    #[test]
    fn test_pids_are_monotonic() {
        let system = SystemBuilder::new().build();
        let a = system.allocate_pid();
        let b = system.allocate_pid();
        assert!(b > a);
        system.shutdown();
    }
}
