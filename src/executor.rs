// SPDX-FileCopyrightText: Copyright (c) 2025-2026 Spindle Project Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-worker hosted coroutine scheduler.
//!
//! [`LocalExecutor`] runs `!Send` futures on the worker thread that owns it.
//! Task polls are ordinary loop callbacks; wakes re-enter through
//! [`Worker::call_threadsafe`], so a waker may be triggered from any thread.
//! The executor is installed through [`ExecutorHooks`] — the base worker has
//! no knowledge of it, which keeps the hook seam open for bindings that host
//! a different scheduler.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::rc::Rc;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Wake, Waker};

use futures::future::LocalBoxFuture;
use futures::FutureExt;

use crate::error::RuntimeError;
use crate::event_loop::Priority;
use crate::worker::{Worker, WorkerHooks};

thread_local! {
    static CURRENT_EXECUTOR: RefCell<Option<LocalExecutor>> = const { RefCell::new(None) };
}

struct ExecutorInner {
    worker: Arc<Worker>,
    /// Task table. A slot is `None` only while its future is being polled.
    tasks: RefCell<HashMap<u64, Option<LocalBoxFuture<'static, ()>>>>,
    next_task_id: Cell<u64>,
}

/// Single-threaded task executor hosted by a worker. Cheap to clone; all
/// clones refer to the same task table.
#[derive(Clone)]
pub struct LocalExecutor {
    inner: Rc<ExecutorInner>,
}

impl LocalExecutor {
    fn new(worker: Arc<Worker>) -> Self {
        LocalExecutor {
            inner: Rc::new(ExecutorInner {
                worker,
                tasks: RefCell::new(HashMap::new()),
                next_task_id: Cell::new(0),
            }),
        }
    }

    /// The executor installed on the running worker thread.
    pub fn current() -> Result<LocalExecutor, RuntimeError> {
        CURRENT_EXECUTOR.with(|current| {
            current.borrow().clone().ok_or_else(|| {
                RuntimeError::Misuse(
                    "no executor is associated with the current thread".to_string(),
                )
            })
        })
    }

    pub fn worker(&self) -> &Arc<Worker> {
        &self.inner.worker
    }

    /// Spawn a task. Must be called on the hosting worker's thread; the
    /// first poll is scheduled as a default-priority loop callback.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + 'static,
    {
        let id = self.inner.next_task_id.get();
        self.inner.next_task_id.set(id + 1);
        self.inner
            .tasks
            .borrow_mut()
            .insert(id, Some(future.boxed_local()));

        let executor = self.clone();
        let submit = self.inner.worker.call_low_level(Priority::Default, move |_, status| {
            if status.is_ok() {
                executor.poll_task(id);
            }
            Ok(())
        });
        if let Err(error) = submit {
            tracing::error!(%error, "failed to schedule task for its first poll");
            self.inner.tasks.borrow_mut().remove(&id);
        }
    }

    /// Number of live (spawned, not yet completed) tasks.
    pub fn task_count(&self) -> usize {
        self.inner.tasks.borrow().len()
    }

    fn poll_task(&self, id: u64) {
        // A completed task leaves no slot; stale wakes are no-ops.
        let future = match self.inner.tasks.borrow_mut().get_mut(&id) {
            Some(slot) => slot.take(),
            None => return,
        };
        let Some(mut future) = future else { return };

        let waker = Waker::from(Arc::new(TaskWaker {
            worker: Arc::downgrade(&self.inner.worker),
            task_id: id,
        }));
        let mut cx = Context::from_waker(&waker);
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(()) => {
                self.inner.tasks.borrow_mut().remove(&id);
            }
            Poll::Pending => {
                if let Some(slot) = self.inner.tasks.borrow_mut().get_mut(&id) {
                    *slot = Some(future);
                }
            }
        }
    }
}

/// Waker that re-enqueues a task poll through the worker mailbox. Holding
/// the worker weakly lets wakers outlive the worker without pinning it.
struct TaskWaker {
    worker: Weak<Worker>,
    task_id: u64,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        let Some(worker) = self.worker.upgrade() else {
            return;
        };
        let task_id = self.task_id;
        worker.call_threadsafe(move || {
            if let Ok(executor) = LocalExecutor::current() {
                executor.poll_task(task_id);
            }
        });
    }
}

/// Worker hooks that install a [`LocalExecutor`] for the worker's lifetime.
/// This is the default factory configuration; bindings that bring their own
/// scheduler substitute their own hooks.
pub struct ExecutorHooks;

impl WorkerHooks for ExecutorHooks {
    fn on_thread_start(&self, worker: &Arc<Worker>) {
        CURRENT_EXECUTOR.with(|current| {
            *current.borrow_mut() = Some(LocalExecutor::new(worker.clone()));
        });
    }

    fn on_thread_stop(&self, worker: &Arc<Worker>) {
        let executor = CURRENT_EXECUTOR.with(|current| current.borrow_mut().take());
        if let Some(executor) = executor {
            let remaining = executor.task_count();
            if remaining > 0 {
                tracing::debug!(
                    worker = %worker.name(),
                    remaining,
                    "dropping unfinished tasks at worker shutdown"
                );
            }
        }
    }
}
