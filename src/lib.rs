// SPDX-FileCopyrightText: Copyright (c) 2025-2026 Spindle Project Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Spindle local worker runtime.
//!
//! Cooperative, single-threaded-per-worker execution for the Spindle
//! heterogeneous compute stack: each [`Worker`] drives one event loop on one
//! OS thread, multiplexing cross-thread submissions, timers, and wait-source
//! completions; a [`Process`] runs a user routine on a worker and reports
//! termination through an awaitable [`CompletionEvent`]; a [`System`] owns
//! the worker fleet and the foreground entry point.
//!
//! ```no_run
//! let system = spindle_runtime::SystemBuilder::new().build();
//! let value = system.run(async { 40 + 2 }).unwrap();
//! assert_eq!(value, 42);
//! ```

pub use anyhow::{anyhow as error, bail as raise, Context as ErrorContext, Error, Result};

pub mod completion;
pub mod config;
pub mod error;
pub mod event_loop;
pub mod executor;
pub mod logging;
pub mod process;
pub mod system;
pub mod wait;
pub mod worker;

pub use completion::{sleep, CompletionEvent, Sleep};
pub use config::RuntimeConfig;
pub use error::RuntimeError;
pub use event_loop::{EventLoop, HostAllocator, LoopCallback, LoopStatus, Priority};
pub use executor::{ExecutorHooks, LocalExecutor};
pub use process::{Continuation, Pid, Process, ProcessState};
pub use system::{Scope, System, SystemBuilder, WorkerFactory};
pub use wait::{Event, WaitSource};
pub use worker::{Worker, WorkerHooks, WorkerOptions};
