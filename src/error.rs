// SPDX-FileCopyrightText: Copyright (c) 2025-2026 Spindle Project Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Spindle runtime error taxonomy.
//!
//! [`RuntimeError`] is the typed error surfaced by the worker runtime. It is
//! deliberately `Clone`: a worker records its terminal status once, and any
//! number of shutdown waiters may observe it. Application-level glue uses the
//! `anyhow` re-exports from the crate root instead.

use serde::{Deserialize, Serialize};

/// Errors produced by the worker runtime.
///
/// The variants map onto the failure classes of the runtime contract:
/// API misuse fails fast, submissions fail synchronously, and callback
/// failures abort the current loop trip and surface through
/// [`Worker::wait_for_shutdown`](crate::Worker::wait_for_shutdown).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum RuntimeError {
    /// An operation was invoked from the wrong thread or in the wrong
    /// lifecycle state (double start, donated-vs-owned entry point mixup,
    /// current-worker lookup off any worker thread).
    #[error("invalid use of worker runtime: {0}")]
    Misuse(String),

    /// A low-level submission was rejected; the callback was not registered.
    #[error("loop submission rejected: {0}")]
    SubmissionFailed(String),

    /// A callback returned a non-ok status. Aborts the trip it ran in.
    #[error("callback failed: {0}")]
    CallbackFailed(String),

    /// A callback panicked. Panics are caught at the loop boundary and
    /// converted; they never unwind through the loop.
    #[error("callback panicked: {0}")]
    CallbackPanic(String),

    /// A pending registration was cancelled at loop teardown.
    #[error("operation cancelled by worker shutdown")]
    Cancelled,

    /// A wait completed because its deadline elapsed, not because the wait
    /// source was signalled.
    #[error("wait deadline elapsed")]
    TimedOut,
}

impl RuntimeError {
    pub(crate) fn misuse(msg: impl Into<String>) -> Self {
        RuntimeError::Misuse(msg.into())
    }
}

/// Extract a human-readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
