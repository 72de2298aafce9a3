// SPDX-FileCopyrightText: Copyright (c) 2025-2026 Spindle Project Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Logging setup for the local runtime.
//!
//! Filters are configured through the `SPINDLE_LOG` environment variable
//! using the usual `tracing_subscriber` directive syntax, e.g.
//! `SPINDLE_LOG=info,spindle_runtime::worker=trace`.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

/// ENV used to set the log filter.
const FILTER_ENV: &str = "SPINDLE_LOG";

/// Default log level.
const DEFAULT_FILTER_LEVEL: &str = "info";

/// Once instance to ensure the logger is only initialized once.
static INIT: Once = Once::new();

/// Initialize process-wide logging. Idempotent; later calls are no-ops, as is
/// initialization when an outer application already installed a subscriber.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env(FILTER_ENV)
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER_LEVEL));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();
    });
}
