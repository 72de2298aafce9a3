// SPDX-FileCopyrightText: Copyright (c) 2025-2026 Spindle Project Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Runtime configuration.
//!
//! Settings are resolved from defaults merged with `SPINDLE_`-prefixed
//! environment variables, e.g. `SPINDLE_WORKER_QUANTUM_MS=250`.

use std::time::Duration;

use figment::{
    providers::{Env, Serialized},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Environment variable prefix for all runtime settings.
const ENV_PREFIX: &str = "SPINDLE_";

/// Process-wide settings for the local runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Maximum wall time a worker loop may block in a single outer trip
    /// before returning control for external maintenance, in milliseconds.
    pub worker_quantum_ms: u64,

    /// Name of the system's init worker (the donated-thread worker driven by
    /// the foreground runner).
    pub init_worker_name: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            worker_quantum_ms: 500,
            init_worker_name: "__init__".to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Resolve the configuration from defaults and the environment.
    pub fn from_settings() -> crate::Result<Self> {
        let config = Figment::from(Serialized::defaults(RuntimeConfig::default()))
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()?;
        Ok(config)
    }

    /// The worker trip quantum as a [`Duration`].
    pub fn quantum(&self) -> Duration {
        Duration::from_millis(self.worker_quantum_ms)
    }
}
