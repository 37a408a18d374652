//! Reconciler configuration.

use std::time::Duration;

use dprof_backends::config::duration_secs;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Tuning for reconciliation, monitoring and status writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Interval between backend status queries.
    #[serde(with = "duration_secs")]
    pub poll_interval: Duration,
    /// Reconciliations allowed to run at once, across both resource kinds.
    pub max_concurrent_reconciles: usize,
    /// Attempts for a status patch that keeps hitting version conflicts.
    pub status_patch_attempts: u32,
    /// Upper bound for one dispatch call.
    #[serde(with = "duration_secs")]
    pub dispatch_timeout: Duration,
    /// Capacity of the watcher-to-dispatcher channel.
    pub event_buffer: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            max_concurrent_reconciles: 16,
            status_patch_attempts: 3,
            dispatch_timeout: Duration::from_secs(30),
            event_buffer: 256,
        }
    }
}

impl ReconcilerConfig {
    /// Set the poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the concurrency bound.
    #[must_use]
    pub const fn with_max_concurrent_reconciles(mut self, max: usize) -> Self {
        self.max_concurrent_reconciles = max;
        self
    }

    /// Set the dispatch timeout.
    #[must_use]
    pub const fn with_dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch_timeout = timeout;
        self
    }

    /// Set the number of status patch attempts.
    #[must_use]
    pub const fn with_status_patch_attempts(mut self, attempts: u32) -> Self {
        self.status_patch_attempts = attempts;
        self
    }

    /// Reject settings the controller cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(Error::invalid_config("poll_interval must be non-zero"));
        }
        if self.max_concurrent_reconciles == 0 {
            return Err(Error::invalid_config(
                "max_concurrent_reconciles must be at least 1",
            ));
        }
        if self.status_patch_attempts == 0 {
            return Err(Error::invalid_config(
                "status_patch_attempts must be at least 1",
            ));
        }
        if self.dispatch_timeout.is_zero() {
            return Err(Error::invalid_config("dispatch_timeout must be non-zero"));
        }
        if self.event_buffer == 0 {
            return Err(Error::invalid_config("event_buffer must be at least 1"));
        }
        Ok(())
    }
}
