//! Per-object exponential backoff for failed reconciles
//!
//! Each object key backs off independently: 1s after the first failure,
//! doubling up to 10s. A successful reconcile resets the key.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub const MAX_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Debug, Default)]
pub struct Backoff {
    failures: Mutex<HashMap<String, u32>>,
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a failure for `key` and returns how long to wait before retrying
    pub fn next_delay(&self, key: &str) -> Duration {
        let mut failures = self
            .failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let count = failures.entry(key.to_string()).or_insert(0);
        let delay = INITIAL_BACKOFF
            .checked_mul(1u32 << (*count).min(16))
            .unwrap_or(MAX_BACKOFF)
            .min(MAX_BACKOFF);
        *count = count.saturating_add(1);
        delay
    }

    pub fn reset(&self, key: &str) {
        self.failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(key);
    }
}
