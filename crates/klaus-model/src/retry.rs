// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::time::Duration;

use rand::Rng;

use crate::ModelError;

/// Exponential backoff with jitter, deferring to the provider's
/// `Retry-After` hint when present.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self { max_attempts, base_delay, max_delay }
    }

    /// Delay before retry number `attempt` (0-based) of `error`.
    ///
    /// A server `Retry-After` wins over the computed backoff but is still
    /// clamped to `max_delay`.  Otherwise: `base · 2^attempt` plus a jitter
    /// drawn uniformly from `[0, 0.3 · exponential)`, capped at `max_delay`.
    /// Ignoring jitter, successive delays are non-decreasing.
    pub fn delay(&self, attempt: u32, error: &ModelError) -> Duration {
        if let Some(secs) = error.retry_after_secs() {
            return Duration::from_secs(secs).min(self.max_delay);
        }
        let exponential = self.base_delay.as_millis() as f64 * 2f64.powi(attempt as i32);
        let jitter = rand::thread_rng().gen_range(0.0..0.3) * exponential;
        Duration::from_millis((exponential + jitter) as u64).min(self.max_delay)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
