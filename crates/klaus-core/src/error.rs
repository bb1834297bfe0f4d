// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

use klaus_model::ModelError;
use klaus_store::StoreError;

/// Failure taxonomy for one run, surfaced to the façade.
///
/// Budget exhaustion, tool-limit hits and cancellation are NOT errors:
/// those runs complete normally with a dedicated terminal event.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Too many concurrent sessions ({active}/{limit})")]
    ConcurrencyExceeded { active: usize, limit: usize },

    #[error("prompt too large: {chars} chars (limit {limit})")]
    PromptTooLarge { chars: usize, limit: usize },

    #[error("model not allowed: {0}")]
    ModelNotAllowed(String),

    #[error(transparent)]
    Storage(#[from] StoreError),

    /// Non-retryable upstream failure, or retries exhausted.
    #[error("model provider error: {0}")]
    Upstream(#[from] ModelError),
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrency_message_names_the_counts() {
        let e = AgentError::ConcurrencyExceeded { active: 2, limit: 2 };
        assert_eq!(e.to_string(), "Too many concurrent sessions (2/2)");
    }

    #[test]
    fn storage_errors_pass_through() {
        let e: AgentError = StoreError::NotFound("s1".into()).into();
        assert!(e.to_string().contains("s1"));
    }
}
