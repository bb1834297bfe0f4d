// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

/// Upstream HTTP statuses worth retrying: rate limiting and transient
/// server-side failures.
const RETRYABLE_STATUSES: &[u16] = &[429, 500, 502, 503, 504];

#[derive(Debug, Error)]
pub enum ModelError {
    /// Transport-level failure: connection reset, DNS, timeout.
    #[error("network error: {0}")]
    Network(String),

    /// Non-2xx response from the provider.
    #[error("model API error {status}: {message}")]
    Api {
        status: u16,
        message: String,
        /// `Retry-After` header in seconds, when the provider sent one.
        retry_after: Option<u64>,
    },

    /// Anything else: malformed stream, missing API key, bad script.
    #[error("{0}")]
    Other(String),
}

impl ModelError {
    pub fn from_reqwest(e: reqwest::Error) -> Self {
        Self::Network(e.to_string())
    }

    /// Whether the retry policy should attempt this call again.
    pub fn is_retryable(&self) -> bool {
        match self {
            // Connection resets, timeouts and DNS failures are all transient
            // from the caller's point of view.
            Self::Network(_) => true,
            Self::Api { status, message, .. } => {
                RETRYABLE_STATUSES.contains(status)
                    || contains_retryable_text(message)
            }
            Self::Other(message) => contains_retryable_text(message),
        }
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

fn contains_retryable_text(message: &str) -> bool {
    let m = message.to_ascii_lowercase();
    m.contains("overloaded") || m.contains("rate limit")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn api(status: u16, message: &str) -> ModelError {
        ModelError::Api { status, message: message.into(), retry_after: None }
    }

    #[test]
    fn network_errors_are_retryable() {
        assert!(ModelError::Network("connection reset by peer".into()).is_retryable());
    }

    #[test]
    fn retryable_statuses() {
        for status in [429, 500, 502, 503, 504] {
            assert!(api(status, "boom").is_retryable(), "status {status}");
        }
    }

    #[test]
    fn client_errors_are_not_retryable() {
        assert!(!api(400, "invalid request").is_retryable());
        assert!(!api(401, "bad key").is_retryable());
        assert!(!api(404, "no such model").is_retryable());
    }

    #[test]
    fn overloaded_text_is_retryable_regardless_of_status() {
        assert!(api(529, "Overloaded").is_retryable());
        assert!(ModelError::Other("provider rate limit hit".into()).is_retryable());
    }

    #[test]
    fn retry_after_only_comes_from_api_errors() {
        let e = ModelError::Api { status: 429, message: "slow down".into(), retry_after: Some(7) };
        assert_eq!(e.retry_after_secs(), Some(7));
        assert_eq!(ModelError::Network("x".into()).retry_after_secs(), None);
    }
}
