// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Per-model token pricing, in USD per million tokens.
//!
//! Matching is a case-insensitive substring check on the model id, so both
//! `claude-haiku-4-5` and a dated alias like `claude-3-5-haiku-20241022`
//! resolve to the haiku tier.  Unknown models price at the opus tier; the
//! ledger should over-estimate, never under-estimate.

/// USD per 1e6 input/output tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

const HAIKU: ModelPricing = ModelPricing { input_per_mtok: 0.80, output_per_mtok: 4.0 };
const SONNET: ModelPricing = ModelPricing { input_per_mtok: 3.0, output_per_mtok: 15.0 };
const OPUS: ModelPricing = ModelPricing { input_per_mtok: 15.0, output_per_mtok: 75.0 };

/// Look up the price tier for a model id.
pub fn pricing_for(model: &str) -> ModelPricing {
    let m = model.to_ascii_lowercase();
    if m.contains("haiku") {
        HAIKU
    } else if m.contains("sonnet") {
        SONNET
    } else {
        // opus and everything unknown
        OPUS
    }
}

/// Estimated cost in USD for one usage entry.
pub fn estimate_cost(model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
    let p = pricing_for(model);
    (input_tokens as f64 / 1e6) * p.input_per_mtok
        + (output_tokens as f64 / 1e6) * p.output_per_mtok
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
