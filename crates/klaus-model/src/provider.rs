// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::{CompletionRequest, ModelError, ResponseEvent, Usage};

pub type ResponseStream =
    Pin<Box<dyn Stream<Item = Result<ResponseEvent, ModelError>> + Send>>;

/// Drain a completion into its full text and usage.  For auxiliary calls
/// (context summaries, session summaries) where streaming buys nothing.
pub async fn collect_text(
    provider: &dyn ModelProvider,
    req: CompletionRequest,
) -> Result<(String, Usage), ModelError> {
    use futures::StreamExt;

    let mut stream = provider.complete(req).await?;
    let mut text = String::new();
    let mut usage = Usage::default();
    while let Some(event) = stream.next().await {
        match event? {
            ResponseEvent::TextDelta(delta) => text.push_str(&delta),
            ResponseEvent::Usage(u) => {
                usage.input_tokens += u.input_tokens;
                usage.output_tokens += u.output_tokens;
            }
            ResponseEvent::Done { .. } => break,
            _ => {}
        }
    }
    Ok((text, usage))
}

#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Human-readable provider name for logs and status display.
    fn name(&self) -> &str;

    /// Send a completion request and return the streaming response.
    ///
    /// The returned stream yields deltas as they arrive; dropping it aborts
    /// the underlying transfer, which is how cancellation propagates.
    async fn complete(&self, req: CompletionRequest) -> Result<ResponseStream, ModelError>;
}
