//! Live delivery path.
//!
//! A stream is opened against a single provider: the first usable one in the
//! fallback chain. Opening is retried on that provider under the retry
//! policy; once chosen, the stream never moves to another provider.

use crate::backends::{ChunkReceiver, ProviderBackend, StreamChunk};
use crate::engine::{attempt_with_retries, build_request, unusable_reason, CallOptions, Completion};
use crate::events::{EventSink, GatewayEvent};
use crate::registry::ProviderRegistry;
use crate::tokens::{estimate_token_count, estimate_usage};
use docsmith_core::{GatewayError, GatewayResult, ProviderError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Progress report sent after every text increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamProgress {
    /// Estimated tokens in the output so far. Never decreases within a stream.
    pub tokens_processed: usize,
    /// The output budget for the request, raised to `tokens_processed` if the
    /// provider overruns it.
    pub estimated_total: usize,
}

type ChunkFn = Box<dyn FnMut(&str) + Send>;
type ProgressFn = Box<dyn FnMut(StreamProgress) + Send>;
type CompleteFn = Box<dyn FnOnce(Completion) + Send>;
type ErrorFn = Box<dyn FnOnce(GatewayError) + Send>;

/// Caller hooks for one stream. Unset hooks do nothing.
///
/// `on_complete` and `on_error` are consumed when called, so each stream
/// invokes at most one of them, at most once.
pub struct StreamCallbacks {
    on_chunk: ChunkFn,
    on_progress: ProgressFn,
    on_complete: CompleteFn,
    on_error: ErrorFn,
}

impl Default for StreamCallbacks {
    fn default() -> Self {
        Self {
            on_chunk: Box::new(|_| {}),
            on_progress: Box::new(|_| {}),
            on_complete: Box::new(|_| {}),
            on_error: Box::new(|_| {}),
        }
    }
}

impl StreamCallbacks {
    /// Callbacks that do nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Called with each text increment, in order.
    pub fn on_chunk(mut self, f: impl FnMut(&str) + Send + 'static) -> Self {
        self.on_chunk = Box::new(f);
        self
    }

    /// Called after each increment with running token counts.
    pub fn on_progress(mut self, f: impl FnMut(StreamProgress) + Send + 'static) -> Self {
        self.on_progress = Box::new(f);
        self
    }

    /// Called once with the aggregated content when the stream finishes.
    pub fn on_complete(mut self, f: impl FnOnce(Completion) + Send + 'static) -> Self {
        self.on_complete = Box::new(f);
        self
    }

    /// Called once if the stream cannot start or breaks part-way.
    pub fn on_error(mut self, f: impl FnOnce(GatewayError) + Send + 'static) -> Self {
        self.on_error = Box::new(f);
        self
    }
}

impl std::fmt::Debug for StreamCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamCallbacks").finish_non_exhaustive()
    }
}

/// How a stream ended, before the outcome is reported to the caller.
enum StreamEnd {
    Completed(Completion),
    Failed(GatewayError),
    Cancelled,
}

/// Live streaming against a single provider, with idle timeout and cancellation.
pub struct StreamingDispatcher {
    registry: Arc<ProviderRegistry>,
    events: Arc<dyn EventSink>,
}

impl StreamingDispatcher {
    /// Creates a dispatcher over `registry`.
    pub fn new(registry: Arc<ProviderRegistry>, events: Arc<dyn EventSink>) -> Self {
        Self { registry, events }
    }

    /// Streams a completion for `prompt`, reporting through `callbacks`.
    ///
    /// Errors are only ever delivered to `on_error`. Streamed output is not
    /// cached.
    pub async fn stream(&self, prompt: &str, options: CallOptions, callbacks: StreamCallbacks) {
        self.run(prompt, &options, callbacks, None).await;
    }

    /// Like [`stream`](Self::stream), but stops as soon as `cancel` fires.
    /// After cancellation no callback of any kind is invoked.
    pub async fn stream_cancellable(
        &self,
        prompt: &str,
        options: CallOptions,
        callbacks: StreamCallbacks,
        cancel: &CancellationToken,
    ) {
        self.run(prompt, &options, callbacks, Some(cancel)).await;
    }

    async fn run(
        &self,
        prompt: &str,
        options: &CallOptions,
        mut callbacks: StreamCallbacks,
        cancel: Option<&CancellationToken>,
    ) {
        let end = match self.select_provider(options) {
            Ok((provider_id, backend)) => {
                self.deliver(&provider_id, backend.as_ref(), prompt, options, &mut callbacks, cancel)
                    .await
            }
            Err(e) => StreamEnd::Failed(e),
        };

        match end {
            StreamEnd::Completed(completion) => (callbacks.on_complete)(completion),
            StreamEnd::Failed(e) => (callbacks.on_error)(e),
            StreamEnd::Cancelled => {}
        }
    }

    /// First provider in the chain that can be tried.
    fn select_provider(
        &self,
        options: &CallOptions,
    ) -> GatewayResult<(String, Arc<dyn ProviderBackend>)> {
        let head = options.chain_head(self.registry.gateway_config());
        self.registry.config_for(head)?;

        for provider_id in self.registry.fallback_chain(head) {
            if let Some(reason) = unusable_reason(&self.registry, &provider_id) {
                self.events.record(&GatewayEvent::ProviderSkipped {
                    provider: provider_id,
                    reason: reason.to_string(),
                });
                continue;
            }
            let backend = self.registry.backend_for(&provider_id)?;
            return Ok((provider_id, backend));
        }
        Err(GatewayError::NoProviderAvailable)
    }

    async fn deliver(
        &self,
        provider_id: &str,
        backend: &dyn ProviderBackend,
        prompt: &str,
        options: &CallOptions,
        callbacks: &mut StreamCallbacks,
        cancel: Option<&CancellationToken>,
    ) -> StreamEnd {
        let config = match self.registry.config_for(provider_id) {
            Ok(config) => config,
            Err(e) => return StreamEnd::Failed(e),
        };
        let request = build_request(
            self.registry.gateway_config(),
            config,
            options.request_messages(prompt),
            options,
        );
        let budget = request.max_tokens;

        let open = attempt_with_retries(
            config,
            &self.registry.gateway_config().retry_policy,
            self.events.as_ref(),
            || backend.stream_invoke(&request),
        );
        let opened = tokio::select! {
            biased;
            () = cancelled(cancel) => return self.cancelled_end(provider_id),
            opened = open => opened,
        };
        let mut rx: ChunkReceiver = match opened {
            Ok((rx, _)) => rx,
            Err(failure) => {
                return self.interrupted(provider_id, failure.to_string());
            }
        };
        self.events.record(&GatewayEvent::StreamStarted {
            provider: provider_id.to_string(),
        });

        let idle = Duration::from_millis(config.timeout_ms);
        let mut content = String::new();
        let mut reported_usage = None;

        loop {
            let next = tokio::select! {
                biased;
                () = cancelled(cancel) => return self.cancelled_end(provider_id),
                next = tokio::time::timeout(idle, rx.recv()) => next,
            };

            match next {
                Err(_) => {
                    let reason = ProviderError::timeout(config.timeout_ms);
                    return self.interrupted(provider_id, format!("{provider_id}: {}", reason.reason()));
                }
                Ok(None) => break,
                Ok(Some(Ok(StreamChunk::Text(text)))) => {
                    if text.is_empty() {
                        continue;
                    }
                    content.push_str(&text);
                    (callbacks.on_chunk)(&text);
                    if is_cancelled(cancel) {
                        return self.cancelled_end(provider_id);
                    }
                    let tokens_processed = estimate_token_count(&content);
                    (callbacks.on_progress)(StreamProgress {
                        tokens_processed,
                        estimated_total: budget.max(tokens_processed),
                    });
                }
                Ok(Some(Ok(StreamChunk::Usage(usage)))) => reported_usage = Some(usage),
                Ok(Some(Err(e))) => {
                    return self.interrupted(provider_id, format!("{provider_id}: {}", e.reason()));
                }
            }
        }

        if is_cancelled(cancel) {
            return self.cancelled_end(provider_id);
        }

        let usage =
            reported_usage.unwrap_or_else(|| estimate_usage(&request.input_text(), &content));
        self.events.record(&GatewayEvent::StreamCompleted {
            provider: provider_id.to_string(),
            usage,
        });
        StreamEnd::Completed(Completion {
            content,
            usage,
            provider: provider_id.to_string(),
            model: config.model.clone(),
            cached: false,
        })
    }

    fn interrupted(&self, provider_id: &str, reason: String) -> StreamEnd {
        self.events.record(&GatewayEvent::StreamInterrupted {
            provider: provider_id.to_string(),
            error: reason.clone(),
        });
        StreamEnd::Failed(GatewayError::StreamInterrupted(reason))
    }

    fn cancelled_end(&self, provider_id: &str) -> StreamEnd {
        self.events.record(&GatewayEvent::StreamCancelled {
            provider: provider_id.to_string(),
        });
        StreamEnd::Cancelled
    }
}

async fn cancelled(cancel: Option<&CancellationToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

fn is_cancelled(cancel: Option<&CancellationToken>) -> bool {
    cancel.is_some_and(CancellationToken::is_cancelled)
}
